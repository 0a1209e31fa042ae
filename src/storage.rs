//! Storage operator construction.
//!
//! The source store is described by the backend sections of `[source]`; the
//! sink, queue state and dead-letter stores are addressed by URI.

use crate::config::{SourceConfig, StorageBackend};
use opendal::{services, Operator};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create {backend} operator: {source}")]
    Operator {
        backend: &'static str,
        #[source]
        source: opendal::Error,
    },
}

/// Build the operator for the object store holding uploaded journals.
pub fn source_operator(config: &SourceConfig) -> Result<Operator, StorageError> {
    let operator = match config.backend {
        StorageBackend::Fs => {
            let fs = config.fs.as_ref().ok_or_else(|| {
                StorageError::InvalidConfig("fs config required for filesystem backend".into())
            })?;
            info!("Using filesystem source at: {}", fs.path);

            let builder = services::Fs::default().root(&fs.path);
            Operator::new(builder)
                .map_err(|source| StorageError::Operator {
                    backend: "fs",
                    source,
                })?
                .finish()
        }
        StorageBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                StorageError::InvalidConfig("s3 config required for S3 backend".into())
            })?;
            info!(
                "Using S3 source: bucket={}, region={}",
                s3.bucket, s3.region
            );

            let mut builder = services::S3::default()
                .bucket(&s3.bucket)
                .region(&s3.region);
            if let Some(endpoint) = &s3.endpoint {
                builder = builder.endpoint(endpoint);
            }

            Operator::new(builder)
                .map_err(|source| StorageError::Operator {
                    backend: "s3",
                    source,
                })?
                .finish()
        }
        StorageBackend::R2 => {
            let r2 = config.r2.as_ref().ok_or_else(|| {
                StorageError::InvalidConfig("r2 config required for R2 backend".into())
            })?;
            info!(
                "Using R2 source: account={}, bucket={}",
                r2.account_id, r2.bucket
            );

            let endpoint = r2.endpoint.clone().unwrap_or_else(|| {
                format!("https://{}.r2.cloudflarestorage.com", r2.account_id)
            });
            let builder = services::S3::default()
                .bucket(&r2.bucket)
                .region("auto")
                .endpoint(&endpoint)
                .access_key_id(&r2.access_key_id)
                .secret_access_key(&r2.secret_access_key);

            Operator::new(builder)
                .map_err(|source| StorageError::Operator {
                    backend: "r2",
                    source,
                })?
                .finish()
        }
        StorageBackend::Memory => {
            info!("Using in-memory source (contents are lost on restart)");
            memory_operator("")?
        }
    };

    Ok(operator)
}

/// Build an operator from a storage URI.
///
/// Supported forms:
/// - `memory://[prefix]`
/// - `fs://<path>` or `file://<path>`
/// - `s3://<bucket>[/prefix][?region=..&endpoint=..]`
///
/// `token` is passed to S3 as the session token.
pub fn operator_from_uri(uri: &str, token: Option<&str>) -> Result<Operator, StorageError> {
    let invalid = |reason: &str| StorageError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| invalid("missing scheme"))?;

    match scheme {
        "memory" | "mem" => memory_operator(rest),
        "fs" | "file" => {
            if rest.is_empty() {
                return Err(invalid("missing path"));
            }
            Operator::new(services::Fs::default().root(rest))
                .map(|op| op.finish())
                .map_err(|source| StorageError::Operator {
                    backend: "fs",
                    source,
                })
        }
        "s3" => {
            let (location, query) = match rest.split_once('?') {
                Some((location, query)) => (location, query),
                None => (rest, ""),
            };
            let (bucket, prefix) = match location.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix),
                None => (location, ""),
            };
            if bucket.is_empty() {
                return Err(invalid("missing bucket"));
            }

            let mut builder = services::S3::default()
                .bucket(bucket)
                .root(&format!("/{}", prefix.trim_matches('/')));
            let mut region = "us-east-1".to_string();
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some(("region", value)) => region = value.to_string(),
                    Some(("endpoint", value)) => builder = builder.endpoint(value),
                    _ => return Err(invalid(&format!("unsupported query parameter '{}'", pair))),
                }
            }
            builder = builder.region(&region);
            if let Some(token) = token {
                builder = builder.session_token(token);
            }

            Operator::new(builder)
                .map(|op| op.finish())
                .map_err(|source| StorageError::Operator {
                    backend: "s3",
                    source,
                })
        }
        other => Err(invalid(&format!(
            "unsupported scheme '{}' (expected memory, fs, file or s3)",
            other
        ))),
    }
}

fn memory_operator(prefix: &str) -> Result<Operator, StorageError> {
    let mut builder = services::Memory::default();
    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        builder = builder.root(&format!("/{}", prefix));
    }
    Operator::new(builder)
        .map(|op| op.finish())
        .map_err(|source| StorageError::Operator {
            backend: "memory",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_schemes() {
        assert!(operator_from_uri("memory://", None).is_ok());
        assert!(operator_from_uri("memory://dead-letters", None).is_ok());
        assert!(operator_from_uri("s3://warehouse/journal?region=us-west-2", Some("tok")).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let uri = format!("fs://{}", dir.path().display());
        assert!(operator_from_uri(&uri, None).is_ok());
    }

    #[test]
    fn rejects_malformed_uris() {
        assert!(matches!(
            operator_from_uri("warehouse", None),
            Err(StorageError::InvalidUri { .. })
        ));
        assert!(matches!(
            operator_from_uri("gs://bucket", None),
            Err(StorageError::InvalidUri { .. })
        ));
        assert!(matches!(
            operator_from_uri("s3://bucket?acl=public", None),
            Err(StorageError::InvalidUri { .. })
        ));
    }
}
