//! Object store access for uploaded journals.

use crate::queue::UploadEvent;
use async_trait::async_trait;
use opendal::{ErrorKind, Metadata, Operator};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    /// The referenced generation does not exist (any more). Retrying cannot help.
    #[error("object {bucket}/{path} generation {generation} not found: {reason}")]
    NotFound {
        bucket: String,
        path: String,
        generation: i64,
        reason: String,
    },

    #[error("transient error accessing {path}: {source}")]
    Transient {
        path: String,
        #[source]
        source: opendal::Error,
    },
}

/// An object seen in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub path: String,
    pub generation: i64,
}

#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Bucket this source serves.
    fn bucket(&self) -> &str;

    /// Read the exact object generation an event refers to.
    async fn fetch(&self, event: &UploadEvent) -> Result<Vec<u8>, FetchError>;

    /// Relocate an ingested object under `segment`. Returns the new path.
    async fn mark_processed(&self, event: &UploadEvent, segment: &str)
        -> Result<String, FetchError>;

    /// Files under `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<ListedObject>, FetchError>;

    /// Cheap reachability probe.
    async fn check(&self) -> Result<(), FetchError>;
}

/// `ObjectSource` backed by an OpenDAL operator.
#[derive(Clone)]
pub struct OpendalSource {
    operator: Operator,
    bucket: String,
}

impl OpendalSource {
    pub fn new(operator: Operator, bucket: impl Into<String>) -> Self {
        Self {
            operator,
            bucket: bucket.into(),
        }
    }

    fn not_found(&self, event: &UploadEvent, reason: impl Into<String>) -> FetchError {
        FetchError::NotFound {
            bucket: event.bucket.clone(),
            path: event.object_path.clone(),
            generation: event.generation,
            reason: reason.into(),
        }
    }

    fn classify(&self, event: &UploadEvent, error: opendal::Error) -> FetchError {
        if error.kind() == ErrorKind::NotFound {
            self.not_found(event, error.to_string())
        } else {
            FetchError::Transient {
                path: event.object_path.clone(),
                source: error,
            }
        }
    }
}

/// Numeric object version, when the backend versions objects.
fn object_version(meta: &Metadata) -> Option<i64> {
    meta.version().and_then(|v| v.parse().ok())
}

/// Generation used for listing-based discovery: the object version when
/// available, otherwise an opaque fingerprint that changes whenever the
/// object is rewritten.
fn listing_generation(meta: &Metadata) -> i64 {
    if let Some(version) = object_version(meta) {
        return version;
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(meta.etag().unwrap_or_default().as_bytes());
    if let Some(modified) = meta.last_modified() {
        hasher.update(modified.to_string().as_bytes());
    }
    hasher.update(&meta.content_length().to_le_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    i64::from_le_bytes(head) & i64::MAX
}

/// `company/store/lane/file` becomes `company/store/<segment>/lane/file`;
/// shorter paths are moved under `<segment>/`.
pub fn processed_path(object_path: &str, segment: &str) -> String {
    let segment = segment.trim_matches('/');
    let parts: Vec<&str> = object_path.split('/').collect();
    if parts.len() >= 3 {
        format!("{}/{}/{}/{}", parts[0], parts[1], segment, parts[2..].join("/"))
    } else {
        format!("{}/{}", segment, object_path)
    }
}

#[async_trait]
impl ObjectSource for OpendalSource {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn fetch(&self, event: &UploadEvent) -> Result<Vec<u8>, FetchError> {
        if event.bucket != self.bucket {
            return Err(self.not_found(
                event,
                format!("bucket is not served here (serving '{}')", self.bucket),
            ));
        }

        let meta = self
            .operator
            .stat(&event.object_path)
            .await
            .map_err(|e| self.classify(event, e))?;

        if let Some(version) = object_version(&meta) {
            if version != event.generation {
                return Err(self.not_found(
                    event,
                    format!("current generation is {}", version),
                ));
            }
        }

        let buffer = self
            .operator
            .read(&event.object_path)
            .await
            .map_err(|e| self.classify(event, e))?;

        debug!(
            object_path = %event.object_path,
            bytes = buffer.len(),
            "Fetched object"
        );
        Ok(buffer.to_vec())
    }

    async fn mark_processed(
        &self,
        event: &UploadEvent,
        segment: &str,
    ) -> Result<String, FetchError> {
        let target = processed_path(&event.object_path, segment);
        let transient = |source| FetchError::Transient {
            path: event.object_path.clone(),
            source,
        };

        if self.operator.info().full_capability().copy {
            self.operator
                .copy(&event.object_path, &target)
                .await
                .map_err(transient)?;
        } else {
            let body = self
                .operator
                .read(&event.object_path)
                .await
                .map_err(transient)?;
            self.operator.write(&target, body).await.map_err(transient)?;
        }

        if let Err(e) = self.operator.delete(&event.object_path).await {
            warn!(
                object_path = %event.object_path,
                error = %e,
                "Copied to processed location but failed to delete the original"
            );
        }

        info!(from = %event.object_path, to = %target, "Moved to processed");
        Ok(target)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ListedObject>, FetchError> {
        let transient = |source| FetchError::Transient {
            path: prefix.to_string(),
            source,
        };
        let entries = match self.operator.list_with(prefix).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(transient(e)),
        };

        let mut objects = Vec::new();
        for entry in entries {
            if !entry.metadata().is_file() {
                continue;
            }
            let meta = self.operator.stat(entry.path()).await.map_err(transient)?;
            objects.push(ListedObject {
                path: entry.path().to_string(),
                generation: listing_generation(&meta),
            });
        }
        Ok(objects)
    }

    async fn check(&self) -> Result<(), FetchError> {
        self.operator
            .check()
            .await
            .map_err(|source| FetchError::Transient {
                path: String::new(),
                source,
            })
    }
}
