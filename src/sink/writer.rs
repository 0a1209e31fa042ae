//! Parquet record sets on an OpenDAL operator.
//!
//! Layout under the operator root:
//!
//! ```text
//! records/log_date=2025-11-30/<key>.parquet
//! manifests/<key>.json
//! content/<sha256>.json
//! ```
//!
//! The manifest is written after the record set and is what `contains`
//! consults. The content index is written last and maps a content hash to
//! the first key that committed it. A crash between the two writes leaves an orphan record set that
//! the next delivery overwrites with identical bytes.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use opendal::{ErrorKind, Operator};
use tracing::{debug, info};

use super::encoding::to_parquet_bytes;
use super::schema::to_record_batch;
use super::{RecordManifest, RecordSink, SinkError};
use crate::journal::ParsedJournal;
use crate::queue::{IdempotencyKey, UploadEvent};

const UNKNOWN_DATE: &str = "unknown";

/// Deterministic location of the record set for `key`.
pub fn records_path(key: &IdempotencyKey, log_date: Option<NaiveDate>) -> String {
    let partition = log_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| UNKNOWN_DATE.to_string());
    format!("records/log_date={}/{}.parquet", partition, key)
}

pub fn manifest_path(key: &IdempotencyKey) -> String {
    format!("manifests/{}.json", key)
}

pub fn content_index_path(content_sha256: &str) -> String {
    format!("content/{}.json", content_sha256)
}

#[derive(Clone)]
pub struct ParquetSink {
    operator: Operator,
}

impl ParquetSink {
    pub fn new(operator: Operator) -> Self {
        Self { operator }
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    /// Committed manifest for `key`, if any.
    pub async fn manifest(&self, key: &IdempotencyKey) -> Result<Option<RecordManifest>, SinkError> {
        let path = manifest_path(key);
        let body = match self.operator.read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SinkError::Unavailable {
                    operation: "read manifest",
                    source,
                })
            }
        };
        serde_json::from_slice(&body.to_vec())
            .map(Some)
            .map_err(|source| SinkError::Manifest { path, source })
    }
}

#[async_trait]
impl RecordSink for ParquetSink {
    async fn contains(&self, key: &IdempotencyKey) -> Result<bool, SinkError> {
        self.operator
            .exists(&manifest_path(key))
            .await
            .map_err(|source| SinkError::Unavailable {
                operation: "stat manifest",
                source,
            })
    }

    async fn upsert(
        &self,
        key: &IdempotencyKey,
        event: &UploadEvent,
        journal: &ParsedJournal,
    ) -> Result<RecordManifest, SinkError> {
        let batch = to_record_batch(key, event, journal)?;
        let file_metadata: Vec<(String, String)> = journal
            .identity
            .key_values()
            .into_iter()
            .map(|(k, v)| (format!("identity.{}", k), v))
            .collect();
        let parquet_bytes = to_parquet_bytes(&batch, &file_metadata)?;
        let bytes_written = parquet_bytes.len();
        let path = records_path(key, journal.metadata.log_date);

        debug!(path = %path, rows = batch.num_rows(), "Writing record set");
        self.operator
            .write(&path, parquet_bytes)
            .await
            .map_err(|source| SinkError::Unavailable {
                operation: "write records",
                source,
            })?;

        let manifest = RecordManifest {
            idempotency_key: key.clone(),
            bucket: event.bucket.clone(),
            object_path: event.object_path.clone(),
            generation: event.generation,
            file_name: journal.metadata.file_name.clone(),
            lane: journal.metadata.lane,
            log_date: journal.metadata.log_date,
            records_path: path.clone(),
            record_count: batch.num_rows(),
            expanded_records: journal.expanded_entries(),
            skipped_lines: journal.skipped_lines,
            truncated_bytes: journal.truncated_bytes,
            identity: journal.identity.clone(),
            ingested_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&manifest).map_err(|source| SinkError::Manifest {
            path: manifest_path(key),
            source,
        })?;
        self.operator
            .write(&manifest_path(key), body)
            .await
            .map_err(|source| SinkError::Unavailable {
                operation: "write manifest",
                source,
            })?;

        let content_sha256 = &journal.identity.content_sha256;
        if !content_sha256.is_empty() && self.committed_content(content_sha256).await?.is_none() {
            let index = serde_json::to_vec(key).map_err(|source| SinkError::Manifest {
                path: content_index_path(content_sha256),
                source,
            })?;
            self.operator
                .write(&content_index_path(content_sha256), index)
                .await
                .map_err(|source| SinkError::Unavailable {
                    operation: "write content index",
                    source,
                })?;
        }

        info!(
            idempotency_key = %key,
            path = %path,
            rows = manifest.record_count,
            bytes = bytes_written,
            "Committed record set"
        );
        Ok(manifest)
    }

    async fn committed_content(
        &self,
        content_sha256: &str,
    ) -> Result<Option<IdempotencyKey>, SinkError> {
        let path = content_index_path(content_sha256);
        let body = match self.operator.read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SinkError::Unavailable {
                    operation: "read content index",
                    source,
                })
            }
        };
        serde_json::from_slice(&body.to_vec())
            .map(Some)
            .map_err(|source| SinkError::Manifest { path, source })
    }

    async fn check(&self) -> Result<(), SinkError> {
        self.operator
            .check()
            .await
            .map_err(|source| SinkError::Unavailable {
                operation: "check",
                source,
            })
    }
}
