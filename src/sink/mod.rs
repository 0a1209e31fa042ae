//! Idempotent storage of parsed journals.
//!
//! A record set is addressed purely by its [`IdempotencyKey`]: writing the
//! same key twice, sequentially or concurrently, leaves exactly one logical
//! record set behind.

mod encoding;
mod writer;
pub mod schema;

pub use writer::{content_index_path, manifest_path, records_path, ParquetSink};

use crate::journal::{FileIdentity, ParsedJournal};
use crate::queue::{IdempotencyKey, UploadEvent};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Storage could not be reached or refused the operation.
    #[error("sink unavailable during {operation}: {source}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: opendal::Error,
    },

    /// The record set cannot be represented as Parquet.
    #[error("failed to encode record set: {0}")]
    Encode(String),

    #[error("corrupt manifest at {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SinkError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable { .. } | SinkError::Manifest { .. })
    }
}

impl From<arrow::error::ArrowError> for SinkError {
    fn from(e: arrow::error::ArrowError) -> Self {
        SinkError::Encode(e.to_string())
    }
}

impl From<parquet::errors::ParquetError> for SinkError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        SinkError::Encode(e.to_string())
    }
}

/// Ledger entry written after a record set is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordManifest {
    pub idempotency_key: IdempotencyKey,
    pub bucket: String,
    pub object_path: String,
    pub generation: i64,
    pub file_name: String,
    pub lane: u32,
    pub log_date: Option<NaiveDate>,
    pub records_path: String,
    pub record_count: usize,
    pub expanded_records: usize,
    pub skipped_lines: usize,
    pub truncated_bytes: usize,
    #[serde(default)]
    pub identity: FileIdentity,
    pub ingested_at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Whether a complete record set for `key` is already committed.
    async fn contains(&self, key: &IdempotencyKey) -> Result<bool, SinkError>;

    /// Insert or replace the record set for `key`.
    async fn upsert(
        &self,
        key: &IdempotencyKey,
        event: &UploadEvent,
        journal: &ParsedJournal,
    ) -> Result<RecordManifest, SinkError>;

    /// Key of a committed record set with this content hash, if any.
    async fn committed_content(
        &self,
        content_sha256: &str,
    ) -> Result<Option<IdempotencyKey>, SinkError>;

    /// Reachability probe used by readiness checks.
    async fn check(&self) -> Result<(), SinkError>;
}
