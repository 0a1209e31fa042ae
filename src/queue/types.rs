//! Messages, delivery attempts and outcomes exchanged across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A specific object generation that has been finalized in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub object_path: String,
    pub bucket: String,
    pub generation: i64,
    pub received_at: DateTime<Utc>,
}

impl UploadEvent {
    pub fn new(bucket: impl Into<String>, object_path: impl Into<String>, generation: i64) -> Self {
        Self {
            object_path: object_path.into(),
            bucket: bucket.into(),
            generation,
            received_at: Utc::now(),
        }
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(&self.bucket, &self.object_path, self.generation)
    }

    /// File name component of the object path.
    pub fn file_name(&self) -> &str {
        self.object_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.object_path)
    }
}

/// Deterministic identity of one object generation.
///
/// Hex-encoded BLAKE3 over `bucket \0 object_path \0 generation`, so two
/// deliveries of the same generation always address the same sink records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(bucket: &str, object_path: &str, generation: i64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(bucket.as_bytes());
        hasher.update(&[0]);
        hasher.update(object_path.as_bytes());
        hasher.update(&[0]);
        hasher.update(generation.to_string().as_bytes());
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Queue-assigned message identity; one per enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One push of a message to the processing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub upload_event: UploadEvent,
    /// 1-based; strictly increasing per message and bounded by the attempt budget.
    pub attempt_number: u32,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Acknowledged,
    RetryableFailure,
    FatalFailure,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Acknowledged => "acknowledged",
            ProcessingOutcome::RetryableFailure => "retryable_failure",
            ProcessingOutcome::FatalFailure => "fatal_failure",
        }
    }
}
