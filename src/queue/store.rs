//! Durable message table.
//!
//! Each live message is one JSON object under `messages/`. Records are
//! rewritten on every state change and removed once the message settles.

use super::types::{DeliveryAttempt, MessageId, UploadEvent};
use opendal::{ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use tracing::warn;

const MESSAGES_PREFIX: &str = "messages/";

/// A live message and its delivery history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub upload_event: UploadEvent,
    pub attempt_history: Vec<DeliveryAttempt>,
    /// Last failure reported for this message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip)]
    pub in_flight: bool,
}

impl MessageRecord {
    pub fn new(message_id: MessageId, upload_event: UploadEvent) -> Self {
        Self {
            message_id,
            upload_event,
            attempt_history: Vec::new(),
            last_error: None,
            in_flight: false,
        }
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.attempt_history.len()).unwrap_or(u32::MAX)
    }
}

#[derive(Clone)]
pub struct QueueStore {
    operator: Operator,
}

impl QueueStore {
    pub fn new(operator: Operator) -> Self {
        Self { operator }
    }

    fn path(message_id: &MessageId) -> String {
        format!("{}{}.json", MESSAGES_PREFIX, message_id)
    }

    pub async fn save(&self, record: &MessageRecord) -> Result<(), opendal::Error> {
        let body = serde_json::to_vec(record).map_err(|e| {
            opendal::Error::new(ErrorKind::Unexpected, "failed to encode message record")
                .set_source(e)
        })?;
        self.operator
            .write(&Self::path(&record.message_id), body)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, message_id: &MessageId) -> Result<(), opendal::Error> {
        self.operator.delete(&Self::path(message_id)).await
    }

    /// Load every persisted record. Unreadable records are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<MessageRecord>, opendal::Error> {
        let entries = match self.operator.list(MESSAGES_PREFIX).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.path();
            if !path.ends_with(".json") {
                continue;
            }
            let bytes = self.operator.read(path).await?.to_vec();
            match serde_json::from_slice::<MessageRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path, error = %e, "Skipping unreadable message record"),
            }
        }
        Ok(records)
    }
}
