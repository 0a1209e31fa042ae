//! Dead-letter quarantine.
//!
//! Entries are held in memory for triage and, when a store is configured,
//! written as `<message_id>.json`. A failed write leaves the entry queued for
//! the next flush; entries are never dropped.

use crate::queue::{DeliveryAttempt, MessageId, UploadEvent};
use chrono::{DateTime, Utc};
use opendal::{ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// A message whose attempt budget is exhausted or whose failure was fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message_id: MessageId,
    pub upload_event: UploadEvent,
    pub attempt_history: Vec<DeliveryAttempt>,
    pub final_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to persist dead-letter entries ({pending} pending): {source}")]
pub struct DeadLetterError {
    pub pending: usize,
    #[source]
    pub source: opendal::Error,
}

#[derive(Default)]
struct Inner {
    entries: Vec<DeadLetterEntry>,
    /// Indexes into `entries` not yet written to the store.
    unpersisted: Vec<usize>,
}

#[derive(Clone, Default)]
pub struct DeadLetterQueue {
    inner: Arc<Mutex<Inner>>,
    store: Option<Operator>,
}

impl DeadLetterQueue {
    /// In-memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist entries to `operator` in addition to keeping them in memory.
    pub fn with_store(operator: Operator) -> Self {
        Self {
            inner: Arc::default(),
            store: Some(operator),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(message_id: &MessageId) -> String {
        format!("{}.json", message_id)
    }

    /// Quarantine an entry. The entry is retained even if persisting fails.
    pub async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        warn!(
            message_id = %entry.message_id,
            object_path = %entry.upload_event.object_path,
            generation = entry.upload_event.generation,
            attempts = entry.attempt_history.len(),
            final_error = %entry.final_error,
            "Moved message to dead-letter queue"
        );

        {
            let mut inner = self.lock();
            inner.entries.push(entry);
            if self.store.is_some() {
                let index = inner.entries.len() - 1;
                inner.unpersisted.push(index);
            }
        }

        self.flush().await.map(|_| ())
    }

    /// Write any unpersisted entries. Returns how many were written.
    pub async fn flush(&self) -> Result<usize, DeadLetterError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let pending: Vec<(usize, DeadLetterEntry)> = {
            let inner = self.lock();
            inner
                .unpersisted
                .iter()
                .map(|&i| (i, inner.entries[i].clone()))
                .collect()
        };

        let mut written = Vec::new();
        let mut failure = None;
        for (index, entry) in pending {
            let body = match serde_json::to_vec_pretty(&entry) {
                Ok(body) => body,
                Err(e) => {
                    error!(message_id = %entry.message_id, error = %e, "Failed to encode dead-letter entry");
                    continue;
                }
            };
            match store.write(&Self::path(&entry.message_id), body).await {
                Ok(_) => written.push(index),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let remaining = {
            let mut inner = self.lock();
            inner.unpersisted.retain(|i| !written.contains(i));
            inner.unpersisted.len()
        };

        match failure {
            Some(source) => Err(DeadLetterError {
                pending: remaining,
                source,
            }),
            None => Ok(written.len()),
        }
    }

    /// Load entries persisted by a previous run.
    pub async fn load(&self) -> Result<usize, opendal::Error> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let listing = match store.list("").await {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut loaded = Vec::new();
        for item in listing {
            if !item.path().ends_with(".json") {
                continue;
            }
            let bytes = store.read(item.path()).await?.to_vec();
            match serde_json::from_slice::<DeadLetterEntry>(&bytes) {
                Ok(entry) => loaded.push(entry),
                Err(e) => warn!(path = item.path(), error = %e, "Skipping unreadable dead-letter entry"),
            }
        }

        let mut inner = self.lock();
        let mut added = 0;
        for entry in loaded {
            if inner
                .entries
                .iter()
                .all(|existing| existing.message_id != entry.message_id)
            {
                inner.entries.push(entry);
                added += 1;
            }
        }
        if added > 0 {
            info!(count = added, "Loaded persisted dead-letter entries");
        }
        Ok(added)
    }

    /// Snapshot of all quarantined entries in arrival order.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn pending_writes(&self) -> usize {
        self.lock().unpersisted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendal::services;

    fn entry(id: &str) -> DeadLetterEntry {
        let event = UploadEvent::new("journals", "acme/0042/jrnl0001.txt", 3);
        let message_id = MessageId::from(id.to_string());
        DeadLetterEntry {
            attempt_history: vec![DeliveryAttempt {
                message_id: message_id.clone(),
                upload_event: event.clone(),
                attempt_number: 1,
                delivered_at: Utc::now(),
            }],
            message_id,
            upload_event: event,
            final_error: "malformed input: no recognizable journal lines".to_string(),
            dead_lettered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn keeps_entries_in_memory() {
        let dlq = DeadLetterQueue::new();
        dlq.record(entry("m1")).await.unwrap();
        dlq.record(entry("m2")).await.unwrap();

        let entries = dlq.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message_id.as_str(), "m1");
        assert_eq!(entries[0].attempt_history.len(), 1);
        assert_eq!(dlq.pending_writes(), 0);
    }

    #[tokio::test]
    async fn persists_and_reloads_entries() {
        let op = Operator::new(services::Memory::default()).unwrap().finish();

        let dlq = DeadLetterQueue::with_store(op.clone());
        dlq.record(entry("m1")).await.unwrap();
        assert!(op.exists("m1.json").await.unwrap());

        let restarted = DeadLetterQueue::with_store(op);
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert_eq!(restarted.entries(), dlq.entries());
    }
}
