//! Notification bridge: object-store finalize events in, queue messages out.
//!
//! Two entry points feed the queue. Pushed notifications arrive through
//! `POST /notifications` and are converted with
//! [`UploadEvent::from_notification`]. The optional [`ListingBridge`] polls
//! the source listing and enqueues one message per newly seen object
//! generation.

use crate::queue::{QueueError, QueueHandle, UploadEvent};
use crate::source::{FetchError, ObjectSource};
use chrono::Utc;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("notification is missing '{0}'")]
    MissingField(&'static str),
    #[error("generation '{0}' is not an integer")]
    InvalidGeneration(String),
    #[error(transparent)]
    Listing(#[from] FetchError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// An object-store finalize resource, as delivered by storage notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectNotification {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "generation_field")]
    pub generation: Option<String>,
}

/// Accepts the generation as either a JSON string or a number.
fn generation_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    }))
}

impl UploadEvent {
    pub fn from_notification(notification: ObjectNotification) -> Result<Self, BridgeError> {
        if notification.bucket.trim().is_empty() {
            return Err(BridgeError::MissingField("bucket"));
        }
        if notification.name.trim().is_empty() {
            return Err(BridgeError::MissingField("name"));
        }
        let raw = notification
            .generation
            .ok_or(BridgeError::MissingField("generation"))?;
        let generation = raw
            .trim()
            .parse::<i64>()
            .map_err(|_| BridgeError::InvalidGeneration(raw.clone()))?;

        Ok(UploadEvent {
            object_path: notification.name,
            bucket: notification.bucket,
            generation,
            received_at: Utc::now(),
        })
    }
}

/// Polls a source listing and enqueues newly seen object generations.
///
/// The first scan only records what already exists; objects present at
/// startup are assumed to have been handled by an earlier run.
pub struct ListingBridge {
    source: Arc<dyn ObjectSource>,
    queue: QueueHandle,
    prefix: String,
    exclude_segment: String,
    seen: HashSet<(String, i64)>,
    seeded: bool,
}

impl ListingBridge {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        queue: QueueHandle,
        prefix: impl Into<String>,
        exclude_segment: impl Into<String>,
    ) -> Self {
        Self {
            source,
            queue,
            prefix: prefix.into(),
            exclude_segment: exclude_segment.into(),
            seen: HashSet::new(),
            seeded: false,
        }
    }

    /// Object generations remembered from the last listing.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    fn excluded(&self, path: &str) -> bool {
        !self.exclude_segment.is_empty()
            && format!("/{}", path).contains(&self.exclude_segment)
    }

    /// Run one listing pass. Returns how many messages were enqueued.
    pub async fn scan(&mut self) -> Result<usize, BridgeError> {
        let listed = self.source.list(&self.prefix).await?;
        let mut present = HashSet::with_capacity(listed.len());
        let mut fresh = Vec::new();
        for object in listed {
            if self.excluded(&object.path) {
                continue;
            }
            let id = (object.path.clone(), object.generation);
            if !self.seen.contains(&id) {
                fresh.push(object);
            }
            present.insert(id);
        }
        // Forget objects that were archived or deleted since the last pass.
        self.seen = present;

        if !self.seeded {
            self.seeded = true;
            info!(existing = self.seen.len(), prefix = %self.prefix, "Listing bridge seeded");
            return Ok(0);
        }

        let mut enqueued = 0;
        for object in fresh {
            let event = UploadEvent::new(self.source.bucket(), &object.path, object.generation);
            let message_id = self.queue.enqueue(event).await?;
            debug!(
                message_id = %message_id,
                object_path = %object.path,
                generation = object.generation,
                "New object detected"
            );
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Poll forever on `interval`. Listing errors are logged and retried on
    /// the next tick; the loop ends once the queue shuts down.
    pub fn spawn(mut self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                prefix = %self.prefix,
                interval_secs = interval.as_secs(),
                "Listing bridge started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.scan().await {
                    Ok(0) => {}
                    Ok(n) => info!(enqueued = n, "Listing bridge enqueued new objects"),
                    Err(BridgeError::Queue(QueueError::Closed)) => {
                        info!("Queue closed, stopping listing bridge");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Listing scan failed"),
                }
            }
        })
    }
}
