//! At-least-once message queue with ack deadlines, bounded exponential
//! backoff and dead-letter routing.

mod backoff;
mod engine;
mod scheduler;
mod store;
mod types;

pub use backoff::BackoffPolicy;
pub use engine::{
    DeliveryReport, DeliveryTarget, MessageQueue, QueueError, QueueHandle, QueueSettings,
    QueueStats, Settlement,
};
pub use scheduler::RetryScheduler;
pub use store::{MessageRecord, QueueStore};
pub use types::{DeliveryAttempt, IdempotencyKey, MessageId, ProcessingOutcome, UploadEvent};
