//! Delivery and retry engine.
//!
//! A single actor task owns the message table and the retry schedule. Callers
//! talk to it through [`QueueHandle`]; each delivery runs as its own task and
//! reports back over a completion channel, raced against the ack deadline.

use super::backoff::BackoffPolicy;
use super::scheduler::RetryScheduler;
use super::store::{MessageRecord, QueueStore};
use super::types::{DeliveryAttempt, MessageId, ProcessingOutcome, UploadEvent};
use crate::config::QueueConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Push target registered with [`MessageQueue::on_delivery`].
#[async_trait]
pub trait DeliveryTarget: Send + Sync + 'static {
    async fn deliver(&self, attempt: DeliveryAttempt) -> DeliveryReport;
}

/// Result of one delivery as seen by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub outcome: ProcessingOutcome,
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn acknowledged() -> Self {
        Self {
            outcome: ProcessingOutcome::Acknowledged,
            error: None,
        }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self {
            outcome: ProcessingOutcome::RetryableFailure,
            error: Some(error.into()),
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            outcome: ProcessingOutcome::FatalFailure,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no delivery target registered")]
    NoTarget,
    #[error("queue has shut down")]
    Closed,
    #[error("failed to recover queue state: {0}")]
    Recovery(#[source] opendal::Error),
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub ack_deadline: Duration,
    pub backoff: BackoffPolicy,
    pub max_delivery_attempts: u32,
    /// Dead-letter Fatal-Failure outcomes immediately. When off, they are
    /// retried like Retryable-Failure until the attempt budget runs out.
    pub fatal_short_circuit: bool,
    pub max_in_flight: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl QueueSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            ack_deadline: config.ack_deadline(),
            backoff: BackoffPolicy::from_config(config),
            max_delivery_attempts: config.max_delivery_attempts,
            fatal_short_circuit: config.fatal_short_circuit,
            max_in_flight: config.max_in_flight.max(1),
        }
    }
}

/// Live counters exposed on the queue status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub live: usize,
    pub in_flight: usize,
    pub scheduled: usize,
    pub enqueued_total: u64,
    pub delivered_total: u64,
    pub acknowledged_total: u64,
    pub retried_total: u64,
    pub dead_lettered_total: u64,
}

/// Terminal state of a message, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acknowledged {
        message_id: MessageId,
        attempts: u32,
    },
    DeadLettered {
        message_id: MessageId,
        attempts: u32,
        final_error: String,
    },
}

impl Settlement {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Settlement::Acknowledged { message_id, .. }
            | Settlement::DeadLettered { message_id, .. } => message_id,
        }
    }
}

enum Command {
    Enqueue {
        event: UploadEvent,
        reply: oneshot::Sender<MessageId>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
}

struct Completion {
    message_id: MessageId,
    attempt_number: u32,
    report: DeliveryReport,
}

/// Cloneable handle to a running queue.
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::Sender<Command>,
    settlements: broadcast::Sender<Settlement>,
}

impl QueueHandle {
    /// Add a message for `event`. Every call creates an independent message,
    /// even for an event already in the queue.
    pub async fn enqueue(&self, event: UploadEvent) -> Result<MessageId, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Enqueue { event, reply })
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Receive a [`Settlement`] for every message that reaches a terminal state
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Settlement> {
        self.settlements.subscribe()
    }
}

/// Builder for the queue actor.
pub struct MessageQueue {
    settings: QueueSettings,
    target: Option<Arc<dyn DeliveryTarget>>,
    dead_letters: DeadLetterQueue,
    store: Option<QueueStore>,
}

impl MessageQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            target: None,
            dead_letters: DeadLetterQueue::new(),
            store: None,
        }
    }

    /// Register the push target every delivery is sent to.
    pub fn on_delivery(mut self, target: Arc<dyn DeliveryTarget>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn dead_letters(mut self, dead_letters: DeadLetterQueue) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    /// Persist live messages so they survive a restart.
    pub fn store(mut self, store: QueueStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Recover persisted messages and spawn the actor.
    pub async fn start(self) -> Result<(QueueHandle, JoinHandle<()>), QueueError> {
        let target = self.target.ok_or(QueueError::NoTarget)?;
        let (commands_tx, commands_rx) = mpsc::channel(1024);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (settlements, _) = broadcast::channel(1024);

        let mut engine = Engine {
            settings: self.settings,
            target,
            dead_letters: self.dead_letters,
            store: self.store,
            table: HashMap::new(),
            scheduler: RetryScheduler::new(),
            ready: VecDeque::new(),
            in_flight: 0,
            stats: QueueStats::default(),
            commands: commands_rx,
            completions_tx,
            completions: completions_rx,
            settlements: settlements.clone(),
        };
        engine.recover().await?;

        let task = tokio::spawn(engine.run());
        Ok((
            QueueHandle {
                commands: commands_tx,
                settlements,
            },
            task,
        ))
    }
}

struct Engine {
    settings: QueueSettings,
    target: Arc<dyn DeliveryTarget>,
    dead_letters: DeadLetterQueue,
    store: Option<QueueStore>,
    table: HashMap<MessageId, MessageRecord>,
    scheduler: RetryScheduler,
    /// Due messages waiting for an in-flight slot.
    ready: VecDeque<MessageId>,
    in_flight: usize,
    stats: QueueStats,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    settlements: broadcast::Sender<Settlement>,
}

impl Engine {
    async fn recover(&mut self) -> Result<(), QueueError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let records = store.load_all().await.map_err(QueueError::Recovery)?;
        if records.is_empty() {
            return Ok(());
        }

        info!(count = records.len(), "Recovered live messages from queue state");
        let now = Instant::now();
        for record in records {
            let message_id = record.message_id.clone();
            // An attempt in progress at shutdown counts as failed.
            if record.attempts() >= self.settings.max_delivery_attempts {
                let final_error = record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "delivery interrupted by restart".to_string());
                self.table.insert(message_id.clone(), record);
                self.dead_letter(&message_id, final_error).await;
            } else {
                self.table.insert(message_id.clone(), record);
                self.scheduler.schedule(now, message_id);
            }
        }
        Ok(())
    }

    async fn run(mut self) {
        let mut accepting = true;
        loop {
            if !accepting && self.table.is_empty() {
                debug!("Queue drained after all handles closed");
                break;
            }

            let next_due = self.scheduler.next_due();
            let timer = async move {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(command) => self.handle_command(command).await,
                    None => accepting = false,
                },
                Some(completion) = self.completions.recv() => {
                    self.handle_completion(completion).await;
                }
                _ = timer => {
                    let due = self.scheduler.pop_due(Instant::now());
                    self.ready.extend(due);
                }
            }

            self.dispatch_ready().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { event, reply } => {
                let message_id = MessageId::generate();
                debug!(
                    message_id = %message_id,
                    object_path = %event.object_path,
                    generation = event.generation,
                    "Enqueued upload event"
                );
                let record = MessageRecord::new(message_id.clone(), event);
                self.persist(&record).await;
                self.table.insert(message_id.clone(), record);
                self.ready.push_back(message_id.clone());
                self.stats.enqueued_total += 1;
                counter!("queue.enqueued", 1);
                let _ = reply.send(message_id);
            }
            Command::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.live = self.table.len();
                stats.in_flight = self.in_flight;
                stats.scheduled = self.scheduler.len() + self.ready.len();
                let _ = reply.send(stats);
            }
        }
    }

    async fn dispatch_ready(&mut self) {
        while self.in_flight < self.settings.max_in_flight {
            let Some(message_id) = self.ready.pop_front() else {
                break;
            };
            self.dispatch(message_id).await;
        }
    }

    async fn dispatch(&mut self, message_id: MessageId) {
        let Some(record) = self.table.get_mut(&message_id) else {
            return;
        };
        if record.in_flight {
            return;
        }

        let attempt = DeliveryAttempt {
            message_id: message_id.clone(),
            upload_event: record.upload_event.clone(),
            attempt_number: record.attempts() + 1,
            delivered_at: Utc::now(),
        };
        record.attempt_history.push(attempt.clone());
        record.in_flight = true;
        let snapshot = record.clone();
        self.persist(&snapshot).await;

        self.in_flight += 1;
        self.stats.delivered_total += 1;
        counter!("queue.delivered", 1);
        debug!(
            message_id = %message_id,
            attempt = attempt.attempt_number,
            object_path = %attempt.upload_event.object_path,
            "Delivering message"
        );

        let target = Arc::clone(&self.target);
        let completions = self.completions_tx.clone();
        let ack_deadline = self.settings.ack_deadline;
        let attempt_number = attempt.attempt_number;
        tokio::spawn(async move {
            let mut call = tokio::spawn(async move { target.deliver(attempt).await });
            let report = match tokio::time::timeout(ack_deadline, &mut call).await {
                Ok(Ok(report)) => report,
                Ok(Err(join_error)) => {
                    DeliveryReport::retryable(format!("delivery handler crashed: {}", join_error))
                }
                // The handler keeps running detached; only the attempt is abandoned.
                Err(_) => DeliveryReport::retryable(format!(
                    "deadline exceeded: not acknowledged within {}s",
                    ack_deadline.as_secs()
                )),
            };
            let _ = completions.send(Completion {
                message_id,
                attempt_number,
                report,
            });
        });
    }

    async fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            message_id,
            attempt_number,
            report,
        } = completion;

        let Some(record) = self.table.get_mut(&message_id) else {
            debug!(message_id = %message_id, "Ignoring completion for settled message");
            return;
        };
        if !record.in_flight || attempt_number != record.attempts() {
            debug!(
                message_id = %message_id,
                attempt = attempt_number,
                "Ignoring stale completion"
            );
            return;
        }
        record.in_flight = false;
        record.last_error = report.error.clone();
        self.in_flight -= 1;

        let error = report
            .error
            .unwrap_or_else(|| report.outcome.as_str().to_string());

        match report.outcome {
            ProcessingOutcome::Acknowledged => {
                let record = self.table.remove(&message_id);
                self.unpersist(&message_id).await;
                self.stats.acknowledged_total += 1;
                counter!("queue.acknowledged", 1);
                info!(
                    message_id = %message_id,
                    attempt = attempt_number,
                    object_path = record.as_ref().map(|r| r.upload_event.object_path.as_str()).unwrap_or(""),
                    "Message acknowledged"
                );
                let _ = self.settlements.send(Settlement::Acknowledged {
                    message_id,
                    attempts: attempt_number,
                });
            }
            ProcessingOutcome::FatalFailure if self.settings.fatal_short_circuit => {
                self.dead_letter(&message_id, error).await;
            }
            outcome => {
                if outcome == ProcessingOutcome::FatalFailure {
                    debug!(message_id = %message_id, "Fatal short-circuit disabled; treating as retryable");
                }
                if attempt_number >= self.settings.max_delivery_attempts {
                    self.dead_letter(&message_id, error).await;
                    return;
                }

                let delay = self.settings.backoff.delay(attempt_number);
                self.scheduler
                    .schedule(Instant::now() + delay, message_id.clone());
                if let Some(record) = self.table.get(&message_id) {
                    let snapshot = record.clone();
                    self.persist(&snapshot).await;
                }
                self.stats.retried_total += 1;
                counter!("queue.retried", 1);
                warn!(
                    message_id = %message_id,
                    attempt = attempt_number,
                    retry_in_secs = delay.as_secs_f64(),
                    error = %error,
                    "Delivery failed; scheduled redelivery"
                );
            }
        }
    }

    async fn dead_letter(&mut self, message_id: &MessageId, final_error: String) {
        let Some(record) = self.table.remove(message_id) else {
            return;
        };
        let attempts = record.attempts();
        let entry = DeadLetterEntry {
            message_id: record.message_id,
            upload_event: record.upload_event,
            attempt_history: record.attempt_history,
            final_error: final_error.clone(),
            dead_lettered_at: Utc::now(),
        };

        if let Err(e) = self.dead_letters.record(entry).await {
            error!(
                message_id = %message_id,
                error = %e,
                "Dead-letter entry kept in memory only; will retry persisting"
            );
        }
        self.unpersist(message_id).await;
        self.stats.dead_lettered_total += 1;
        counter!("queue.dead_lettered", 1);
        let _ = self.settlements.send(Settlement::DeadLettered {
            message_id: message_id.clone(),
            attempts,
            final_error,
        });
    }

    async fn persist(&self, record: &MessageRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(record).await {
                error!(message_id = %record.message_id, error = %e, "Failed to persist message record");
            }
        }
    }

    async fn unpersist(&self, message_id: &MessageId) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(message_id).await {
                error!(message_id = %message_id, error = %e, "Failed to remove message record");
            }
        }
    }
}
