//! Processing worker: turns one delivery into one committed record set.
//!
//! A delivery walks `Received -> Fetching -> Parsing -> Writing ->
//! Acknowledged`, or drops to `Failed` from any working state. Every failure
//! is classified on the spot (see [`ProcessingError::outcome`]).
//!
//! The worker is stateless across deliveries. Duplicate and concurrent
//! deliveries are safe because the sink addresses record sets by
//! [`IdempotencyKey`] alone.

mod error;
mod state;

pub use error::ProcessingError;
pub use state::{StateTrace, WorkerState};

use crate::config::RuntimeConfig;
use crate::journal::{parse_journal_with, ParseOptions};
use crate::queue::{
    DeliveryAttempt, DeliveryReport, DeliveryTarget, IdempotencyKey, MessageId, ProcessingOutcome,
    UploadEvent,
};
use crate::sink::RecordSink;
use crate::source::{FetchError, ObjectSource};
use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn, Instrument};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Upper bound for parsing one object, independent of the ack deadline.
    pub parse_timeout: Duration,
    /// Time from delivery within which the worker must answer: the ack
    /// deadline minus a safety margin.
    pub processing_budget: Duration,
    /// Only objects ending in one of these are ingested; empty means all.
    pub include_suffixes: Vec<String>,
    /// Objects whose path contains this are skipped.
    pub exclude_segment: String,
    pub archive_processed: bool,
    pub processed_segment: String,
    pub parse_options: ParseOptions,
    pub skip_duplicate_content: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            parse_timeout: Duration::from_secs(30),
            processing_budget: Duration::from_secs(270),
            include_suffixes: Vec::new(),
            exclude_segment: "/processed/".to_string(),
            archive_processed: false,
            processed_segment: "processed".to_string(),
            parse_options: ParseOptions::default(),
            skip_duplicate_content: true,
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let worker = &config.worker;
        Self {
            parse_timeout: Duration::from_secs(worker.parse_timeout_secs),
            processing_budget: config
                .queue
                .ack_deadline()
                .saturating_sub(Duration::from_secs(worker.deadline_margin_secs)),
            include_suffixes: worker.include_suffixes.clone(),
            exclude_segment: worker.exclude_segment.clone(),
            archive_processed: worker.archive_processed,
            processed_segment: worker.processed_segment.clone(),
            parse_options: ParseOptions {
                max_entries: worker.max_entries_per_file,
                identity_scan_entries: worker.identity_scan_entries,
            },
            skip_duplicate_content: worker.skip_duplicate_content,
        }
    }

    /// Why `object_path` should not be ingested, if it should not.
    pub fn skip_reason(&self, object_path: &str) -> Option<String> {
        if !self.exclude_segment.is_empty()
            && format!("/{}", object_path).contains(&self.exclude_segment)
        {
            return Some(format!("path is under '{}'", self.exclude_segment));
        }
        if !self.include_suffixes.is_empty()
            && !self
                .include_suffixes
                .iter()
                .any(|suffix| object_path.ends_with(suffix.as_str()))
        {
            return Some(format!(
                "suffix not in [{}]",
                self.include_suffixes.join(", ")
            ));
        }
        None
    }
}

/// How an acknowledged delivery was satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    Written {
        records: usize,
        records_path: String,
    },
    /// The record set was already committed by an earlier delivery.
    AlreadyCommitted,
    /// Identical bytes were already committed under another key.
    DuplicateContent {
        original: IdempotencyKey,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ProcessingReport {
    pub message_id: MessageId,
    pub attempt_number: u32,
    pub idempotency_key: IdempotencyKey,
    pub states: Vec<WorkerState>,
    pub result: Result<Disposition, ProcessingError>,
    pub elapsed: Duration,
}

impl ProcessingReport {
    pub fn outcome(&self) -> ProcessingOutcome {
        match &self.result {
            Ok(_) => ProcessingOutcome::Acknowledged,
            Err(e) => e.outcome(),
        }
    }

    pub fn final_state(&self) -> WorkerState {
        self.states.last().copied().unwrap_or(WorkerState::Received)
    }

    pub fn delivery_report(&self) -> DeliveryReport {
        match &self.result {
            Ok(_) => DeliveryReport::acknowledged(),
            Err(e) if e.is_fatal() => DeliveryReport::fatal(e.to_string()),
            Err(e) => DeliveryReport::retryable(e.to_string()),
        }
    }
}

pub struct Worker {
    source: Arc<dyn ObjectSource>,
    sink: Arc<dyn RecordSink>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        sink: Arc<dyn RecordSink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            source,
            sink,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    pub fn source(&self) -> &Arc<dyn ObjectSource> {
        &self.source
    }

    /// Process one delivery to a terminal state.
    pub async fn process(&self, attempt: &DeliveryAttempt) -> ProcessingReport {
        let span = tracing::info_span!(
            "process",
            message_id = %attempt.message_id,
            attempt = attempt.attempt_number,
            object_path = %attempt.upload_event.object_path,
        );
        self.process_inner(attempt).instrument(span).await
    }

    async fn process_inner(&self, attempt: &DeliveryAttempt) -> ProcessingReport {
        let start = Instant::now();
        let key = attempt.upload_event.idempotency_key();

        // The budget runs from delivery, not from when this call started.
        let waited = (Utc::now() - attempt.delivered_at)
            .to_std()
            .unwrap_or_default();
        let deadline = start + self.settings.processing_budget.saturating_sub(waited);

        let mut trace = StateTrace::default();
        let result = self
            .run(&attempt.upload_event, &key, deadline, &mut trace)
            .await;
        match &result {
            Ok(_) => trace.advance(WorkerState::Acknowledged),
            Err(_) => trace.advance(WorkerState::Failed),
        }

        let elapsed = start.elapsed();
        histogram!("worker.latency_ms", elapsed.as_secs_f64() * 1000.0);
        match &result {
            Ok(disposition) => {
                if let Disposition::Written { records, .. } = disposition {
                    counter!("worker.records", *records as u64);
                }
                info!(
                    idempotency_key = %key,
                    disposition = ?disposition,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Delivery acknowledged"
                );
            }
            Err(e) => {
                counter!("worker.failures", 1, "kind" => e.kind());
                warn!(
                    idempotency_key = %key,
                    kind = e.kind(),
                    outcome = e.outcome().as_str(),
                    error = %e,
                    "Delivery failed"
                );
            }
        }

        ProcessingReport {
            message_id: attempt.message_id.clone(),
            attempt_number: attempt.attempt_number,
            idempotency_key: key,
            states: trace.into_visited(),
            result,
            elapsed,
        }
    }

    async fn run(
        &self,
        event: &UploadEvent,
        key: &IdempotencyKey,
        deadline: Instant,
        trace: &mut StateTrace,
    ) -> Result<Disposition, ProcessingError> {
        if let Some(reason) = self.settings.skip_reason(&event.object_path) {
            return Ok(Disposition::Skipped { reason });
        }

        let budget_ms = self.settings.processing_budget.as_millis() as u64;
        let exceeded = |state| ProcessingError::DeadlineExceeded { state, budget_ms };
        let ensure_budget = |state| {
            if Instant::now() >= deadline {
                Err(exceeded(state))
            } else {
                Ok(())
            }
        };

        ensure_budget(WorkerState::Received)?;

        if timeout_at(deadline, self.sink.contains(key))
            .await
            .map_err(|_| exceeded(WorkerState::Received))??
        {
            return Ok(Disposition::AlreadyCommitted);
        }

        ensure_budget(WorkerState::Fetching)?;
        trace.advance(WorkerState::Fetching);
        let fetched = timeout_at(deadline, self.source.fetch(event))
            .await
            .map_err(|_| exceeded(WorkerState::Fetching))?;
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e @ FetchError::NotFound { .. }) => {
                // An earlier attempt may have committed and archived the object.
                if timeout_at(deadline, self.sink.contains(key))
                    .await
                    .map_err(|_| exceeded(WorkerState::Fetching))??
                {
                    return Ok(Disposition::AlreadyCommitted);
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        ensure_budget(WorkerState::Parsing)?;
        trace.advance(WorkerState::Parsing);
        let parse_limit = Instant::now() + self.settings.parse_timeout;
        let file_name = event.file_name().to_string();
        let options = self.settings.parse_options;
        let parse =
            tokio::task::spawn_blocking(move || parse_journal_with(&file_name, &bytes, &options));
        let journal = match timeout_at(parse_limit.min(deadline), parse).await {
            Ok(Ok(parsed)) => parsed?,
            Ok(Err(join_error)) => {
                return Err(ProcessingError::malformed(format!(
                    "parser aborted: {}",
                    join_error
                )))
            }
            Err(_) if deadline < parse_limit => return Err(exceeded(WorkerState::Parsing)),
            Err(_) => {
                return Err(ProcessingError::malformed(format!(
                    "parse did not finish within {}s",
                    self.settings.parse_timeout.as_secs()
                )))
            }
        };
        if journal.truncated_bytes > 0 {
            warn!(
                idempotency_key = %key,
                truncated_bytes = journal.truncated_bytes,
                records = journal.entries.len(),
                "Ingesting truncated upload"
            );
        }

        if self.settings.skip_duplicate_content {
            let committed = timeout_at(
                deadline,
                self.sink.committed_content(&journal.identity.content_sha256),
            )
            .await
            .map_err(|_| exceeded(WorkerState::Parsing))??;
            if let Some(original) = committed.filter(|original| original != key) {
                info!(
                    idempotency_key = %key,
                    original = %original,
                    content_sha256 = %journal.identity.content_sha256,
                    "Content already ingested"
                );
                return Ok(Disposition::DuplicateContent { original });
            }
        }

        ensure_budget(WorkerState::Writing)?;
        trace.advance(WorkerState::Writing);
        let manifest = timeout_at(deadline, self.sink.upsert(key, event, &journal))
            .await
            .map_err(|_| exceeded(WorkerState::Writing))??;

        if self.settings.archive_processed {
            let archive = self
                .source
                .mark_processed(event, &self.settings.processed_segment);
            match timeout_at(deadline, archive).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Records committed but archiving the object failed"),
                Err(_) => warn!("Records committed but archiving the object ran out of budget"),
            }
        }

        Ok(Disposition::Written {
            records: manifest.record_count,
            records_path: manifest.records_path,
        })
    }
}

#[async_trait]
impl DeliveryTarget for Worker {
    async fn deliver(&self, attempt: DeliveryAttempt) -> DeliveryReport {
        self.process(&attempt).await.delivery_report()
    }
}
