use serde::Serialize;
use std::fmt;

/// Processing state of one delivery.
///
/// ```text
/// Received -> Fetching -> Parsing -> Writing -> Acknowledged
///     \           \          \          \
///      +-----------+----------+----------+--> Failed
/// ```
///
/// `Received -> Acknowledged` is also valid for deliveries that are skipped
/// or already committed, and `Parsing -> Acknowledged` for content that was
/// already ingested under another key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Received,
    Fetching,
    Parsing,
    Writing,
    Acknowledged,
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Received => "received",
            WorkerState::Fetching => "fetching",
            WorkerState::Parsing => "parsing",
            WorkerState::Writing => "writing",
            WorkerState::Acknowledged => "acknowledged",
            WorkerState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Acknowledged | WorkerState::Failed)
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Received, Fetching)
                | (Fetching, Parsing)
                | (Parsing, Writing)
                | (Writing, Acknowledged)
                | (Received, Acknowledged)
                | (Fetching, Acknowledged)
                | (Parsing, Acknowledged)
                | (Received | Fetching | Parsing | Writing, Failed)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States visited by one delivery, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTrace {
    visited: Vec<WorkerState>,
}

impl Default for StateTrace {
    fn default() -> Self {
        Self {
            visited: vec![WorkerState::Received],
        }
    }
}

impl StateTrace {
    pub fn current(&self) -> WorkerState {
        self.visited
            .last()
            .copied()
            .unwrap_or(WorkerState::Received)
    }

    /// Move to `next`. Illegal transitions are ignored and logged; the trace
    /// never leaves a terminal state.
    pub fn advance(&mut self, next: WorkerState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            tracing::warn!(from = %current, to = %next, "Ignoring illegal worker transition");
            return;
        }
        tracing::debug!(from = %current, to = %next, "Worker transition");
        self.visited.push(next);
    }

    pub fn visited(&self) -> &[WorkerState] {
        &self.visited
    }

    pub fn into_visited(self) -> Vec<WorkerState> {
        self.visited
    }
}
