use super::state::WorkerState;
use crate::journal::ParseError;
use crate::queue::ProcessingOutcome;
use crate::sink::SinkError;
use crate::source::FetchError;
use thiserror::Error;

/// Everything that can go wrong while processing one delivery.
///
/// Each variant is classified as retryable or fatal where it is raised; the
/// queue only ever sees the resulting [`ProcessingOutcome`].
#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    #[error("transient fetch error: {message}")]
    TransientFetchError { message: String },

    #[error("object not found: {message}")]
    ObjectNotFound { message: String },

    #[error("malformed input: {message}")]
    MalformedInput { message: String },

    #[error("sink unavailable: {message}")]
    SinkUnavailable { message: String },

    #[error("processing budget of {budget_ms}ms exhausted while {state}")]
    DeadlineExceeded { state: WorkerState, budget_ms: u64 },
}

impl ProcessingError {
    pub fn outcome(&self) -> ProcessingOutcome {
        match self {
            Self::ObjectNotFound { .. } | Self::MalformedInput { .. } => {
                ProcessingOutcome::FatalFailure
            }
            Self::TransientFetchError { .. }
            | Self::SinkUnavailable { .. }
            | Self::DeadlineExceeded { .. } => ProcessingOutcome::RetryableFailure,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.outcome() == ProcessingOutcome::FatalFailure
    }

    /// Error type string for logs and responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientFetchError { .. } => "TransientFetchError",
            Self::ObjectNotFound { .. } => "ObjectNotFound",
            Self::MalformedInput { .. } => "MalformedInput",
            Self::SinkUnavailable { .. } => "SinkUnavailable",
            Self::DeadlineExceeded { .. } => "DeadlineExceeded",
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }
}

impl From<FetchError> for ProcessingError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotFound { .. } => Self::ObjectNotFound {
                message: e.to_string(),
            },
            FetchError::Transient { .. } => Self::TransientFetchError {
                message: e.to_string(),
            },
        }
    }
}

impl From<ParseError> for ProcessingError {
    fn from(e: ParseError) -> Self {
        Self::malformed(e.to_string())
    }
}

impl From<SinkError> for ProcessingError {
    fn from(e: SinkError) -> Self {
        if e.is_retryable() {
            Self::SinkUnavailable {
                message: e.to_string(),
            }
        } else {
            Self::malformed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let retryable = [
            ProcessingError::TransientFetchError {
                message: "503".into(),
            },
            ProcessingError::SinkUnavailable {
                message: "refused".into(),
            },
            ProcessingError::DeadlineExceeded {
                state: WorkerState::Writing,
                budget_ms: 270_000,
            },
        ];
        for err in retryable {
            assert_eq!(err.outcome(), ProcessingOutcome::RetryableFailure, "{}", err);
        }

        assert!(ProcessingError::ObjectNotFound {
            message: "gone".into()
        }
        .is_fatal());
        assert!(ProcessingError::malformed("binary").is_fatal());
    }

    #[test]
    fn parse_errors_are_malformed() {
        let err: ProcessingError = ParseError::NoRecognizedLines { lines: 3 }.into();
        assert_eq!(err.kind(), "MalformedInput");
    }

    #[test]
    fn encode_failures_are_fatal_but_storage_failures_retry() {
        let encode: ProcessingError = SinkError::Encode("bad column".into()).into();
        assert!(encode.is_fatal());

        let storage: ProcessingError = SinkError::Unavailable {
            operation: "write records",
            source: opendal::Error::new(opendal::ErrorKind::Unexpected, "connection reset"),
        }
        .into();
        assert_eq!(storage.kind(), "SinkUnavailable");
        assert!(!storage.is_fatal());
    }

    #[test]
    fn deadline_message_names_the_state() {
        let err = ProcessingError::DeadlineExceeded {
            state: WorkerState::Parsing,
            budget_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "processing budget of 1500ms exhausted while parsing"
        );
    }
}
