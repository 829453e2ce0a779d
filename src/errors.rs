//! Typed error hierarchy for the Andexa analysis core.
//!
//! Three top-level enums cover the three subsystems:
//! - `BackendError` — generation-backend transport and format failures
//! - `ExecutionError` — execution-service transport failures
//! - `PipelineError` — per-turn pipeline failures

use thiserror::Error;

/// Errors from a generation-backend call.
///
/// These are absorbed by the generation fallback chain and the auxiliary-call
/// defaults; they only surface to the caller when every fallback exhausts.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("backend returned malformed output: {0}")]
    Malformed(String),

    #[error("backend call timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Errors from the execution-service transport.
///
/// A transport failure is not a code failure: the retry controller folds it
/// into a failed execution result and classifies it like any other raw
/// failure text.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("execution service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Errors that end a turn.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The event receiver was dropped; the caller aborted mid-turn.
    #[error("caller disconnected mid-turn")]
    Cancelled,

    /// Both analysis and code were empty after the full fallback chain.
    #[error("generation produced no analysis and no code")]
    EmptyGeneration,

    #[error("unknown generation backend '{0}'")]
    UnknownBackend(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl PipelineError {
    /// Whether the turn should emit an `error` event before `done`.
    ///
    /// Cancellation must not: no events may follow a dropped receiver.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, PipelineError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_timeout_carries_seconds() {
        let err = BackendError::Timeout { seconds: 60 };
        assert!(err.to_string().contains("60"));
        match err {
            BackendError::Timeout { seconds } => assert_eq!(seconds, 60),
            _ => panic!("Expected Timeout variant"),
        }
    }

    #[test]
    fn execution_status_error_carries_body() {
        let err = ExecutionError::Status {
            status: 503,
            body: "service restarting".to_string(),
        };
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("service restarting"));
    }

    #[test]
    fn pipeline_error_converts_from_backend_error() {
        let inner = BackendError::Malformed("not json".to_string());
        let err: PipelineError = inner.into();
        match &err {
            PipelineError::Backend(BackendError::Malformed(msg)) => {
                assert_eq!(msg, "not json");
            }
            _ => panic!("Expected PipelineError::Backend(Malformed(...))"),
        }
    }

    #[test]
    fn cancelled_is_not_reportable() {
        assert!(!PipelineError::Cancelled.is_reportable());
        assert!(PipelineError::EmptyGeneration.is_reportable());
        assert!(PipelineError::UnknownBackend("x".into()).is_reportable());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BackendError::Transport("x".into()));
        assert_std_error(&PipelineError::EmptyGeneration);
    }
}
