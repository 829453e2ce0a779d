//! Outward event protocol for one analysis turn.
//!
//! Every turn produces exactly one ordered, append-only stream of
//! [`StreamEvent`]s. The stream is single-writer (the pipeline task) and
//! single-reader (the caller); ordering matches generation order.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::PipelineError;

/// Channel capacity for the per-turn event stream.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Event types ──────────────────────────────────────────────────────

/// Pipeline phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Exploring,
    Generating,
    Executing,
    Retrying,
    Commenting,
}

/// One of the three generated text fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    Analysis,
    Code,
    Commentary,
}

/// Events streamed to the caller over one turn.
///
/// Field names that cross to the web consumer are camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    PhaseStart {
        phase: Phase,
    },
    PhaseComplete {
        phase: Phase,
    },

    /// Incremental suffix growth of one field.
    Delta {
        field: Artifact,
        text: String,
    },
    /// Terminal value for one field. Authoritative when a fallback strategy
    /// superseded the streamed deltas.
    FieldDone {
        field: Artifact,
        value: String,
    },

    ExecutionResult {
        success: bool,
        output: String,
        results: serde_json::Map<String, serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(rename = "elapsedMs")]
        elapsed_ms: u64,
    },

    RetryStart {
        attempt: u32,
        #[serde(rename = "errorType")]
        error_type: String,
    },
    RetryFailed {
        #[serde(rename = "totalAttempts")]
        total_attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },

    /// Precedes `done` on unrecoverable failure.
    Error {
        message: String,
    },
    Done {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

// ── Event sink ───────────────────────────────────────────────────────

/// Single-producer handle for the per-turn event channel.
///
/// A failed send means the receiver is gone: the caller aborted the turn.
/// That maps to [`PipelineError::Cancelled`] so the pipeline unwinds without
/// emitting anything further.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: StreamEvent) -> Result<(), PipelineError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| PipelineError::Cancelled)
    }

    pub async fn phase_start(&self, phase: Phase) -> Result<(), PipelineError> {
        self.emit(StreamEvent::PhaseStart { phase }).await
    }

    pub async fn phase_complete(&self, phase: Phase) -> Result<(), PipelineError> {
        self.emit(StreamEvent::PhaseComplete { phase }).await
    }

    pub async fn delta(&self, field: Artifact, text: impl Into<String>) -> Result<(), PipelineError> {
        let text = text.into();
        if text.is_empty() {
            return Ok(());
        }
        self.emit(StreamEvent::Delta { field, text }).await
    }

    pub async fn field_done(
        &self,
        field: Artifact,
        value: impl Into<String>,
    ) -> Result<(), PipelineError> {
        self.emit(StreamEvent::FieldDone {
            field,
            value: value.into(),
        })
        .await
    }
}

/// Shorthand for [`EventSink::channel`].
pub fn channel() -> (EventSink, mpsc::Receiver<StreamEvent>) {
    EventSink::channel()
}

// ── Text helpers ─────────────────────────────────────────────────────

/// Truncate a string with ellipsis, respecting char boundaries.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_start_serialization() {
        let ev = StreamEvent::PhaseStart {
            phase: Phase::Generating,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"phase_start\""));
        assert!(json.contains("\"phase\":\"generating\""));
    }

    #[test]
    fn test_delta_serialization() {
        let ev = StreamEvent::Delta {
            field: Artifact::Analysis,
            text: "Average revenue is".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"delta\""));
        assert!(json.contains("\"field\":\"analysis\""));
    }

    #[test]
    fn test_retry_events_use_camel_case_fields() {
        let start = StreamEvent::RetryStart {
            attempt: 2,
            error_type: "KeyError".to_string(),
        };
        let json = serde_json::to_string(&start).unwrap();
        assert!(json.contains("\"errorType\":\"KeyError\""));
        assert!(json.contains("\"attempt\":2"));

        let failed = StreamEvent::RetryFailed {
            total_attempts: 4,
            explanation: Some("columns do not exist".to_string()),
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("\"totalAttempts\":4"));
    }

    #[test]
    fn test_retry_failed_omits_absent_explanation() {
        let ev = StreamEvent::RetryFailed {
            total_attempts: 1,
            explanation: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("explanation"));
    }

    #[test]
    fn test_execution_result_serialization() {
        let mut results = serde_json::Map::new();
        results.insert("result".to_string(), serde_json::json!(42));
        let ev = StreamEvent::ExecutionResult {
            success: true,
            output: "done\n".to_string(),
            results,
            error: None,
            elapsed_ms: 120,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"execution_result\""));
        assert!(json.contains("\"elapsedMs\":120"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_done_roundtrip() {
        let ev = StreamEvent::Done {
            session_id: "abc-123".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"sessionId\":\"abc-123\""));
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        match back {
            StreamEvent::Done { session_id } => assert_eq!(session_id, "abc-123"),
            _ => panic!("Expected Done variant"),
        }
    }

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.phase_start(Phase::Generating).await.unwrap();
        sink.delta(Artifact::Code, "df.head()").await.unwrap();
        drop(sink);

        match rx.recv().await.unwrap() {
            StreamEvent::PhaseStart { phase } => assert_eq!(phase, Phase::Generating),
            other => panic!("Unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            StreamEvent::Delta { field, text } => {
                assert_eq!(field, Artifact::Code);
                assert_eq!(text, "df.head()");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sink_maps_dropped_receiver_to_cancelled() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        let err = sink.phase_start(Phase::Exploring).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_delta_is_suppressed() {
        let (sink, mut rx) = EventSink::channel();
        sink.delta(Artifact::Analysis, "").await.unwrap();
        drop(sink);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a very long sentence", 10), "a very ...");
    }
}
