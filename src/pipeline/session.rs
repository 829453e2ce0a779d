//! One-turn orchestration across the phase state machine.
//!
//! Phases run strictly sequentially because each one seeds the next:
//! exploring builds the context block, generating produces the draft,
//! executing/retrying verifies the code, commenting narrates the verified
//! outcome. Per-turn state lives entirely on this stack; concurrent turns
//! never share anything but the collaborators.

use std::sync::Arc;

use uuid::Uuid;

use crate::backend::{BackendRegistry, GenerationBackend};
use crate::config::Settings;
use crate::errors::PipelineError;
use crate::events::{EventSink, Phase, StreamEvent};
use crate::executor::ExecutionService;
use crate::metadata::{describe_columns, DataSource, MetadataStore};

use super::commentary::{verified_summary, CommentaryPhase};
use super::explore::ExplorationPhase;
use super::generate::GenerationPhase;
use super::ground_truth::extract_ground_truth;
use super::retry::RetryController;

/// One inbound request.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TurnRequest {
    pub message: String,
    /// Which registered generation backend drives this turn.
    #[serde(default)]
    pub backend: Option<String>,
    /// Continues an earlier session when present.
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub sources: Vec<DataSource>,
}

pub struct SessionPipeline {
    backends: BackendRegistry,
    executor: Arc<dyn ExecutionService>,
    metadata: Arc<dyn MetadataStore>,
    settings: Settings,
}

impl SessionPipeline {
    pub fn new(
        backends: BackendRegistry,
        executor: Arc<dyn ExecutionService>,
        metadata: Arc<dyn MetadataStore>,
        settings: Settings,
    ) -> Self {
        Self {
            backends,
            executor,
            metadata,
            settings,
        }
    }

    /// Run one turn to completion, emitting the whole event stream.
    ///
    /// Every outcome, including failure, ends with a `done` event; the one
    /// exception is caller cancellation, after which nothing more may be
    /// emitted.
    pub async fn run_turn(&self, request: TurnRequest, sink: EventSink) {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::info!(session_id, backend = ?request.backend, "turn started");

        match self.drive_turn(&request, &sink).await {
            Ok(()) => {
                let _ = sink.emit(StreamEvent::Done { session_id }).await;
            }
            Err(error) if error.is_reportable() => {
                tracing::error!(session_id, %error, "turn failed");
                let _ = sink
                    .emit(StreamEvent::Error {
                        message: error.to_string(),
                    })
                    .await;
                let _ = sink.emit(StreamEvent::Done { session_id }).await;
            }
            Err(_) => {
                tracing::debug!(session_id, "turn cancelled by caller");
            }
        }
    }

    async fn drive_turn(
        &self,
        request: &TurnRequest,
        sink: &EventSink,
    ) -> Result<(), PipelineError> {
        let backend = self.select_backend(request)?;
        let column_context = describe_columns(self.metadata.as_ref(), &request.sources);

        // Exploring is skipped outright when nothing is attached.
        let exploration = if request.sources.is_empty() {
            String::new()
        } else {
            sink.phase_start(Phase::Exploring).await?;
            let phase = ExplorationPhase {
                backend: backend.as_ref(),
                executor: self.executor.as_ref(),
                metadata: self.metadata.as_ref(),
                max_rounds: self.settings.pipeline.max_explore_rounds,
            };
            let context = phase.run(&request.message, &request.sources).await;
            sink.phase_complete(Phase::Exploring).await?;
            context
        };

        sink.phase_start(Phase::Generating).await?;
        let generation = GenerationPhase {
            backend: backend.as_ref(),
            backend_timeout: self.settings.pipeline.backend_timeout_secs,
        };
        let instructions = compose_instructions(&request.message, &column_context, &exploration);
        let draft = generation.run(sink, &instructions).await?;
        sink.phase_complete(Phase::Generating).await?;

        let summary;
        let analysis = draft.analysis.clone();
        if draft.code.trim().is_empty() {
            // Analysis-only drafts have nothing to verify.
            summary = "No code was executed for this request.".to_string();
        } else {
            sink.phase_start(Phase::Executing).await?;
            let controller = RetryController {
                backend: backend.as_ref(),
                executor: self.executor.as_ref(),
                max_retries: self.settings.pipeline.max_retries,
                run_timeout: self.settings.executor.run_timeout_secs,
            };
            let file_paths: Vec<String> =
                request.sources.iter().map(|s| s.path.clone()).collect();
            let outcome = controller
                .run(sink, &request.message, &draft.code, &file_paths, &column_context)
                .await?;
            let closing = if outcome.entered_retry {
                Phase::Retrying
            } else {
                Phase::Executing
            };
            sink.phase_complete(closing).await?;

            summary = if outcome.result.success {
                let facts = extract_ground_truth(&outcome.result);
                verified_summary(&outcome.result, &facts)
            } else {
                format!(
                    "The code did not run successfully after {} attempt(s). {}",
                    outcome.total_attempts,
                    outcome.explanation.unwrap_or_default()
                )
            };
        }

        sink.phase_start(Phase::Commenting).await?;
        let commentary = CommentaryPhase {
            backend: backend.as_ref(),
            backend_timeout: self.settings.pipeline.backend_timeout_secs,
        };
        commentary
            .run(sink, &request.message, &analysis, &summary)
            .await?;
        sink.phase_complete(Phase::Commenting).await?;

        Ok(())
    }

    fn select_backend(
        &self,
        request: &TurnRequest,
    ) -> Result<Arc<dyn GenerationBackend>, PipelineError> {
        let name = request.backend.as_deref().unwrap_or_else(|| {
            self.settings
                .backends
                .first()
                .map(|b| b.name.as_str())
                .unwrap_or("openai")
        });
        self.backends
            .get(name)
            .ok_or_else(|| PipelineError::UnknownBackend(name.to_string()))
    }
}

fn compose_instructions(message: &str, column_context: &str, exploration: &str) -> String {
    let mut instructions = format!(
        "Write an analysis plan and Python code answering this request.\n\
         Request: {message}\n\
         Available data:\n{column_context}"
    );
    if !exploration.is_empty() {
        instructions.push_str("\nExploration findings:\n");
        instructions.push_str(exploration);
    }
    instructions
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::{
        BackendResult, DraftSnapshot, ExploreMessage, ExploreStep, ToolSpec,
    };
    use crate::errors::{BackendError, ExecutionError};
    use crate::events;
    use crate::executor::{ExecutionRequest, ExecutionResult};
    use crate::metadata::InMemoryMetadata;

    struct HappyBackend;

    #[async_trait]
    impl GenerationBackend for HappyBackend {
        fn name(&self) -> &str {
            "happy"
        }

        async fn stream_draft(
            &self,
            _instructions: &str,
            tx: mpsc::Sender<DraftSnapshot>,
        ) -> BackendResult<DraftSnapshot> {
            let draft = DraftSnapshot {
                analysis: "I will count rows.".to_string(),
                code: "print(len(df))".to_string(),
            };
            let _ = tx.send(draft.clone()).await;
            Ok(draft)
        }

        async fn generate_draft(&self, _instructions: &str) -> BackendResult<DraftSnapshot> {
            Err(BackendError::Malformed("unused".into()))
        }

        async fn generate_text(&self, _prompt: &str) -> BackendResult<String> {
            Ok("corrected".to_string())
        }

        async fn stream_text(
            &self,
            _prompt: &str,
            _tx: mpsc::Sender<String>,
        ) -> BackendResult<String> {
            Ok("The table has 3 rows.".to_string())
        }

        async fn explore_step(
            &self,
            _transcript: &[ExploreMessage],
            _tools: &[ToolSpec],
        ) -> BackendResult<ExploreStep> {
            Ok(ExploreStep::Text("nothing to inspect".to_string()))
        }
    }

    /// Streams an analysis-only draft and refuses everything else.
    struct AnalysisOnlyBackend;

    #[async_trait]
    impl GenerationBackend for AnalysisOnlyBackend {
        fn name(&self) -> &str {
            "analysis-only"
        }

        async fn stream_draft(
            &self,
            _instructions: &str,
            _tx: mpsc::Sender<DraftSnapshot>,
        ) -> BackendResult<DraftSnapshot> {
            Err(BackendError::Transport("scripted".into()))
        }

        async fn generate_draft(&self, _instructions: &str) -> BackendResult<DraftSnapshot> {
            Ok(DraftSnapshot {
                analysis: "This needs no code.".to_string(),
                code: String::new(),
            })
        }

        async fn generate_text(&self, _prompt: &str) -> BackendResult<String> {
            Err(BackendError::Transport("scripted".into()))
        }

        async fn stream_text(
            &self,
            _prompt: &str,
            _tx: mpsc::Sender<String>,
        ) -> BackendResult<String> {
            Ok("Nothing was executed.".to_string())
        }

        async fn explore_step(
            &self,
            _transcript: &[ExploreMessage],
            _tools: &[ToolSpec],
        ) -> BackendResult<ExploreStep> {
            Err(BackendError::Malformed("unused".into()))
        }
    }

    struct OkExecutor;

    #[async_trait]
    impl ExecutionService for OkExecutor {
        async fn execute(
            &self,
            _request: ExecutionRequest,
        ) -> Result<ExecutionResult, ExecutionError> {
            Ok(ExecutionResult {
                success: true,
                output: "3".to_string(),
                ..ExecutionResult::default()
            })
        }
    }

    fn pipeline(backend: Arc<dyn GenerationBackend>, name: &str) -> SessionPipeline {
        let mut backends = BackendRegistry::new();
        backends.register(backend);
        let mut settings = Settings::load(Some(std::path::Path::new("/nonexistent"))).unwrap();
        settings.backends[0].name = name.to_string();
        SessionPipeline::new(
            backends,
            Arc::new(OkExecutor),
            Arc::new(InMemoryMetadata::new()),
            settings,
        )
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_happy_turn_phase_order() {
        let pipeline = pipeline(Arc::new(HappyBackend), "happy");
        let (sink, rx) = events::channel();
        let request = TurnRequest {
            message: "how many rows?".to_string(),
            backend: None,
            session_id: Some("s-1".to_string()),
            sources: vec![],
        };

        pipeline.run_turn(request, sink).await;
        let emitted = collect(rx).await;

        let phases: Vec<_> = emitted
            .iter()
            .filter_map(|e| match e {
                StreamEvent::PhaseStart { phase } => Some(("start", *phase)),
                StreamEvent::PhaseComplete { phase } => Some(("complete", *phase)),
                _ => None,
            })
            .collect();
        // No sources attached: exploring never appears.
        assert_eq!(
            phases,
            vec![
                ("start", Phase::Generating),
                ("complete", Phase::Generating),
                ("start", Phase::Executing),
                ("complete", Phase::Executing),
                ("start", Phase::Commenting),
                ("complete", Phase::Commenting),
            ]
        );
        assert!(matches!(
            emitted.last(),
            Some(StreamEvent::Done { session_id }) if session_id == "s-1"
        ));
        assert!(emitted
            .iter()
            .all(|e| !matches!(e, StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_analysis_only_draft_skips_execution() {
        let pipeline = pipeline(Arc::new(AnalysisOnlyBackend), "analysis-only");
        let (sink, rx) = events::channel();
        let request = TurnRequest {
            message: "what is a median?".to_string(),
            backend: Some("analysis-only".to_string()),
            session_id: None,
            sources: vec![],
        };

        pipeline.run_turn(request, sink).await;
        let emitted = collect(rx).await;

        assert!(emitted.iter().all(|e| {
            !matches!(
                e,
                StreamEvent::PhaseStart {
                    phase: Phase::Executing
                } | StreamEvent::ExecutionResult { .. }
            )
        }));
        assert!(matches!(emitted.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_unknown_backend_is_an_error_event_then_done() {
        let pipeline = pipeline(Arc::new(HappyBackend), "happy");
        let (sink, rx) = events::channel();
        let request = TurnRequest {
            message: "anything".to_string(),
            backend: Some("missing".to_string()),
            session_id: None,
            sources: vec![],
        };

        pipeline.run_turn(request, sink).await;
        let emitted = collect(rx).await;

        assert!(matches!(
            &emitted[..],
            [StreamEvent::Error { .. }, StreamEvent::Done { .. }]
        ));
    }
}
