//! Narrative interpretation of verified results.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::backend::GenerationBackend;
use crate::errors::PipelineError;
use crate::events::{truncate_str, Artifact, EventSink};
use crate::executor::ExecutionResult;

use super::ground_truth::GroundTruthFact;

/// How much captured output the commentary prompt may carry.
const MAX_SUMMARY_CHARS: usize = 2000;

pub struct CommentaryPhase<'a> {
    pub backend: &'a dyn GenerationBackend,
    /// Per-call budget for the backend, in seconds.
    pub backend_timeout: u64,
}

impl CommentaryPhase<'_> {
    /// Stream commentary token-by-token, then close the field with the full
    /// text. A backend failure closes the field empty; the turn continues.
    pub async fn run(
        &self,
        sink: &EventSink,
        request: &str,
        analysis: &str,
        summary: &str,
    ) -> Result<String, PipelineError> {
        let prompt = format!(
            "Interpret the verified analysis results for the user.\n\
             Request: {request}\n\
             Analysis plan:\n{analysis}\n\
             Verified results:\n{summary}\n\n\
             Write two or three sentences of plain commentary. Only cite \
             numbers that appear in the verified results above."
        );

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let timeout = Duration::from_secs(self.backend_timeout);
        let backend_call = tokio::time::timeout(timeout, self.backend.stream_text(&prompt, tx));
        let relay = async {
            while let Some(token) = rx.recv().await {
                sink.delta(Artifact::Commentary, &token).await?;
            }
            Ok::<(), PipelineError>(())
        };

        let (call_result, relay_result) = tokio::join!(backend_call, relay);
        relay_result?;
        let commentary = match call_result {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => {
                tracing::warn!(%error, "commentary generation failed");
                String::new()
            }
            Err(_) => {
                tracing::warn!(seconds = self.backend_timeout, "commentary timed out");
                String::new()
            }
        };

        sink.field_done(Artifact::Commentary, &commentary).await?;
        Ok(commentary)
    }
}

/// Condense a successful execution into the bounded summary the commentary
/// prompt receives: captured output first, then the fact list that bounds
/// what may be cited.
pub fn verified_summary(result: &ExecutionResult, facts: &[GroundTruthFact]) -> String {
    let mut summary = String::new();
    let output = result.output.trim();
    if !output.is_empty() {
        summary.push_str(&truncate_str(output, MAX_SUMMARY_CHARS));
    }
    if !facts.is_empty() {
        if !summary.is_empty() {
            summary.push('\n');
        }
        summary.push_str("Verified values:\n");
        for fact in facts {
            summary.push_str(&format!("- {} = {}\n", fact.source_key, fact.formatted_value));
        }
    }
    if summary.is_empty() {
        summary.push_str("The code ran successfully but produced no printed output.");
    }
    summary
}
