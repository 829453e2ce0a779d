//! Structured generation of the analysis/code draft.
//!
//! The streaming structured call is preferred; when it errors or comes back
//! empty the phase falls through an ordered chain of non-streaming recoveries.
//! Whatever path wins, the terminal field payloads are authoritative over any
//! deltas already streamed.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::backend::{DraftSnapshot, GenerationBackend};
use crate::errors::PipelineError;
use crate::events::{Artifact, EventSink};

pub struct GenerationPhase<'a> {
    pub backend: &'a dyn GenerationBackend,
    /// Per-call budget for the backend, in seconds.
    pub backend_timeout: u64,
}

impl GenerationPhase<'_> {
    /// Produce a finalized draft, streaming deltas when the backend can.
    ///
    /// Fails only when every strategy leaves both fields empty.
    pub async fn run(
        &self,
        sink: &EventSink,
        instructions: &str,
    ) -> Result<DraftSnapshot, PipelineError> {
        let (mut draft, partial) = self.stream_structured(sink, instructions).await?;

        if draft.is_none() {
            draft = self.recover_structured(instructions).await;
        }
        if draft.is_none() {
            draft = self.recover_from_json(instructions).await;
        }
        if draft.is_none() {
            draft = self.recover_from_prose(instructions).await;
        }
        if draft.is_none() && !partial.is_empty() {
            // A half-finished stream still beats failing the turn.
            draft = Some(partial);
        }

        let Some(mut draft) = draft else {
            return Err(PipelineError::EmptyGeneration);
        };
        draft.code = strip_code_fences(&draft.code);

        sink.field_done(Artifact::Analysis, &draft.analysis).await?;
        sink.field_done(Artifact::Code, &draft.code).await?;
        Ok(draft)
    }

    /// Returns the winning draft (both fields filled) plus whatever partial
    /// draft the stream left behind; only a cancelled event stream is an
    /// error here.
    async fn stream_structured(
        &self,
        sink: &EventSink,
        instructions: &str,
    ) -> Result<(Option<DraftSnapshot>, DraftSnapshot), PipelineError> {
        let (tx, mut rx) = mpsc::channel::<DraftSnapshot>(64);
        let timeout = Duration::from_secs(self.backend_timeout);

        let backend_call = tokio::time::timeout(timeout, self.backend.stream_draft(instructions, tx));
        let relay = async {
            let mut seen = DraftSnapshot::default();
            while let Some(snapshot) = rx.recv().await {
                emit_growth(sink, Artifact::Analysis, &mut seen.analysis, &snapshot.analysis)
                    .await?;
                emit_growth(sink, Artifact::Code, &mut seen.code, &snapshot.code).await?;
            }
            Ok::<DraftSnapshot, PipelineError>(seen)
        };

        let (call_result, relay_result) = tokio::join!(backend_call, relay);
        let seen = relay_result?;
        match call_result {
            // Streaming only wins outright with both fields filled; a partial
            // final draft falls through the recovery chain first.
            Ok(Ok(draft))
                if !draft.analysis.trim().is_empty() && !draft.code.trim().is_empty() =>
            {
                Ok((Some(draft.clone()), draft))
            }
            Ok(Ok(draft)) => Ok((None, draft)),
            Ok(Err(error)) => {
                tracing::warn!(%error, "structured streaming failed, trying recovery");
                Ok((None, seen))
            }
            Err(_) => {
                tracing::warn!(
                    seconds = self.backend_timeout,
                    "structured streaming timed out, trying recovery"
                );
                Ok((None, seen))
            }
        }
    }

    async fn recover_structured(&self, instructions: &str) -> Option<DraftSnapshot> {
        let timeout = Duration::from_secs(self.backend_timeout);
        let draft = tokio::time::timeout(timeout, self.backend.generate_draft(instructions))
            .await
            .ok()?
            .ok()?;
        (!draft.is_empty()).then_some(draft)
    }

    async fn recover_from_json(&self, instructions: &str) -> Option<DraftSnapshot> {
        let prompt = format!(
            "{instructions}\n\nRespond with exactly one JSON object with two \
             string fields: \"analysis\" and \"code\". No other text."
        );
        let text = self.text_call(&prompt).await?;
        parse_json_draft(&text)
    }

    async fn recover_from_prose(&self, instructions: &str) -> Option<DraftSnapshot> {
        let prompt = format!(
            "{instructions}\n\nWrite a short prose analysis plan, then exactly \
             one fenced code block containing the code."
        );
        let text = self.text_call(&prompt).await?;
        let draft = split_prose_and_code(&text);
        (!draft.is_empty()).then_some(draft)
    }

    async fn text_call(&self, prompt: &str) -> Option<String> {
        let timeout = Duration::from_secs(self.backend_timeout);
        tokio::time::timeout(timeout, self.backend.generate_text(prompt))
            .await
            .ok()?
            .ok()
    }
}

/// Emit the suffix a growing field gained since the last snapshot.
///
/// Snapshots that shrink or rewrite the prefix are skipped without advancing:
/// concatenated deltas always reconstruct `seen` exactly.
async fn emit_growth(
    sink: &EventSink,
    field: Artifact,
    seen: &mut String,
    current: &str,
) -> Result<(), PipelineError> {
    if let Some(delta) = current.strip_prefix(seen.as_str()) {
        sink.delta(field, delta).await?;
        *seen = current.to_string();
    }
    Ok(())
}

// ── text recovery helpers ───────────────────────────────────────────────────

/// Strip one level of leading/trailing Markdown fences, tag line included.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.split_once('\n') {
        Some((_tag, body)) => body,
        None => "",
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

/// Candidate order: whole trimmed text, fenced JSON block, outermost braces.
pub fn parse_json_draft(text: &str) -> Option<DraftSnapshot> {
    if let Some(draft) = decode_draft(text.trim()) {
        return Some(draft);
    }
    if let Some(block) = fenced_block(text) {
        if let Some(draft) = decode_draft(block.trim()) {
            return Some(draft);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start < end {
        return decode_draft(&text[start..=end]);
    }
    None
}

fn decode_draft(candidate: &str) -> Option<DraftSnapshot> {
    let draft: DraftSnapshot = serde_json::from_str(candidate).ok()?;
    (!draft.is_empty()).then_some(draft)
}

/// The content of the first fenced block, tag line excluded.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_tag = text[open + 3..].split_once('\n')?.1;
    let close = after_tag.find("```")?;
    Some(&after_tag[..close])
}

/// Split prose-plus-one-code-block text: the fence becomes the code, the
/// surrounding prose becomes the analysis.
pub fn split_prose_and_code(text: &str) -> DraftSnapshot {
    let Some(open) = text.find("```") else {
        return DraftSnapshot {
            analysis: text.trim().to_string(),
            code: String::new(),
        };
    };
    let before = &text[..open];
    let rest = &text[open + 3..];
    let body = match rest.split_once('\n') {
        Some((_tag, body)) => body,
        None => "",
    };
    let (code, after) = match body.find("```") {
        Some(close) => (&body[..close], &body[close + 3..]),
        None => (body, ""),
    };
    let mut analysis = before.trim().to_string();
    let after = after.trim();
    if !after.is_empty() {
        if !analysis.is_empty() {
            analysis.push_str("\n\n");
        }
        analysis.push_str(after);
    }
    DraftSnapshot {
        analysis,
        code: code.trim().to_string(),
    }
}
