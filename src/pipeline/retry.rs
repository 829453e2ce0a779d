//! Execution of generated code with classification-driven self-correction.
//!
//! Every failure is classified deterministically from the raw sandbox output.
//! Only a fixed allow-list of exception kinds is eligible for correction, and
//! a deny-list of sandbox-violation phrases overrides the kind entirely:
//! security refusals are never retried.

use std::sync::LazyLock;

use regex::Regex;

use crate::backend::GenerationBackend;
use crate::errors::PipelineError;
use crate::events::{truncate_str, EventSink, Phase, StreamEvent};
use crate::executor::{ExecutionRequest, ExecutionResult, ExecutionService};

use super::generate::strip_code_fences;

/// Correction attempts after the first execution.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How much raw failure text a classification message may carry.
const MAX_ERROR_DETAIL: usize = 500;

/// How much traceback the correction prompt may carry.
const MAX_TRACEBACK_CHARS: usize = 1500;

// ── Failure classification ──────────────────────────────────────────────────

/// `^ExceptionName: message` at any line start.
static EXCEPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^([A-Za-z_][A-Za-z0-9_]*(?:Error|Exception))\s*:\s*(.*)")
        .unwrap_or_else(|e| panic!("invalid exception pattern: {e}"))
});

/// Sandbox refusal phrases. Any match makes the failure final.
const NON_RETRIABLE_PATTERNS: &[&str] = &[
    "blocked import",
    "blocked builtin",
    "dangerous pattern",
    "memory safety violation",
    "not allowed in sandbox",
    "security violation",
];

/// Exception kinds worth asking the backend to correct.
const RETRIABLE_KINDS: &[&str] = &[
    "syntaxerror",
    "nameerror",
    "keyerror",
    "typeerror",
    "valueerror",
    "attributeerror",
    "indexerror",
    "timeouterror",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub kind: String,
    pub message: String,
    pub retriable: bool,
}

pub fn classify_failure(raw: &str) -> ErrorClassification {
    let lowered = raw.to_lowercase();
    let denied = NON_RETRIABLE_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern));

    if let Some(captures) = EXCEPTION_LINE.captures(raw) {
        let kind = captures[1].to_string();
        let message = captures[0].trim_end().to_string();
        let retriable = !denied && RETRIABLE_KINDS.contains(&kind.to_lowercase().as_str());
        return ErrorClassification {
            kind,
            message,
            retriable,
        };
    }

    if lowered.contains("timed out") || lowered.contains("timeout") {
        return ErrorClassification {
            kind: "TimeoutError".to_string(),
            message: truncate_str(raw, MAX_ERROR_DETAIL),
            retriable: !denied,
        };
    }

    ErrorClassification {
        kind: "UnknownError".to_string(),
        message: truncate_str(raw, MAX_ERROR_DETAIL),
        retriable: false,
    }
}

// ── Retry controller ────────────────────────────────────────────────────────

/// Final state of the execute/correct loop.
#[derive(Debug)]
pub struct RetryOutcome {
    /// Outcome of the last execution run.
    pub result: ExecutionResult,
    /// The snapshot that produced `result`.
    pub code: String,
    pub total_attempts: u32,
    /// Present only when the loop ended without a success.
    pub explanation: Option<String>,
    /// Whether the retrying phase was entered.
    pub entered_retry: bool,
}

pub struct RetryController<'a> {
    pub backend: &'a dyn GenerationBackend,
    pub executor: &'a dyn ExecutionService,
    pub max_retries: u32,
    /// Sandbox-side wall-clock budget per attempt, in seconds.
    pub run_timeout: u64,
}

impl RetryController<'_> {
    /// Drive executions until success, a non-retriable failure, or the
    /// attempt bound. Emits execution and retry events along the way; the
    /// caller owns the surrounding phase events except the transition into
    /// retrying, which only this loop can observe.
    pub async fn run(
        &self,
        sink: &EventSink,
        request_text: &str,
        initial_code: &str,
        file_paths: &[String],
        column_context: &str,
    ) -> Result<RetryOutcome, PipelineError> {
        let mut code = initial_code.to_string();
        let mut attempt: u32 = 1;
        let mut entered_retry = false;
        let mut error_history: Vec<String> = Vec::new();

        loop {
            let request = ExecutionRequest {
                code: code.clone(),
                file_paths: file_paths.to_vec(),
                timeout: self.run_timeout,
            };
            let result = match self.executor.execute(request).await {
                Ok(result) => result,
                Err(error) => ExecutionResult::from_transport_failure(&error),
            };
            sink.emit(StreamEvent::ExecutionResult {
                success: result.success,
                output: result.output.clone(),
                results: result.results.clone(),
                error: result.error.clone(),
                elapsed_ms: result.execution_time_ms,
            })
            .await?;

            if result.success {
                return Ok(RetryOutcome {
                    result,
                    code,
                    total_attempts: attempt,
                    explanation: None,
                    entered_retry,
                });
            }

            let raw = failure_text(&result);
            let classification = classify_failure(&raw);
            error_history.push(format!("attempt {}: {}", attempt, classification.message));

            if !classification.retriable || attempt > self.max_retries {
                let explanation = self
                    .explain_failure(request_text, attempt, &error_history, column_context)
                    .await;
                sink.emit(StreamEvent::RetryFailed {
                    total_attempts: attempt,
                    explanation: Some(explanation.clone()),
                })
                .await?;
                return Ok(RetryOutcome {
                    result,
                    code,
                    total_attempts: attempt,
                    explanation: Some(explanation),
                    entered_retry,
                });
            }

            if !entered_retry {
                sink.phase_complete(Phase::Executing).await?;
                sink.phase_start(Phase::Retrying).await?;
                entered_retry = true;
            }
            attempt += 1;
            sink.emit(StreamEvent::RetryStart {
                attempt,
                error_type: classification.kind.clone(),
            })
            .await?;

            // A failed, empty, or unchanged correction keeps the previous
            // snapshot; re-running it still consumes the attempt.
            if let Ok(text) = self
                .backend
                .generate_text(&correction_prompt(
                    request_text,
                    &code,
                    &classification,
                    &raw,
                    column_context,
                ))
                .await
            {
                let candidate = strip_code_fences(&text);
                if !candidate.trim().is_empty() && candidate != code {
                    code = candidate;
                }
            }
        }
    }

    async fn explain_failure(
        &self,
        request_text: &str,
        attempts: u32,
        error_history: &[String],
        column_context: &str,
    ) -> String {
        let prompt = explanation_prompt(request_text, attempts, error_history, column_context);
        match self.backend.generate_text(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => format!(
                "The analysis could not be completed after {} attempt(s). \
                 The generated code kept failing against the data. \
                 Rephrasing the request or checking the column names may help.",
                attempts
            ),
        }
    }
}

fn failure_text(result: &ExecutionResult) -> String {
    result
        .error
        .clone()
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| result.output.clone())
}

fn correction_prompt(
    request_text: &str,
    code: &str,
    classification: &ErrorClassification,
    raw: &str,
    column_context: &str,
) -> String {
    format!(
        "The following code failed while answering a data-analysis request.\n\
         Request: {request_text}\n\n\
         Failed code:\n{code}\n\n\
         Error ({kind}): {message}\n\
         Traceback:\n{traceback}\n\n\
         Available columns:\n{column_context}\n\n\
         Return only the corrected code, no explanation, no markdown fences.",
        kind = classification.kind,
        message = classification.message,
        traceback = truncate_str(raw, MAX_TRACEBACK_CHARS),
    )
}

fn explanation_prompt(
    request_text: &str,
    attempts: u32,
    error_history: &[String],
    column_context: &str,
) -> String {
    format!(
        "Code generated for the request below failed {attempts} time(s) and \
         will not be retried further.\n\
         Request: {request_text}\n\
         Errors:\n{errors}\n\
         Available columns:\n{column_context}\n\n\
         Explain to the user in two or three plain sentences why this \
         analysis could not be completed and what they could try instead. \
         Do not include code.",
        errors = truncate_str(&error_history.join("\n"), MAX_ERROR_DETAIL),
    )
}
