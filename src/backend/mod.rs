//! Generation-backend abstraction.
//!
//! The pipeline consumes four generation modes (streaming structured decode,
//! non-streaming structured decode, free text, token streaming) plus one
//! agentic exploration step. Concrete providers implement
//! [`GenerationBackend`]; the orchestrator resolves one per turn from an
//! explicitly constructed [`BackendRegistry`] — there is no ambient global
//! client cache.

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::BackendError;

pub type BackendResult<T> = Result<T, BackendError>;

// ── Structured draft schema ──────────────────────────────────────────

/// The fixed two-field draft schema produced by structured generation.
///
/// Streaming backends send cumulative snapshots of this shape; fields only
/// ever grow between snapshots on a well-behaved stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftSnapshot {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub code: String,
}

impl DraftSnapshot {
    pub fn is_empty(&self) -> bool {
        self.analysis.is_empty() && self.code.is_empty()
    }
}

// ── Exploration step types ───────────────────────────────────────────

/// Description of one data-inspection operation offered to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the arguments.
    pub parameters: serde_json::Value,
}

/// One operation invocation requested by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExploreRole {
    User,
    Assistant,
    Tool,
}

/// Transcript entry for the exploration conversation.
#[derive(Debug, Clone)]
pub struct ExploreMessage {
    pub role: ExploreRole,
    pub content: String,
}

impl ExploreMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ExploreRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ExploreRole::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: ExploreRole::Tool,
            content: content.into(),
        }
    }
}

/// Outcome of one exploration step: either operations to run, or final text.
#[derive(Debug, Clone)]
pub enum ExploreStep {
    ToolCalls(Vec<ToolCall>),
    Text(String),
}

// ── Backend trait ────────────────────────────────────────────────────

/// A language-model backend, parameterized only by instruction text (and,
/// for structured modes, the fixed [`DraftSnapshot`] schema).
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Identifier used in logs and the registry.
    fn name(&self) -> &str;

    /// Streaming structured decode: send cumulative draft snapshots through
    /// `tx` as they grow, then return the final draft.
    async fn stream_draft(
        &self,
        instructions: &str,
        tx: mpsc::Sender<DraftSnapshot>,
    ) -> BackendResult<DraftSnapshot>;

    /// Non-streaming structured decode of the draft schema.
    async fn generate_draft(&self, instructions: &str) -> BackendResult<DraftSnapshot>;

    /// Non-streaming free text.
    async fn generate_text(&self, instructions: &str) -> BackendResult<String>;

    /// Free-text token streaming: send chunks through `tx`, return full text.
    async fn stream_text(
        &self,
        instructions: &str,
        tx: mpsc::Sender<String>,
    ) -> BackendResult<String>;

    /// One agentic exploration step over the transcript: the backend may
    /// request zero or more of the offered operations before emitting text.
    async fn explore_step(
        &self,
        transcript: &[ExploreMessage],
        tools: &[ToolSpec],
    ) -> BackendResult<ExploreStep>;
}

// ── Registry ─────────────────────────────────────────────────────────

/// Explicitly constructed backend map, owned by the process entry point and
/// passed into the orchestrator.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
