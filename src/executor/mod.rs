//! Client for the sandboxed code-execution service.
//!
//! The service is an external HTTP collaborator; only its request/response
//! contract matters here. `POST /execute` runs a code snapshot against named
//! data files with a soft timeout and returns captured output plus a map of
//! named, JSON-serialized results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ExecutionError;

/// Default soft timeout passed to the service per run, in seconds.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 30;

/// One execution request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub file_paths: Vec<String>,
    /// Soft timeout enforced inside the sandbox, independent of the
    /// transport-level timeout of the HTTP client.
    pub timeout: u64,
}

/// Execution outcome as reported by the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub results: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// A synthetic failed result carrying transport-level failure text, so
    /// the retry controller can classify it like any sandbox failure.
    pub fn from_transport_failure(error: &ExecutionError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Abstraction over the execution service for testability.
/// Real implementation: `HttpExecutionClient`. Test doubles live in tests.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecutionError>;
}

/// HTTP client for the executor service.
pub struct HttpExecutionClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExecutionClient {
    /// `transport_timeout` caps the whole HTTP round trip and must exceed the
    /// soft per-run timeout so sandbox timeouts surface as classified
    /// failures rather than transport errors.
    pub fn new(base_url: impl Into<String>, transport_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(transport_timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl ExecutionService for HttpExecutionClient {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        let url = format!("{}/execute", self.base_url.trim_end_matches('/'));
        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<ExecutionResult>().await?)
    }
}
