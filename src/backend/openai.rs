//! OpenAI-compatible chat-completions adapter.
//!
//! Implements [`GenerationBackend`] against any endpoint speaking the
//! chat-completions wire format. Structured decode uses JSON mode; streaming
//! reads SSE `data:` lines and, for drafts, re-parses the accumulated
//! partial JSON after each chunk so callers see cumulative snapshots.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{
    BackendResult, DraftSnapshot, ExploreMessage, ExploreRole, ExploreStep, GenerationBackend,
    ToolCall, ToolSpec,
};
use crate::errors::BackendError;

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Registry name, e.g. "openai" or "deepseek".
    pub name: String,
    /// Full chat-completions URL.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

pub struct OpenAiCompatBackend {
    config: OpenAiConfig,
    client: reqwest::Client,
}

// ── Response envelope subsets ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object.
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatBackend {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, messages: Vec<serde_json::Value>, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "stream": stream,
            "messages": messages,
        })
    }

    fn user_message(text: &str) -> Vec<serde_json::Value> {
        vec![serde_json::json!({"role": "user", "content": text})]
    }

    async fn post(&self, body: &serde_json::Value) -> BackendResult<reqwest::Response> {
        let response = self
            .client
            .post(&self.config.base_url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::Transport(format!("HTTP {}: {}", status, text)));
        }
        Ok(response)
    }

    async fn complete(&self, body: &serde_json::Value) -> BackendResult<ChoiceMessage> {
        let response = self.post(body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| BackendError::Malformed("response had no choices".to_string()))
    }

    /// Stream the response, mapping each content delta through `to_item` and
    /// awaiting every forwarded item so no token is dropped under a slow
    /// consumer. Returns the full accumulated content.
    async fn stream_content<O, F>(
        &self,
        body: &serde_json::Value,
        tx: &mpsc::Sender<O>,
        mut to_item: F,
    ) -> BackendResult<String>
    where
        O: Send,
        F: FnMut(&str, &str) -> Option<O> + Send,
    {
        let response = self.post(body).await?;
        let mut stream = response.bytes_stream();
        let mut line_buf = String::new();
        let mut content = String::new();
        let mut forwarding = true;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| BackendError::Transport(e.to_string()))?;
            line_buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=newline).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                // Skip malformed keepalive frames rather than failing the stream.
                let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                for choice in parsed.choices {
                    if let Some(delta) = choice.delta.content {
                        if !delta.is_empty() {
                            content.push_str(&delta);
                            if let Some(item) = to_item(&delta, &content) {
                                forward(tx, &mut forwarding, item).await;
                            }
                        }
                    }
                }
            }
        }

        Ok(content)
    }

    fn render_transcript(transcript: &[ExploreMessage]) -> Vec<serde_json::Value> {
        transcript
            .iter()
            .map(|msg| match msg.role {
                ExploreRole::User => serde_json::json!({"role": "user", "content": msg.content}),
                ExploreRole::Assistant => {
                    serde_json::json!({"role": "assistant", "content": msg.content})
                }
                // Tool results return to the model as user turns; the adapter
                // does not track provider tool-call ids across steps.
                ExploreRole::Tool => serde_json::json!({
                    "role": "user",
                    "content": format!("Tool results:\n{}", msg.content),
                }),
            })
            .collect()
    }

    fn tool_to_wire(tool: &ToolSpec) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn stream_draft(
        &self,
        instructions: &str,
        tx: mpsc::Sender<DraftSnapshot>,
    ) -> BackendResult<DraftSnapshot> {
        let mut body = self.build_body(Self::user_message(instructions), true);
        body["response_format"] = serde_json::json!({"type": "json_object"});

        let mut last = DraftSnapshot::default();
        let content = self
            .stream_content(&body, &tx, |_, accumulated| {
                // Re-parse the accumulated partial JSON into a snapshot; ticks
                // that do not yet close into the schema are simply skipped.
                match parse_partial_draft(accumulated) {
                    Some(snapshot) if snapshot != last => {
                        last = snapshot.clone();
                        Some(snapshot)
                    }
                    _ => None,
                }
            })
            .await?;

        parse_partial_draft(&content)
            .ok_or_else(|| BackendError::Malformed("stream did not form a draft object".to_string()))
    }

    async fn generate_draft(&self, instructions: &str) -> BackendResult<DraftSnapshot> {
        let mut body = self.build_body(Self::user_message(instructions), false);
        body["response_format"] = serde_json::json!({"type": "json_object"});

        let message = self.complete(&body).await?;
        let content = message.content.unwrap_or_default();
        serde_json::from_str(&content)
            .map_err(|e| BackendError::Malformed(format!("draft decode failed: {}", e)))
    }

    async fn generate_text(&self, instructions: &str) -> BackendResult<String> {
        let body = self.build_body(Self::user_message(instructions), false);
        let message = self.complete(&body).await?;
        Ok(message.content.unwrap_or_default())
    }

    async fn stream_text(
        &self,
        instructions: &str,
        tx: mpsc::Sender<String>,
    ) -> BackendResult<String> {
        let body = self.build_body(Self::user_message(instructions), true);
        self.stream_content(&body, &tx, |delta, _| Some(delta.to_string()))
            .await
    }

    async fn explore_step(
        &self,
        transcript: &[ExploreMessage],
        tools: &[ToolSpec],
    ) -> BackendResult<ExploreStep> {
        let mut body = self.build_body(Self::render_transcript(transcript), false);
        body["tools"] = serde_json::Value::Array(tools.iter().map(Self::tool_to_wire).collect());

        let message = self.complete(&body).await?;
        if let Some(calls) = message.tool_calls.filter(|c| !c.is_empty()) {
            let calls = calls
                .into_iter()
                .map(|c| ToolCall {
                    name: c.function.name,
                    arguments: serde_json::from_str(&c.function.arguments)
                        .unwrap_or(serde_json::Value::Null),
                })
                .collect();
            return Ok(ExploreStep::ToolCalls(calls));
        }
        Ok(ExploreStep::Text(message.content.unwrap_or_default()))
    }
}

/// Awaited send that stops forwarding once the receiver is gone, so the
/// stream can still drain to its full text.
async fn forward<O>(tx: &mpsc::Sender<O>, forwarding: &mut bool, item: O) {
    if *forwarding && tx.send(item).await.is_err() {
        *forwarding = false;
    }
}

// ── Partial JSON handling ────────────────────────────────────────────

/// Parse an in-flight JSON object by appending the closers it still needs.
///
/// Good enough for cumulative snapshot decoding: close an open string, then
/// unwind the open brace/bracket stack. Returns `None` until the prefix can
/// complete into the draft schema.
fn parse_partial_draft(partial: &str) -> Option<DraftSnapshot> {
    let trimmed = partial.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    if let Ok(draft) = serde_json::from_str(trimmed) {
        return Some(draft);
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in trimmed.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut candidate = trimmed.to_string();
    if escaped {
        // A dangling backslash cannot be completed this tick.
        return None;
    }
    if in_string {
        candidate.push('"');
    }
    while let Some(closer) = stack.pop() {
        candidate.push(closer);
    }
    serde_json::from_str(&candidate).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_draft_complete_object() {
        let draft = parse_partial_draft(r#"{"analysis": "done", "code": "x = 1"}"#).unwrap();
        assert_eq!(draft.analysis, "done");
        assert_eq!(draft.code, "x = 1");
    }

    #[test]
    fn test_parse_partial_draft_open_string() {
        let draft = parse_partial_draft(r#"{"analysis": "The data sho"#).unwrap();
        assert_eq!(draft.analysis, "The data sho");
        assert!(draft.code.is_empty());
    }

    #[test]
    fn test_parse_partial_draft_open_escape_is_skipped() {
        assert!(parse_partial_draft(r#"{"analysis": "line\"#).is_none());
    }

    #[test]
    fn test_parse_partial_draft_non_object() {
        assert!(parse_partial_draft("Here is your analysis").is_none());
        assert!(parse_partial_draft("").is_none());
    }

    #[test]
    fn test_parse_partial_draft_grows_monotonically() {
        let ticks = [
            r#"{"#,
            r#"{"analysis": "Revenue"#,
            r#"{"analysis": "Revenue rose", "code": "df.gro"#,
        ];
        let mut prev = String::new();
        for tick in ticks {
            if let Some(draft) = parse_partial_draft(tick) {
                assert!(draft.analysis.starts_with(&prev));
                prev = draft.analysis;
            }
        }
        assert_eq!(prev, "Revenue rose");
    }

    #[tokio::test]
    async fn test_forward_waits_for_a_slow_receiver() {
        let (tx, mut rx) = mpsc::channel::<String>(1);
        let producer = tokio::spawn(async move {
            let mut forwarding = true;
            for i in 0..50 {
                forward(&tx, &mut forwarding, format!("tok{i}")).await;
            }
            forwarding
        });

        let mut received = Vec::new();
        while let Some(token) = rx.recv().await {
            // Let the producer run into the full channel between reads.
            tokio::task::yield_now().await;
            received.push(token);
        }

        assert!(producer.await.unwrap());
        assert_eq!(received.len(), 50);
        assert_eq!(received.last().map(String::as_str), Some("tok49"));
    }

    #[tokio::test]
    async fn test_forward_stops_after_receiver_drops() {
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(rx);

        let mut forwarding = true;
        forward(&tx, &mut forwarding, "tok".to_string()).await;
        assert!(!forwarding);
    }

    #[test]
    fn test_stream_chunk_decoding() {
        let json = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        let chunk: StreamChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));

        // Usage-only frames have empty choices.
        let json = r#"{"choices":[],"usage":{"total_tokens":10}}"#;
        let chunk: StreamChunk = serde_json::from_str(json).unwrap();
        assert!(chunk.choices.is_empty());
    }

    #[test]
    fn test_wire_tool_call_decoding() {
        let json = r#"{"function":{"name":"inspect_column","arguments":"{\"column\":\"age\"}"}}"#;
        let call: WireToolCall = serde_json::from_str(json).unwrap();
        assert_eq!(call.function.name, "inspect_column");
        let args: serde_json::Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(args["column"], "age");
    }
}
