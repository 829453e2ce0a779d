//! Optional pre-generation exploration over the attached data sources.
//!
//! The backend may call a fixed set of inspection operations before writing
//! free text. Operations validate their inputs and answer with bounded
//! structured results; a bad input or a failed evaluation becomes data for
//! the backend to react to, never an abort.

use serde_json::json;

use crate::backend::{ExploreMessage, ExploreStep, GenerationBackend, ToolCall, ToolSpec};
use crate::events::truncate_str;
use crate::executor::{ExecutionRequest, ExecutionService};
use crate::metadata::{DataSource, MetadataStore};

pub const DEFAULT_MAX_ROUNDS: u32 = 6;

/// Wall-clock budget for a single probe expression, in seconds.
const EVALUATE_TIMEOUT_SECS: u64 = 10;

/// How much of each operation result survives into the context block.
const MAX_RESULT_CHARS: usize = 400;

pub struct ExplorationPhase<'a> {
    pub backend: &'a dyn GenerationBackend,
    pub executor: &'a dyn ExecutionService,
    pub metadata: &'a dyn MetadataStore,
    pub max_rounds: u32,
}

impl ExplorationPhase<'_> {
    /// Drive capability rounds until the backend emits text or the round
    /// bound is hit. A backend failure ends the phase with whatever context
    /// was gathered so far.
    pub async fn run(&self, request: &str, sources: &[DataSource]) -> String {
        let specs = capability_specs();
        let mut active = sources.first().map(|s| s.name.clone());
        let mut transcript = vec![ExploreMessage::user(self.intro_prompt(request, sources))];
        let mut context_lines: Vec<String> = Vec::new();

        for _ in 0..self.max_rounds {
            let step = match self.backend.explore_step(&transcript, &specs).await {
                Ok(step) => step,
                Err(error) => {
                    tracing::warn!(%error, "exploration backend failed, keeping gathered context");
                    break;
                }
            };
            match step {
                ExploreStep::Text(text) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        context_lines.push(format!("notes: {text}"));
                    }
                    break;
                }
                ExploreStep::ToolCalls(calls) => {
                    let mut results = Vec::new();
                    for call in &calls {
                        let result = self.invoke(call, sources, &mut active).await;
                        context_lines.push(format!(
                            "{}({}) -> {}",
                            call.name,
                            compact_args(&call.arguments),
                            truncate_str(&result, MAX_RESULT_CHARS)
                        ));
                        results.push(format!("{}: {}", call.name, result));
                    }
                    transcript.push(ExploreMessage::assistant(format!(
                        "Calling: {}",
                        calls
                            .iter()
                            .map(|c| c.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                    transcript.push(ExploreMessage::tool(results.join("\n")));
                }
            }
        }

        if let Some(active) = active {
            context_lines.push(format!("active source: {active}"));
        }
        context_lines.join("\n")
    }

    fn intro_prompt(&self, request: &str, sources: &[DataSource]) -> String {
        format!(
            "Before writing analysis code for the request below, you may \
             inspect the attached data with the available operations, then \
             summarize what matters in plain text.\n\
             Request: {request}\n\
             Sources: {}",
            sources
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    async fn invoke(
        &self,
        call: &ToolCall,
        sources: &[DataSource],
        active: &mut Option<String>,
    ) -> String {
        match call.name.as_str() {
            "list_sources" => self.list_sources(sources),
            "inspect_column" => self.inspect_column(call, sources, active.as_deref()).await,
            "find_join_keys" => self.find_join_keys(call),
            "switch_source" => switch_source(call, sources, active),
            "evaluate" => self.evaluate(call, sources, active.as_deref()).await,
            other => json!({"error": format!("unknown operation '{other}'")}).to_string(),
        }
    }

    fn list_sources(&self, sources: &[DataSource]) -> String {
        let listing: Vec<_> = sources
            .iter()
            .map(|source| {
                let columns = self
                    .metadata
                    .columns(&source.name)
                    .map(|cols| cols.iter().map(|c| c.name.clone()).collect::<Vec<_>>())
                    .unwrap_or_default();
                json!({
                    "name": source.name,
                    "path": source.path,
                    "column_count": columns.len(),
                    "columns": columns,
                })
            })
            .collect();
        json!({"sources": listing}).to_string()
    }

    async fn inspect_column(
        &self,
        call: &ToolCall,
        sources: &[DataSource],
        active: Option<&str>,
    ) -> String {
        let Some(column) = str_arg(call, "column") else {
            return json!({"error": "missing 'column' argument"}).to_string();
        };
        let source = str_arg(call, "source")
            .or(active)
            .map(String::from)
            .or_else(|| sources.first().map(|s| s.name.clone()))
            .unwrap_or_default();
        let Some(columns) = self.metadata.columns(&source) else {
            return json!({"error": format!("source '{source}' not found")}).to_string();
        };
        let Some(info) = columns.iter().find(|c| c.name == column) else {
            return json!({
                "error": format!("column '{column}' not found in source '{source}'")
            })
            .to_string();
        };

        let mut report = json!({"source": source, "column": info.name, "dtype": info.dtype});
        // Best effort: a failed probe leaves the dtype-only report intact.
        if let Some(stats) = self.column_stats(&info.name, &source, sources).await {
            report["stats"] = stats;
        }
        report.to_string()
    }

    /// Null/unique/sample statistics probed through the execution service.
    async fn column_stats(
        &self,
        column: &str,
        source: &str,
        sources: &[DataSource],
    ) -> Option<serde_json::Value> {
        let path = sources.iter().find(|s| s.name == source)?.path.clone();
        let request = ExecutionRequest {
            code: format!(
                "col = df['{column}']\n\
                 result = {{'nulls': int(col.isnull().sum()), \
                 'unique': int(col.nunique()), \
                 'sample': col.dropna().head(5).tolist()}}"
            ),
            file_paths: vec![path],
            timeout: EVALUATE_TIMEOUT_SECS,
        };
        let result = self.executor.execute(request).await.ok()?;
        if !result.success {
            return None;
        }
        result.results.get("result").cloned()
    }

    fn find_join_keys(&self, call: &ToolCall) -> String {
        let (Some(left), Some(right)) = (str_arg(call, "left"), str_arg(call, "right")) else {
            return json!({"error": "requires 'left' and 'right' source names"}).to_string();
        };
        let (Some(left_cols), Some(right_cols)) =
            (self.metadata.columns(left), self.metadata.columns(right))
        else {
            return json!({"error": "one or both sources not found"}).to_string();
        };
        let shared: Vec<_> = left_cols
            .iter()
            .filter(|l| {
                right_cols
                    .iter()
                    .any(|r| r.name.eq_ignore_ascii_case(&l.name))
            })
            .map(|c| c.name.clone())
            .collect();
        json!({"left": left, "right": right, "shared_columns": shared}).to_string()
    }

    async fn evaluate(
        &self,
        call: &ToolCall,
        sources: &[DataSource],
        active: Option<&str>,
    ) -> String {
        let Some(expression) = str_arg(call, "expression") else {
            return json!({"error": "missing 'expression' argument"}).to_string();
        };
        // Expressions run against the active source when one is set.
        let file_paths = active
            .and_then(|name| sources.iter().find(|s| s.name == name))
            .map(|s| vec![s.path.clone()])
            .unwrap_or_else(|| sources.iter().map(|s| s.path.clone()).collect());
        let request = ExecutionRequest {
            code: format!("result = ({expression})"),
            file_paths,
            timeout: EVALUATE_TIMEOUT_SECS,
        };
        match self.executor.execute(request).await {
            Ok(result) if result.success => {
                let value = result
                    .results
                    .get("result")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                json!({"value": value}).to_string()
            }
            Ok(result) => json!({
                "error": result.error.unwrap_or_else(|| "evaluation failed".to_string())
            })
            .to_string(),
            Err(error) => json!({"error": error.to_string()}).to_string(),
        }
    }
}

fn switch_source(call: &ToolCall, sources: &[DataSource], active: &mut Option<String>) -> String {
    let Some(name) = str_arg(call, "source") else {
        return json!({"error": "missing 'source' argument"}).to_string();
    };
    if sources.iter().any(|s| s.name == name) {
        *active = Some(name.to_string());
        json!({"active": name}).to_string()
    } else {
        json!({"error": format!("source '{name}' not found")}).to_string()
    }
}

fn str_arg<'a>(call: &'a ToolCall, key: &str) -> Option<&'a str> {
    call.arguments.get(key).and_then(|v| v.as_str())
}

fn compact_args(arguments: &serde_json::Value) -> String {
    match arguments {
        serde_json::Value::Object(map) if !map.is_empty() => map
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    }
}

fn capability_specs() -> Vec<ToolSpec> {
    let spec = |name: &str, description: &str, parameters: serde_json::Value| ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    };

    vec![
        spec(
            "list_sources",
            "List the attached data sources and their columns.",
            json!({"type": "object", "properties": {}, "required": []}),
        ),
        spec(
            "inspect_column",
            "Look up one column's dtype in a source.",
            json!({
                "type": "object",
                "properties": {
                    "source": {"type": "string", "description": "Source name; defaults to the active source."},
                    "column": {"type": "string", "description": "Column name to inspect."},
                },
                "required": ["column"],
            }),
        ),
        spec(
            "find_join_keys",
            "List column names shared by two sources.",
            json!({
                "type": "object",
                "properties": {
                    "left": {"type": "string", "description": "First source name."},
                    "right": {"type": "string", "description": "Second source name."},
                },
                "required": ["left", "right"],
            }),
        ),
        spec(
            "switch_source",
            "Make another attached source the active one.",
            json!({
                "type": "object",
                "properties": {
                    "source": {"type": "string", "description": "Source name."},
                },
                "required": ["source"],
            }),
        ),
        spec(
            "evaluate",
            "Evaluate one short read-only expression against the data.",
            json!({
                "type": "object",
                "properties": {
                    "expression": {"type": "string", "description": "Expression to evaluate."},
                },
                "required": ["expression"],
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::{BackendResult, DraftSnapshot};
    use crate::errors::{BackendError, ExecutionError};
    use crate::executor::ExecutionResult;
    use crate::metadata::InMemoryMetadata;

    struct ScriptedBackend {
        steps: Mutex<Vec<BackendResult<ExploreStep>>>,
    }

    impl ScriptedBackend {
        fn new(steps: Vec<BackendResult<ExploreStep>>) -> Self {
            let mut reversed = steps;
            reversed.reverse();
            Self {
                steps: Mutex::new(reversed),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream_draft(
            &self,
            _instructions: &str,
            _tx: mpsc::Sender<DraftSnapshot>,
        ) -> BackendResult<DraftSnapshot> {
            Err(BackendError::Malformed("unused".into()))
        }

        async fn generate_draft(&self, _instructions: &str) -> BackendResult<DraftSnapshot> {
            Err(BackendError::Malformed("unused".into()))
        }

        async fn generate_text(&self, _prompt: &str) -> BackendResult<String> {
            Err(BackendError::Malformed("unused".into()))
        }

        async fn stream_text(
            &self,
            _prompt: &str,
            _tx: mpsc::Sender<String>,
        ) -> BackendResult<String> {
            Err(BackendError::Malformed("unused".into()))
        }

        async fn explore_step(
            &self,
            _transcript: &[ExploreMessage],
            _tools: &[ToolSpec],
        ) -> BackendResult<ExploreStep> {
            self.steps
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(ExploreStep::Text(String::new())))
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl ExecutionService for NoopExecutor {
        async fn execute(
            &self,
            _request: ExecutionRequest,
        ) -> Result<ExecutionResult, ExecutionError> {
            Ok(ExecutionResult {
                success: true,
                results: serde_json::json!({"result": 42})
                    .as_object()
                    .unwrap()
                    .clone(),
                ..ExecutionResult::default()
            })
        }
    }

    fn column(name: &str, dtype: &str) -> crate::metadata::ColumnInfo {
        crate::metadata::ColumnInfo {
            name: name.to_string(),
            dtype: dtype.to_string(),
        }
    }

    fn store() -> InMemoryMetadata {
        let mut store = InMemoryMetadata::new();
        store.insert(
            "orders",
            vec![column("order_id", "int64"), column("revenue", "float64")],
        );
        store.insert(
            "customers",
            vec![column("order_id", "int64"), column("email", "object")],
        );
        store
    }

    fn sources() -> Vec<DataSource> {
        vec![
            DataSource {
                name: "orders".to_string(),
                path: "/data/orders.csv".to_string(),
            },
            DataSource {
                name: "customers".to_string(),
                path: "/data/customers.csv".to_string(),
            },
        ]
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_operations_feed_the_context_block() {
        let backend = ScriptedBackend::new(vec![
            Ok(ExploreStep::ToolCalls(vec![
                call("inspect_column", serde_json::json!({"column": "revenue"})),
                call(
                    "find_join_keys",
                    serde_json::json!({"left": "orders", "right": "customers"}),
                ),
            ])),
            Ok(ExploreStep::Text("revenue is float, join on order_id".into())),
        ]);
        let metadata = store();
        let phase = ExplorationPhase {
            backend: &backend,
            executor: &NoopExecutor,
            metadata: &metadata,
            max_rounds: DEFAULT_MAX_ROUNDS,
        };

        let context = phase.run("total revenue per customer", &sources()).await;
        assert!(context.contains("inspect_column"));
        assert!(context.contains("float64"));
        assert!(context.contains("order_id"));
        assert!(context.contains("notes: revenue is float, join on order_id"));
        assert!(context.ends_with("active source: orders"));
    }

    #[tokio::test]
    async fn test_missing_inputs_become_not_found_results() {
        let backend = ScriptedBackend::new(vec![
            Ok(ExploreStep::ToolCalls(vec![
                call("inspect_column", serde_json::json!({"column": "nope"})),
                call("switch_source", serde_json::json!({"source": "ghost"})),
            ])),
            Ok(ExploreStep::Text("done".into())),
        ]);
        let metadata = store();
        let phase = ExplorationPhase {
            backend: &backend,
            executor: &NoopExecutor,
            metadata: &metadata,
            max_rounds: DEFAULT_MAX_ROUNDS,
        };

        let context = phase.run("anything", &sources()).await;
        assert!(context.contains("column 'nope' not found"));
        assert!(context.contains("source 'ghost' not found"));
        // The active source never changed.
        assert!(context.contains("active source: orders"));
    }

    #[tokio::test]
    async fn test_switch_source_redirects_later_lookups() {
        // "email" exists only on customers, so the lookup proves the switch
        // took effect for the following round.
        let backend = ScriptedBackend::new(vec![
            Ok(ExploreStep::ToolCalls(vec![call(
                "switch_source",
                serde_json::json!({"source": "customers"}),
            )])),
            Ok(ExploreStep::ToolCalls(vec![call(
                "inspect_column",
                serde_json::json!({"column": "email"}),
            )])),
            Ok(ExploreStep::Text("done".into())),
        ]);
        let metadata = store();
        let phase = ExplorationPhase {
            backend: &backend,
            executor: &NoopExecutor,
            metadata: &metadata,
            max_rounds: DEFAULT_MAX_ROUNDS,
        };

        let context = phase.run("anything", &sources()).await;
        assert!(context.contains(r#""source":"customers""#));
        assert!(context.contains(r#""dtype":"object""#));
        assert!(!context.contains("not found"));
        assert!(context.ends_with("active source: customers"));
    }

    #[tokio::test]
    async fn test_round_bound_stops_the_loop() {
        let endless: Vec<BackendResult<ExploreStep>> = (0..20)
            .map(|_| {
                Ok(ExploreStep::ToolCalls(vec![call(
                    "list_sources",
                    serde_json::json!({}),
                )]))
            })
            .collect();
        let backend = ScriptedBackend::new(endless);
        let metadata = store();
        let phase = ExplorationPhase {
            backend: &backend,
            executor: &NoopExecutor,
            metadata: &metadata,
            max_rounds: 3,
        };

        let context = phase.run("anything", &sources()).await;
        let invocations = context.matches("list_sources(").count();
        assert_eq!(invocations, 3);
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_gathered_context() {
        let backend = ScriptedBackend::new(vec![
            Ok(ExploreStep::ToolCalls(vec![call(
                "evaluate",
                serde_json::json!({"expression": "len(df)"}),
            )])),
            Err(BackendError::Transport("connection reset".into())),
        ]);
        let metadata = store();
        let phase = ExplorationPhase {
            backend: &backend,
            executor: &NoopExecutor,
            metadata: &metadata,
            max_rounds: DEFAULT_MAX_ROUNDS,
        };

        let context = phase.run("anything", &sources()).await;
        assert!(context.contains("evaluate("));
        assert!(context.contains("42"));
    }

    #[test]
    fn test_capability_specs_cover_the_fixed_set() {
        let names: Vec<_> = capability_specs().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "list_sources",
                "inspect_column",
                "find_join_keys",
                "switch_source",
                "evaluate"
            ]
        );
    }
}
