//! Read-only column metadata for attached data sources.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One attached data source for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    /// Display name, e.g. the uploaded filename stem.
    pub name: String,
    /// Path understood by the execution service.
    pub path: String,
}

/// Column name plus pandas dtype string (e.g. "int64", "object").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub dtype: String,
}

/// Read-only access to per-source column metadata.
///
/// Populated at upload time by the storage layer; the pipeline only reads it.
pub trait MetadataStore: Send + Sync {
    /// Columns for a source, or `None` if the source is unknown.
    fn columns(&self, source: &str) -> Option<Vec<ColumnInfo>>;
}

/// In-memory metadata store used by the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    sources: HashMap<String, Vec<ColumnInfo>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: impl Into<String>, columns: Vec<ColumnInfo>) {
        self.sources.insert(source.into(), columns);
    }

    /// Build columns from parallel name/dtype maps, the shape the executor
    /// service reports at upload time.
    pub fn insert_from_dtypes(
        &mut self,
        source: impl Into<String>,
        names: &[String],
        dtypes: &HashMap<String, String>,
    ) {
        let columns = names
            .iter()
            .map(|name| ColumnInfo {
                name: name.clone(),
                dtype: dtypes.get(name).cloned().unwrap_or_else(|| "object".to_string()),
            })
            .collect();
        self.sources.insert(source.into(), columns);
    }
}

impl MetadataStore for InMemoryMetadata {
    fn columns(&self, source: &str) -> Option<Vec<ColumnInfo>> {
        self.sources.get(source).cloned()
    }
}

/// Render a columns/dtypes block for prompt construction.
///
/// Format: one `source: col (dtype), col (dtype)` line per source.
pub fn describe_columns(store: &dyn MetadataStore, sources: &[DataSource]) -> String {
    let mut lines = Vec::new();
    for source in sources {
        match store.columns(&source.name) {
            Some(columns) => {
                let rendered: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{} ({})", c.name, c.dtype))
                    .collect();
                lines.push(format!("{}: {}", source.name, rendered.join(", ")));
            }
            None => lines.push(format!("{}: <no metadata>", source.name)),
        }
    }
    lines.join("\n")
}
