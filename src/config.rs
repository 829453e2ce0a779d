//! Layered settings: built-in defaults, then `andexa.toml`, then environment
//! overrides.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "andexa.toml";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub executor: ExecutorSettings,
    pub pipeline: PipelineSettings,
    pub backends: Vec<BackendSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8077,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub base_url: String,
    /// HTTP transport budget per call, in seconds.
    pub transport_timeout_secs: u64,
    /// Sandbox-side budget passed with each run, in seconds.
    pub run_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            transport_timeout_secs: 60,
            run_timeout_secs: crate::executor::DEFAULT_RUN_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_retries: u32,
    pub max_explore_rounds: u32,
    /// Generation-backend budget per call, in seconds.
    pub backend_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: crate::pipeline::DEFAULT_MAX_RETRIES,
            max_explore_rounds: crate::pipeline::explore::DEFAULT_MAX_ROUNDS,
            backend_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            name: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

/// On-disk shape; every section is optional.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    server: Option<ServerSettings>,
    executor: Option<ExecutorSettings>,
    pipeline: Option<PipelineSettings>,
    #[serde(rename = "backend")]
    backends: Option<Vec<BackendSettings>>,
}

impl Settings {
    /// `path` wins over the default file name; a missing file means pure
    /// defaults, a present-but-broken file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let raw = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<RawSettings>(&contents)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            RawSettings::default()
        };

        let mut settings = Self {
            server: raw.server.unwrap_or_default(),
            executor: raw.executor.unwrap_or_default(),
            pipeline: raw.pipeline.unwrap_or_default(),
            backends: raw
                .backends
                .unwrap_or_else(|| vec![BackendSettings::default()]),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("ANDEXA_EXECUTOR_URL") {
            self.executor.base_url = url;
        }
        if let Ok(port) = env::var("ANDEXA_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(retries) = env::var("ANDEXA_MAX_RETRIES") {
            if let Ok(retries) = retries.parse() {
                self.pipeline.max_retries = retries;
            }
        }
    }
}
