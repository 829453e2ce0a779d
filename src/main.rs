use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use andexa::backend::openai::{OpenAiCompatBackend, OpenAiConfig};
use andexa::backend::BackendRegistry;
use andexa::config::Settings;
use andexa::events::{self, Artifact, StreamEvent};
use andexa::executor::HttpExecutionClient;
use andexa::metadata::{DataSource, InMemoryMetadata};
use andexa::pipeline::{SessionPipeline, TurnRequest};
use andexa::server;

#[derive(Parser)]
#[command(name = "andexa")]
#[command(version, about = "Conversational data-analysis pipeline")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (defaults to andexa.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket/HTTP server
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a single analysis turn and print the result
    Ask {
        /// The analysis request
        message: String,

        /// Backend name from the config (defaults to the first one)
        #[arg(short, long)]
        backend: Option<String>,

        /// Data source as name=path; repeatable
        #[arg(short, long)]
        source: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => {
            let pipeline = Arc::new(build_pipeline(&settings)?);
            let port = port.unwrap_or(settings.server.port);
            server::start_server(pipeline, &settings.server.host, port).await
        }
        Commands::Ask {
            message,
            backend,
            source,
        } => run_ask(&settings, message, backend, source).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_pipeline(settings: &Settings) -> Result<SessionPipeline> {
    let mut registry = BackendRegistry::new();
    for entry in &settings.backends {
        let api_key = std::env::var(&entry.api_key_env).unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!(
                backend = entry.name,
                env = entry.api_key_env,
                "no API key in environment"
            );
        }
        let chat_url = format!(
            "{}/chat/completions",
            entry.base_url.trim_end_matches('/')
        );
        registry.register(Arc::new(OpenAiCompatBackend::new(OpenAiConfig {
            name: entry.name.clone(),
            base_url: chat_url,
            api_key,
            model: entry.model.clone(),
            max_tokens: entry.max_tokens,
            temperature: entry.temperature,
        })));
    }
    if registry.is_empty() {
        bail!("no generation backends configured");
    }

    let executor = HttpExecutionClient::new(
        settings.executor.base_url.clone(),
        Duration::from_secs(settings.executor.transport_timeout_secs),
    );
    Ok(SessionPipeline::new(
        registry,
        Arc::new(executor),
        Arc::new(InMemoryMetadata::new()),
        settings.clone(),
    ))
}

async fn run_ask(
    settings: &Settings,
    message: String,
    backend: Option<String>,
    source: Vec<String>,
) -> Result<()> {
    let sources = source
        .iter()
        .map(|spec| {
            let (name, path) = spec
                .split_once('=')
                .with_context(|| format!("source '{spec}' is not name=path"))?;
            Ok(DataSource {
                name: name.to_string(),
                path: path.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let pipeline = Arc::new(build_pipeline(settings)?);
    let request = TurnRequest {
        message,
        backend,
        session_id: None,
        sources,
    };

    let (sink, mut rx) = events::channel();
    let turn = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run_turn(request, sink).await }
    });

    let mut failed = false;
    while let Some(event) = rx.recv().await {
        render_event(&event, &mut failed);
    }
    turn.await?;

    if failed {
        bail!("turn ended with an error");
    }
    Ok(())
}

fn render_event(event: &StreamEvent, failed: &mut bool) {
    match event {
        StreamEvent::PhaseStart { phase } => {
            println!("{} {:?}", console::style("▶").cyan(), phase);
        }
        StreamEvent::Delta { field, text } => {
            if matches!(field, Artifact::Analysis | Artifact::Commentary) {
                print!("{text}");
            }
        }
        StreamEvent::FieldDone { field, value } => {
            if matches!(field, Artifact::Code) && !value.is_empty() {
                println!("\n{}", console::style("── code ──").dim());
                println!("{value}");
            } else {
                println!();
            }
        }
        StreamEvent::ExecutionResult {
            success,
            error,
            elapsed_ms,
            ..
        } => {
            if *success {
                println!(
                    "{} executed in {}ms",
                    console::style("✓").green(),
                    elapsed_ms
                );
            } else {
                println!(
                    "{} execution failed: {}",
                    console::style("✗").red(),
                    error.as_deref().unwrap_or("unknown")
                );
            }
        }
        StreamEvent::RetryStart {
            attempt,
            error_type,
        } => {
            println!(
                "{} retrying (attempt {}, {})",
                console::style("↻").yellow(),
                attempt,
                error_type
            );
        }
        StreamEvent::RetryFailed {
            total_attempts,
            explanation,
        } => {
            println!(
                "{} gave up after {} attempt(s)",
                console::style("✗").red(),
                total_attempts
            );
            if let Some(explanation) = explanation {
                println!("{explanation}");
            }
        }
        StreamEvent::Error { message } => {
            *failed = true;
            println!("{} {}", console::style("Error:").red().bold(), message);
        }
        StreamEvent::Done { session_id } => {
            println!("{} session {}", console::style("done").dim(), session_id);
        }
        StreamEvent::PhaseComplete { .. } => {}
    }
}
