//! flowgraph - run the bundled code-review pipeline from a terminal

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowgraph_cli::output::{render, OutputFormat};
use flowgraph_cli::{apply_cli_defaults, build_bridge, pipeline};
use flowgraph_core::checkpoint::select_store;
use flowgraph_core::{ExecutionRequest, FlowConfig, StreamEvent};
use futures::StreamExt;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flowgraph")]
#[command(version)]
#[command(about = "Streamed code review on a checkpointed workflow engine", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "FLOWGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for file checkpoints (overrides configuration)
    #[arg(long, global = true)]
    checkpoint_dir: Option<PathBuf>,

    /// Event output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Review a source file and stream the results
    Run {
        /// File to review; reads stdin when omitted or "-"
        file: Option<PathBuf>,

        /// Session to record the review under (generated when omitted)
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Ask a follow-up question about an earlier review
    Chat {
        #[arg(short, long)]
        session: String,

        question: String,
    },
    /// Print the compiled pipeline
    Plan,
    /// Print the latest checkpoint of a session
    Checkpoint {
        #[arg(short, long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = FlowConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    apply_cli_defaults(&mut config, cli.checkpoint_dir.clone());

    match cli.command {
        Command::Run { file, session } => {
            let (path, code) = read_source(file)?;
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            info!(session_id = %session, "Starting review");

            let request = ExecutionRequest::new(&session, pipeline::review_input(path.as_deref(), &code));
            stream(&config, request, cli.format).await?;
            eprintln!("session: {}", session);
        }
        Command::Chat { session, question } => {
            if question.trim().is_empty() {
                bail!("Question must not be empty");
            }
            let request = ExecutionRequest::new(&session, pipeline::chat_input(&question)).resume();
            stream(&config, request, cli.format).await?;
        }
        Command::Plan => {
            let plan = pipeline::build_plan()?;
            print!("{}", plan.describe());
        }
        Command::Checkpoint { session } => {
            let selected = select_store(&config.checkpoint).await;
            match selected.store.load_optional(&session).await? {
                Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
                None => bail!("No checkpoint for session '{}' in the {} store", session, selected.tier),
            }
        }
    }

    Ok(())
}

fn read_source(file: Option<PathBuf>) -> Result<(Option<String>, String)> {
    match file {
        Some(path) if path.as_os_str() != "-" => {
            let code = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok((Some(path.display().to_string()), code))
        }
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read stdin")?;
            Ok((None, code))
        }
    }
}

async fn stream(config: &FlowConfig, request: ExecutionRequest, format: OutputFormat) -> Result<()> {
    let bridge = build_bridge(config).await?;
    let mut events = bridge.stream(request);

    let mut stdout = std::io::stdout().lock();
    let mut finished = false;
    while let Some(event) = events.next().await {
        if event == StreamEvent::Done {
            finished = true;
        }
        if let Some(line) = render(&event, format) {
            writeln!(stdout, "{}", line)?;
        }
    }
    stdout.flush()?;

    if !finished {
        warn!("Stream ended before completion");
    }
    Ok(())
}
