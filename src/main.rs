use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vuln_graph_rag::{
    config::{Config, LogFormat},
    langbase::LangbaseClient,
    server::{AppState, McpServer},
    SubmitOptions,
};

/// Vulnerability assessment question answering over graph evidence.
#[derive(Debug, Parser)]
#[command(name = "vuln-graph-rag", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the MCP server on stdio (default).
    Serve {
        /// Skip creating missing Langbase pipes at startup.
        #[arg(long)]
        skip_pipe_check: bool,
    },
    /// Answer a single question and print the response as JSON.
    Ask {
        /// The security question.
        question: String,
        /// Rephrase cycles allowed when evidence is insufficient.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Session deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Vuln Graph RAG starting..."
    );

    match cli.command.unwrap_or(Command::Serve {
        skip_pipe_check: false,
    }) {
        Command::Serve { skip_pipe_check } => serve(config, skip_pipe_check).await,
        Command::Ask {
            question,
            max_iterations,
            timeout_ms,
        } => ask(config, &question, max_iterations, timeout_ms).await,
    }
}

async fn serve(config: Config, skip_pipe_check: bool) -> anyhow::Result<()> {
    if !skip_pipe_check {
        // Ensure required pipes exist (create if needed)
        info!("Ensuring required Langbase pipes exist...");
        let langbase = LangbaseClient::new(&config.langbase, &config.request)?;
        if let Err(e) = langbase.ensure_pipes(&config.pipes).await {
            error!(error = %e, "Failed to ensure pipes exist");
            return Err(e.into());
        }
    }

    // Create application state
    let state = match AppState::from_config(config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Failed to initialize clients");
            return Err(e.into());
        }
    };

    // Start MCP server
    let server = McpServer::new(state);

    info!("Server ready, waiting for requests on stdin...");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn ask(
    config: Config,
    question: &str,
    max_iterations: Option<u32>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling session");
            on_interrupt.cancel();
        }
    });

    let options = SubmitOptions {
        max_iterations,
        timeout: timeout_ms.map(Duration::from_millis),
        cancel: Some(cancel),
    };
    let response = state.orchestrator.submit(question, options).await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
