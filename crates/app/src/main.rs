mod api;
mod chat;
mod client;
mod server;
mod state;

use anyhow::Context;
use chat::{run_repl, session_for, ChatBackend, LocalBackend, RemoteBackend};
use chrono::Utc;
use clap::{Parser, Subcommand};
use client::ApiClient;
use docchat_core::{discover_documents, load_uploaded_file, FileStatus, Settings};
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docchat", version, about = "Chat with your documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Terminal chat that processes and answers in this process.
    Chat,
    /// Terminal chat against a running REST server.
    ChatRemote {
        #[arg(long, env = "API_URL", default_value = "http://localhost:8000")]
        api_url: String,
    },
    /// Index every supported document under a folder.
    Ingest {
        /// Folder searched recursively for pdf, txt and md files.
        #[arg(long)]
        folder: PathBuf,
    },
    /// Print index statistics.
    Stats,
    /// Delete the persisted index.
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "docchat boot"
    );

    match cli.command {
        Command::Serve { host, port } => {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("invalid listen address {host}:{port}"))?;
            server::start_server(local_state(settings)?, addr).await?;
        }
        Command::Chat => {
            let state = local_state(settings)?;
            let backend = LocalBackend::new(Arc::clone(&state));
            run_terminal_chat(&backend, &state.settings).await?;
        }
        Command::ChatRemote { api_url } => {
            let client = ApiClient::new(&api_url)?;
            match client.health().await {
                Ok(health) => info!(
                    api_url = %client.base_url(),
                    vector_store_loaded = health.vector_store_loaded,
                    "remote API reachable"
                ),
                Err(error) => warn!(api_url = %client.base_url(), %error, "remote API health check failed"),
            }
            run_terminal_chat(&RemoteBackend::new(client), &settings).await?;
        }
        Command::Ingest { folder } => {
            let state = local_state(settings)?;
            ingest_folder(&state, &folder).await?;
        }
        Command::Stats => {
            let stats = local_state(settings)?.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Reset => {
            let state = local_state(settings)?;
            state.reset().await?;
            println!("vector store at {} removed", state.settings.persist_dir.display());
        }
    }

    Ok(())
}

/// In-process components. Requires a valid API key.
fn local_state(settings: Settings) -> anyhow::Result<Arc<AppState>> {
    settings.validate()?;
    Ok(Arc::new(AppState::from_settings(settings)?))
}

async fn run_terminal_chat(backend: &dyn ChatBackend, settings: &Settings) -> anyhow::Result<()> {
    let fallback = api::ModelsResponse {
        models: settings.available_models.clone(),
        default: settings.default_model.clone(),
    };
    let mut session = session_for(backend, fallback, settings.temperature).await;
    let mut stdout = tokio::io::stdout();
    run_repl(
        backend,
        &mut session,
        BufReader::new(tokio::io::stdin()),
        &mut stdout,
        true,
    )
    .await
}

async fn ingest_folder(state: &AppState, folder: &std::path::Path) -> anyhow::Result<()> {
    let paths = discover_documents(folder);
    if paths.is_empty() {
        println!("no supported documents found under {}", folder.display());
        return Ok(());
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        match load_uploaded_file(path) {
            Ok(file) => files.push(file),
            Err(error) => warn!(path = %path.display(), %error, "skipping unreadable file"),
        }
    }

    let report = state.processor.process_files(&files);
    for problem in report.problems() {
        match &problem.status {
            FileStatus::Skipped { reason } => warn!(file = %problem.name, %reason, "skipped"),
            FileStatus::Failed { error } => warn!(file = %problem.name, %error, "failed"),
            FileStatus::Processed { .. } => {}
        }
    }

    if report.chunks.is_empty() {
        println!("0 chunks ingested (all files were skipped)");
        return Ok(());
    }

    info!(folder = %folder.display(), chunk_count = report.chunks.len(), "indexing chunks");
    let total = state.index_chunks(&report.chunks).await?;

    println!(
        "{} chunks from {} file(s) ingested at {} ({total} in index)",
        report.chunks.len(),
        report.processed_files(),
        Utc::now().to_rfc3339()
    );
    Ok(())
}
