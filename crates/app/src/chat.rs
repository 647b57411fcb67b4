//! Terminal chat front-end. Both variants share one REPL and differ only in
//! the [`ChatBackend`] they talk to.

use crate::api::{AskRequest, ModelsResponse};
use crate::client::ApiClient;
use crate::state::AppState;
use anyhow::Context;
use async_trait::async_trait;
use docchat_core::{
    document_stats, load_uploaded_file, AskOptions, ConversationMessage, DocumentStats,
    FileStatus, Role, UploadedFile, VectorStoreStats, WireMessage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

const HELP: &str = "\
commands:
  /upload <paths...>    index documents (pdf, txt, md)
  /model <name>         switch chat model
  /models               list available models
  /temperature <0..1>   set sampling temperature
  /stats                show index statistics
  /clear                clear the conversation
  /reset                delete every indexed document
  /help                 show this help
  /quit                 leave
anything else is sent as a question";

#[derive(Debug, Clone, PartialEq)]
pub struct UploadSummary {
    pub files_processed: usize,
    pub total_chunks: usize,
    pub stats: DocumentStats,
    pub problems: Vec<String>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn upload(&self, paths: &[PathBuf]) -> anyhow::Result<UploadSummary>;

    async fn ask(
        &self,
        query: &str,
        history: &[ConversationMessage],
        model: &str,
        temperature: f32,
    ) -> anyhow::Result<String>;

    async fn stats(&self) -> anyhow::Result<VectorStoreStats>;

    async fn reset(&self) -> anyhow::Result<()>;

    async fn models(&self) -> anyhow::Result<ModelsResponse>;
}

/// Runs processing, indexing and generation in this process.
pub struct LocalBackend {
    state: Arc<AppState>,
}

impl LocalBackend {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ChatBackend for LocalBackend {
    async fn upload(&self, paths: &[PathBuf]) -> anyhow::Result<UploadSummary> {
        let mut problems = Vec::new();
        let mut files = Vec::new();
        for path in paths {
            match load_uploaded_file(path) {
                Ok(file) => files.push(file),
                Err(error) => problems.push(format!("{}: {error}", path.display())),
            }
        }

        let processor = Arc::clone(&self.state.processor);
        let report = tokio::task::spawn_blocking(move || processor.process_files(&files))
            .await
            .context("document processing task failed")?;

        for problem in report.problems() {
            let reason = match &problem.status {
                FileStatus::Skipped { reason } => reason.as_str(),
                FileStatus::Failed { error } => error.as_str(),
                FileStatus::Processed { .. } => continue,
            };
            problems.push(format!("{}: {reason}", problem.name));
        }

        if !report.chunks.is_empty() {
            self.state.index_chunks(&report.chunks).await?;
        }

        Ok(UploadSummary {
            files_processed: report.processed_files(),
            total_chunks: report.chunks.len(),
            stats: document_stats(&report.chunks),
            problems,
        })
    }

    async fn ask(
        &self,
        query: &str,
        history: &[ConversationMessage],
        model: &str,
        temperature: f32,
    ) -> anyhow::Result<String> {
        let options = AskOptions {
            model: Some(model.to_string()),
            temperature: Some(temperature),
            system_prompt: None,
            history: history.to_vec(),
        };
        Ok(self.state.ask(query, &options, false).await?.answer)
    }

    async fn stats(&self) -> anyhow::Result<VectorStoreStats> {
        Ok(self.state.stats().await)
    }

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(self.state.reset().await?)
    }

    async fn models(&self) -> anyhow::Result<ModelsResponse> {
        Ok(ModelsResponse {
            models: self.state.settings.available_models.clone(),
            default: self.state.settings.default_model.clone(),
        })
    }
}

/// Talks to a running REST server.
pub struct RemoteBackend {
    client: ApiClient,
}

impl RemoteBackend {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatBackend for RemoteBackend {
    async fn upload(&self, paths: &[PathBuf]) -> anyhow::Result<UploadSummary> {
        let files = paths
            .iter()
            .map(|path| load_uploaded_file(path))
            .collect::<Result<Vec<UploadedFile>, _>>()?;
        let response = self.client.upload(&files).await?;
        Ok(UploadSummary {
            files_processed: response.files_processed,
            total_chunks: response.total_chunks,
            stats: response.stats,
            problems: Vec::new(),
        })
    }

    async fn ask(
        &self,
        query: &str,
        history: &[ConversationMessage],
        model: &str,
        temperature: f32,
    ) -> anyhow::Result<String> {
        let request = AskRequest {
            query: query.to_string(),
            model: Some(model.to_string()),
            temperature: Some(temperature),
            history: Some(history.iter().map(WireMessage::from).collect()),
            with_sources: false,
        };
        Ok(self.client.ask(&request).await?.answer)
    }

    async fn stats(&self) -> anyhow::Result<VectorStoreStats> {
        Ok(self.client.stats().await?)
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.client.reset().await?;
        Ok(())
    }

    async fn models(&self) -> anyhow::Result<ModelsResponse> {
        Ok(self.client.models().await?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Ask(String),
    Upload(Vec<PathBuf>),
    Model(String),
    Models,
    Temperature(f32),
    Stats,
    Clear,
    Reset,
    Help,
    Quit,
    Empty,
}

pub fn parse_command(line: &str) -> Result<ChatCommand, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ChatCommand::Empty);
    }
    if !line.starts_with('/') {
        return Ok(ChatCommand::Ask(line.to_string()));
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match command {
        "/upload" if args.is_empty() => Err("usage: /upload <paths...>".to_string()),
        "/upload" => Ok(ChatCommand::Upload(
            args.iter().map(|arg| PathBuf::from(*arg)).collect(),
        )),
        "/model" => match args.as_slice() {
            [name] => Ok(ChatCommand::Model(name.to_string())),
            _ => Err("usage: /model <name>".to_string()),
        },
        "/models" => Ok(ChatCommand::Models),
        "/temperature" => {
            let value = args
                .first()
                .and_then(|raw| raw.parse::<f32>().ok())
                .ok_or_else(|| "usage: /temperature <0..1>".to_string())?;
            if (0.0..=1.0).contains(&value) {
                Ok(ChatCommand::Temperature(value))
            } else {
                Err(format!("temperature must be between 0 and 1, got {value}"))
            }
        }
        "/stats" => Ok(ChatCommand::Stats),
        "/clear" => Ok(ChatCommand::Clear),
        "/reset" => Ok(ChatCommand::Reset),
        "/help" => Ok(ChatCommand::Help),
        "/quit" | "/exit" => Ok(ChatCommand::Quit),
        other => Err(format!("unknown command {other}, try /help")),
    }
}

/// In-memory conversation plus the knobs the user can turn.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub model: String,
    pub temperature: f32,
    pub available_models: Vec<String>,
    pub messages: Vec<ConversationMessage>,
    pub status: Option<String>,
}

impl ChatSession {
    pub fn new(models: ModelsResponse, temperature: f32) -> Self {
        Self {
            model: models.default,
            temperature,
            available_models: models.models,
            messages: Vec::new(),
            status: None,
        }
    }

    /// Runs one command. Returns `false` when the session should end.
    pub async fn handle(&mut self, backend: &dyn ChatBackend, command: ChatCommand) -> bool {
        self.status = match command {
            ChatCommand::Quit => return false,
            ChatCommand::Empty => None,
            ChatCommand::Ask(query) => self.ask(backend, query).await,
            ChatCommand::Upload(paths) => Some(match backend.upload(&paths).await {
                Ok(summary) => describe_upload(&summary),
                Err(error) => format!("upload failed: {error:#}"),
            }),
            ChatCommand::Model(name) => Some(if self.available_models.contains(&name) {
                self.model = name;
                format!("model set to {}", self.model)
            } else {
                format!(
                    "unknown model {name}, available: {}",
                    self.available_models.join(", ")
                )
            }),
            ChatCommand::Models => Some(format!(
                "available models: {}",
                self.available_models.join(", ")
            )),
            ChatCommand::Temperature(value) => {
                self.temperature = value;
                Some(format!("temperature set to {value}"))
            }
            ChatCommand::Stats => Some(match backend.stats().await {
                Ok(stats) => describe_stats(&stats),
                Err(error) => format!("stats unavailable: {error:#}"),
            }),
            ChatCommand::Clear => {
                self.messages.clear();
                Some("conversation cleared".to_string())
            }
            ChatCommand::Reset => Some(match backend.reset().await {
                Ok(()) => "all documents removed".to_string(),
                Err(error) => format!("reset failed: {error:#}"),
            }),
            ChatCommand::Help => Some(HELP.to_string()),
        };
        true
    }

    async fn ask(&mut self, backend: &dyn ChatBackend, query: String) -> Option<String> {
        match backend
            .ask(&query, &self.messages, &self.model, self.temperature)
            .await
        {
            Ok(answer) => {
                self.messages.push(ConversationMessage::user(query));
                self.messages.push(ConversationMessage::assistant(answer));
                None
            }
            Err(error) => Some(format!("error: {error:#}")),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "docchat | model: {} | temperature: {}\n\n",
            self.model, self.temperature
        );
        for message in &self.messages {
            let speaker = match message.role {
                Role::User => "you",
                Role::Assistant => "assistant",
            };
            out.push_str(&format!("{speaker}> {}\n\n", message.content));
        }
        if let Some(status) = &self.status {
            out.push_str(&format!("-- {status}\n"));
        }
        out
    }
}

fn describe_upload(summary: &UploadSummary) -> String {
    let mut text = format!(
        "processed {} file(s) into {} chunks (avg {} chars)",
        summary.files_processed, summary.total_chunks, summary.stats.avg_chunk_size
    );
    for problem in &summary.problems {
        text.push_str(&format!("\n   skipped {problem}"));
    }
    text
}

fn describe_stats(stats: &VectorStoreStats) -> String {
    if !stats.exists {
        return "no documents loaded".to_string();
    }
    let mut text = format!(
        "{} chunks indexed in {}",
        stats.total_documents, stats.persist_directory
    );
    if let Some(error) = &stats.error {
        text.push_str(&format!(" ({error})"));
    }
    text
}

/// Reads commands line by line and re-renders the whole transcript after each.
pub async fn run_repl<R, W>(
    backend: &dyn ChatBackend,
    session: &mut ChatSession,
    input: R,
    output: &mut W,
    clear_screen: bool,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    session.status = Some("type /help for commands".to_string());

    loop {
        if clear_screen {
            output.write_all(CLEAR_SCREEN.as_bytes()).await?;
        }
        output.write_all(session.render().as_bytes()).await?;
        output.write_all(b"> ").await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let keep_going = match parse_command(&line) {
            Ok(command) => session.handle(backend, command).await,
            Err(message) => {
                session.status = Some(message);
                true
            }
        };
        if !keep_going {
            break;
        }
    }

    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

/// Fetches the model list, falling back to `fallback` when the backend can't say.
pub async fn session_for(
    backend: &dyn ChatBackend,
    fallback: ModelsResponse,
    temperature: f32,
) -> ChatSession {
    let models = match backend.models().await {
        Ok(models) => models,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "could not fetch models, using defaults");
            fallback
        }
    };
    ChatSession::new(models, temperature)
}
