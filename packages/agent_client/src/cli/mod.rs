pub mod render;

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use agent_convo::{AgentCommand, AgentSession, Change, SessionView};

use crate::config::ClientConfig;
use crate::connection::{self, CommandResult, ConnectionEvent, ConnectionHandle};
use crate::error::{ApiError, CommandError};
use crate::rest::ApiClient;
use crate::store::SessionStore;
use render::StreamPrinter;

/// Shared state for every subcommand.
pub struct CliContext {
    pub config: ClientConfig,
    pub api: ApiClient,
    pub store: SessionStore,
}

impl CliContext {
    pub fn new(config: ClientConfig) -> Self {
        let api = ApiClient::new(config.server.clone());
        let store = SessionStore::new(config.paths.sessions_path.clone());
        Self { config, api, store }
    }

    fn current_session(&self) -> Result<String> {
        self.store.current()?.context(
            "No session selected. Run `science-agent session new` or `science-agent tasks start <id>`",
        )
    }
}

fn server_unavailable() -> Result<()> {
    eprintln!("[science-agent: server unavailable]");
    Ok(())
}

// =============================================================================
// Sessions
// =============================================================================

pub async fn session_new(ctx: &CliContext) -> Result<()> {
    let id = match ctx.api.create_session().await {
        Ok(id) => id,
        Err(ApiError::Unavailable) => return server_unavailable(),
        Err(e) => return Err(e.into()),
    };
    ctx.store.select(&id)?;
    println!("{id}");
    Ok(())
}

/// Check the current session; forget it if the server no longer knows it.
pub async fn session_validate(ctx: &CliContext) -> Result<()> {
    let id = ctx.current_session()?;
    match ctx.api.validate_session(&id).await {
        Ok(()) => {
            println!("Session {id} is valid.");
            Ok(())
        }
        Err(ApiError::Status { message, .. }) => {
            ctx.store.remove(&id)?;
            warn!(session = %id, %message, "forgot invalid session");
            println!("Session {id} is no longer valid ({message}); forgotten.");
            Ok(())
        }
        Err(ApiError::Unavailable) => server_unavailable(),
        Err(e) => Err(e.into()),
    }
}

pub fn session_list(ctx: &CliContext) -> Result<()> {
    let sessions = ctx.store.load()?;
    if sessions.saved.is_empty() {
        println!("No saved sessions.");
        return Ok(());
    }
    for id in &sessions.saved {
        let marker = if sessions.current.as_deref() == Some(id) {
            "*"
        } else {
            " "
        };
        println!("{marker} {id}");
    }
    Ok(())
}

pub async fn session_use(ctx: &CliContext, id: &str) -> Result<()> {
    match ctx.api.validate_session(id).await {
        Ok(()) => {}
        Err(ApiError::Status { message, .. }) => bail!("Cannot use session {id}: {message}"),
        Err(ApiError::Unavailable) => return server_unavailable(),
        Err(e) => return Err(e.into()),
    }
    ctx.store.select(id)?;
    println!("Now using session {id}.");
    Ok(())
}

// =============================================================================
// Tasks
// =============================================================================

pub async fn tasks_list(ctx: &CliContext, user: bool, json: bool) -> Result<()> {
    let result = if user {
        ctx.api.fetch_user_tasks().await
    } else {
        ctx.api.fetch_tasks().await
    };
    let tasks = match result {
        Ok(tasks) => tasks,
        Err(ApiError::Unavailable) => return server_unavailable(),
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else if tasks.is_empty() {
        println!("No tasks.");
    } else {
        println!("{:<38} {:<20} {}", "ID", "DOMAIN", "INSTRUCTION");
        println!("{}", "-".repeat(100));
        for task in &tasks {
            println!(
                "{:<38} {:<20} {}",
                task.id,
                truncate(task.metadata.task.domain.as_deref().unwrap_or("-"), 20),
                truncate(&instruction(task), 60)
            );
        }
        println!("\n{} task(s)", tasks.len());
    }
    Ok(())
}

pub async fn tasks_show(ctx: &CliContext, id: &str) -> Result<()> {
    let task = match ctx.api.fetch_task(id).await {
        Ok(task) => task,
        Err(ApiError::Unavailable) => return server_unavailable(),
        Err(e) => return Err(e.into()),
    };
    let meta = &task.metadata;
    println!("Task {}", task.id);
    if let Some(created) = meta.created_at() {
        println!("Created:     {}", created.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(domain) = &meta.task.domain {
        println!("Domain:      {domain}");
    }
    if let Some(dataset) = &meta.task.dataset_folder_tree {
        println!("Dataset:\n{dataset}");
    }
    println!("\nInstruction:\n{}", instruction(&task));
    let knowledge = if task.domain_knowledge.is_empty() {
        meta.task.domain_knowledge.clone().unwrap_or_default()
    } else {
        task.domain_knowledge.clone()
    };
    if !knowledge.is_empty() {
        println!("\nDomain knowledge:\n{knowledge}");
    }
    Ok(())
}

pub async fn tasks_start(ctx: &CliContext, id: &str) -> Result<()> {
    let session = match ctx.api.create_session_from_task(id).await {
        Ok(session) => session,
        Err(ApiError::Unavailable) => return server_unavailable(),
        Err(e) => return Err(e.into()),
    };
    ctx.store.select(&session)?;
    println!("{session}");
    Ok(())
}

fn instruction(task: &AgentSession) -> String {
    if !task.task_instruction.is_empty() {
        return task.task_instruction.clone();
    }
    task.metadata.task.task_inst.clone().unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

// =============================================================================
// Files and evaluation
// =============================================================================

pub async fn upload(ctx: &CliContext, path: &Path) -> Result<()> {
    let id = ctx.current_session()?;
    let label = path.display().to_string();
    let progress_label = label.clone();
    let result = ctx
        .api
        .upload_file(&id, path, move |percent| {
            eprint!("\rUploading {progress_label}: {percent:>3}%");
            let _ = std::io::stderr().flush();
        })
        .await;
    eprintln!();
    match result {
        Ok(file) => {
            println!("Uploaded {} ({} bytes) as {}", file.name, file.size, file.object_name);
            Ok(())
        }
        Err(ApiError::Unavailable) => server_unavailable(),
        Err(e) => Err(anyhow::Error::from(e).context(format!("Failed to upload {label}"))),
    }
}

pub async fn delete(ctx: &CliContext, filename: &str) -> Result<()> {
    let id = ctx.current_session()?;
    match ctx.api.delete_file(&id, filename).await {
        Ok(()) => {
            println!("Deleted {filename}.");
            Ok(())
        }
        Err(ApiError::Unavailable) => server_unavailable(),
        Err(e) => Err(e.into()),
    }
}

pub async fn evaluate(ctx: &CliContext, instance_id: &str) -> Result<()> {
    let result = match ctx.api.evaluate_task(instance_id).await {
        Ok(result) => result,
        Err(ApiError::Unavailable) => return server_unavailable(),
        Err(e) => return Err(e.into()),
    };
    if let Some(output) = &result.output {
        print!("{output}");
    }
    if !result.success {
        bail!(
            "Evaluation failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

// =============================================================================
// Live session
// =============================================================================

/// Open the session WebSocket and wait for it to connect.
async fn open_session(
    ctx: &CliContext,
) -> Result<(String, ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>)> {
    let id = ctx.current_session()?;
    let url = ctx.api.ws_url(&id);
    info!(session = %id, %url, "connecting");
    let (handle, events) = connection::connect(
        url,
        ctx.config.connection.reconnect,
        ctx.config.connection.command_timeout,
    );
    if handle.wait_open().await.is_err() {
        handle.close();
        bail!("Could not connect to session {id}");
    }
    Ok((id, handle, events))
}

/// Renders the event stream of one session to stdout.
struct Console<'a> {
    ctx: &'a CliContext,
    view: SessionView,
    printer: StreamPrinter,
    was_connected: bool,
}

impl<'a> Console<'a> {
    fn new(ctx: &'a CliContext, show_history: bool) -> Self {
        Self {
            ctx,
            view: SessionView::new(),
            printer: StreamPrinter::new(show_history),
            was_connected: false,
        }
    }

    /// Returns the fatal message once the connection has given up.
    fn handle(&mut self, event: ConnectionEvent) -> Option<String> {
        match event {
            ConnectionEvent::Event(event) => {
                let kind = event.kind();
                match self.view.apply(event) {
                    Ok(change) => self.show(&change),
                    Err(e) => debug!(kind, error = %e, "event did not apply"),
                }
            }
            ConnectionEvent::Error(message) => eprintln!("error: {message}"),
            ConnectionEvent::ConnectionChanged { connected: true } => {
                if self.was_connected {
                    eprintln!("[science-agent: reconnected]");
                }
                self.was_connected = true;
            }
            ConnectionEvent::ConnectionChanged { connected: false } => {
                eprintln!("[science-agent: connection lost, reconnecting]");
            }
            ConnectionEvent::Fatal(message) => return Some(message),
        }
        None
    }

    fn show(&mut self, change: &Change) {
        let text = self.printer.render(&self.view, change);
        if !text.is_empty() {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        match change {
            Change::Snapshot => {
                if let Some(session) = self.view.session() {
                    eprintln!(
                        "[science-agent: session {} with {} message(s)]",
                        session.id,
                        self.view.messages().len()
                    );
                }
            }
            Change::CodeFileAdded(idx) => {
                if let Some(file) = self.view.code_files().get(*idx) {
                    println!("[saved {} as program {}]", file.filename, file.id);
                }
            }
            Change::OutputFiles => {
                for file in self.view.output_files() {
                    println!(
                        "[output {}: {}]",
                        file.filename,
                        self.ctx.api.output_file_url(file)
                    );
                }
            }
            _ => {}
        }
    }

    fn summary(&self) {
        let usage = self.view.usage();
        if usage.total_tokens() > 0 {
            eprintln!(
                "[tokens: {} prompt + {} completion, cost ${:.4}]",
                usage.prompt_tokens, usage.completion_tokens, usage.cost
            );
        }
    }
}

/// Stream a session until Ctrl-C or the connection gives up.
pub async fn watch(ctx: &CliContext) -> Result<()> {
    let (_id, handle, mut events) = open_session(ctx).await?;
    let mut console = Console::new(ctx, true);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(fatal) = console.handle(event) {
                        bail!(fatal);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
        }
    }

    handle.close();
    console.summary();
    Ok(())
}

/// Send one command and stream the session until it completes.
///
/// Long-running commands wait without a timeout; the first Ctrl-C asks the
/// server to cancel, the second detaches.
pub async fn run_agent_command(ctx: &CliContext, command: AgentCommand) -> Result<()> {
    let long_running = matches!(
        command,
        AgentCommand::SolveTask { .. }
            | AgentCommand::FollowUp { .. }
            | AgentCommand::RunProgram { .. }
    );
    let timeout = if long_running {
        std::time::Duration::ZERO
    } else {
        ctx.config.connection.command_timeout
    };

    let (id, handle, mut events) = open_session(ctx).await?;
    let mut console = Console::new(ctx, false);

    let pending = handle.run(command, timeout)?;
    tokio::pin!(pending);
    let mut cancel_sent = false;

    let outcome = loop {
        tokio::select! {
            result = &mut pending => break result,
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(fatal) = console.handle(event) {
                        bail!(fatal);
                    }
                }
                None => break Err(CommandError::Closed),
            },
            _ = tokio::signal::ctrl_c(), if long_running => {
                if cancel_sent {
                    eprintln!("\n[science-agent: detached]");
                    break Err(CommandError::Closed);
                }
                cancel_sent = true;
                eprintln!("\n[science-agent: cancelling, press Ctrl-C again to detach]");
                match handle.run(AgentCommand::Cancel, ctx.config.connection.command_timeout) {
                    Ok(cancel) => {
                        tokio::spawn(async move {
                            if let Err(e) = cancel.await {
                                warn!(error = %e, "cancel failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "could not send cancel"),
                }
            }
        }
    };

    // Events that preceded the response are already queued
    while let Ok(event) = events.try_recv() {
        if let Some(fatal) = console.handle(event) {
            bail!(fatal);
        }
    }
    handle.close();
    console.summary();

    match classify_outcome(outcome, cancel_sent) {
        Outcome::Completed => {
            debug!(session = %id, "command completed");
            Ok(())
        }
        Outcome::Cancelled => {
            eprintln!("[science-agent: cancelled]");
            Ok(())
        }
        Outcome::Detached => Ok(()),
        Outcome::Failed(e) => Err(e.into()),
    }
}

/// Server rejection sent to a command stopped by `cancel`.
const CANCELLED: &str = "Command cancelled";

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
    /// The user left after asking for a cancel
    Detached,
    Failed(CommandError),
}

fn classify_outcome(result: CommandResult, cancel_sent: bool) -> Outcome {
    match result {
        Ok(_) => Outcome::Completed,
        Err(CommandError::Server(message)) if message == CANCELLED => Outcome::Cancelled,
        Err(CommandError::Closed) if cancel_sent => Outcome::Detached,
        Err(e) => Outcome::Failed(e),
    }
}
