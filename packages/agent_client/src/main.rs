use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

use agent_client::cli::{self, CliContext};
use agent_client::config::ClientConfig;
use agent_convo::AgentCommand;

#[derive(Parser)]
#[command(name = "science-agent")]
#[command(about = "Drive science agent sessions from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.science-agent)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Backend base URL, e.g. http://127.0.0.1:8000
    #[arg(long, global = true)]
    server: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, check and switch agent sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Browse benchmark and user tasks
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },

    /// Upload a file into the current session
    Upload(UploadArgs),

    /// Delete an uploaded file from the current session
    Delete(DeleteArgs),

    /// Run the evaluation script for a benchmark instance
    Evaluate(EvaluateArgs),

    /// Stream the current session until interrupted
    Watch,

    /// Ask the agent to solve the session's task
    Solve(SolveArgs),

    /// Send a follow-up message to the agent
    FollowUp(FollowUpArgs),

    /// Execute a generated program
    Run(RunArgs),

    /// Replace a program's code with your own edit
    UpdateProgram(UpdateProgramArgs),

    /// Cancel the running generation or execution
    Cancel,

    /// Clear the session history
    Clear,

    /// Change the task instruction, domain knowledge and description
    UpdateInputs(UpdateInputsArgs),
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a new empty session and make it current
    New,
    /// Check that the current session still exists
    Validate,
    /// List saved sessions (* marks the current one)
    List,
    /// Switch to another session
    Use {
        /// Session ID
        id: String,
    },
}

#[derive(Subcommand)]
enum TasksAction {
    /// List tasks
    List {
        /// List user-created tasks instead of benchmark tasks
        #[arg(long)]
        user: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one task
    Show {
        /// Task ID
        id: String,
    },
    /// Start a new session from a task and make it current
    Start {
        /// Task ID
        id: String,
    },
}

#[derive(Parser)]
struct UploadArgs {
    /// File to upload
    path: PathBuf,
}

#[derive(Parser)]
struct DeleteArgs {
    /// Name of the uploaded file
    filename: String,
}

#[derive(Parser)]
struct EvaluateArgs {
    /// Benchmark instance ID
    instance_id: String,
}

#[derive(Parser)]
struct SolveArgs {
    /// Do not let the agent debug its own failing programs
    #[arg(long)]
    no_self_debug: bool,
}

#[derive(Parser)]
struct FollowUpArgs {
    /// Message for the agent
    message: String,

    /// Program the message refers to
    #[arg(long)]
    code_id: Option<String>,

    /// Do not let the agent debug its own failing programs
    #[arg(long)]
    no_self_debug: bool,
}

#[derive(Parser)]
struct RunArgs {
    /// Program ID
    program_id: String,
}

#[derive(Parser)]
struct UpdateProgramArgs {
    /// Program ID
    program_id: String,

    /// File holding the new code
    #[arg(long)]
    file: PathBuf,
}

#[derive(Parser)]
struct UpdateInputsArgs {
    /// Task instruction
    #[arg(long)]
    task: String,

    /// Domain knowledge
    #[arg(long, default_value = "")]
    knowledge: String,

    /// Short description
    #[arg(long, default_value = "")]
    description: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the session output
    let default_directive = if cli.debug {
        "science_agent=debug,agent_client=debug,info"
    } else {
        "science_agent=info,agent_client=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = ClientConfig::load(cli.data_dir.clone(), cli.server.clone())?;
    let ctx = CliContext::new(config);
    let llm = ctx.config.llm.clone();

    match cli.command {
        Commands::Session { action } => match action {
            SessionAction::New => cli::session_new(&ctx).await,
            SessionAction::Validate => cli::session_validate(&ctx).await,
            SessionAction::List => cli::session_list(&ctx),
            SessionAction::Use { id } => cli::session_use(&ctx, &id).await,
        },
        Commands::Tasks { action } => match action {
            TasksAction::List { user, json } => cli::tasks_list(&ctx, user, json).await,
            TasksAction::Show { id } => cli::tasks_show(&ctx, &id).await,
            TasksAction::Start { id } => cli::tasks_start(&ctx, &id).await,
        },
        Commands::Upload(args) => cli::upload(&ctx, &args.path).await,
        Commands::Delete(args) => cli::delete(&ctx, &args.filename).await,
        Commands::Evaluate(args) => cli::evaluate(&ctx, &args.instance_id).await,
        Commands::Watch => cli::watch(&ctx).await,
        Commands::Solve(args) => {
            let command = AgentCommand::SolveTask {
                use_self_debug: !args.no_self_debug,
                llm,
            };
            cli::run_agent_command(&ctx, command).await
        }
        Commands::FollowUp(args) => {
            let command = AgentCommand::FollowUp {
                message: args.message,
                code_id: args.code_id,
                use_self_debug: !args.no_self_debug,
                llm,
            };
            cli::run_agent_command(&ctx, command).await
        }
        Commands::Run(args) => {
            let command = AgentCommand::RunProgram {
                id: args.program_id,
            };
            cli::run_agent_command(&ctx, command).await
        }
        Commands::UpdateProgram(args) => {
            let user_content = std::fs::read_to_string(&args.file)
                .with_context(|| format!("Failed to read {:?}", args.file))?;
            let command = AgentCommand::UpdateProgram {
                id: args.program_id,
                user_content,
            };
            cli::run_agent_command(&ctx, command).await
        }
        Commands::Cancel => cli::run_agent_command(&ctx, AgentCommand::Cancel).await,
        Commands::Clear => cli::run_agent_command(&ctx, AgentCommand::Clear).await,
        Commands::UpdateInputs(args) => {
            let command = AgentCommand::UpdateTaskInputs {
                task_instruction: args.task,
                domain_knowledge: args.knowledge,
                description: args.description,
            };
            cli::run_agent_command(&ctx, command).await
        }
    }
}
