use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "smithers")]
#[command(version, about = "Declarative orchestration engine for multi-agent workflows")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the workflow database. Defaults to the project config's
    /// `db_path` (.smithers/state.db).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a smithers project in the current directory
    Init,
    /// Show the latest execution and its headline counters
    Status,
    /// Inspect durable state keys
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// List tasks, optionally for a single iteration
    Tasks {
        #[arg(long)]
        iteration: Option<u64>,
    },
    /// List phase rows
    Phases,
    /// List step rows
    Steps,
    /// List pending human gates
    Gates,
    /// List recorded VCS events
    Vcs,
    /// List tickets, optionally filtered by status
    Tickets {
        #[arg(long)]
        status: Option<String>,
    },
    /// Resolve a pending human gate
    Resolve {
        /// Interaction id (see `smithers gates`)
        id: String,
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        #[arg(long, conflicts_with = "approve")]
        reject: bool,
        /// Response payload recorded on the interaction
        #[arg(long)]
        response: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Print the current value of a key
    Get { key: String },
    /// Print the change history of a key, newest first
    History {
        key: String,
        #[arg(long, default_value = "10")]
        limit: u32,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose { "smithers=debug" } else { "smithers=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let db_path = match &cli.db {
        Some(db) => db.clone(),
        None => {
            let project_dir = std::env::current_dir().context("Failed to resolve current dir")?;
            smithers::SmithersConfig::load(&project_dir)?.db_path
        }
    };

    match cli.command {
        Commands::Init => {
            let project_dir = std::env::current_dir().context("Failed to resolve current dir")?;
            cmd::cmd_init(&project_dir)
        }
        Commands::Status => cmd::cmd_status(&db_path),
        Commands::State { command } => match command {
            StateCommands::Get { key } => cmd::cmd_state_get(&db_path, &key),
            StateCommands::History { key, limit } => {
                cmd::cmd_state_history(&db_path, &key, limit)
            }
        },
        Commands::Tasks { iteration } => cmd::cmd_tasks(&db_path, iteration),
        Commands::Phases => cmd::cmd_phases(&db_path),
        Commands::Steps => cmd::cmd_steps(&db_path),
        Commands::Gates => cmd::cmd_gates(&db_path),
        Commands::Vcs => cmd::cmd_vcs(&db_path),
        Commands::Tickets { status } => cmd::cmd_tickets(&db_path, status.as_deref()),
        Commands::Resolve {
            id,
            approve,
            reject,
            response,
        } => cmd::cmd_resolve(&db_path, &id, approve, reject, response),
    }
}
