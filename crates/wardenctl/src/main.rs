//! Warden Control - command line host for the Warden planner
//!
//! Probes the local machine, plans requests, asks for approval on the
//! terminal and keeps the rollback stack in the configured backup dir.

mod commands;
mod probe;
mod tools;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "wardenctl")]
#[command(about = "Warden - plans and runs Linux admin tasks with rollback", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/warden/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a request without planning it
    Assess {
        request: Vec<String>,
    },

    /// Score a shell command's risk
    Risk {
        command: Vec<String>,
    },

    /// Show the plan for a request without running it
    Plan {
        request: Vec<String>,

        /// Read the system context from a JSON file instead of probing
        #[arg(long)]
        context: Option<PathBuf>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan a request, ask for approval and execute it
    Run {
        request: Vec<String>,

        /// Approve the plan without asking
        #[arg(long, short)]
        yes: bool,

        /// Read the system context from a JSON file instead of probing
        #[arg(long)]
        context: Option<PathBuf>,
    },

    /// Inspect or undo recorded actions
    Rollback {
        #[command(subcommand)]
        action: RollbackCommand,
    },

    /// Capture running services and disk usage into the backup dir
    Snapshot {
        #[arg(default_value = "manual")]
        name: String,
    },
}

#[derive(Subcommand)]
enum RollbackCommand {
    /// List actions that can still be undone
    List,

    /// Undo the most recent action, or a specific one by id
    Undo {
        id: Option<String>,

        /// Undo every pending action, newest first
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Drop completed actions older than the retention window
    Gc {
        /// Override `safety.rollback_retention_days`
        #[arg(long)]
        days: Option<u32>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Assess { request } => commands::assess(&request.join(" ")),
        Commands::Risk { command } => commands::risk(&command.join(" ")),
        Commands::Plan {
            request,
            context,
            json,
        } => commands::plan(&config, &request.join(" "), context.as_deref(), json),
        Commands::Run {
            request,
            yes,
            context,
        } => commands::run(&config, &request.join(" "), context.as_deref(), yes),
        Commands::Rollback { action } => match action {
            RollbackCommand::List => commands::rollback_list(&config),
            RollbackCommand::Undo { id, all } => commands::rollback_undo(&config, id, all),
            RollbackCommand::Gc { days } => commands::rollback_gc(&config, days),
        },
        Commands::Snapshot { name } => commands::snapshot(&config, &name),
    }
}
