use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::adapters::config::Settings;
use crate::core::error::DynError;

mod commands;

/// Run multi-turn, tool-calling agents and inspect their ledger
#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Ledger database (defaults to `db_path` in ~/.relay/config.toml)
    #[arg(long, global = true, env = "RELAY_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an agent definition (.yaml, .yml or .toml)
    Run {
        agent_file: PathBuf,
    },

    /// Print the persisted history of one run as JSON
    History {
        run_id: String,
    },

    /// List recent runs, newest first
    Runs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

pub fn run() {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("relay: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(dispatch(cli)) {
        eprintln!("relay: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), DynError> {
    let settings = Settings::load_global();
    let db_path = cli.db.unwrap_or_else(|| settings.db_path());

    match cli.command {
        Commands::Run { agent_file } => {
            commands::run::run_agent(&settings, &db_path, &agent_file).await
        }
        Commands::History { run_id } => commands::history::show_history(&db_path, &run_id),
        Commands::Runs { limit } => commands::history::list_runs(&db_path, limit),
    }
}
