//! jobgridd — the jobgrid daemon.
//!
//! Hosts a controller, a scheduler and any number of worker processes
//! against one shared store. The controller runs the liveness reaper and
//! both status maintainers; every hosted process emits keepalives.
//!
//! # Usage
//!
//! ```text
//! jobgridd standalone --data-dir /var/lib/jobgrid --workers 4
//! ```

mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str =
    "info,jobgrid_state=debug,jobgrid_registry=debug,jobgrid_workers=debug,jobgridd=debug";

#[derive(Parser)]
#[command(name = "jobgridd", about = "jobgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every process kind in this one OS process.
    Standalone {
        /// Path to a jobgrid.toml configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the store.
        #[arg(long, default_value = "/var/lib/jobgrid")]
        data_dir: PathBuf,

        /// Number of worker processes to host.
        #[arg(long, default_value = "1")]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            data_dir,
            workers,
        } => standalone::run(config, data_dir, workers).await,
    }
}
