//! Windowcast CLI
//!
//! Usage:
//!   windowcast --config ./windowcast.toml run
//!   windowcast --config ./windowcast.toml replay --parallel --workers 8
//!   windowcast --config ./windowcast.toml listen
//!   windowcast --config ./windowcast.toml periods
//!   windowcast clients

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use tracing::info;
use windowcast::config::{DispatchConfig, RunMode};
use windowcast::dispatch::available_clients;
use windowcast::{logging, runner};

/// Calendar-aware market data dispatch
#[derive(Parser, Debug)]
#[command(name = "windowcast")]
#[command(about = "Replay or stream market data windows to pluggable clients")]
struct Cli {
    /// Path to the TOML run configuration
    #[arg(short, long, env = "WINDOWCAST_CONFIG", default_value = "windowcast.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run whatever `mode` the config selects
    Run,

    /// Publish live windows on every clock boundary
    Live,

    /// Subscribe to live windows and run the configured client
    Listen,

    /// Replay the configured historical range
    Replay {
        /// Run windows on a worker pool
        #[arg(long)]
        parallel: bool,

        /// Pool size (implies --parallel)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print the windows a replay would process
    Periods,

    /// List registered clients
    Clients,
}

/// Load, apply env overrides and optionally force a mode, then validate.
fn load_config(path: &Path, mode: Option<RunMode>) -> Result<DispatchConfig> {
    let mut config = DispatchConfig::load(path)?;
    config.apply_env_overrides();
    if let Some(mode) = mode {
        config.mode = mode;
    }
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

async fn replay(config: DispatchConfig) -> Result<()> {
    let client = config.client_name()?.to_string();
    let summary = runner::run_replay(config).await?;
    println!("{}", summary.message(&client));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    logging::init_tracing();

    let cli = Cli::parse();
    info!(command = ?cli.command, config = %cli.config.display(), "windowcast starting");

    match cli.command {
        Commands::Clients => {
            let mut clients: Vec<_> = available_clients().into_iter().collect();
            clients.sort();
            for (name, description) in clients {
                println!("{:<20} {}", name, description);
            }
        }
        Commands::Periods => {
            let config = load_config(&cli.config, Some(RunMode::Replay))?;
            for window in runner::replay_windows(&config)? {
                println!("{}", window);
            }
        }
        Commands::Run => {
            let config = load_config(&cli.config, None)?;
            match config.mode {
                RunMode::Live => {
                    runner::run_live(config).await?;
                }
                RunMode::Replay => replay(config).await?,
            }
        }
        Commands::Live => {
            let config = load_config(&cli.config, Some(RunMode::Live))?;
            runner::run_live(config).await?;
        }
        Commands::Listen => {
            let config = load_config(&cli.config, Some(RunMode::Live))?;
            runner::run_listener(config).await?;
        }
        Commands::Replay { parallel, workers } => {
            let mut config = load_config(&cli.config, Some(RunMode::Replay))?;
            if let Some(n) = workers {
                config.workers = n;
                config.parallel = true;
            }
            config.parallel |= parallel;
            replay(config).await?;
        }
    }

    Ok(())
}
