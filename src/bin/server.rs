//! Dispatch server binary

use clap::{Parser, Subcommand};
use geodispatch::{Config, DispatchServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "geodispatch-server")]
#[command(about = "Driver location and dispatch coordination server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// TOML config file (GEODISPATCH__* env vars override it)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// RocksDB state store directory (selects the rocksdb backend)
        #[arg(long)]
        state_path: Option<PathBuf>,

        /// Location history file (selects the file backend)
        #[arg(long)]
        history_path: Option<PathBuf>,

        /// Log level used when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,

        /// Disable the periodic reconciliation sweep
        #[arg(long)]
        no_reconcile: bool,
    },

    /// Print the effective configuration and exit
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            state_path,
            history_path,
            log_level,
            no_reconcile,
        } => {
            // file and env first, then flags on top
            let mut config = Config::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(path) = state_path {
                config.state.backend = geodispatch::common::StateBackend::RocksDb;
                config.state.path = Some(path);
            }
            if let Some(path) = history_path {
                config.history.backend = geodispatch::common::HistoryBackend::File;
                config.history.path = Some(path);
            }
            if let Some(level) = log_level {
                config.log_level = level;
            }
            if no_reconcile {
                config.reconcile.enabled = false;
            }
            config.validate()?;

            init_tracing(&config.log_level);
            DispatchServer::new(config).serve().await?;
        }

        Commands::Config { config } => {
            let config = Config::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
