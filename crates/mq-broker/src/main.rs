//! Message queue broker: entry point.
//!
//! Loads the TOML configuration, applies command-line overrides, opens the
//! storage backend and runs the server manager until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! mq-broker [OPTIONS]
//!
//! Options:
//!   --config <PATH>               Configuration file [default: mq-broker.toml]
//!   --port <PORT>                 Listening port
//!   --workers <N>                 Maximum worker threads
//!   --clients-per-worker <N>      Connections per worker
//!   --database <PATH>             SQLite database file
//!   --log-level <FILTER>          tracing filter, e.g. "debug"
//! ```
//!
//! Every option can also be set through the environment variable listed in
//! `--help`. `RUST_LOG` overrides the configured log level.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mq_broker::infrastructure::config::{load_config, BrokerConfig};
use mq_broker::infrastructure::logging::TracingSink;
use mq_broker::infrastructure::network::server_manager::ServerManager;
use mq_broker::infrastructure::storage::open_storage;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Multi-threaded message queue broker.
#[derive(Debug, Parser)]
#[command(name = "mq-broker", about = "Message queue broker server", version)]
struct Cli {
    /// Path to the TOML configuration file. Missing file means defaults.
    #[arg(long, default_value = "mq-broker.toml", env = "MQ_BROKER_CONFIG")]
    config: PathBuf,

    /// TCP port to listen on.
    #[arg(long, env = "MQ_BROKER_PORT")]
    port: Option<u16>,

    /// Upper bound on worker threads.
    #[arg(long, env = "MQ_BROKER_WORKERS")]
    workers: Option<usize>,

    /// Connections each worker may own.
    #[arg(long, env = "MQ_BROKER_CLIENTS_PER_WORKER")]
    clients_per_worker: Option<usize>,

    /// SQLite database file.
    #[arg(long, env = "MQ_BROKER_DATABASE")]
    database: Option<PathBuf>,

    /// Log filter directive.
    #[arg(long, env = "MQ_BROKER_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the configuration file and layers the command-line values on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// combined configuration is invalid.
    fn into_config(self) -> anyhow::Result<BrokerConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(workers) = self.workers {
            config.server.max_workers = workers;
        }
        if let Some(clients) = self.clients_per_worker {
            config.server.max_clients_per_worker = clients;
        }
        if let Some(database) = self.database {
            config.storage.path = database;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        config.validate()?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(
        "mq-broker starting: backend={:?}, database={}",
        config.storage.backend,
        config.storage.path.display()
    );

    let storage = open_storage(&config.storage).context("failed to open storage")?;
    let settings = config.server.settings()?;
    let server = ServerManager::start(settings, storage, Arc::new(TracingSink))?;

    info!("mq-broker ready on {}. Press Ctrl-C to exit.", server.local_addr());
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C signal: {e}");
    }
    info!("shutdown signal received");

    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .context("shutdown task failed")??;

    info!("mq-broker stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
