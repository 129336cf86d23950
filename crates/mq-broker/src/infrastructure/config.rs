//! TOML configuration for the broker process.
//!
//! Every field has a default, so a partial file (or no file at all) yields a
//! working configuration:
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! port = 4444
//! max_workers = 4
//! max_clients_per_worker = 64
//! idle_timeout_secs = 300
//! worker_retire_after_secs = 600   # 0 keeps idle workers forever
//!
//! [storage]
//! backend = "sqlite"               # or "memory"
//! path = "mq-broker.db"
//! max_connections = 8
//! checkout_timeout_ms = 5000
//!
//! [logging]
//! level = "info"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::server_manager::ServerSettings;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The bind address is not an IP address.
    #[error("invalid bind address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// A value is out of its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening socket and worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address to listen on. `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on worker threads.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Connections one worker may own at a time.
    #[serde(default = "default_max_clients_per_worker")]
    pub max_clients_per_worker: usize,
    /// Connections silent for this long are closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// A worker left without connections for this long exits. `0` disables.
    #[serde(default = "default_worker_retire_after_secs")]
    pub worker_retire_after_secs: u64,
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

/// Storage backend selection and pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Database file for the `sqlite` backend.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long a request waits for a free connection.
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `"info"` or `"mq_broker=debug"`.
    /// `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4444
}
fn default_max_workers() -> usize {
    4
}
fn default_max_clients_per_worker() -> usize {
    64
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_worker_retire_after_secs() -> u64 {
    600
}
fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}
fn default_db_path() -> PathBuf {
    PathBuf::from("mq-broker.db")
}
fn default_max_connections() -> usize {
    8
}
fn default_checkout_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_workers: default_max_workers(),
            max_clients_per_worker: default_max_clients_per_worker(),
            idle_timeout_secs: default_idle_timeout_secs(),
            worker_retire_after_secs: default_worker_retire_after_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
            max_connections: default_max_connections(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Derived settings ──────────────────────────────────────────────────────────

impl BrokerConfig {
    /// Rejects sizes that would leave the broker unable to serve anyone.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.server.max_workers == 0, "server.max_workers must be at least 1"),
            (
                self.server.max_clients_per_worker == 0,
                "server.max_clients_per_worker must be at least 1",
            ),
            (self.server.idle_timeout_secs == 0, "server.idle_timeout_secs must be at least 1"),
            (self.storage.max_connections == 0, "storage.max_connections must be at least 1"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid(message.to_string())),
            None => Ok(()),
        }
    }
}

impl ServerConfig {
    /// Converts the file representation into runtime [`ServerSettings`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if `bind_address` is not an IP.
    pub fn settings(&self) -> Result<ServerSettings, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|source| ConfigError::InvalidAddress {
                address: self.bind_address.clone(),
                source,
            })?;
        Ok(ServerSettings {
            bind_address: SocketAddr::new(ip, self.port),
            max_workers: self.max_workers,
            max_clients_per_worker: self.max_clients_per_worker,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            worker_retire_after: (self.worker_retire_after_secs > 0)
                .then(|| Duration::from_secs(self.worker_retire_after_secs)),
        })
    }
}

impl StorageConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads a [`BrokerConfig`] from `path`, returning the defaults if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<BrokerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BrokerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
