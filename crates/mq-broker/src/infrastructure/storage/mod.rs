//! Storage backends behind the [`Storage`] port.
//!
//! - **`sqlite`** – Relational store on a pooled set of SQLite connections.
//! - **`pool`** – Bounded connection pool with a checkout timeout.
//! - **`memory`** – Embedded in-process store with the same semantics.

pub mod memory;
pub mod pool;
pub mod sqlite;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::application::storage::{Storage, StorageError};
use crate::infrastructure::config::{StorageBackend, StorageConfig};

/// Opens the backend selected by `config`.
///
/// # Errors
///
/// Returns [`StorageError::Backend`] if the database cannot be opened or its
/// schema cannot be created.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config.backend {
        StorageBackend::Sqlite => Ok(Arc::new(sqlite::SqliteStore::open(
            &config.path,
            config.max_connections,
            config.checkout_timeout(),
        )?)),
        StorageBackend::Memory => Ok(Arc::new(memory::MemoryStore::new())),
    }
}

/// Microseconds since the Unix epoch.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}
