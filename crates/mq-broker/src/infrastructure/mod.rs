//! Infrastructure layer of the broker.
//!
//! Contains the OS-facing adapters: non-blocking sockets and the reactor
//! threads that drive them, the storage backends behind the
//! [`crate::application::storage::Storage`] port, configuration loading and
//! the `tracing` event sink.
//!
//! **Dependency rule**: this layer may depend on `application` and `mq_core`,
//! but MUST NOT be imported by the `application` layer.

pub mod config;
pub mod logging;
pub mod network;
pub mod storage;
