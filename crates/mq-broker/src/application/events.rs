//! Structured server events and the observer they are emitted to.
//!
//! The broker core never logs directly. It builds a [`ServerEvent`] and hands
//! it to an injected [`EventSink`]; the binary installs a sink that forwards
//! to `tracing`, tests install mocks or recorders.

use std::net::SocketAddr;

use mq_core::protocol::{MessageType, StatusCode};
use uuid::Uuid;

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end of the socket.
    RemoteClosed,
    /// The client sent a disconnect request and its responses were flushed.
    Disconnected,
    /// No reads or writes within the idle timeout.
    IdleTimeout,
    /// The socket failed with an I/O error.
    Io(String),
    /// The broker is stopping.
    Shutdown,
}

/// One thing worth observing that happened inside the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ServerStarted {
        address: SocketAddr,
        max_workers: usize,
        clients_per_worker: usize,
    },
    ServerStopped,
    WorkerSpawned {
        worker: Uuid,
        capacity: usize,
    },
    WorkerRetired {
        worker: Uuid,
    },
    WorkerFailed {
        worker: Option<Uuid>,
        error: String,
    },
    ConnectionAccepted {
        peer: SocketAddr,
        worker: Uuid,
    },
    /// The server was saturated and answered `FULL_SERVER`.
    ConnectionRejected {
        peer: SocketAddr,
    },
    ConnectionClosed {
        peer: SocketAddr,
        reason: CloseReason,
    },
    AcceptFailed {
        error: String,
    },
    ClientConnected {
        peer: SocketAddr,
        username: String,
    },
    ClientDisconnected {
        peer: SocketAddr,
        username: String,
    },
    RequestCompleted {
        peer: SocketAddr,
        request: MessageType,
        status: StatusCode,
    },
    /// A header or body could not be decoded and was discarded.
    MalformedFrame {
        peer: SocketAddr,
        error: String,
    },
    /// An authenticated client sent a message type only servers send.
    UnexpectedRequest {
        peer: SocketAddr,
        request: MessageType,
    },
    StorageFailure {
        peer: SocketAddr,
        error: String,
    },
}

/// Receives every [`ServerEvent`]. Called from worker and manager threads.
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ServerEvent);
}
