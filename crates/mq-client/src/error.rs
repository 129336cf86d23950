//! Errors returned by [`BrokerClient`](crate::BrokerClient).

use mq_core::protocol::{MessageType, ProtocolError, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to broker at {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection closed by broker")]
    Closed,
    #[error("broker answered with an unexpected {0:?} frame")]
    UnexpectedResponse(MessageType),

    // ── Status codes ──────────────────────────────────────────────────────────
    #[error("broker is at full capacity")]
    ServerFull,
    #[error("user is already connected")]
    UserOnline,
    #[error("queue already exists")]
    QueueExists,
    #[error("queue does not exist")]
    QueueNotFound,
    #[error("queue still holds messages")]
    QueueNotEmpty,
    #[error("receiver is not a known client")]
    ClientNotFound,
    #[error("broker error: {0}")]
    Server(String),
}

impl ClientError {
    /// Maps a non-success status to its error. `description` is only kept for
    /// the generic `EXCEPTION` case.
    pub(crate) fn from_status(status: StatusCode, description: String) -> Self {
        match status {
            StatusCode::FullServer => ClientError::ServerFull,
            StatusCode::UserOnline => ClientError::UserOnline,
            StatusCode::QueueExists => ClientError::QueueExists,
            StatusCode::QueueNotExists => ClientError::QueueNotFound,
            StatusCode::QueueNotEmpty => ClientError::QueueNotEmpty,
            StatusCode::NoClient => ClientError::ClientNotFound,
            _ => ClientError::Server(description),
        }
    }
}
