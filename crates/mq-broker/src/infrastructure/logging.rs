//! `tracing`-backed [`EventSink`].
//!
//! Severity follows the error taxonomy: expected outcomes (rejections,
//! non-success statuses) at `debug`/`info`, malformed input at `warn`,
//! unexpected requests and storage failures at `error`.

use tracing::{debug, error, info, warn};

use crate::application::events::{CloseReason, EventSink, ServerEvent};

/// Forwards every [`ServerEvent`] to the global `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ServerEvent) {
        match event {
            ServerEvent::ServerStarted {
                address,
                max_workers,
                clients_per_worker,
            } => info!(
                "broker listening on {address} ({max_workers} workers x {clients_per_worker} clients)"
            ),
            ServerEvent::ServerStopped => info!("broker stopped"),
            ServerEvent::WorkerSpawned { worker, capacity } => {
                info!(%worker, capacity, "worker started")
            }
            ServerEvent::WorkerRetired { worker } => info!(%worker, "idle worker retired"),
            ServerEvent::WorkerFailed { worker, error } => match worker {
                Some(worker) => error!(%worker, "worker failed: {error}"),
                None => error!("could not start worker: {error}"),
            },
            ServerEvent::ConnectionAccepted { peer, worker } => {
                debug!(%peer, %worker, "connection assigned to worker")
            }
            ServerEvent::ConnectionRejected { peer } => {
                info!(%peer, "server full, connection rejected")
            }
            ServerEvent::ConnectionClosed { peer, reason } => match reason {
                CloseReason::Io(err) => warn!(%peer, "connection closed after I/O error: {err}"),
                CloseReason::IdleTimeout => info!(%peer, "idle connection reaped"),
                other => debug!(%peer, reason = ?other, "connection closed"),
            },
            ServerEvent::AcceptFailed { error } => warn!("accept failed: {error}"),
            ServerEvent::ClientConnected { peer, username } => {
                info!(%peer, "client {username} connected")
            }
            ServerEvent::ClientDisconnected { peer, username } => {
                info!(%peer, "client {username} disconnected")
            }
            ServerEvent::RequestCompleted {
                peer,
                request,
                status,
            } => debug!(%peer, ?request, ?status, "request handled"),
            ServerEvent::MalformedFrame { peer, error } => {
                warn!(%peer, "discarding malformed frame: {error}")
            }
            ServerEvent::UnexpectedRequest { peer, request } => {
                error!(%peer, ?request, "unexpected message type from authenticated client")
            }
            ServerEvent::StorageFailure { peer, error } => {
                error!(%peer, "storage failure: {error}")
            }
        }
    }
}
