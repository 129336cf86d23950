//! Listener thread: admission control and delegation to workers.
//!
//! Workers are spawned lazily, one per saturated predecessor, up to
//! `max_workers`. When every worker is full the socket is accepted anyway and
//! answered with a single `FULL_SERVER` frame. That write never blocks the
//! listener: a short write parks the socket in the manager's own poll until
//! it drains or a linger deadline passes.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use mq_core::protocol::{encode_frame, ProtocolError, ProtocolMessage, StatusCode};
use thiserror::Error;

use crate::application::events::{EventSink, ServerEvent};
use crate::application::handle_request::RequestHandler;
use crate::application::storage::Storage;
use crate::infrastructure::network::worker::{WorkerHandle, WorkerSettings};

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);
const FIRST_REJECTION: usize = 2;

/// Longest a rejected socket is kept around to deliver its frame.
const REJECTION_LINGER: Duration = Duration::from_secs(5);

const FULL_SERVER_DESCRIPTION: &str = "Server is at full capacity, try again later.";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listener setup failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to spawn server manager thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to encode rejection frame: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server manager thread panicked")]
    Panicked,
}

/// Runtime sizing for [`ServerManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub bind_address: SocketAddr,
    pub max_workers: usize,
    pub max_clients_per_worker: usize,
    pub idle_timeout: Duration,
    pub worker_retire_after: Option<Duration>,
}

impl ServerSettings {
    pub fn total_capacity(&self) -> usize {
        self.max_workers.saturating_mul(self.max_clients_per_worker)
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            capacity: self.max_clients_per_worker,
            idle_timeout: self.idle_timeout,
            retire_after: self.worker_retire_after,
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Owner of a running server. Dropping it stops the server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, shuts every worker down and waits for completion.
    ///
    /// # Errors
    ///
    /// [`ServerError::Panicked`] if the manager thread panicked.
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), ServerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
        thread.join().map_err(|_| ServerError::Panicked)
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.stop_and_join();
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

struct PendingRejection {
    stream: TcpStream,
    written: usize,
    write_closed: bool,
    deadline: Instant,
}

impl PendingRejection {
    /// Pushes the frame out, half-closes, then drains the peer's bytes until
    /// EOF so the close is not turned into a reset. Returns `true` when done.
    fn progress(&mut self, frame: &[u8]) -> bool {
        while self.written < frame.len() {
            match self.stream.write(&frame[self.written..]) {
                Ok(0) => return true,
                Ok(n) => self.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return true,
            }
        }
        if !self.write_closed {
            self.write_closed = true;
            if self.stream.shutdown(Shutdown::Write).is_err() {
                return true;
            }
        }
        let mut scratch = [0u8; 512];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return true,
            }
        }
    }
}

/// Accepts connections and assigns them to workers.
pub struct ServerManager {
    listener: TcpListener,
    poll: Poll,
    settings: ServerSettings,
    handler: Arc<RequestHandler>,
    events: Arc<dyn EventSink>,
    stop: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    spawned: usize,
    rejection_frame: Vec<u8>,
    rejections: HashMap<Token, PendingRejection>,
    next_token: usize,
}

impl ServerManager {
    /// Binds the listener and starts the manager thread.
    ///
    /// # Errors
    ///
    /// [`ServerError::BindFailed`] if the address is unavailable, or a setup
    /// error for the poll or thread.
    pub fn start(
        settings: ServerSettings,
        storage: Arc<dyn Storage>,
        events: Arc<dyn EventSink>,
    ) -> Result<ServerHandle, ServerError> {
        let mut listener =
            TcpListener::bind(settings.bind_address).map_err(|source| ServerError::BindFailed {
                addr: settings.bind_address,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let stop = Arc::new(AtomicBool::new(false));
        let rejection_frame = encode_frame(&ProtocolMessage::response(
            StatusCode::FullServer,
            FULL_SERVER_DESCRIPTION,
        ))?;

        events.emit(&ServerEvent::ServerStarted {
            address: local_addr,
            max_workers: settings.max_workers,
            clients_per_worker: settings.max_clients_per_worker,
        });

        let manager = ServerManager {
            listener,
            poll,
            handler: Arc::new(RequestHandler::new(storage, Arc::clone(&events))),
            settings,
            events,
            stop: Arc::clone(&stop),
            workers: Vec::new(),
            spawned: 0,
            rejection_frame,
            rejections: HashMap::new(),
            next_token: FIRST_REJECTION,
        };
        let thread = thread::Builder::new()
            .name("mq-server-manager".to_string())
            .spawn(move || manager.run())
            .map_err(ServerError::Spawn)?;

        Ok(ServerHandle {
            local_addr,
            stop,
            waker,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(128);
        while !self.stop.load(Ordering::Acquire) {
            let timeout = self.next_wait(Instant::now());
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                self.events.emit(&ServerEvent::AcceptFailed {
                    error: format!("listener poll failed: {err}"),
                });
                break;
            }

            let now = Instant::now();
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending(now),
                    WAKE => {}
                    token => self.advance_rejection(token),
                }
            }
            self.expire_rejections(now);
        }

        for mut worker in self.workers.drain(..) {
            if !worker.shutdown() {
                self.events.emit(&ServerEvent::WorkerFailed {
                    worker: Some(worker.id()),
                    error: "worker thread panicked".to_string(),
                });
            }
        }
        self.events.emit(&ServerEvent::ServerStopped);
    }

    fn accept_pending(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer, now),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.events.emit(&ServerEvent::AcceptFailed {
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr, now: Instant) {
        self.prune_workers();
        let stream = match self.delegate(stream, peer) {
            Ok(()) => return,
            Err(stream) => stream,
        };
        let stream = if self.workers.len() < self.settings.max_workers && self.spawn_worker() {
            match self.delegate(stream, peer) {
                Ok(()) => return,
                Err(stream) => stream,
            }
        } else {
            stream
        };
        self.reject(stream, peer, now);
    }

    /// Offers the socket to each worker with spare capacity, in order.
    fn delegate(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), TcpStream> {
        for worker in self.workers.iter().filter(|w| !w.is_full()) {
            match worker.register_connection(stream, peer) {
                Ok(()) => {
                    self.events.emit(&ServerEvent::ConnectionAccepted {
                        peer,
                        worker: worker.id(),
                    });
                    return Ok(());
                }
                Err(returned) => stream = returned,
            }
        }
        Err(stream)
    }

    fn spawn_worker(&mut self) -> bool {
        let index = self.spawned;
        match WorkerHandle::spawn(index, self.settings.worker_settings(), Arc::clone(&self.handler)) {
            Ok(worker) => {
                self.spawned += 1;
                self.workers.push(worker);
                true
            }
            Err(err) => {
                self.events.emit(&ServerEvent::WorkerFailed {
                    worker: None,
                    error: err.to_string(),
                });
                false
            }
        }
    }

    fn prune_workers(&mut self) {
        let (retired, live): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(WorkerHandle::is_retired);
        self.workers = live;
        for mut worker in retired {
            if !worker.shutdown() {
                self.events.emit(&ServerEvent::WorkerFailed {
                    worker: Some(worker.id()),
                    error: "worker thread panicked".to_string(),
                });
            }
        }
    }

    // ── Rejection ─────────────────────────────────────────────────────────────

    fn reject(&mut self, stream: TcpStream, peer: SocketAddr, now: Instant) {
        self.events.emit(&ServerEvent::ConnectionRejected { peer });
        let mut pending = PendingRejection {
            stream,
            written: 0,
            write_closed: false,
            deadline: now + REJECTION_LINGER,
        };
        if pending.progress(&self.rejection_frame) {
            return;
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        let registered = self.poll.registry().register(
            &mut pending.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        );
        if registered.is_ok() {
            self.rejections.insert(token, pending);
        }
    }

    fn advance_rejection(&mut self, token: Token) {
        let done = match self.rejections.get_mut(&token) {
            Some(pending) => pending.progress(&self.rejection_frame),
            None => return,
        };
        if done {
            self.drop_rejection(token);
        }
    }

    fn expire_rejections(&mut self, now: Instant) {
        let expired: Vec<Token> = self
            .rejections
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            self.drop_rejection(token);
        }
    }

    fn drop_rejection(&mut self, token: Token) {
        if let Some(mut pending) = self.rejections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut pending.stream);
        }
    }

    fn next_wait(&self, now: Instant) -> Option<Duration> {
        self.rejections
            .values()
            .map(|pending| pending.deadline.saturating_duration_since(now))
            .min()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::Mutex;

    use mq_core::protocol::{decode_frame, ConnectionRequest};

    use crate::application::events::MockEventSink;
    use crate::infrastructure::storage::memory::MemoryStore;

    type EventLog = Arc<Mutex<Vec<ServerEvent>>>;

    fn recording_sink() -> (Arc<dyn EventSink>, EventLog) {
        let log: EventLog = Arc::default();
        let sink_log = Arc::clone(&log);
        let mut sink = MockEventSink::new();
        sink.expect_emit()
            .returning(move |event| sink_log.lock().unwrap().push(event.clone()));
        (Arc::new(sink), log)
    }

    fn settings(max_workers: usize, per_worker: usize) -> ServerSettings {
        ServerSettings {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            max_workers,
            max_clients_per_worker: per_worker,
            idle_timeout: Duration::from_secs(30),
            worker_retire_after: None,
        }
    }

    fn start(settings: ServerSettings) -> (ServerHandle, EventLog) {
        let (events, log) = recording_sink();
        let handle = ServerManager::start(settings, Arc::new(MemoryStore::new()), events).unwrap();
        (handle, log)
    }

    /// Connects, sends a connect request and returns the single response.
    fn connect(addr: SocketAddr, username: &str) -> (StdTcpStream, ProtocolMessage) {
        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let request = ProtocolMessage::ConnectionRequest(ConnectionRequest {
            is_connect: true,
            username: username.to_string(),
        });
        stream.write_all(&encode_frame(&request).unwrap()).unwrap();
        let response = read_frame(&mut stream);
        (stream, response)
    }

    fn read_frame(stream: &mut StdTcpStream) -> ProtocolMessage {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            if let Ok((msg, _)) = decode_frame(&buf) {
                return msg;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed before a full frame arrived");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn status(msg: &ProtocolMessage) -> StatusCode {
        match msg {
            ProtocolMessage::RequestResponse(r) => r.status,
            other => panic!("expected a request response, got {other:?}"),
        }
    }

    #[test]
    fn test_total_capacity_is_workers_times_clients() {
        assert_eq!(settings(2, 3).total_capacity(), 6);
    }

    #[test]
    fn test_bind_to_busy_port_fails() {
        let (first, _log) = start(settings(1, 1));
        let (events, _log) = recording_sink();
        let busy = ServerSettings {
            bind_address: first.local_addr(),
            ..settings(1, 1)
        };

        let result = ServerManager::start(busy, Arc::new(MemoryStore::new()), events);

        assert!(matches!(result, Err(ServerError::BindFailed { .. })));
    }

    #[test]
    fn test_saturated_server_answers_full_server_then_closes() {
        // Arrange
        let (server, log) = start(settings(1, 1));
        let (_alice, response) = connect(server.local_addr(), "alice");
        assert_eq!(status(&response), StatusCode::Success);

        // Act
        let (mut bob, response) = connect(server.local_addr(), "bob");

        // Assert
        assert_eq!(status(&response), StatusCode::FullServer);
        let mut rest = [0u8; 16];
        assert_eq!(bob.read(&mut rest).unwrap_or(0), 0);
        assert!(log
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ServerEvent::ConnectionRejected { .. })));
    }

    #[test]
    fn test_second_worker_spawned_when_first_is_full() {
        let (server, log) = start(settings(2, 1));

        let (_a, first) = connect(server.local_addr(), "alice");
        let (_b, second) = connect(server.local_addr(), "bob");

        assert_eq!(status(&first), StatusCode::Success);
        assert_eq!(status(&second), StatusCode::Success);
        let spawned = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ServerEvent::WorkerSpawned { .. }))
            .count();
        assert_eq!(spawned, 2);
    }

    #[test]
    fn test_retired_worker_is_replaced_on_next_admission() {
        let (server, log) = start(ServerSettings {
            worker_retire_after: Some(Duration::from_millis(50)),
            ..settings(1, 1)
        });
        let (alice, response) = connect(server.local_addr(), "alice");
        assert_eq!(status(&response), StatusCode::Success);
        drop(alice);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !log
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ServerEvent::WorkerRetired { .. }))
        {
            assert!(Instant::now() < deadline, "worker never retired");
            thread::sleep(Duration::from_millis(10));
        }

        let (_bob, response) = connect(server.local_addr(), "bob");
        assert_eq!(status(&response), StatusCode::Success);
    }

    #[test]
    fn test_shutdown_emits_server_stopped() {
        let (server, log) = start(settings(1, 1));
        let (_alice, _) = connect(server.local_addr(), "alice");

        server.shutdown().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.last(), Some(&ServerEvent::ServerStopped));
    }
}
