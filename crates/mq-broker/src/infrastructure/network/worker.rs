//! Reactor worker: one thread, one `mio::Poll`, a bounded set of connections.
//!
//! Other threads never touch a worker's poll. The server manager reserves a
//! slot on the shared load counter, sends the socket over a command channel
//! and wakes the poll; the worker registers it from its own thread.
//!
//! The load counter doubles as the retirement latch: a worker that has been
//! empty long enough swaps it from `0` to [`RETIRED`], which no reservation
//! can pass, and exits.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendError, Sender, TryRecvError};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use thiserror::Error;
use uuid::Uuid;

use crate::application::events::{CloseReason, EventSink, ServerEvent};
use crate::application::handle_request::RequestHandler;
use crate::infrastructure::network::connection::{Connection, WriteStatus};

/// Load value of a worker that has exited and accepts nothing.
const RETIRED: usize = usize::MAX;

const WAKE_TOKEN: Token = Token(0);
const MAX_WAIT: Duration = Duration::from_secs(1);
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to create poll for worker: {0}")]
    Poll(#[source] std::io::Error),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Limits a worker runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub capacity: usize,
    pub idle_timeout: Duration,
    /// `None` keeps the worker alive while empty.
    pub retire_after: Option<Duration>,
}

enum WorkerCommand {
    Register { stream: TcpStream, peer: SocketAddr },
    Shutdown,
}

// ── Handle (manager side) ─────────────────────────────────────────────────────

/// The manager's view of a running worker.
pub struct WorkerHandle {
    id: Uuid,
    capacity: usize,
    load: Arc<AtomicUsize>,
    commands: Sender<WorkerCommand>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Starts a worker thread named `mq-worker-{index}`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the poll or the thread cannot be created.
    pub fn spawn(
        index: usize,
        settings: WorkerSettings,
        handler: Arc<RequestHandler>,
    ) -> Result<Self, WorkerError> {
        let poll = Poll::new().map_err(WorkerError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(WorkerError::Poll)?);
        let (commands, inbox) = crossbeam_channel::unbounded();
        let load = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        let events = Arc::clone(handler.events());
        let worker = Worker {
            id,
            poll,
            inbox,
            load: Arc::clone(&load),
            settings,
            handler,
            connections: HashMap::new(),
            next_token: 1,
            empty_since: Some(Instant::now()),
        };
        let thread = thread::Builder::new()
            .name(format!("mq-worker-{index}"))
            .spawn(move || worker.run())
            .map_err(WorkerError::Spawn)?;

        events.emit(&ServerEvent::WorkerSpawned {
            worker: id,
            capacity: settings.capacity,
        });
        Ok(Self {
            id,
            capacity: settings.capacity,
            load,
            commands,
            waker,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Hands a freshly accepted socket to the worker.
    ///
    /// # Errors
    ///
    /// Gives the socket back if the worker is full, retired or gone.
    pub fn register_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TcpStream> {
        let capacity = self.capacity;
        let reserved = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then(|| n + 1)
            })
            .is_ok();
        if !reserved {
            return Err(stream);
        }
        let command = WorkerCommand::Register { stream, peer };
        if let Err(SendError(WorkerCommand::Register { stream, .. })) = self.commands.send(command) {
            self.load.fetch_sub(1, Ordering::AcqRel);
            return Err(stream);
        }
        // A failed wake only delays pickup until the next poll timeout.
        let _ = self.waker.wake();
        Ok(())
    }

    /// Connections owned or reserved. A retired worker reports zero.
    pub fn connection_count(&self) -> usize {
        match self.load.load(Ordering::Acquire) {
            RETIRED => 0,
            n => n,
        }
    }

    /// Free slots. A retired worker has none.
    pub fn remaining_capacity(&self) -> usize {
        match self.load.load(Ordering::Acquire) {
            RETIRED => 0,
            n => self.capacity.saturating_sub(n),
        }
    }

    pub fn is_full(&self) -> bool {
        self.remaining_capacity() == 0
    }

    /// True once the worker thread has exited or committed to exiting.
    pub fn is_retired(&self) -> bool {
        self.load.load(Ordering::Acquire) == RETIRED
            || self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the worker, closing its connections, and waits for the thread.
    ///
    /// Returns `false` if the worker thread panicked.
    pub fn shutdown(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        if self.commands.send(WorkerCommand::Shutdown).is_ok() {
            let _ = self.waker.wake();
        }
        thread.join().is_ok()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Reactor (worker thread) ───────────────────────────────────────────────────

struct Slot {
    connection: Connection<TcpStream>,
    interest: Interest,
}

struct Worker {
    id: Uuid,
    poll: Poll,
    inbox: Receiver<WorkerCommand>,
    load: Arc<AtomicUsize>,
    settings: WorkerSettings,
    handler: Arc<RequestHandler>,
    connections: HashMap<Token, Slot>,
    next_token: usize,
    empty_since: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            let timeout = self.next_wait(Instant::now());
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                self.events().emit(&ServerEvent::WorkerFailed {
                    worker: Some(self.id),
                    error: err.to_string(),
                });
                self.stop();
                return;
            }

            let now = Instant::now();
            for event in events.iter() {
                if event.token() != WAKE_TOKEN {
                    self.on_event(event, now);
                }
            }

            if !self.drain_inbox(now) {
                self.stop();
                return;
            }
            self.reap_idle(now);
            if self.try_retire(now) {
                self.events().emit(&ServerEvent::WorkerRetired { worker: self.id });
                return;
            }
        }
    }

    fn events(&self) -> &Arc<dyn EventSink> {
        self.handler.events()
    }

    fn on_event(&mut self, event: &Event, now: Instant) {
        let token = event.token();
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        self.service(token, readable, now);
    }

    /// Reads if asked, flushes pending output, and updates write interest.
    fn service(&mut self, token: Token, readable: bool, now: Instant) {
        let Some(slot) = self.connections.get_mut(&token) else {
            return;
        };
        let outcome = drive(&mut slot.connection, readable, now);
        match outcome {
            Ok(()) => {
                let interest = interest_for(&slot.connection);
                if interest != slot.interest {
                    let stream = slot.connection.stream_mut();
                    if let Err(err) = self.poll.registry().reregister(stream, token, interest) {
                        self.close(token, CloseReason::Io(err.to_string()), now);
                        return;
                    }
                    slot.interest = interest;
                }
            }
            Err(reason) => self.close(token, reason, now),
        }
    }

    /// Returns `false` when the worker must stop.
    fn drain_inbox(&mut self, now: Instant) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(WorkerCommand::Register { stream, peer }) => self.adopt(stream, peer, now),
                Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn adopt(&mut self, mut stream: TcpStream, peer: SocketAddr, now: Instant) {
        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            self.load.fetch_sub(1, Ordering::AcqRel);
            self.events().emit(&ServerEvent::ConnectionClosed {
                peer,
                reason: CloseReason::Io(err.to_string()),
            });
            return;
        }
        let connection = Connection::new(stream, peer, Arc::clone(&self.handler), now);
        self.connections.insert(
            token,
            Slot {
                connection,
                interest: Interest::READABLE,
            },
        );
        self.empty_since = None;
        // Bytes may have arrived before registration.
        self.service(token, true, now);
    }

    fn close(&mut self, token: Token, reason: CloseReason, now: Instant) {
        let Some(mut slot) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(slot.connection.stream_mut());
        slot.connection.close(reason);
        self.load.fetch_sub(1, Ordering::AcqRel);
        if self.connections.is_empty() {
            self.empty_since = Some(now);
        }
    }

    fn reap_idle(&mut self, now: Instant) {
        let idle_timeout = self.settings.idle_timeout;
        let expired: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, slot)| slot.connection.idle_for(now) >= idle_timeout)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            self.close(token, CloseReason::IdleTimeout, now);
        }
    }

    fn try_retire(&mut self, now: Instant) -> bool {
        let (Some(after), Some(since)) = (self.settings.retire_after, self.empty_since) else {
            return false;
        };
        now.saturating_duration_since(since) >= after
            && self
                .load
                .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Wait until the earliest idle or retirement deadline, bounded.
    fn next_wait(&self, now: Instant) -> Duration {
        let idle = self
            .connections
            .values()
            .map(|slot| slot.connection.last_activity() + self.settings.idle_timeout)
            .min();
        let retire = self
            .settings
            .retire_after
            .zip(self.empty_since)
            .map(|(after, since)| since + after);
        idle.into_iter()
            .chain(retire)
            .min()
            .map_or(MAX_WAIT, |deadline| deadline.saturating_duration_since(now))
            .clamp(MIN_WAIT, MAX_WAIT)
    }

    /// Closes everything and refuses further registrations.
    fn stop(&mut self) {
        let now = Instant::now();
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, CloseReason::Shutdown, now);
        }
        self.load.store(RETIRED, Ordering::Release);
        while let Ok(command) = self.inbox.try_recv() {
            if let WorkerCommand::Register { peer, .. } = command {
                self.events().emit(&ServerEvent::ConnectionClosed {
                    peer,
                    reason: CloseReason::Shutdown,
                });
            }
        }
    }
}

/// Reads, then flushes. Reading paused by a full backlog resumes in the
/// same pass once the flush drains it.
fn drive(connection: &mut Connection<TcpStream>, readable: bool, now: Instant) -> Result<(), CloseReason> {
    let mut readable = readable;
    loop {
        if readable && connection.wants_read() {
            connection.on_readable(now)?;
        }
        let paused = !connection.wants_read();
        if connection.has_pending_output() || connection.session().disconnect_requested() {
            match connection.on_writable(now)? {
                WriteStatus::Disconnect => return Err(CloseReason::Disconnected),
                WriteStatus::Writing => return Ok(()),
                WriteStatus::Idle => {}
            }
        }
        if !paused {
            return Ok(());
        }
        readable = true;
    }
}

/// Write interest while output is queued; read interest unless the backlog
/// is full.
fn interest_for(connection: &Connection<TcpStream>) -> Interest {
    match (connection.wants_read(), connection.has_pending_output()) {
        (true, false) => Interest::READABLE,
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, _) => Interest::WRITABLE,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::Mutex;

    use mq_core::protocol::{
        decode_frame, encode_frame, ConnectionRequest, ProtocolMessage, QueueModification, StatusCode,
    };

    use crate::application::events::MockEventSink;
    use crate::infrastructure::storage::memory::MemoryStore;

    type EventLog = Arc<Mutex<Vec<ServerEvent>>>;

    fn handler() -> (Arc<RequestHandler>, EventLog) {
        let log: EventLog = Arc::default();
        let sink_log = Arc::clone(&log);
        let mut sink = MockEventSink::new();
        sink.expect_emit()
            .returning(move |event| sink_log.lock().unwrap().push(event.clone()));
        let handler = RequestHandler::new(Arc::new(MemoryStore::new()), Arc::new(sink));
        (Arc::new(handler), log)
    }

    fn settings(capacity: usize) -> WorkerSettings {
        WorkerSettings {
            capacity,
            idle_timeout: Duration::from_secs(30),
            retire_after: None,
        }
    }

    /// Returns a connected (server side, client side) socket pair.
    fn socket_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registered_connection_is_served() {
        // Arrange
        let (handler, _log) = handler();
        let worker = WorkerHandle::spawn(0, settings(2), handler).unwrap();
        let (server, peer, mut client) = socket_pair();

        // Act
        worker.register_connection(server, peer).map_err(|_| "full").unwrap();
        let request = ProtocolMessage::ConnectionRequest(ConnectionRequest {
            is_connect: true,
            username: "alice".to_string(),
        });
        client.write_all(&encode_frame(&request).unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).unwrap();

        // Assert
        let (response, _) = decode_frame(&buf[..n]).unwrap();
        assert_eq!(response, ProtocolMessage::response(StatusCode::Success, ""));
        assert_eq!(worker.connection_count(), 1);
    }

    #[test]
    fn test_register_beyond_capacity_returns_stream() {
        let (handler, _log) = handler();
        let worker = WorkerHandle::spawn(0, settings(1), handler).unwrap();
        let (first, first_peer, _c1) = socket_pair();
        let (second, second_peer, _c2) = socket_pair();

        assert!(worker.register_connection(first, first_peer).is_ok());
        assert!(worker.is_full());
        assert!(worker.register_connection(second, second_peer).is_err());
    }

    #[test]
    fn test_pipelined_requests_beyond_backlog_are_all_answered() {
        // Arrange
        let (handler, _log) = handler();
        let worker = WorkerHandle::spawn(0, settings(1), handler).unwrap();
        let (server, peer, client) = socket_pair();
        worker.register_connection(server, peer).map_err(|_| "full").unwrap();
        let request = encode_frame(&ProtocolMessage::QueueModification(QueueModification {
            is_delete: false,
            queue_name: "jobs".to_string(),
        }))
        .unwrap();
        let total = 20_000;

        // Act
        let mut writer = client.try_clone().unwrap();
        let sender = thread::spawn(move || {
            for _ in 0..total {
                writer.write_all(&request).unwrap();
            }
        });
        let mut reader = client;
        reader.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut pending = Vec::new();
        let mut answered = 0;
        let mut buf = [0u8; 8192];
        while answered < total {
            let n = reader.read(&mut buf).unwrap();
            assert!(n > 0, "worker closed the connection");
            pending.extend_from_slice(&buf[..n]);
            while let Ok((response, used)) = decode_frame(&pending) {
                assert!(matches!(
                    response,
                    ProtocolMessage::RequestResponse(ref r) if r.status == StatusCode::Exception
                ));
                pending.drain(..used);
                answered += 1;
            }
        }

        // Assert
        sender.join().unwrap();
        assert_eq!(answered, total);
        assert_eq!(worker.connection_count(), 1);
    }

    #[test]
    fn test_remote_close_frees_capacity() {
        let (handler, log) = handler();
        let worker = WorkerHandle::spawn(0, settings(1), handler).unwrap();
        let (server, peer, client) = socket_pair();
        worker.register_connection(server, peer).map_err(|_| "full").unwrap();

        drop(client);

        assert!(wait_until(|| worker.connection_count() == 0));
        assert!(log.lock().unwrap().contains(&ServerEvent::ConnectionClosed {
            peer,
            reason: CloseReason::RemoteClosed,
        }));
    }

    #[test]
    fn test_idle_connection_is_reaped() {
        let (handler, log) = handler();
        let settings = WorkerSettings {
            idle_timeout: Duration::from_millis(100),
            ..settings(1)
        };
        let worker = WorkerHandle::spawn(0, settings, handler).unwrap();
        let (server, peer, mut client) = socket_pair();
        worker.register_connection(server, peer).map_err(|_| "full").unwrap();

        assert!(wait_until(|| worker.connection_count() == 0));
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert!(log.lock().unwrap().contains(&ServerEvent::ConnectionClosed {
            peer,
            reason: CloseReason::IdleTimeout,
        }));
    }

    #[test]
    fn test_empty_worker_retires_and_refuses_registration() {
        let (handler, log) = handler();
        let settings = WorkerSettings {
            retire_after: Some(Duration::from_millis(50)),
            ..settings(4)
        };
        let worker = WorkerHandle::spawn(0, settings, handler).unwrap();

        let retired = ServerEvent::WorkerRetired { worker: worker.id() };
        assert!(wait_until(|| log.lock().unwrap().contains(&retired)));
        assert!(worker.is_retired());
        let (server, peer, _client) = socket_pair();
        assert!(worker.register_connection(server, peer).is_err());
    }

    #[test]
    fn test_retired_worker_reports_full_and_returns_offered_sockets() {
        let (handler, log) = handler();
        let settings = WorkerSettings {
            retire_after: Some(Duration::from_millis(20)),
            ..settings(4)
        };
        let worker = WorkerHandle::spawn(0, settings, handler).unwrap();
        let retired = ServerEvent::WorkerRetired { worker: worker.id() };
        assert!(wait_until(|| log.lock().unwrap().contains(&retired)));

        assert!(worker.is_full());
        assert_eq!(worker.remaining_capacity(), 0);
        assert_eq!(worker.connection_count(), 0);
        for _ in 0..3 {
            let (server, peer, _client) = socket_pair();
            assert!(worker.register_connection(server, peer).is_err());
        }
        assert!(worker.is_retired());
    }

    #[test]
    fn test_shut_down_worker_refuses_registration() {
        let (handler, _log) = handler();
        let mut worker = WorkerHandle::spawn(0, settings(2), handler).unwrap();
        assert!(worker.shutdown());

        let (server, peer, _client) = socket_pair();

        assert!(worker.is_full());
        assert!(worker.register_connection(server, peer).is_err());
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let (handler, log) = handler();
        let mut worker = WorkerHandle::spawn(0, settings(2), handler).unwrap();
        let (server, peer, _client) = socket_pair();
        worker.register_connection(server, peer).map_err(|_| "full").unwrap();

        assert!(worker.shutdown());

        assert!(worker.is_retired());
        assert!(log.lock().unwrap().contains(&ServerEvent::ConnectionClosed {
            peer,
            reason: CloseReason::Shutdown,
        }));
    }
}
