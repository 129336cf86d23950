//! Connection state machine: framing, dispatch and buffered responses for one
//! socket.
//!
//! The machine alternates between reading an 8-byte header and reading the
//! body it announces. It is generic over the stream so tests can drive it with
//! an in-memory socket that returns short reads, short writes and
//! `WouldBlock`.
//!
//! Reading pauses while more than [`MAX_PENDING_OUTPUT`] bytes of responses
//! are waiting to be written, so a peer that never reads cannot grow the
//! queue without bound or keep its idle clock fresh.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mq_core::protocol::{
    decode_body, decode_header, encode_frame, resync_offset, ProtocolError, ProtocolMessage,
    StatusCode, HEADER_SIZE,
};
use thiserror::Error;

use crate::application::events::{CloseReason, ServerEvent};
use crate::application::handle_request::{RequestHandler, Session};

/// Queued response bytes above which no further requests are read.
pub const MAX_PENDING_OUTPUT: usize = 256 * 1024;

/// Why a connection can no longer be serviced.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("remote end closed the connection")]
    RemoteClosed,
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl From<ConnectionError> for CloseReason {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::RemoteClosed => CloseReason::RemoteClosed,
            ConnectionError::Io(e) => CloseReason::Io(e.to_string()),
        }
    }
}

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The socket stopped accepting bytes; more output remains.
    Writing,
    /// Everything was flushed.
    Idle,
    /// Everything was flushed and the client asked to disconnect; close now.
    Disconnect,
}

enum ReadState {
    Header { buf: [u8; HEADER_SIZE], filled: usize },
    Body { buf: Vec<u8>, filled: usize },
}

impl ReadState {
    fn header() -> Self {
        ReadState::Header {
            buf: [0; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// One client socket and its protocol state.
pub struct Connection<S> {
    stream: S,
    session: Session,
    handler: Arc<RequestHandler>,
    read_state: ReadState,
    write_queue: VecDeque<Vec<u8>>,
    write_offset: usize,
    /// Unwritten bytes across `write_queue`.
    pending_bytes: usize,
    output_limit: usize,
    last_activity: Instant,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, peer: SocketAddr, handler: Arc<RequestHandler>, now: Instant) -> Self {
        Self {
            stream,
            session: Session::new(peer),
            handler,
            read_state: ReadState::header(),
            write_queue: VecDeque::new(),
            write_offset: 0,
            pending_bytes: 0,
            output_limit: MAX_PENDING_OUTPUT,
            last_activity: now,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.session.peer()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn has_pending_output(&self) -> bool {
        !self.write_queue.is_empty()
    }

    /// False while the response backlog is over the limit.
    pub fn wants_read(&self) -> bool {
        self.pending_bytes < self.output_limit
    }

    /// Time since the last byte was read or written.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Reads until the socket would block, dispatching every complete frame.
    ///
    /// Returns `true` if at least one response was queued. Once a disconnect
    /// has been accepted nothing more is read, and reading stops early while
    /// [`wants_read`](Self::wants_read) is false.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::RemoteClosed`] on end of stream, or the underlying
    /// I/O error.
    pub fn on_readable(&mut self, now: Instant) -> Result<bool, ConnectionError> {
        let mut produced = false;
        while !self.session.disconnect_requested() && self.wants_read() {
            let result = match &mut self.read_state {
                ReadState::Header { buf, filled } => self.stream.read(&mut buf[*filled..]),
                ReadState::Body { buf, filled } => self.stream.read(&mut buf[*filled..]),
            };
            match result {
                Ok(0) => return Err(ConnectionError::RemoteClosed),
                Ok(n) => {
                    self.last_activity = now;
                    produced |= self.advance(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(produced)
    }

    /// Writes as much queued output as the socket accepts.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error, or `WriteZero` if the socket stops
    /// accepting bytes without blocking.
    pub fn on_writable(&mut self, now: Instant) -> Result<WriteStatus, ConnectionError> {
        while let Some(frame) = self.write_queue.front() {
            match self.stream.write(&frame[self.write_offset..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.last_activity = now;
                    self.write_offset += n;
                    self.pending_bytes -= n;
                    if self.write_offset == frame.len() {
                        self.write_queue.pop_front();
                        self.write_offset = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(WriteStatus::Writing),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if self.session.disconnect_requested() {
            Ok(WriteStatus::Disconnect)
        } else {
            Ok(WriteStatus::Idle)
        }
    }

    /// Tears the connection down. An authenticated client is marked offline.
    pub fn close(mut self, reason: CloseReason) -> S {
        self.handler.release(&mut self.session);
        self.handler.events().emit(&ServerEvent::ConnectionClosed {
            peer: self.session.peer(),
            reason,
        });
        self.stream
    }

    // ── Framing ───────────────────────────────────────────────────────────────

    fn advance(&mut self, n: usize) -> bool {
        match &mut self.read_state {
            ReadState::Header { buf, filled } => {
                *filled += n;
                if *filled < HEADER_SIZE {
                    return false;
                }
                let header = *buf;
                match decode_header(&header) {
                    Ok(len) => {
                        self.read_state = ReadState::Body {
                            buf: vec![0; len],
                            filled: 0,
                        };
                    }
                    Err(err) => {
                        let skip = resync_offset(&header);
                        buf.copy_within(skip.., 0);
                        *filled = HEADER_SIZE - skip;
                        self.report_malformed(&err);
                    }
                }
                false
            }
            ReadState::Body { buf, filled } => {
                *filled += n;
                if *filled < buf.len() {
                    return false;
                }
                let body = std::mem::take(buf);
                self.read_state = ReadState::header();
                match decode_body(&body) {
                    Ok(request) => {
                        let response = self.handler.handle(&mut self.session, request);
                        self.enqueue(&response);
                        true
                    }
                    Err(err) => {
                        self.report_malformed(&err);
                        false
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, response: &ProtocolMessage) {
        let frame = encode_frame(response).or_else(|err| {
            encode_frame(&ProtocolMessage::response(
                StatusCode::Exception,
                format!("failed to encode response: {err}"),
            ))
        });
        match frame {
            Ok(bytes) => {
                self.pending_bytes += bytes.len();
                self.write_queue.push_back(bytes);
            }
            Err(err) => self.report_malformed(&err),
        }
    }

    fn report_malformed(&self, err: &ProtocolError) {
        self.handler.events().emit(&ServerEvent::MalformedFrame {
            peer: self.session.peer(),
            error: err.to_string(),
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
