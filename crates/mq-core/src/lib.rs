//! # mq-core
//!
//! Shared library for the mq message broker containing the wire protocol
//! codec and the domain vocabulary used by both the broker and its clients.
//!
//! It has no dependencies on sockets, threads or storage.
//!
//! - **`protocol`** – How bytes travel over the network. Every frame is an
//!   8-byte envelope (magic `AA 56 AA 56` + big-endian body length) followed
//!   by a body whose first byte names the message type.
//!
//! - **`domain`** – Priorities, message contexts, retrieval filters and
//!   orderings, and the validation rules that go with them.

pub mod domain;
pub mod protocol;

pub use domain::{ClientId, Context, FilterType, MessageId, OrderBy, Priority};
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError};
pub use protocol::messages::{ProtocolMessage, StatusCode};
