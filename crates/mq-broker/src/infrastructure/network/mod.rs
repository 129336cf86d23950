//! Socket plumbing for the broker.
//!
//! # Sub-modules
//!
//! - **`connection`** – Per-socket state machine. Reassembles frames from
//!   partial reads, resynchronizes after malformed headers, hands each decoded
//!   request to the [`RequestHandler`](crate::application::handle_request::RequestHandler)
//!   and queues the encoded responses for partial writes.
//!
//! - **`worker`** – One reactor thread per worker. Owns a `mio::Poll` and a
//!   bounded set of connections, drives their readiness events, reaps idle
//!   connections and retires itself after a configurable empty period.
//!
//! - **`server_manager`** – Owns the listening socket. Applies admission
//!   control, spawns workers on demand and answers `FULL_SERVER` when every
//!   worker is saturated.

pub mod connection;
pub mod server_manager;
pub mod worker;
