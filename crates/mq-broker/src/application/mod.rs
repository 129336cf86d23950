//! Application layer of the broker.
//!
//! Holds the request handling rules and the two ports the rest of the broker
//! plugs into:
//!
//! - **`handle_request`** – Turns one decoded request into exactly one
//!   response, tracking each connection's authentication state.
//! - **`storage`** – The transactional [`storage::Storage`] port that the
//!   request handler reads and writes through.
//! - **`events`** – Structured [`events::ServerEvent`] records and the
//!   [`events::EventSink`] observer they are emitted to.
//!
//! Nothing here touches sockets, threads or a concrete database.

pub mod events;
pub mod handle_request;
pub mod storage;
