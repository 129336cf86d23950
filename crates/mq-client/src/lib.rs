//! # mq-client
//!
//! Async client for the mq message broker.
//!
//! A [`BrokerClient`] owns one TCP connection and is authenticated as one
//! username for its whole life. Every call sends a single request frame and
//! waits for the single response the broker sends back.
//!
//! ```no_run
//! use mq_client::{BrokerClient, OutgoingMessage, Selector};
//!
//! # async fn demo() -> Result<(), mq_client::ClientError> {
//! let mut client = BrokerClient::connect("127.0.0.1:4444", "alice").await?;
//! client.create_queue("jobs").await?;
//! client
//!     .send_message(&OutgoingMessage::new("hello").to_queue("jobs").priority(7))
//!     .await?;
//! let next = client.pop_message(&Selector::queue("jobs")).await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;

pub use client::{BrokerClient, OutgoingMessage, Selector};
pub use error::ClientError;
pub use mq_core::protocol::ReturnedMessage;
pub use mq_core::{Context, FilterType, OrderBy};
