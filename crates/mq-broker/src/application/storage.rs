//! Storage port consumed by the request handler.
//!
//! Every request runs inside one [`Transaction`] obtained from
//! [`Storage::begin`]. Committing consumes the transaction; dropping it
//! without a commit rolls back and releases the underlying connection.

use mq_core::{ClientId, Context, FilterType, MessageId, OrderBy, Priority};
use thiserror::Error;

/// Failures reported by a storage backend.
///
/// The first four variants are expected outcomes that map to specific status
/// codes; the rest are infrastructure failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("queue {0} already exists")]
    QueueExists(String),

    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    #[error("queue {0} still holds messages")]
    QueueNotEmpty(String),

    #[error("client {0} does not exist")]
    ClientNotFound(String),

    #[error("timed out after {0:?} waiting for a storage connection")]
    PoolTimeout(std::time::Duration),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// A registered client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: ClientId,
    pub username: String,
    pub online: bool,
}

/// Everything needed to store a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: ClientId,
    /// Username of the addressee; `None` for a broadcast.
    pub receiver: Option<String>,
    /// Distinct, non-empty queue names.
    pub queues: Vec<String>,
    pub context: Context,
    pub priority: Priority,
    pub content: String,
}

/// One (message, queue) association as returned by a retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: String,
    pub receiver: Option<String>,
    pub queue: String,
    pub context: Context,
    pub priority: u8,
    /// Microseconds since the Unix epoch, strictly increasing per store.
    pub created_at: i64,
    pub content: String,
}

/// A persistent store shared by every worker thread.
pub trait Storage: Send + Sync {
    /// Checks out a connection and opens a transaction on it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PoolTimeout`] if no connection becomes free in
    /// time, or [`StorageError::Backend`] if the transaction cannot start.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StorageError>;
}

/// Operations available inside one storage transaction.
pub trait Transaction {
    fn find_client_by_username(&mut self, username: &str) -> Result<Option<Client>, StorageError>;

    fn create_client(&mut self, username: &str, online: bool) -> Result<ClientId, StorageError>;

    /// Fails with [`StorageError::ClientNotFound`] for an unknown id.
    fn set_client_online(&mut self, id: ClientId, online: bool) -> Result<(), StorageError>;

    /// Fails with [`StorageError::QueueExists`] if the name is taken.
    fn create_queue(&mut self, name: &str) -> Result<(), StorageError>;

    /// Fails with [`StorageError::QueueNotFound`] or
    /// [`StorageError::QueueNotEmpty`]; the emptiness check and the delete
    /// happen atomically.
    fn delete_queue(&mut self, name: &str) -> Result<(), StorageError>;

    /// Fails with [`StorageError::ClientNotFound`] for an unknown receiver or
    /// [`StorageError::QueueNotFound`] for an unknown queue; nothing is
    /// written in either case.
    fn create_message(&mut self, message: &NewMessage) -> Result<MessageId, StorageError>;

    /// Returns the top message visible to `receiver` among those in queue
    /// `value` (or sent by user `value`), ordered by `order` descending with
    /// the other key breaking ties.
    fn retrieve_top_message(
        &mut self,
        receiver: ClientId,
        filter: FilterType,
        value: &str,
        order: OrderBy,
    ) -> Result<Option<StoredMessage>, StorageError>;

    /// Removes one queue association, and the message itself once it has
    /// none left.
    fn delete_message_from_queue(&mut self, id: MessageId, queue: &str) -> Result<(), StorageError>;

    /// Names of queues holding at least one message addressed directly to
    /// `receiver`, sorted by name.
    fn queues_with_pending_messages_for(&mut self, receiver: ClientId) -> Result<Vec<String>, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}
