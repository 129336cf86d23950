//! All broker protocol message types.
//!
//! Every frame is an 8-byte envelope (magic + body length) followed by a body
//! whose first byte is the [`MessageType`] discriminator.

use serde::{Deserialize, Serialize};

use crate::domain::{Context, FilterType, MessageId, OrderBy};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Magic sequence opening every frame.
pub const MAGIC: [u8; 4] = [0xAA, 0x56, 0xAA, 0x56];

/// Size of the frame envelope: magic (4) + body length (4).
pub const HEADER_SIZE: usize = 8;

/// Largest body length accepted from the wire.
pub const MAX_BODY_LEN: usize = 1 << 20;

// ── Message type codes ────────────────────────────────────────────────────────

/// Body discriminator. Code 4 is reserved and never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Client requests
    ConnectionRequest = 0,
    QueueModification = 1,
    SendMessage = 2,
    RetrieveMessage = 3,
    RetrieveQueues = 5,
    // Server responses
    RequestResponse = 6,
    ReturnedMessage = 7,
    ReturnedQueues = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(MessageType::ConnectionRequest),
            1 => Ok(MessageType::QueueModification),
            2 => Ok(MessageType::SendMessage),
            3 => Ok(MessageType::RetrieveMessage),
            5 => Ok(MessageType::RetrieveQueues),
            6 => Ok(MessageType::RequestResponse),
            7 => Ok(MessageType::ReturnedMessage),
            8 => Ok(MessageType::ReturnedQueues),
            _ => Err(()),
        }
    }
}

// ── Status codes ──────────────────────────────────────────────────────────────

/// Outcome carried by a [`RequestResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0,
    Exception = 1,
    FullServer = 2,
    NoQueue = 3,
    UserOnline = 4,
    QueueNotEmpty = 5,
    QueueExists = 6,
    QueueNotExists = 7,
    NoClient = 8,
    NoMessage = 9,
}

impl TryFrom<u8> for StatusCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(StatusCode::Success),
            1 => Ok(StatusCode::Exception),
            2 => Ok(StatusCode::FullServer),
            3 => Ok(StatusCode::NoQueue),
            4 => Ok(StatusCode::UserOnline),
            5 => Ok(StatusCode::QueueNotEmpty),
            6 => Ok(StatusCode::QueueExists),
            7 => Ok(StatusCode::QueueNotExists),
            8 => Ok(StatusCode::NoClient),
            9 => Ok(StatusCode::NoMessage),
            _ => Err(()),
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// Connects as `username`, or disconnects when `is_connect` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub is_connect: bool,
    /// Empty when disconnecting.
    pub username: String,
}

/// Creates or deletes a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueModification {
    pub is_delete: bool,
    pub queue_name: String,
}

/// Publishes one message into one or more queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// Raw wire priority; range checks happen at dispatch.
    pub priority: u8,
    pub context: Context,
    pub queues: Vec<String>,
    pub content: String,
    /// `None` for a broadcast message.
    pub receiver: Option<String>,
}

/// Looks up the top message for a queue or a sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveMessageRequest {
    pub filter: FilterType,
    pub order: OrderBy,
    /// Remove the message from its queue after returning it.
    pub pop: bool,
    /// Queue name or sender username, depending on `filter`.
    pub value: String,
}

/// Generic status reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResponse {
    pub status: StatusCode,
    pub description: String,
}

impl RequestResponse {
    pub fn new(status: StatusCode, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(StatusCode::Success, "")
    }
}

/// A message handed back by a retrieve request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnedMessage {
    pub id: MessageId,
    pub context: Context,
    pub priority: u8,
    pub content: String,
    pub sender: String,
    pub receiver: Option<String>,
    /// Queue the message was found in.
    pub queue: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Any message that can travel in a frame body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    ConnectionRequest(ConnectionRequest),
    QueueModification(QueueModification),
    SendMessage(SendMessageRequest),
    RetrieveMessage(RetrieveMessageRequest),
    RetrieveQueues,
    RequestResponse(RequestResponse),
    ReturnedMessage(ReturnedMessage),
    ReturnedQueues(Vec<String>),
}

impl ProtocolMessage {
    /// Returns the discriminator written as the first body byte.
    pub fn message_type(&self) -> MessageType {
        match self {
            ProtocolMessage::ConnectionRequest(_) => MessageType::ConnectionRequest,
            ProtocolMessage::QueueModification(_) => MessageType::QueueModification,
            ProtocolMessage::SendMessage(_) => MessageType::SendMessage,
            ProtocolMessage::RetrieveMessage(_) => MessageType::RetrieveMessage,
            ProtocolMessage::RetrieveQueues => MessageType::RetrieveQueues,
            ProtocolMessage::RequestResponse(_) => MessageType::RequestResponse,
            ProtocolMessage::ReturnedMessage(_) => MessageType::ReturnedMessage,
            ProtocolMessage::ReturnedQueues(_) => MessageType::ReturnedQueues,
        }
    }

    /// Shorthand for a [`ProtocolMessage::RequestResponse`].
    pub fn response(status: StatusCode, description: impl Into<String>) -> Self {
        ProtocolMessage::RequestResponse(RequestResponse::new(status, description))
    }
}
