//! Value types for clients, queues and messages.
//!
//! A message carries a priority in `1..=10`, a context tag describing whether
//! it is a request, a response or neither, and at most [`MAX_CONTENT_CHARS`]
//! characters of text. Retrieval is parameterised by a [`FilterType`] and an
//! [`OrderBy`] key.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of characters in a message body.
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Storage-assigned identifier of a client.
pub type ClientId = i64;

/// Storage-assigned identifier of a message.
pub type MessageId = i64;

/// Errors raised when a value violates a domain rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("priority must be between {min} and {max}, got {0}", min = Priority::MIN, max = Priority::MAX)]
    InvalidPriority(u8),

    #[error("message content exceeds {MAX_CONTENT_CHARS} characters ({0} given)")]
    ContentTooLong(usize),

    #[error("{0} must not be empty")]
    EmptyName(&'static str),

    #[error("a message must target at least one queue")]
    NoQueues,
}

// ── Priority ──────────────────────────────────────────────────────────────────

/// Message priority; higher values are retrieved first under [`OrderBy::Priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    /// Validates `value` against the `1..=10` range.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidPriority`] when out of range.
    pub fn new(value: u8) -> Result<Self, DomainError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(DomainError::InvalidPriority(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Conversational role of a message, carried as a 4-byte code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Context {
    Request = 0,
    Response = 1,
    None = 2,
}

impl TryFrom<u32> for Context {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Context::Request),
            1 => Ok(Context::Response),
            2 => Ok(Context::None),
            _ => Err(()),
        }
    }
}

// ── Retrieval parameters ──────────────────────────────────────────────────────

/// What the filter value of a retrieve request names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FilterType {
    /// The filter value is a queue name.
    Queue = 0,
    /// The filter value is the username of the sender.
    Sender = 1,
}

impl TryFrom<u8> for FilterType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FilterType::Queue),
            1 => Ok(FilterType::Sender),
            _ => Err(()),
        }
    }
}

/// Primary sort key of a retrieve request. Both keys sort descending and the
/// other key breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderBy {
    Priority = 0,
    Timestamp = 1,
}

impl TryFrom<u8> for OrderBy {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OrderBy::Priority),
            1 => Ok(OrderBy::Timestamp),
            _ => Err(()),
        }
    }
}

// ── Validation helpers ────────────────────────────────────────────────────────

/// Rejects empty usernames and queue names. `what` names the field in the error.
pub fn validate_name(value: &str, what: &'static str) -> Result<(), DomainError> {
    if value.is_empty() {
        Err(DomainError::EmptyName(what))
    } else {
        Ok(())
    }
}

/// Rejects message bodies longer than [`MAX_CONTENT_CHARS`] characters.
pub fn validate_content(content: &str) -> Result<(), DomainError> {
    let chars = content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        Err(DomainError::ContentTooLong(chars))
    } else {
        Ok(())
    }
}
