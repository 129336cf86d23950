//! Domain vocabulary shared by the broker and its clients.

pub mod model;

pub use model::{
    validate_content, validate_name, ClientId, Context, DomainError, FilterType, MessageId,
    OrderBy, Priority, MAX_CONTENT_CHARS,
};
