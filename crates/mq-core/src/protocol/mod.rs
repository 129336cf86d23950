//! Protocol module containing message types and the binary codec.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_body, decode_frame, decode_header, encode_body, encode_frame, resync_offset,
    ProtocolError,
};
pub use messages::*;
