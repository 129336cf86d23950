//! Binary codec for encoding and decoding broker protocol frames.
//!
//! Wire format:
//! ```text
//! [magic:4 = AA 56 AA 56][body_len:4 (i32)][msg_type:1][payload:body_len-1]
//! ```
//! All multi-byte integers are big-endian. Text fields are a 2-byte length
//! followed by UTF-8 bytes; a zero length marks an absent optional field.
//! Lists are a 2-byte count followed by that many text fields.

use crate::domain::{Context, FilterType, OrderBy};
use crate::protocol::messages::{
    ConnectionRequest, MessageType, ProtocolMessage, QueueModification, RequestResponse,
    RetrieveMessageRequest, ReturnedMessage, SendMessageRequest, StatusCode, HEADER_SIZE, MAGIC,
    MAX_BODY_LEN,
};
use thiserror::Error;

/// Errors that can occur during frame encoding or decoding.
///
/// Any decoding variant means the frame is malformed; the decoder never keeps
/// state between calls, so a failed decode leaves nothing to undo.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The envelope does not start with the magic sequence.
    #[error("bad magic: {0:02X?}")]
    BadMagic([u8; 4]),

    /// The declared body length is not in `1..=MAX_BODY_LEN`.
    #[error("invalid body length: {0}")]
    InvalidBodyLength(i64),

    /// The message type byte is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The payload could not be parsed (enum code out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The declared body length exceeds the bytes available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// A text field or list is too long for its 2-byte length prefix.
    #[error("{field} too long to encode: {len}")]
    FieldTooLong { field: &'static str, len: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`ProtocolMessage`] into a complete frame, envelope included.
///
/// # Errors
///
/// Returns [`ProtocolError::FieldTooLong`] if a string or list does not fit
/// its length prefix, or [`ProtocolError::InvalidBodyLength`] if the body
/// would exceed [`MAX_BODY_LEN`].
///
/// # Examples
///
/// ```rust
/// use mq_core::protocol::{decode_frame, encode_frame, ProtocolMessage};
///
/// let msg = ProtocolMessage::RetrieveQueues;
/// let bytes = encode_frame(&msg).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(msg: &ProtocolMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = encode_body(msg)?;
    if body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::InvalidBodyLength(body.len() as i64));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&(body.len() as i32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Encodes only the frame body: discriminator byte followed by the payload.
///
/// # Errors
///
/// Returns [`ProtocolError::FieldTooLong`] if a field does not fit its prefix.
pub fn encode_body(msg: &ProtocolMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![msg.message_type() as u8];
    match msg {
        ProtocolMessage::ConnectionRequest(m) => encode_connection_request(&mut buf, m)?,
        ProtocolMessage::QueueModification(m) => encode_queue_modification(&mut buf, m)?,
        ProtocolMessage::SendMessage(m) => encode_send_message(&mut buf, m)?,
        ProtocolMessage::RetrieveMessage(m) => encode_retrieve_message(&mut buf, m)?,
        ProtocolMessage::RetrieveQueues => {} // empty payload
        ProtocolMessage::RequestResponse(m) => encode_request_response(&mut buf, m)?,
        ProtocolMessage::ReturnedMessage(m) => encode_returned_message(&mut buf, m)?,
        ProtocolMessage::ReturnedQueues(names) => {
            write_string_list(&mut buf, names, "queue list")?
        }
    }
    Ok(buf)
}

/// Validates an 8-byte envelope and returns the declared body length.
///
/// # Errors
///
/// Returns [`ProtocolError::BadMagic`] or [`ProtocolError::InvalidBodyLength`]
/// for a malformed header, [`ProtocolError::InsufficientData`] if fewer than
/// [`HEADER_SIZE`] bytes are given.
pub fn decode_header(bytes: &[u8]) -> Result<usize, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let body_len = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if body_len <= 0 || body_len as usize > MAX_BODY_LEN {
        return Err(ProtocolError::InvalidBodyLength(i64::from(body_len)));
    }
    Ok(body_len as usize)
}

/// Decodes a frame body (discriminator + payload) into a [`ProtocolMessage`].
///
/// # Errors
///
/// Returns [`ProtocolError`] if the discriminator is unknown or the payload
/// is truncated or invalid.
pub fn decode_body(body: &[u8]) -> Result<ProtocolMessage, ProtocolError> {
    let Some((&type_byte, payload)) = body.split_first() else {
        return Err(ProtocolError::InsufficientData {
            needed: 1,
            available: 0,
        });
    };
    let msg_type =
        MessageType::try_from(type_byte).map_err(|_| ProtocolError::UnknownMessageType(type_byte))?;
    decode_payload(msg_type, payload)
}

/// Decodes one complete frame from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed
/// (envelope + body), so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed or incomplete.
pub fn decode_frame(bytes: &[u8]) -> Result<(ProtocolMessage, usize), ProtocolError> {
    let body_len = decode_header(bytes)?;
    let total = HEADER_SIZE + body_len;
    if bytes.len() < total {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: body_len,
            available: bytes.len() - HEADER_SIZE,
        });
    }
    let msg = decode_body(&bytes[HEADER_SIZE..total])?;
    Ok((msg, total))
}

/// Returns how many leading bytes of a rejected header to drop so that the
/// remainder could still be the start of a frame.
///
/// The result is the first offset (after 0) whose suffix is a prefix of
/// [`MAGIC`], or `buf.len()` when no such suffix exists.
pub fn resync_offset(buf: &[u8]) -> usize {
    (1..buf.len())
        .find(|&start| {
            let tail = &buf[start..];
            let n = tail.len().min(MAGIC.len());
            tail[..n] == MAGIC[..n]
        })
        .unwrap_or(buf.len())
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(msg_type: MessageType, payload: &[u8]) -> Result<ProtocolMessage, ProtocolError> {
    match msg_type {
        MessageType::ConnectionRequest => {
            decode_connection_request(payload).map(ProtocolMessage::ConnectionRequest)
        }
        MessageType::QueueModification => {
            decode_queue_modification(payload).map(ProtocolMessage::QueueModification)
        }
        MessageType::SendMessage => decode_send_message(payload).map(ProtocolMessage::SendMessage),
        MessageType::RetrieveMessage => {
            decode_retrieve_message(payload).map(ProtocolMessage::RetrieveMessage)
        }
        MessageType::RetrieveQueues => Ok(ProtocolMessage::RetrieveQueues),
        MessageType::RequestResponse => {
            decode_request_response(payload).map(ProtocolMessage::RequestResponse)
        }
        MessageType::ReturnedMessage => {
            decode_returned_message(payload).map(ProtocolMessage::ReturnedMessage)
        }
        MessageType::ReturnedQueues => {
            read_string_list(payload, 0).map(|(names, _)| ProtocolMessage::ReturnedQueues(names))
        }
    }
}

// ── Per-message encode helpers ────────────────────────────────────────────────

fn encode_connection_request(buf: &mut Vec<u8>, m: &ConnectionRequest) -> Result<(), ProtocolError> {
    buf.push(u8::from(m.is_connect));
    write_length_prefixed_string(buf, &m.username, "username")
}

fn encode_queue_modification(buf: &mut Vec<u8>, m: &QueueModification) -> Result<(), ProtocolError> {
    buf.push(u8::from(m.is_delete));
    write_length_prefixed_string(buf, &m.queue_name, "queue name")
}

fn encode_send_message(buf: &mut Vec<u8>, m: &SendMessageRequest) -> Result<(), ProtocolError> {
    buf.push(m.priority);
    buf.extend_from_slice(&(m.context as u32).to_be_bytes());
    write_string_list(buf, &m.queues, "queue list")?;
    write_length_prefixed_string(buf, &m.content, "content")?;
    write_optional_string(buf, m.receiver.as_deref(), "receiver")
}

fn encode_retrieve_message(buf: &mut Vec<u8>, m: &RetrieveMessageRequest) -> Result<(), ProtocolError> {
    buf.push(m.filter as u8);
    buf.push(m.order as u8);
    buf.push(u8::from(m.pop));
    write_length_prefixed_string(buf, &m.value, "filter value")
}

fn encode_request_response(buf: &mut Vec<u8>, m: &RequestResponse) -> Result<(), ProtocolError> {
    buf.push(m.status as u8);
    write_length_prefixed_string(buf, &m.description, "description")
}

fn encode_returned_message(buf: &mut Vec<u8>, m: &ReturnedMessage) -> Result<(), ProtocolError> {
    buf.extend_from_slice(&m.id.to_be_bytes());
    buf.extend_from_slice(&(m.context as u32).to_be_bytes());
    buf.push(m.priority);
    write_length_prefixed_string(buf, &m.content, "content")?;
    write_length_prefixed_string(buf, &m.sender, "sender")?;
    write_optional_string(buf, m.receiver.as_deref(), "receiver")?;
    write_length_prefixed_string(buf, &m.queue, "queue name")
}

// ── Per-message decode helpers ────────────────────────────────────────────────

fn decode_connection_request(p: &[u8]) -> Result<ConnectionRequest, ProtocolError> {
    require_len(p, 1, "ConnectionRequest")?;
    let (username, _) = read_length_prefixed_string(p, 1)?;
    Ok(ConnectionRequest {
        is_connect: p[0] != 0,
        username,
    })
}

fn decode_queue_modification(p: &[u8]) -> Result<QueueModification, ProtocolError> {
    require_len(p, 1, "QueueModification")?;
    let (queue_name, _) = read_length_prefixed_string(p, 1)?;
    Ok(QueueModification {
        is_delete: p[0] != 0,
        queue_name,
    })
}

fn decode_send_message(p: &[u8]) -> Result<SendMessageRequest, ProtocolError> {
    require_len(p, 5, "SendMessage")?;
    let priority = p[0];
    let context = read_context(p, 1)?;
    let (queues, offset) = read_string_list(p, 5)?;
    let (content, offset) = read_length_prefixed_string(p, offset)?;
    let (receiver, _) = read_optional_string(p, offset)?;
    Ok(SendMessageRequest {
        priority,
        context,
        queues,
        content,
        receiver,
    })
}

fn decode_retrieve_message(p: &[u8]) -> Result<RetrieveMessageRequest, ProtocolError> {
    require_len(p, 3, "RetrieveMessage")?;
    let filter = FilterType::try_from(p[0])
        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown filter code: {}", p[0])))?;
    let order = OrderBy::try_from(p[1])
        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown order code: {}", p[1])))?;
    let (value, _) = read_length_prefixed_string(p, 3)?;
    Ok(RetrieveMessageRequest {
        filter,
        order,
        pop: p[2] != 0,
        value,
    })
}

fn decode_request_response(p: &[u8]) -> Result<RequestResponse, ProtocolError> {
    require_len(p, 1, "RequestResponse")?;
    let status = StatusCode::try_from(p[0])
        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown status code: {}", p[0])))?;
    let (description, _) = read_length_prefixed_string(p, 1)?;
    Ok(RequestResponse {
        status,
        description,
    })
}

fn decode_returned_message(p: &[u8]) -> Result<ReturnedMessage, ProtocolError> {
    require_len(p, 13, "ReturnedMessage")?;
    let id = read_u64(p, 0)? as i64;
    let context = read_context(p, 8)?;
    let priority = p[12];
    let (content, offset) = read_length_prefixed_string(p, 13)?;
    let (sender, offset) = read_length_prefixed_string(p, offset)?;
    let (receiver, offset) = read_optional_string(p, offset)?;
    let (queue, _) = read_length_prefixed_string(p, offset)?;
    Ok(ReturnedMessage {
        id,
        context,
        priority,
        content,
        sender,
        receiver,
        queue,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    require_len(buf, offset + 4, "u32 field")?;
    Ok(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, ProtocolError> {
    require_len(buf, offset + 8, "u64 field")?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    Ok(u64::from_be_bytes(bytes))
}

fn read_context(buf: &[u8], offset: usize) -> Result<Context, ProtocolError> {
    let code = read_u32(buf, offset)?;
    Context::try_from(code)
        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown context code: {code}")))
}

fn write_length_prefixed_string(
    buf: &mut Vec<u8>,
    s: &str,
    field: &'static str,
) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: bytes.len(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// `None` and `Some("")` both encode as a zero length.
fn write_optional_string(
    buf: &mut Vec<u8>,
    s: Option<&str>,
    field: &'static str,
) -> Result<(), ProtocolError> {
    write_length_prefixed_string(buf, s.unwrap_or(""), field)
}

fn write_string_list(
    buf: &mut Vec<u8>,
    items: &[String],
    field: &'static str,
) -> Result<(), ProtocolError> {
    let count = u16::try_from(items.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: items.len(),
    })?;
    buf.extend_from_slice(&count.to_be_bytes());
    for item in items {
        write_length_prefixed_string(buf, item, field)?;
    }
    Ok(())
}

fn read_length_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

fn read_optional_string(buf: &[u8], offset: usize) -> Result<(Option<String>, usize), ProtocolError> {
    let (s, next) = read_length_prefixed_string(buf, offset)?;
    Ok(((!s.is_empty()).then_some(s), next))
}

fn read_string_list(buf: &[u8], offset: usize) -> Result<(Vec<String>, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for list count at offset {offset}"
        )));
    }
    let count = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let mut items = Vec::with_capacity(count);
    let mut cursor = offset + 2;
    for _ in 0..count {
        let (item, next) = read_length_prefixed_string(buf, cursor)?;
        items.push(item);
        cursor = next;
    }
    Ok((items, cursor))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MAX_CONTENT_CHARS;

    fn round_trip(msg: &ProtocolMessage) -> ProtocolMessage {
        let encoded = encode_frame(msg).expect("encode failed");
        let (decoded, consumed) = decode_frame(&encoded).expect("decode failed");
        assert_eq!(consumed, encoded.len(), "consumed bytes should equal total encoded size");
        decoded
    }

    fn send_message(queues: &[&str], receiver: Option<&str>) -> ProtocolMessage {
        ProtocolMessage::SendMessage(SendMessageRequest {
            priority: 5,
            context: Context::Request,
            queues: queues.iter().map(|q| q.to_string()).collect(),
            content: "hello".to_string(),
            receiver: receiver.map(str::to_string),
        })
    }

    // ── ConnectionRequest ────────────────────────────────────────────────────

    #[test]
    fn test_connect_round_trip() {
        let msg = ProtocolMessage::ConnectionRequest(ConnectionRequest {
            is_connect: true,
            username: "alice".to_string(),
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_disconnect_with_empty_username_round_trip() {
        let msg = ProtocolMessage::ConnectionRequest(ConnectionRequest {
            is_connect: false,
            username: String::new(),
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_connect_encodes_expected_bytes() {
        let msg = ProtocolMessage::ConnectionRequest(ConnectionRequest {
            is_connect: true,
            username: "ab".to_string(),
        });
        let bytes = encode_frame(&msg).unwrap();
        assert_eq!(
            bytes,
            vec![0xAA, 0x56, 0xAA, 0x56, 0, 0, 0, 6, 0, 1, 0, 2, b'a', b'b']
        );
    }

    // ── QueueModification ────────────────────────────────────────────────────

    #[test]
    fn test_queue_create_and_delete_round_trip() {
        for is_delete in [false, true] {
            let msg = ProtocolMessage::QueueModification(QueueModification {
                is_delete,
                queue_name: "jobs".to_string(),
            });
            assert_eq!(round_trip(&msg), msg);
        }
    }

    // ── SendMessage ──────────────────────────────────────────────────────────

    #[test]
    fn test_send_message_with_receiver_round_trip() {
        let msg = send_message(&["a", "b"], Some("bob"));
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_send_message_without_receiver_round_trip() {
        let msg = send_message(&["a"], None);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_send_message_queue_names_may_contain_pipe() {
        let msg = send_message(&["left|right", "plain"], None);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_send_message_max_length_content_round_trip() {
        let msg = ProtocolMessage::SendMessage(SendMessageRequest {
            priority: 10,
            context: Context::None,
            queues: vec!["q".to_string()],
            content: "x".repeat(MAX_CONTENT_CHARS),
            receiver: None,
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_send_message_keeps_out_of_range_priority() {
        // Range checks are a dispatch concern; the codec carries the raw byte.
        let mut msg = send_message(&["q"], None);
        if let ProtocolMessage::SendMessage(ref mut m) = msg {
            m.priority = 0;
        }
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_send_message_unknown_context_is_malformed() {
        let mut body = encode_body(&send_message(&["q"], None)).unwrap();
        body[2..6].copy_from_slice(&9u32.to_be_bytes());
        assert!(matches!(
            decode_body(&body),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    // ── RetrieveMessage / RetrieveQueues ─────────────────────────────────────

    #[test]
    fn test_retrieve_message_round_trip() {
        let msg = ProtocolMessage::RetrieveMessage(RetrieveMessageRequest {
            filter: FilterType::Sender,
            order: OrderBy::Timestamp,
            pop: true,
            value: "alice".to_string(),
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_retrieve_queues_has_single_byte_body() {
        let bytes = encode_frame(&ProtocolMessage::RetrieveQueues).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 1);
        assert_eq!(round_trip(&ProtocolMessage::RetrieveQueues), ProtocolMessage::RetrieveQueues);
    }

    #[test]
    fn test_retrieve_message_unknown_filter_is_malformed() {
        let body = [MessageType::RetrieveMessage as u8, 7, 0, 0, 0, 0];
        assert!(matches!(
            decode_body(&body),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    // ── Responses ────────────────────────────────────────────────────────────

    #[test]
    fn test_request_response_round_trip() {
        let msg = ProtocolMessage::response(StatusCode::QueueNotEmpty, "queue still holds messages");
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_returned_message_round_trip() {
        let msg = ProtocolMessage::ReturnedMessage(ReturnedMessage {
            id: 0x0102_0304_0506_0708,
            context: Context::Response,
            priority: 9,
            content: "payload".to_string(),
            sender: "alice".to_string(),
            receiver: Some("bob".to_string()),
            queue: "jobs".to_string(),
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_returned_message_broadcast_round_trip() {
        let msg = ProtocolMessage::ReturnedMessage(ReturnedMessage {
            id: 1,
            context: Context::None,
            priority: 1,
            content: String::new(),
            sender: "alice".to_string(),
            receiver: None,
            queue: "jobs".to_string(),
        });
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_returned_queues_round_trip() {
        let msg = ProtocolMessage::ReturnedQueues(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(round_trip(&msg), msg);
        let empty = ProtocolMessage::ReturnedQueues(Vec::new());
        assert_eq!(round_trip(&empty), empty);
    }

    // ── Error conditions ──────────────────────────────────────────────────────

    #[test]
    fn test_decode_header_short_input_returns_insufficient_data() {
        let result = decode_header(&[0xAA, 0x56]);
        assert!(matches!(result, Err(ProtocolError::InsufficientData { .. })));
    }

    #[test]
    fn test_decode_header_bad_magic() {
        let result = decode_header(&[0xAA, 0x56, 0xAA, 0x57, 0, 0, 0, 1]);
        assert_eq!(result, Err(ProtocolError::BadMagic([0xAA, 0x56, 0xAA, 0x57])));
    }

    #[test]
    fn test_decode_header_rejects_negative_and_zero_length() {
        let mut header = [0xAA, 0x56, 0xAA, 0x56, 0, 0, 0, 0];
        assert_eq!(decode_header(&header), Err(ProtocolError::InvalidBodyLength(0)));
        header[4..8].copy_from_slice(&(-5i32).to_be_bytes());
        assert_eq!(decode_header(&header), Err(ProtocolError::InvalidBodyLength(-5)));
    }

    #[test]
    fn test_decode_header_rejects_unreasonable_length() {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&MAGIC);
        header[4..8].copy_from_slice(&((MAX_BODY_LEN + 1) as i32).to_be_bytes());
        assert!(matches!(
            decode_header(&header),
            Err(ProtocolError::InvalidBodyLength(_))
        ));
    }

    #[test]
    fn test_decode_body_reserved_type_is_unknown() {
        assert_eq!(decode_body(&[4]), Err(ProtocolError::UnknownMessageType(4)));
    }

    #[test]
    fn test_decode_body_truncated_string_is_malformed() {
        // QueueModification declaring a 10-byte name but carrying 2.
        let body = [MessageType::QueueModification as u8, 0, 0, 10, b'a', b'b'];
        assert!(matches!(
            decode_body(&body),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_body_invalid_utf8_is_malformed() {
        let body = [MessageType::QueueModification as u8, 0, 0, 2, 0xFF, 0xFE];
        assert!(matches!(
            decode_body(&body),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_frame_incomplete_body_returns_mismatch() {
        let bytes = encode_frame(&send_message(&["q"], None)).unwrap();
        let result = decode_frame(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::PayloadLengthMismatch { .. })));
    }

    #[test]
    fn test_encode_rejects_oversized_string() {
        let msg = ProtocolMessage::QueueModification(QueueModification {
            is_delete: false,
            queue_name: "q".repeat(u16::MAX as usize + 1),
        });
        assert_eq!(
            encode_frame(&msg),
            Err(ProtocolError::FieldTooLong {
                field: "queue name",
                len: u16::MAX as usize + 1,
            })
        );
    }

    // ── Resynchronization ─────────────────────────────────────────────────────

    #[test]
    fn test_resync_offset_finds_embedded_magic() {
        let buf = [0x00, 0x11, 0xAA, 0x56, 0xAA, 0x56, 0x00, 0x00];
        assert_eq!(resync_offset(&buf), 2);
    }

    #[test]
    fn test_resync_offset_keeps_partial_magic_at_tail() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xAA, 0x56];
        assert_eq!(resync_offset(&buf), 6);
    }

    #[test]
    fn test_resync_offset_drops_everything_without_candidate() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(resync_offset(&buf), buf.len());
    }

    #[test]
    fn test_resync_offset_never_keeps_offset_zero() {
        // A header with valid magic but a bad length must still move forward.
        let buf = [0xAA, 0x56, 0xAA, 0x56, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(resync_offset(&buf), buf.len());

        let repeated = [0xAA, 0x56, 0xAA, 0x56, 0xAA, 0x56, 0xAA, 0x56];
        assert_eq!(resync_offset(&repeated), 2);
    }
}
