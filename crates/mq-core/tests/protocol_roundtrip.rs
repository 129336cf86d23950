//! Integration tests for the mq-core protocol codec.
//!
//! These tests drive the public API the way a connection does: frames are
//! concatenated into one stream, split at the envelope boundary, and decoded
//! header first, body second.

use mq_core::{
    decode_frame, encode_frame,
    domain::MAX_CONTENT_CHARS,
    protocol::{
        decode_body, decode_header,
        messages::{
            ConnectionRequest, QueueModification, RetrieveMessageRequest, ReturnedMessage,
            SendMessageRequest, HEADER_SIZE,
        },
    },
    Context, FilterType, OrderBy, ProtocolMessage, StatusCode,
};

fn roundtrip(msg: ProtocolMessage) -> ProtocolMessage {
    let bytes = encode_frame(&msg).expect("encode must succeed");
    let (decoded, consumed) = decode_frame(&bytes).expect("decode must succeed");
    assert_eq!(consumed, bytes.len(), "all bytes must be consumed");
    decoded
}

fn every_message_type() -> Vec<ProtocolMessage> {
    vec![
        ProtocolMessage::ConnectionRequest(ConnectionRequest {
            is_connect: true,
            username: "alice".to_string(),
        }),
        ProtocolMessage::QueueModification(QueueModification {
            is_delete: false,
            queue_name: "orders".to_string(),
        }),
        ProtocolMessage::SendMessage(SendMessageRequest {
            priority: 7,
            context: Context::Request,
            queues: vec!["orders".to_string(), "audit".to_string()],
            content: "ship it".to_string(),
            receiver: Some("bob".to_string()),
        }),
        ProtocolMessage::RetrieveMessage(RetrieveMessageRequest {
            filter: FilterType::Queue,
            order: OrderBy::Priority,
            pop: false,
            value: "orders".to_string(),
        }),
        ProtocolMessage::RetrieveQueues,
        ProtocolMessage::response(StatusCode::NoMessage, "no message found"),
        ProtocolMessage::ReturnedMessage(ReturnedMessage {
            id: 42,
            context: Context::Response,
            priority: 3,
            content: "done".to_string(),
            sender: "bob".to_string(),
            receiver: None,
            queue: "orders".to_string(),
        }),
        ProtocolMessage::ReturnedQueues(vec!["orders".to_string()]),
    ]
}

#[test]
fn test_roundtrip_every_message_type() {
    for msg in every_message_type() {
        assert_eq!(roundtrip(msg.clone()), msg);
    }
}

#[test]
fn test_roundtrip_empty_strings() {
    let msg = ProtocolMessage::RetrieveMessage(RetrieveMessageRequest {
        filter: FilterType::Sender,
        order: OrderBy::Timestamp,
        pop: true,
        value: String::new(),
    });
    assert_eq!(roundtrip(msg.clone()), msg);

    let msg = ProtocolMessage::response(StatusCode::Success, "");
    assert_eq!(roundtrip(msg.clone()), msg);
}

#[test]
fn test_roundtrip_max_length_multibyte_content() {
    let msg = ProtocolMessage::SendMessage(SendMessageRequest {
        priority: 1,
        context: Context::None,
        queues: vec!["q".to_string()],
        content: "ü".repeat(MAX_CONTENT_CHARS),
        receiver: None,
    });
    assert_eq!(roundtrip(msg.clone()), msg);
}

#[test]
fn test_stream_of_frames_decodes_sequentially() {
    let messages = every_message_type();
    let mut stream = Vec::new();
    for msg in &messages {
        stream.extend(encode_frame(msg).expect("encode must succeed"));
    }

    let mut cursor = 0;
    let mut decoded = Vec::new();
    while cursor < stream.len() {
        let (msg, consumed) = decode_frame(&stream[cursor..]).expect("decode must succeed");
        decoded.push(msg);
        cursor += consumed;
    }
    assert_eq!(decoded, messages);
}

#[test]
fn test_header_then_body_matches_whole_frame_decode() {
    for msg in every_message_type() {
        let bytes = encode_frame(&msg).expect("encode must succeed");
        let body_len = decode_header(&bytes[..HEADER_SIZE]).expect("header must decode");
        assert_eq!(body_len, bytes.len() - HEADER_SIZE);
        let body = decode_body(&bytes[HEADER_SIZE..]).expect("body must decode");
        assert_eq!(body, msg);
    }
}
