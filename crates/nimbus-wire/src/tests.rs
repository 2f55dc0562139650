//! Integration tests for the wire protocol.

use bytes::{Bytes, BytesMut};
use nimbus_types::{DataPointer, NodeName, RequestId, TenantId, Timestamp, ValueRecord};

use crate::message::{
    ArchiveKeyEntire, ArchiveKeyFinalReply, HintedHandoff, Ping, RetrieveKeyEntireReply,
    SpaceAccountingDetail, SpaceEvent,
};
use crate::*;

fn descriptor() -> SegmentDescriptor {
    SegmentDescriptor {
        tenant_id: TenantId::new(42),
        key: "x".to_string(),
        version_number: 0,
        segment_number: 5,
        timestamp: Timestamp::from_nanos(1_700_000_000_000_000_000),
        total_size: 4000,
        file_adler32: -42,
        file_md5: [0xFF; 16],
        segment_adler32: 32,
        segment_md5: [0x11; 16],
    }
}

fn record(size: u64) -> ValueRecord {
    ValueRecord::DataPointer(DataPointer {
        timestamp: Timestamp::from_nanos(7),
        segment_number: 1,
        segment_size: size,
        encoded_size: size,
        total_size: size * 3,
        checksum_adler32: 1,
        checksum_md5: [9; 16],
    })
}

fn through_stream(frame: &WireFrame) -> WireFrame {
    let bytes = frame.to_frame().unwrap().encode_to_bytes();
    let mut buf = BytesMut::from(&bytes[..]);
    let decoded = Frame::decode(&mut buf).unwrap().unwrap();
    assert!(buf.is_empty());
    WireFrame::from_frame(&decoded).unwrap()
}

// ============================================================================
// Database envelope
// ============================================================================

#[test]
fn test_insert_request_cycle() {
    let request = DatabaseRequest {
        request_id: RequestId::new(0xABCDEF),
        tenant_id: TenantId::new(42),
        segment_number: 0,
        reply_exchange: "reply-exchange".into(),
        reply_routing_header: "node-01.database".into(),
        key: Bytes::from_static(b"k1"),
        operation: DatabaseOperation::Insert {
            version_number: 3,
            record: record(1000),
        },
    };

    let decoded = through_stream(&request.clone().into());
    assert_eq!(decoded, WireFrame::DatabaseRequest(request.clone()));
    assert_eq!(decoded.request_id(), Some(RequestId::new(0xABCDEF)));

    let key = request.segment_key().unwrap();
    assert_eq!(key.version_number, 3);
    assert_eq!(key.tenant_id, TenantId::new(42));
}

#[test]
fn test_request_header_layout() {
    let request = DatabaseRequest {
        request_id: RequestId::new(1),
        tenant_id: TenantId::new(0x0102030405060708),
        segment_number: 9,
        reply_exchange: "e".into(),
        reply_routing_header: String::new(),
        key: Bytes::from_static(b"kk"),
        operation: DatabaseOperation::Lookup { version_number: 0 },
    };
    let mut buf = BytesMut::new();
    request.encode(&mut buf).unwrap();

    assert_eq!(&buf[..32], b"00000000000000000000000000000001");
    assert_eq!(&buf[32..40], &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(buf[40], 9);
    assert_eq!(&buf[41..44], &[0, 1, b'e']);
    assert_eq!(&buf[44..46], &[0, 0]);
    assert_eq!(&buf[46..50], &[0, 2, b'k', b'k']);
    assert_eq!(buf[50], OperationCode::Lookup as u8);
}

#[test]
fn test_list_request_with_cursor() {
    let request = DatabaseRequest {
        request_id: RequestId::random(),
        tenant_id: TenantId::new(1),
        segment_number: 0,
        reply_exchange: String::new(),
        reply_routing_header: String::new(),
        key: Bytes::from_static(b"prefix/"),
        operation: DatabaseOperation::List {
            cursor: Some(Bytes::from_static(b"prefix/a\x00\x01\x00\x00\x00\x00\x00")),
            limit: 100,
        },
    };
    assert_eq!(request.segment_key(), None);
    assert_eq!(
        through_stream(&request.clone().into()),
        WireFrame::DatabaseRequest(request)
    );
}

#[test]
fn test_field_too_long_is_rejected() {
    let request = DatabaseRequest {
        request_id: RequestId::random(),
        tenant_id: TenantId::new(1),
        segment_number: 0,
        reply_exchange: "x".repeat(MAX_FIELD_LEN + 1),
        reply_routing_header: String::new(),
        key: Bytes::new(),
        operation: DatabaseOperation::Lookup { version_number: 0 },
    };
    let err = request.to_frame().unwrap_err();
    assert!(matches!(err, WireError::FieldTooLong { field: "reply-exchange", .. }));
}

#[test]
fn test_truncated_request_is_malformed_not_framing() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&RequestId::new(5).to_hex_bytes());
    buf.extend_from_slice(&[0, 0, 0]);
    let err = DatabaseRequest::decode(buf.freeze()).unwrap_err();
    assert!(matches!(err, WireError::Malformed(_)));
    assert!(!err.is_framing());
}

#[test]
fn test_reply_variants_cycle() {
    let id = RequestId::random();
    let replies = vec![
        DatabaseReply::success(id, OperationCode::Insert, ReplyBody::PreviousSize(1000)),
        DatabaseReply::success(id, OperationCode::Delete, ReplyBody::PreviousSize(0)),
        DatabaseReply::success(id, OperationCode::Lookup, ReplyBody::Lookup(Some(record(5)))),
        DatabaseReply::success(
            id,
            OperationCode::Lookup,
            ReplyBody::Lookup(Some(ValueRecord::Tombstone {
                timestamp: Timestamp::from_nanos(3),
            })),
        ),
        DatabaseReply::success(
            id,
            OperationCode::List,
            ReplyBody::List {
                entries: vec![ListEntry {
                    key: Bytes::from_static(b"a"),
                    version_number: 1,
                    segment_number: 2,
                    record: record(10),
                }],
                next_cursor: Some(Bytes::from_static(b"cursor")),
            },
        ),
        DatabaseReply::failure(
            id,
            OperationCode::Lookup,
            ReplyResult::NotFound,
            "key not found",
        ),
    ];

    for reply in replies {
        assert_eq!(through_stream(&reply.clone().into()), WireFrame::DatabaseReply(reply));
    }
}

#[test]
fn test_reply_body_must_match_operation() {
    let reply = DatabaseReply::success(
        RequestId::random(),
        OperationCode::Lookup,
        ReplyBody::PreviousSize(1),
    );
    assert!(matches!(reply.to_frame(), Err(WireError::Serialization(_))));
}

// ============================================================================
// Structured messages
// ============================================================================

#[test]
fn test_message_json_uses_kebab_case() {
    let id = RequestId::new(7);
    let message = Message::ArchiveKeyEntire(ArchiveKeyEntire {
        message_id: id,
        segment: descriptor(),
    });
    let json: serde_json::Value = serde_json::to_value(&message).unwrap();

    assert_eq!(json["message-type"], "archive-key-entire");
    assert_eq!(json["message-id"], "00000000000000000000000000000007");
    assert_eq!(json["tenant-id"], 42);
    assert_eq!(json["segment-number"], 5);
    assert_eq!(json["segment-md5"], "EREREREREREREREREREREQ==");
}

#[test]
fn test_message_with_data_cycle() {
    let message = Message::HintedHandoff(HintedHandoff {
        message_id: RequestId::random(),
        original_destination: NodeName::new("node-b"),
        segment: descriptor(),
    });
    let envelope = MessageEnvelope::with_data(message, Bytes::from(vec![0u8; 4096]));

    let decoded = through_stream(&envelope.clone().into());
    assert_eq!(decoded, WireFrame::Message(envelope));
    assert_eq!(decoded.describe(), "hinted-handoff");
}

#[test]
fn test_reply_status_error_message_only_on_failure() {
    let ok = Message::ArchiveKeyFinalReply(ArchiveKeyFinalReply {
        message_id: RequestId::new(1),
        status: ReplyStatus::success(),
        previous_size: 10,
    });
    let json = serde_json::to_value(&ok).unwrap();
    assert_eq!(json["result"], "success");
    assert!(json.get("error-message").is_none());

    let failed = Message::RetrieveKeyEntireReply(RetrieveKeyEntireReply::failure(
        RequestId::new(2),
        ReplyResult::ChecksumMismatch,
        "md5 mismatch",
    ));
    let json = serde_json::to_value(&failed).unwrap();
    assert_eq!(json["result"], "checksum-mismatch");
    assert_eq!(json["error-message"], "md5 mismatch");
    assert_eq!(failed.result(), Some(ReplyResult::ChecksumMismatch));

    let back: Message = serde_json::from_value(json).unwrap();
    assert_eq!(back, failed);
}

#[test]
fn test_set_message_id() {
    let mut frame: WireFrame = Message::Ping(Ping {
        message_id: RequestId::default(),
    })
    .into();
    frame.set_request_id(RequestId::new(99));
    assert_eq!(frame.request_id(), Some(RequestId::new(99)));

    let mut push: WireFrame = Message::SpaceAccountingDetail(SpaceAccountingDetail {
        tenant_id: TenantId::new(1),
        timestamp: Timestamp::from_nanos(1),
        event: SpaceEvent::BytesAdded,
        value: 10,
    })
    .into();
    push.set_request_id(RequestId::new(99));
    assert_eq!(push.request_id(), None);
}

#[test]
fn test_space_event_names() {
    let json = serde_json::to_value(SpaceEvent::BytesRetrieved).unwrap();
    assert_eq!(json, "bytes-retrieved");
}

#[test]
fn test_unknown_message_type_is_malformed() {
    let json = br#"{"message-type":"launch-rockets","message-id":"00000000000000000000000000000001"}"#;
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(json);
    let frame = Frame::new(FrameKind::Message, buf.freeze()).unwrap();

    let err = WireFrame::from_frame(&frame).unwrap_err();
    assert!(matches!(err, WireError::Malformed(_)));
}

#[test]
fn test_bad_md5_length_is_malformed() {
    let mut json = serde_json::to_value(Message::ArchiveKeyEntire(ArchiveKeyEntire {
        message_id: RequestId::new(1),
        segment: descriptor(),
    }))
    .unwrap();
    json["segment-md5"] = serde_json::Value::from("AAAA");
    assert!(serde_json::from_value::<Message>(json).is_err());
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn request_envelope_preserves_edge_values(
            id in any::<u128>(),
            tenant in any::<u64>(),
            segment in prop_oneof![Just(0u8), Just(255u8), any::<u8>()],
            exchange_len in prop_oneof![Just(0usize), Just(MAX_FIELD_LEN), 0usize..64],
            routing_len in prop_oneof![Just(0usize), Just(MAX_FIELD_LEN), 0usize..64],
            key in proptest::collection::vec(any::<u8>(), 0..64),
            version in any::<u32>(),
        ) {
            let request = DatabaseRequest {
                request_id: RequestId::new(id),
                tenant_id: TenantId::new(tenant),
                segment_number: segment,
                reply_exchange: "e".repeat(exchange_len),
                reply_routing_header: "r".repeat(routing_len),
                key: Bytes::from(key),
                operation: DatabaseOperation::Delete {
                    version_number: version,
                    timestamp: Timestamp::from_nanos(tenant ^ 0x5555),
                },
            };
            let mut buf = BytesMut::new();
            request.encode(&mut buf).unwrap();
            let decoded = DatabaseRequest::decode(buf.freeze()).unwrap();
            prop_assert_eq!(decoded, request);
        }

        #[test]
        fn truncated_envelopes_never_panic(cut in 0usize..60) {
            let request = DatabaseRequest {
                request_id: RequestId::new(3),
                tenant_id: TenantId::new(4),
                segment_number: 5,
                reply_exchange: "ex".into(),
                reply_routing_header: "rt".into(),
                key: Bytes::from_static(b"key"),
                operation: DatabaseOperation::Lookup { version_number: 1 },
            };
            let mut buf = BytesMut::new();
            request.encode(&mut buf).unwrap();
            let bytes = buf.freeze();
            let cut = cut.min(bytes.len() - 1);
            prop_assert!(DatabaseRequest::decode(bytes.slice(..cut)).is_err());
        }
    }
}
