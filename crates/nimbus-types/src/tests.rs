//! Unit tests for nimbus-types

use bytes::Bytes;

use super::*;

fn pointer(timestamp: u64, size: u64) -> ValueRecord {
    ValueRecord::DataPointer(DataPointer {
        timestamp: Timestamp::from_nanos(timestamp),
        segment_number: 3,
        segment_size: size,
        encoded_size: size + 16,
        total_size: size * 4,
        checksum_adler32: -12345,
        checksum_md5: [0xAB; 16],
    })
}

// ============================================================================
// Request IDs
// ============================================================================

#[test]
fn request_id_renders_32_lowercase_hex() {
    let id = RequestId::new(0xDEAD_BEEF);
    let text = id.to_string();
    assert_eq!(text.len(), 32);
    assert_eq!(text, "000000000000000000000000deadbeef");
    assert_eq!(text.parse::<RequestId>().unwrap(), id);
}

#[test]
fn request_id_rejects_wrong_length_and_non_hex() {
    assert_eq!(
        "abc".parse::<RequestId>(),
        Err(DecodeError::InvalidRequestId)
    );
    assert_eq!(
        "z".repeat(32).parse::<RequestId>(),
        Err(DecodeError::InvalidRequestId)
    );
    assert_eq!(
        "+0000000000000000000000000000001".parse::<RequestId>(),
        Err(DecodeError::InvalidRequestId)
    );
}

#[test]
fn request_id_random_is_unique() {
    let a = RequestId::random();
    let b = RequestId::random();
    assert_ne!(a, b);
}

#[test]
fn request_id_serializes_as_hex_string() {
    let id = RequestId::new(1);
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"00000000000000000000000000000001\"");
    let back: RequestId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn request_id_hex_bytes() {
    let id = RequestId::new(u128::MAX);
    let bytes = id.to_hex_bytes();
    assert_eq!(&bytes, "f".repeat(32).as_bytes());
    assert_eq!(RequestId::from_hex_bytes(&bytes).unwrap(), id);
    assert!(RequestId::from_hex_bytes(&bytes[..31]).is_err());
}

// ============================================================================
// Timestamps
// ============================================================================

#[test]
fn timestamp_now_is_after_epoch() {
    assert!(Timestamp::now() > Timestamp::ZERO);
}

// ============================================================================
// Segment keys
// ============================================================================

#[test]
fn segment_key_encoding_roundtrip_with_nul_bytes() {
    let key = SegmentKey::new(TenantId::new(42), Bytes::from_static(b"a\0b\0"), 7, 255);
    let encoded = key.encode();
    let decoded = SegmentKey::decode(TenantId::new(42), &encoded).unwrap();
    assert_eq!(decoded, key);
}

#[test]
fn segment_key_empty_key() {
    let key = SegmentKey::new(TenantId::new(1), Bytes::new(), 0, 0);
    let encoded = key.encode();
    assert_eq!(&encoded[..2], &KEY_TERMINATOR);
    assert_eq!(SegmentKey::decode(TenantId::new(1), &encoded).unwrap(), key);
}

#[test]
fn segment_key_shorter_key_sorts_first() {
    let short = SegmentKey::new(TenantId::new(1), Bytes::from_static(b"ab"), 9, 9).encode();
    let long = SegmentKey::new(TenantId::new(1), Bytes::from_static(b"ab\0"), 0, 0).encode();
    assert!(short < long);
}

#[test]
fn segment_key_decode_rejects_garbage() {
    assert_eq!(
        SegmentKey::decode(TenantId::new(1), b"abc"),
        Err(DecodeError::Truncated)
    );
    assert_eq!(
        SegmentKey::decode(TenantId::new(1), &[b'a', 0x00, 0x07]),
        Err(DecodeError::InvalidKeyEncoding)
    );
    assert_eq!(
        SegmentKey::decode(TenantId::new(1), &[b'a', 0x00, 0x01, 0, 0]),
        Err(DecodeError::InvalidKeyEncoding)
    );
}

// ============================================================================
// Records
// ============================================================================

#[test]
fn record_sizes() {
    assert_eq!(pointer(1, 1000).size(), 1000);
    let tombstone = ValueRecord::Tombstone {
        timestamp: Timestamp::from_nanos(5),
    };
    assert_eq!(tombstone.size(), 0);
    assert!(tombstone.is_tombstone());
    assert_eq!(tombstone.timestamp(), Timestamp::from_nanos(5));
}

#[test]
fn record_codec_data_pointer() {
    let record = pointer(99, 2000);
    let bytes = record.to_vec();
    assert_eq!(bytes.len(), record.encoded_len());
    assert_eq!(bytes[0], RECORD_TAG_DATA);
    assert_eq!(ValueRecord::from_slice(&bytes).unwrap(), record);
}

#[test]
fn record_codec_rejects_unknown_tag_and_truncation() {
    let mut bytes = pointer(1, 1).to_vec();
    assert_eq!(
        ValueRecord::from_slice(&bytes[..20]),
        Err(DecodeError::Truncated)
    );
    bytes[0] = 9;
    assert_eq!(ValueRecord::from_slice(&bytes), Err(DecodeError::UnknownTag(9)));
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn encoded_key_order_matches_tuple_order(
            a in proptest::collection::vec(any::<u8>(), 0..12),
            b in proptest::collection::vec(any::<u8>(), 0..12),
            va in any::<u32>(),
            vb in any::<u32>(),
            sa in any::<u8>(),
            sb in any::<u8>(),
        ) {
            let ka = SegmentKey::new(TenantId::new(1), a.clone(), va, sa);
            let kb = SegmentKey::new(TenantId::new(1), b.clone(), vb, sb);
            let by_tuple = (a, va, sa).cmp(&(b, vb, sb));
            prop_assert_eq!(ka.encode().cmp(&kb.encode()), by_tuple);
        }

        #[test]
        fn escaped_prefix_is_byte_prefix(
            key in proptest::collection::vec(any::<u8>(), 0..16),
            cut in 0usize..16,
            version in any::<u32>(),
        ) {
            let cut = cut.min(key.len());
            let prefix = SegmentKey::encode_prefix(&key[..cut]);
            let encoded = SegmentKey::new(TenantId::new(1), key.clone(), version, 0).encode();
            prop_assert!(encoded.starts_with(&prefix));
        }

        #[test]
        fn tombstone_codec(ts in any::<u64>()) {
            let record = ValueRecord::Tombstone { timestamp: Timestamp::from_nanos(ts) };
            prop_assert_eq!(ValueRecord::from_slice(&record.to_vec()).unwrap(), record);
        }
    }
}
