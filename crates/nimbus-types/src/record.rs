//! Segment metadata records and their binary codec.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Timestamp;

/// Tag byte of an encoded [`ValueRecord::DataPointer`].
pub const RECORD_TAG_DATA: u8 = 1;

/// Tag byte of an encoded [`ValueRecord::Tombstone`].
pub const RECORD_TAG_TOMBSTONE: u8 = 2;

const DATA_BODY_LEN: usize = 1 + 8 + 8 + 8 + 8 + 16;

/// Errors from decoding records, keys, and request ids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record truncated")]
    Truncated,

    #[error("unknown record tag: {0}")]
    UnknownTag(u8),

    #[error("invalid segment key encoding")]
    InvalidKeyEncoding,

    #[error("request id must be 32 hex characters")]
    InvalidRequestId,
}

/// Points to durably stored segment bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPointer {
    pub timestamp: Timestamp,
    pub segment_number: u8,
    pub segment_size: u64,
    pub encoded_size: u64,
    pub total_size: u64,
    pub checksum_adler32: i64,
    pub checksum_md5: [u8; 16],
}

/// The current metadata for one segment slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueRecord {
    DataPointer(DataPointer),
    /// Logical deletion as of `timestamp`.
    Tombstone { timestamp: Timestamp },
}

impl ValueRecord {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            ValueRecord::DataPointer(p) => p.timestamp,
            ValueRecord::Tombstone { timestamp } => *timestamp,
        }
    }

    /// Size accounted to this record when it is superseded.
    pub fn size(&self) -> u64 {
        match self {
            ValueRecord::DataPointer(p) => p.segment_size,
            ValueRecord::Tombstone { .. } => 0,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, ValueRecord::Tombstone { .. })
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            ValueRecord::DataPointer(_) => 1 + 8 + DATA_BODY_LEN,
            ValueRecord::Tombstone { .. } => 1 + 8,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            ValueRecord::DataPointer(p) => {
                buf.put_u8(RECORD_TAG_DATA);
                buf.put_u64(p.timestamp.as_nanos());
                buf.put_u8(p.segment_number);
                buf.put_u64(p.segment_size);
                buf.put_u64(p.encoded_size);
                buf.put_u64(p.total_size);
                buf.put_i64(p.checksum_adler32);
                buf.put_slice(&p.checksum_md5);
            }
            ValueRecord::Tombstone { timestamp } => {
                buf.put_u8(RECORD_TAG_TOMBSTONE);
                buf.put_u64(timestamp.as_nanos());
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Decodes one record, advancing `buf` past it.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < 9 {
            return Err(DecodeError::Truncated);
        }
        let tag = buf.get_u8();
        let timestamp = Timestamp::from_nanos(buf.get_u64());
        match tag {
            RECORD_TAG_DATA => {
                if buf.remaining() < DATA_BODY_LEN {
                    return Err(DecodeError::Truncated);
                }
                let segment_number = buf.get_u8();
                let segment_size = buf.get_u64();
                let encoded_size = buf.get_u64();
                let total_size = buf.get_u64();
                let checksum_adler32 = buf.get_i64();
                let mut checksum_md5 = [0u8; 16];
                buf.copy_to_slice(&mut checksum_md5);
                Ok(ValueRecord::DataPointer(DataPointer {
                    timestamp,
                    segment_number,
                    segment_size,
                    encoded_size,
                    total_size,
                    checksum_adler32,
                    checksum_md5,
                }))
            }
            RECORD_TAG_TOMBSTONE => Ok(ValueRecord::Tombstone { timestamp }),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }

    pub fn from_slice(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&mut bytes)
    }
}
