//! Segment addressing and its order-preserving storage encoding.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::TenantId;
use crate::record::DecodeError;

/// Two-byte sequence terminating the escaped object key in a stored key.
pub const KEY_TERMINATOR: [u8; 2] = [0x00, 0x01];

const ESCAPE: [u8; 2] = [0x00, 0xFF];

/// Identifies exactly one metadata slot: one segment of one version of one
/// object owned by one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub tenant_id: TenantId,
    pub key: Bytes,
    pub version_number: u32,
    pub segment_number: u8,
}

impl SegmentKey {
    pub fn new(
        tenant_id: TenantId,
        key: impl Into<Bytes>,
        version_number: u32,
        segment_number: u8,
    ) -> Self {
        Self {
            tenant_id,
            key: key.into(),
            version_number,
            segment_number,
        }
    }

    /// Encodes the storage key for this slot.
    ///
    /// The tenant is not part of the encoding: each tenant owns its own
    /// collection. Byte-wise order of the result equals
    /// `(key, version_number, segment_number)` order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.key.len() + 8);
        buf.put_slice(&Self::encode_prefix(&self.key));
        buf.put_slice(&KEY_TERMINATOR);
        buf.put_u32(self.version_number);
        buf.put_u8(self.segment_number);
        buf.to_vec()
    }

    /// Escapes an object-key prefix.
    ///
    /// The result is a byte prefix of the encoding of every key that starts
    /// with `prefix`.
    pub fn encode_prefix(prefix: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(prefix.len() + 2);
        for &b in prefix {
            if b == 0x00 {
                out.extend_from_slice(&ESCAPE);
            } else {
                out.push(b);
            }
        }
        out
    }

    /// Decodes a storage key produced by [`SegmentKey::encode`].
    pub fn decode(tenant_id: TenantId, encoded: &[u8]) -> Result<Self, DecodeError> {
        let mut key = Vec::with_capacity(encoded.len());
        let mut i = 0;
        loop {
            let b = *encoded.get(i).ok_or(DecodeError::Truncated)?;
            if b != 0x00 {
                key.push(b);
                i += 1;
                continue;
            }
            match encoded.get(i + 1) {
                Some(0xFF) => {
                    key.push(0x00);
                    i += 2;
                }
                Some(0x01) => {
                    i += 2;
                    break;
                }
                Some(_) => return Err(DecodeError::InvalidKeyEncoding),
                None => return Err(DecodeError::Truncated),
            }
        }

        let rest = &encoded[i..];
        if rest.len() != 5 {
            return Err(DecodeError::InvalidKeyEncoding);
        }
        let version_number = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let segment_number = rest[4];

        Ok(Self {
            tenant_id,
            key: Bytes::from(key),
            version_number,
            segment_number,
        })
    }
}

impl std::fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{}#{}",
            self.tenant_id,
            String::from_utf8_lossy(&self.key),
            self.version_number,
            self.segment_number
        )
    }
}
