//! # nimbus-types: Core types for the nimbus storage node
//!
//! This crate contains shared types used across the storage node:
//! - Entity IDs ([`TenantId`], [`NodeName`], [`RequestId`])
//! - Time ([`Timestamp`])
//! - Segment addressing ([`SegmentKey`]) with an order-preserving storage encoding
//! - Segment metadata ([`ValueRecord`], [`DataPointer`]) and its binary codec

use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod key;
mod record;

pub use key::{KEY_TERMINATOR, SegmentKey};
pub use record::{DataPointer, DecodeError, RECORD_TAG_DATA, RECORD_TAG_TOMBSTONE, ValueRecord};

#[cfg(test)]
mod tests;

// ============================================================================
// Entity IDs
// ============================================================================

/// Identifier of the logical owner of stored objects (the "avatar").
///
/// Each tenant owns one collection (database) per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(u64);

impl TenantId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TenantId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TenantId> for u64 {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// Name of a node in the static cluster node list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Request IDs
// ============================================================================

/// Number of hex characters in the textual form of a [`RequestId`].
pub const REQUEST_ID_HEX_LEN: usize = 32;

/// 128-bit request identifier used to correlate replies with requests.
///
/// The textual form is always 32 lowercase hex characters, which is also how
/// the id is carried in the binary envelope header and in JSON messages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RequestId(u128);

impl RequestId {
    pub fn new(id: u128) -> Self {
        Self(id)
    }

    /// Generates a random id from a v4 UUID.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().as_u128())
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Returns the 32-character hex form as ASCII bytes.
    pub fn to_hex_bytes(&self) -> [u8; REQUEST_ID_HEX_LEN] {
        let mut out = [0u8; REQUEST_ID_HEX_LEN];
        out.copy_from_slice(format!("{:032x}", self.0).as_bytes());
        out
    }

    /// Parses the 32-character hex form.
    pub fn from_hex_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != REQUEST_ID_HEX_LEN {
            return Err(DecodeError::InvalidRequestId);
        }
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidRequestId)?;
        text.parse()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({:032x})", self.0)
    }
}

impl FromStr for RequestId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != REQUEST_ID_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DecodeError::InvalidRequestId);
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| DecodeError::InvalidRequestId)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Time
// ============================================================================

/// Wall-clock time in nanoseconds since the Unix epoch.
///
/// Record supersession compares timestamps, never arrival order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Current wall-clock time. Clocks set before the epoch read as zero.
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
