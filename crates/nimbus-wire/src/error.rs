//! Wire protocol error types.

use nimbus_types::DecodeError;
use thiserror::Error;

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur during wire protocol operations.
///
/// Framing errors leave the byte stream in an unknown state and the
/// connection must be closed. Payload errors ([`WireError::is_framing`]
/// returns false) only invalidate the one frame.
#[derive(Debug, Error)]
pub enum WireError {
    /// Invalid magic bytes in frame header.
    #[error("invalid magic: expected 0x4e494d42, got 0x{0:08x}")]
    InvalidMagic(u32),

    /// Unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Frame kind byte not recognized.
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    /// Payload exceeds maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u32 },

    /// Checksum mismatch.
    #[error("checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The payload of an intact frame could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A length-prefixed field does not fit its u16 prefix.
    #[error("field {field} too long: {len} bytes (max 65535)")]
    FieldTooLong { field: &'static str, len: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Returns true if the error corrupts the framing of the stream.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            WireError::InvalidMagic(_)
                | WireError::UnsupportedVersion(_)
                | WireError::UnknownKind(_)
                | WireError::PayloadTooLarge { .. }
                | WireError::ChecksumMismatch { .. }
                | WireError::Io(_)
        )
    }
}

impl From<DecodeError> for WireError {
    fn from(e: DecodeError) -> Self {
        WireError::Malformed(e.to_string())
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Malformed(e.to_string())
    }
}
