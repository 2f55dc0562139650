//! Server error types.

use nimbus_client::{ClientError, Endpoint};
use nimbus_handoff::HandoffError;
use nimbus_store::StoreError;
use nimbus_types::{RequestId, SegmentKey};
use nimbus_wire::{ReplyResult, WireError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Metadata store or segment file error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Handoff store or placement error.
    #[error("handoff error: {0}")]
    Handoff(#[from] HandoffError),

    /// Outbound connection error.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind a service endpoint.
    #[error("failed to bind {endpoint}: {source}")]
    BindFailed {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    /// Invalid node or cluster configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The slot was never written.
    #[error("{0} not found")]
    NotFound(SegmentKey),

    /// The slot's current record is a tombstone.
    #[error("{0} is deleted")]
    KeyDeleted(SegmentKey),

    /// Segment bytes do not match their MD5 digest.
    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(SegmentKey),

    /// A record points at a segment file that is not there.
    #[error("segment file missing for {0}")]
    MissingSegment(SegmentKey),

    /// A chunk of a multi-message archive arrived out of order.
    #[error("archive {archive_id}: expected sequence {expected}, got {actual}")]
    OutOfSequence {
        archive_id: RequestId,
        expected: u32,
        actual: u32,
    },

    /// A segment or reply would not fit in one frame.
    #[error("{size} bytes exceeds the limit of {max}")]
    TooLarge { size: usize, max: usize },

    /// The request is well formed but cannot be served.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A service thread stopped unexpectedly.
    #[error("{0} stopped unexpectedly")]
    ServiceStopped(String),
}

impl ServerError {
    /// The result code reported to the requester.
    pub fn reply_result(&self) -> ReplyResult {
        match self {
            ServerError::Store(e) if e.is_unavailable() => ReplyResult::StorageUnavailable,
            ServerError::Store(_) => ReplyResult::StorageError,
            ServerError::Handoff(_) | ServerError::Io(_) | ServerError::MissingSegment(_) => {
                ReplyResult::StorageError
            }
            ServerError::NotFound(_) => ReplyResult::NotFound,
            ServerError::KeyDeleted(_) => ReplyResult::KeyDeleted,
            ServerError::ChecksumMismatch(_) => ReplyResult::ChecksumMismatch,
            ServerError::OutOfSequence { .. } => ReplyResult::OutOfSequence,
            ServerError::InvalidRequest(_) | ServerError::Wire(_) | ServerError::TooLarge { .. } => {
                ReplyResult::InvalidRequest
            }
            ServerError::Client(_)
            | ServerError::BindFailed { .. }
            | ServerError::Config(_)
            | ServerError::ServiceStopped(_) => ReplyResult::InternalError,
        }
    }
}
