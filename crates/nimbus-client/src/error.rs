//! Client error types.

use nimbus_types::{NodeName, RequestId};
use nimbus_wire::{ReplyResult, WireError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// Endpoint string could not be parsed.
    #[error("invalid endpoint {0:?}: expected tcp://host:port or ipc:///path")]
    InvalidEndpoint(String),

    /// The remote service is not reachable right now.
    #[error("destination {node} unreachable")]
    DestinationUnreachable { node: NodeName },

    /// No reply arrived within the deadline. The remote operation may still
    /// have been applied.
    #[error("request {request_id} timed out")]
    TimedOut { request_id: RequestId },

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The client has been shut down.
    #[error("client closed")]
    Closed,

    /// A reply of the wrong kind arrived.
    #[error("unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: String,
    },

    /// The remote service answered with a failure result.
    #[error("remote error ({result}): {message}")]
    Remote { result: ReplyResult, message: String },
}

impl ClientError {
    pub fn remote(result: ReplyResult, message: impl Into<String>) -> Self {
        Self::Remote {
            result,
            message: message.into(),
        }
    }

    /// Returns true if the error means the destination could not be
    /// reached, as opposed to the destination rejecting the request.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ClientError::DestinationUnreachable { .. }
                | ClientError::ConnectionClosed
                | ClientError::Io(_)
        )
    }
}

/// Errors from waiting on a [`Completion`](crate::Completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CorrelationError {
    /// The deadline passed first. The slot is gone; a late reply is
    /// discarded as unmatched.
    #[error("request {request_id} timed out")]
    TimedOut { request_id: RequestId },

    /// The slot was dropped without a reply.
    #[error("request {request_id} abandoned")]
    Closed { request_id: RequestId },
}

impl From<CorrelationError> for ClientError {
    fn from(e: CorrelationError) -> Self {
        match e {
            CorrelationError::TimedOut { request_id } => ClientError::TimedOut { request_id },
            CorrelationError::Closed { .. } => ClientError::Closed,
        }
    }
}
