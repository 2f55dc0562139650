//! Handoff error types.

use nimbus_client::ClientError;
use nimbus_types::NodeName;
use nimbus_wire::ReplyResult;
use thiserror::Error;

/// Result type for handoff operations.
pub type HandoffResult<T> = Result<T, HandoffError>;

#[derive(Debug, Error)]
pub enum HandoffError {
    /// Transport or correlation failure talking to another node.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Filesystem I/O error.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    /// Handoff database failure.
    #[error("handoff storage error: {0}")]
    Storage(#[from] redb::Error),

    /// A stored handoff record could not be encoded or decoded.
    #[error("handoff record serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// No link is configured for the node.
    #[error("unknown node {0}")]
    UnknownNode(NodeName),

    /// Fewer backups than required accepted the write.
    #[error("handoff needs {needed} backups, only {accepted} accepted")]
    InsufficientBackups { needed: usize, accepted: usize },

    /// The remote service processed the request and refused it.
    #[error("{node} rejected request ({result}): {message}")]
    Rejected {
        node: NodeName,
        result: ReplyResult,
        message: String,
    },

    /// The remote service answered with the wrong message kind.
    #[error("{node} sent unexpected reply {kind}")]
    UnexpectedReply { node: NodeName, kind: String },
}

impl From<redb::DatabaseError> for HandoffError {
    fn from(e: redb::DatabaseError) -> Self {
        HandoffError::Storage(e.into())
    }
}

impl From<redb::TransactionError> for HandoffError {
    fn from(e: redb::TransactionError) -> Self {
        HandoffError::Storage(e.into())
    }
}

impl From<redb::TableError> for HandoffError {
    fn from(e: redb::TableError) -> Self {
        HandoffError::Storage(e.into())
    }
}

impl From<redb::StorageError> for HandoffError {
    fn from(e: redb::StorageError) -> Self {
        HandoffError::Storage(e.into())
    }
}

impl From<redb::CommitError> for HandoffError {
    fn from(e: redb::CommitError) -> Self {
        HandoffError::Storage(e.into())
    }
}
