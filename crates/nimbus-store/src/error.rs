//! Error types for store operations.

use std::io;

use nimbus_types::{DecodeError, TenantId};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
///
/// A key that was never written is not an error: lookups return `None`.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Filesystem I/O error.
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),

    /// Underlying database failure.
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    /// A collection's database could not be opened.
    ///
    /// Fatal for requests against that collection only.
    #[error("collection {collection} unavailable: {reason}")]
    Unavailable { collection: String, reason: String },

    /// A stored record or key failed to decode.
    #[error("corrupt record: {0}")]
    Corrupt(#[from] DecodeError),

    /// The key belongs to a different tenant than the store.
    #[error("key for tenant {key_tenant} used on collection of tenant {store_tenant}")]
    TenantMismatch {
        store_tenant: TenantId,
        key_tenant: TenantId,
    },

    /// The cache has been shut down.
    #[error("cache manager is shut down")]
    ShutDown,

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Storage(e.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Storage(e.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Storage(e.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Storage(e.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Storage(e.into())
    }
}

impl StoreError {
    /// Returns true if the collection could not be reached at all, as
    /// opposed to an operation failing on an open collection.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::ShutDown)
    }
}
