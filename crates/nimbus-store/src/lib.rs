//! # nimbus-store: Segment metadata storage for a nimbus node
//!
//! - [`SegmentStore`]: ordered per-collection database of [`ValueRecord`]s,
//!   keyed by [`SegmentKey`], with supersession by timestamp.
//! - [`CacheManager`]: LRU pool of open stores, one per (node, tenant).
//! - [`SegmentRepository`]: the segment bytes the records point to.
//!
//! [`ValueRecord`]: nimbus_types::ValueRecord
//! [`SegmentKey`]: nimbus_types::SegmentKey

mod cache;
mod error;
mod repository;
mod store;

pub use cache::{CacheConfig, CacheManager, CollectionKey, DEFAULT_CACHE_CAPACITY, StoreHandle};
pub use error::{StoreError, StoreResult};
pub use repository::SegmentRepository;
pub use store::{InsertOutcome, ListPage, SegmentStore};

#[cfg(test)]
mod tests;
