//! # nimbus-handoff: Hinted handoff for unreachable nodes
//!
//! When a segment's primary node cannot be reached, the
//! [`HandoffCoordinator`] stores it at backup nodes instead. Each backup
//! keeps it in its [`HandoffStore`] and its [`HandoffReplayer`] delivers it
//! to the primary once the primary is back, then deletes the local copy.
//!
//! Nodes are reached through the [`Link`] trait, implemented by
//! [`nimbus_client::ResilientClient`].

mod coordinator;
mod error;
mod link;
mod replay;
mod store;

pub use coordinator::{
    DEFAULT_BACKUP_COUNT, DEFAULT_HOLDER_CAPACITY, HandoffConfig, HandoffCoordinator, Placement,
};
pub use error::{HandoffError, HandoffResult};
pub use link::{Link, LinkSet};
pub use replay::{HandoffReplayer, ReplayConfig, ReplayStats};
pub use store::{HandoffId, HandoffRecord, HandoffState, HandoffStore};

#[cfg(test)]
mod tests;
