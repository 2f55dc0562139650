//! Per-service request handlers.
//!
//! Each handler owns its state and is driven by one [`Dispatcher`] loop, so
//! handlers never need their own locking.
//!
//! [`Dispatcher`]: crate::Dispatcher

mod database;
mod handoff;
mod reader;
mod writer;

pub use database::DatabaseService;
pub use handoff::HandoffService;
pub use reader::ReaderService;
pub use writer::WriterService;

use nimbus_types::SegmentKey;
use nimbus_wire::WireFrame;
use tracing::warn;

use crate::error::{ServerError, ServerResult};

/// A request handler run by a [`Dispatcher`](crate::Dispatcher).
pub trait Service: Send {
    /// Short name for logs and thread names.
    fn name(&self) -> &'static str;

    /// Handles one inbound frame. Returns the reply, or `None` when the
    /// frame calls for none.
    fn handle(&mut self, request: WireFrame) -> Option<WireFrame>;

    /// Called once per loop turn.
    fn tick(&mut self) {}
}

/// Fails unless `data` hashes to `expected`.
pub(crate) fn verify_md5(key: &SegmentKey, data: &[u8], expected: &[u8; 16]) -> ServerResult<()> {
    if md5::compute(data).0 == *expected {
        Ok(())
    } else {
        Err(ServerError::ChecksumMismatch(key.clone()))
    }
}

/// Logs a frame the service has no handler for.
pub(crate) fn unexpected(service: &'static str, request: &WireFrame) -> Option<WireFrame> {
    warn!(service, kind = request.describe(), "ignoring unexpected request");
    None
}
