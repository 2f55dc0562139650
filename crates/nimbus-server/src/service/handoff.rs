//! Handoff server: holds segments for unreachable nodes.

use std::sync::Arc;

use bytes::Bytes;
use nimbus_handoff::{HandoffRecord, HandoffStore};
use nimbus_wire::message::{HintedHandoff, HintedHandoffReply};
use nimbus_wire::{Message, MessageEnvelope, ReplyStatus, WireFrame};
use tracing::{info, warn};

use crate::error::ServerResult;
use crate::service::{Service, unexpected, verify_md5};

/// Handles `hinted-handoff` by storing a pending [`HandoffRecord`]. The
/// node's replayer delivers it later.
#[derive(Debug)]
pub struct HandoffService {
    store: Arc<HandoffStore>,
}

impl HandoffService {
    pub fn new(store: Arc<HandoffStore>) -> Self {
        Self { store }
    }

    /// Accepts a segment. Accepting the same write twice is not an error.
    pub fn accept(&self, request: HintedHandoff, data: Bytes) -> ServerResult<()> {
        let key = request.segment.segment_key();
        verify_md5(&key, &data, &request.segment.segment_md5)?;

        let record = HandoffRecord::new(request.original_destination, request.segment, data);
        if self.store.accept(&record)? {
            info!(
                original_destination = %record.original_destination,
                key = %key,
                timestamp = %record.segment.timestamp,
                "holding segment for unreachable node"
            );
        }
        Ok(())
    }
}

impl Service for HandoffService {
    fn name(&self) -> &'static str {
        "handoff-server"
    }

    fn handle(&mut self, request: WireFrame) -> Option<WireFrame> {
        let (request, data) = match request {
            WireFrame::Message(MessageEnvelope {
                message: Message::HintedHandoff(request),
                data,
            }) => (request, data),
            other => return unexpected(self.name(), &other),
        };

        let message_id = request.message_id;
        let status = match self.accept(request, data) {
            Ok(()) => ReplyStatus::success(),
            Err(e) => {
                warn!(error = %e, "hinted handoff refused");
                ReplyStatus::failure(e.reply_result(), e.to_string())
            }
        };
        Some(WireFrame::from(Message::HintedHandoffReply(HintedHandoffReply {
            message_id,
            status,
        })))
    }
}
