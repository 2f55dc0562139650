//! Data reader: returns verified segment bytes.

use std::sync::Arc;

use bytes::Bytes;
use nimbus_client::SpaceAccountingClient;
use nimbus_store::{CacheManager, SegmentRepository};
use nimbus_types::{NodeName, SegmentKey, Timestamp, ValueRecord};
use nimbus_wire::message::{RetrieveKeyEntire, RetrieveKeyEntireReply};
use nimbus_wire::{Message, MessageEnvelope, ReplyStatus, WireFrame};
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};
use crate::service::{Service, unexpected, verify_md5};

/// Handles `retrieve-key-entire`.
///
/// The segment bytes are checked against the MD5 recorded at archive time
/// before they are returned; a mismatch is reported, never retried here.
#[derive(Debug)]
pub struct ReaderService {
    node: NodeName,
    cache: Arc<CacheManager>,
    repository: SegmentRepository,
    accounting: Option<SpaceAccountingClient>,
}

impl ReaderService {
    pub fn new(
        node: NodeName,
        cache: Arc<CacheManager>,
        repository: SegmentRepository,
        accounting: Option<SpaceAccountingClient>,
    ) -> Self {
        Self {
            node,
            cache,
            repository,
            accounting,
        }
    }

    /// Looks up the slot and reads its bytes.
    pub fn retrieve(&self, request: &RetrieveKeyEntire) -> ServerResult<(RetrieveKeyEntireReply, Bytes)> {
        let key = SegmentKey::new(
            request.tenant_id,
            Bytes::from(request.key.clone().into_bytes()),
            request.version_number,
            request.segment_number,
        );

        let store = self.cache.acquire(&self.node, request.tenant_id)?;
        let record = store.lookup(&key)?;
        drop(store);

        let pointer = match record {
            None => return Err(ServerError::NotFound(key)),
            Some(ValueRecord::Tombstone { .. }) => return Err(ServerError::KeyDeleted(key)),
            Some(ValueRecord::DataPointer(pointer)) => pointer,
        };

        let Some(data) = self.repository.read(&key, pointer.timestamp)? else {
            return Err(ServerError::MissingSegment(key));
        };
        verify_md5(&key, &data, &pointer.checksum_md5)?;

        debug!(key = %key, timestamp = %pointer.timestamp, bytes = data.len(), "retrieved segment");
        if let Some(accounting) = &self.accounting {
            if let Err(e) = accounting.retrieved(request.tenant_id, Timestamp::now(), data.len() as u64)
            {
                warn!(error = %e, "space accounting event lost");
            }
        }

        let reply = RetrieveKeyEntireReply {
            message_id: request.message_id,
            status: ReplyStatus::success(),
            timestamp: Some(pointer.timestamp),
            segment_size: pointer.segment_size,
            total_size: pointer.total_size,
            segment_adler32: pointer.checksum_adler32,
            segment_md5: Some(pointer.checksum_md5),
        };
        Ok((reply, data))
    }
}

impl Service for ReaderService {
    fn name(&self) -> &'static str {
        "data-reader"
    }

    fn handle(&mut self, request: WireFrame) -> Option<WireFrame> {
        let request = match request {
            WireFrame::Message(MessageEnvelope {
                message: Message::RetrieveKeyEntire(request),
                ..
            }) => request,
            other => return unexpected(self.name(), &other),
        };

        let envelope = match self.retrieve(&request) {
            Ok((reply, data)) => {
                MessageEnvelope::with_data(Message::RetrieveKeyEntireReply(reply), data)
            }
            Err(e) => {
                match e {
                    ServerError::NotFound(_) | ServerError::KeyDeleted(_) => {
                        debug!(key = %request.key, error = %e, "retrieve miss");
                    }
                    _ => warn!(key = %request.key, error = %e, "retrieve failed"),
                }
                MessageEnvelope::new(Message::RetrieveKeyEntireReply(
                    RetrieveKeyEntireReply::failure(request.message_id, e.reply_result(), e.to_string()),
                ))
            }
        };
        Some(envelope.into())
    }
}
