//! Data writer: stores segment bytes and their metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use nimbus_client::SpaceAccountingClient;
use nimbus_store::{CacheManager, InsertOutcome, SegmentRepository};
use nimbus_types::{DataPointer, NodeName, RequestId, SegmentKey, TenantId, Timestamp, ValueRecord};
use nimbus_wire::message::{
    ArchiveKeyChunkReply, ArchiveKeyEntire, ArchiveKeyFinal, ArchiveKeyFinalReply,
    ArchiveKeyNext, ArchiveKeyStart, DestroyKey, DestroyKeyReply,
};
use nimbus_wire::{MAX_DATA_SIZE, Message, MessageEnvelope, ReplyStatus, SegmentDescriptor, WireFrame};
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::service::{Service, unexpected, verify_md5};

/// Unfinished multi-message archives are dropped after this long.
pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// A multi-message archive between `start` and `final`.
#[derive(Debug)]
struct PendingArchive {
    tenant_id: TenantId,
    key: String,
    version_number: u32,
    segment_number: u8,
    timestamp: Timestamp,
    next_sequence: u32,
    data: BytesMut,
    last_chunk: Instant,
}

/// Handles `archive-key-*` and `destroy-key`.
///
/// A segment's bytes are written to the [`SegmentRepository`] first, then
/// its [`DataPointer`] is inserted into the collection. Written and removed
/// byte counts are reported to space accounting when configured.
#[derive(Debug)]
pub struct WriterService {
    node: NodeName,
    cache: Arc<CacheManager>,
    repository: SegmentRepository,
    accounting: Option<SpaceAccountingClient>,
    archives: HashMap<RequestId, PendingArchive>,
    archive_timeout: Duration,
}

impl WriterService {
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
            archives: HashMap::new(),
            archive_timeout: DEFAULT_ARCHIVE_TIMEOUT,
        }
    }

    pub fn with_archive_timeout(mut self, timeout: Duration) -> Self {
        self.archive_timeout = timeout;
        self
    }

    /// Number of multi-message archives in progress.
    pub fn pending_archives(&self) -> usize {
        self.archives.len()
    }

    /// Stores one whole segment. Returns the size of the value it replaced.
    ///
    /// A segment older than the stored record is acknowledged but leaves
    /// neither a file nor an accounting event behind.
    pub fn archive(&self, segment: &SegmentDescriptor, data: &[u8]) -> ServerResult<u64> {
        check_size(data.len())?;
        let key = segment.segment_key();
        verify_md5(&key, data, &segment.segment_md5)?;

        self.repository.write(&key, segment.timestamp, data)?;

        let record = ValueRecord::DataPointer(DataPointer {
            timestamp: segment.timestamp,
            segment_number: segment.segment_number,
            segment_size: data.len() as u64,
            encoded_size: data.len() as u64,
            total_size: segment.total_size,
            checksum_adler32: segment.segment_adler32,
            checksum_md5: segment.segment_md5,
        });
        let store = self.cache.acquire(&self.node, segment.tenant_id)?;
        let outcome = store.upsert(&key, &record)?;
        drop(store);

        match outcome {
            InsertOutcome::Applied { previous_size } => {
                debug!(
                    key = %key,
                    timestamp = %segment.timestamp,
                    bytes = data.len(),
                    previous_size,
                    "archived segment"
                );
                self.report(|accounting| {
                    accounting.added(segment.tenant_id, segment.timestamp, data.len() as u64)
                });
                Ok(previous_size)
            }
            InsertOutcome::Ignored { current } => {
                // A replay of the current write shares its file.
                if current != segment.timestamp {
                    self.repository.remove(&key, segment.timestamp)?;
                }
                debug!(key = %key, timestamp = %segment.timestamp, %current, "stale segment ignored");
                Ok(0)
            }
        }
    }

    /// Writes a tombstone. Returns the size of the value it replaced.
    pub fn destroy(&self, request: &DestroyKey) -> ServerResult<u64> {
        let key = SegmentKey::new(
            request.tenant_id,
            Bytes::from(request.key.clone().into_bytes()),
            request.version_number,
            request.segment_number,
        );
        let store = self.cache.acquire(&self.node, request.tenant_id)?;
        let previous_size = store.delete(&key, request.timestamp)?;
        drop(store);

        info!(key = %key, timestamp = %request.timestamp, previous_size, "destroyed key");
        if previous_size > 0 {
            self.report(|accounting| {
                accounting.removed(request.tenant_id, request.timestamp, previous_size)
            });
        }
        Ok(previous_size)
    }

    fn start(&mut self, request: &ArchiveKeyStart, data: Bytes) -> ServerResult<()> {
        if self.archives.contains_key(&request.archive_id) {
            return Err(ServerError::InvalidRequest(format!(
                "archive {} already started",
                request.archive_id
            )));
        }
        if request.sequence != 0 {
            return Err(ServerError::OutOfSequence {
                archive_id: request.archive_id,
                expected: 0,
                actual: request.sequence,
            });
        }

        check_size(data.len())?;

        let mut buffer = BytesMut::with_capacity(data.len());
        buffer.extend_from_slice(&data);
        self.archives.insert(
            request.archive_id,
            PendingArchive {
                tenant_id: request.tenant_id,
                key: request.key.clone(),
                version_number: request.version_number,
                segment_number: request.segment_number,
                timestamp: request.timestamp,
                next_sequence: 1,
                data: buffer,
                last_chunk: Instant::now(),
            },
        );
        debug!(archive_id = %request.archive_id, key = %request.key, "archive started");
        Ok(())
    }

    /// Appends a chunk. A chunk out of order, or one that would take the
    /// segment past [`MAX_DATA_SIZE`], abandons the archive.
    fn append(&mut self, archive_id: RequestId, sequence: u32, data: &[u8]) -> ServerResult<()> {
        let Some(archive) = self.archives.get_mut(&archive_id) else {
            return Err(ServerError::InvalidRequest(format!("unknown archive {archive_id}")));
        };
        if sequence != archive.next_sequence {
            let expected = archive.next_sequence;
            self.archives.remove(&archive_id);
            return Err(ServerError::OutOfSequence {
                archive_id,
                expected,
                actual: sequence,
            });
        }
        if let Err(e) = check_size(archive.data.len() + data.len()) {
            self.archives.remove(&archive_id);
            return Err(e);
        }
        archive.data.extend_from_slice(data);
        archive.next_sequence += 1;
        archive.last_chunk = Instant::now();
        Ok(())
    }

    fn finish(&mut self, request: &ArchiveKeyFinal, data: &[u8]) -> ServerResult<u64> {
        self.append(request.archive_id, request.sequence, data)?;
        let Some(archive) = self.archives.remove(&request.archive_id) else {
            return Err(ServerError::InvalidRequest(format!(
                "unknown archive {}",
                request.archive_id
            )));
        };

        let segment = SegmentDescriptor {
            tenant_id: archive.tenant_id,
            key: archive.key,
            version_number: archive.version_number,
            segment_number: archive.segment_number,
            timestamp: archive.timestamp,
            total_size: request.total_size,
            file_adler32: request.file_adler32,
            file_md5: request.file_md5,
            segment_adler32: request.segment_adler32,
            segment_md5: request.segment_md5,
        };
        self.archive(&segment, &archive.data)
    }

    fn report(&self, event: impl FnOnce(&SpaceAccountingClient) -> nimbus_client::ClientResult<()>) {
        if let Some(accounting) = &self.accounting {
            if let Err(e) = event(accounting) {
                warn!(error = %e, "space accounting event lost");
            }
        }
    }

    fn chunk_reply(message_id: RequestId, outcome: ServerResult<()>) -> ArchiveKeyChunkReply {
        ArchiveKeyChunkReply {
            message_id,
            status: status_of(&outcome),
        }
    }
}

/// A segment has to fit in one reader reply.
fn check_size(size: usize) -> ServerResult<()> {
    if size > MAX_DATA_SIZE {
        return Err(ServerError::TooLarge {
            size,
            max: MAX_DATA_SIZE,
        });
    }
    Ok(())
}

fn status_of<T>(outcome: &ServerResult<T>) -> ReplyStatus {
    match outcome {
        Ok(_) => ReplyStatus::success(),
        Err(e) => {
            warn!(error = %e, "write request failed");
            ReplyStatus::failure(e.reply_result(), e.to_string())
        }
    }
}

fn final_reply(message_id: RequestId, outcome: ServerResult<u64>) -> Message {
    let status = status_of(&outcome);
    Message::ArchiveKeyFinalReply(ArchiveKeyFinalReply {
        message_id,
        status,
        previous_size: outcome.unwrap_or(0),
    })
}

impl Service for WriterService {
    fn name(&self) -> &'static str {
        "data-writer"
    }

    fn handle(&mut self, request: WireFrame) -> Option<WireFrame> {
        let (message, data) = match request {
            WireFrame::Message(MessageEnvelope { message, data }) => (message, data),
            other => return unexpected(self.name(), &other),
        };

        let reply = match message {
            Message::ArchiveKeyEntire(ArchiveKeyEntire {
                message_id,
                segment,
            }) => final_reply(message_id, self.archive(&segment, &data)),
            Message::ArchiveKeyStart(start) => {
                let outcome = self.start(&start, data);
                Message::ArchiveKeyStartReply(Self::chunk_reply(start.message_id, outcome))
            }
            Message::ArchiveKeyNext(ArchiveKeyNext {
                message_id,
                archive_id,
                sequence,
            }) => {
                let outcome = self.append(archive_id, sequence, &data);
                Message::ArchiveKeyNextReply(Self::chunk_reply(message_id, outcome))
            }
            Message::ArchiveKeyFinal(request) => {
                let outcome = self.finish(&request, &data);
                final_reply(request.message_id, outcome)
            }
            Message::DestroyKey(request) => {
                let outcome = self.destroy(&request);
                Message::DestroyKeyReply(DestroyKeyReply {
                    message_id: request.message_id,
                    status: status_of(&outcome),
                    previous_size: outcome.unwrap_or(0),
                })
            }
            other => {
                return unexpected(self.name(), &WireFrame::from(other));
            }
        };
        Some(WireFrame::from(reply))
    }

    fn tick(&mut self) {
        let timeout = self.archive_timeout;
        let before = self.archives.len();
        self.archives
            .retain(|_, archive| archive.last_chunk.elapsed() <= timeout);
        let expired = before - self.archives.len();
        if expired > 0 {
            warn!(expired, "abandoned unfinished archives");
        }
    }
}
