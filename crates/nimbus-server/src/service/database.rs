//! Database server: binary-envelope access to the segment metadata store.

use std::sync::Arc;

use bytes::Bytes;
use nimbus_store::CacheManager;
use nimbus_types::{NodeName, SegmentKey};
use nimbus_wire::{
    DatabaseOperation, DatabaseReply, DatabaseRequest, ListEntry, MAX_PAYLOAD_SIZE, ReplyBody,
    WireFrame,
};
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};
use crate::service::{Service, unexpected};

/// Most entries one list reply carries. A limit of 0 means this many.
pub const MAX_LIST_ENTRIES: usize = 10_000;

/// Encoded entries of one list reply stop short of this, leaving room for the
/// envelope and the cursor.
pub const MAX_LIST_REPLY_BYTES: usize = MAX_PAYLOAD_SIZE as usize - 64 * 1024;

/// Serves insert, lookup, delete and list against this node's collections.
#[derive(Debug)]
pub struct DatabaseService {
    node: NodeName,
    cache: Arc<CacheManager>,
}

impl DatabaseService {
    pub fn new(node: NodeName, cache: Arc<CacheManager>) -> Self {
        Self { node, cache }
    }

    /// Executes one request.
    pub fn execute(&self, request: &DatabaseRequest) -> DatabaseReply {
        let operation = request.operation.code();
        match self.execute_inner(request) {
            Ok(body) => DatabaseReply::success(request.request_id, operation, body),
            Err(e) => {
                let result = e.reply_result();
                if matches!(e, ServerError::NotFound(_)) {
                    debug!(request_id = %request.request_id, error = %e, "lookup miss");
                } else {
                    warn!(
                        request_id = %request.request_id,
                        tenant = %request.tenant_id,
                        ?operation,
                        error = %e,
                        "database request failed"
                    );
                }
                DatabaseReply::failure(request.request_id, operation, result, e.to_string())
            }
        }
    }

    fn execute_inner(&self, request: &DatabaseRequest) -> ServerResult<ReplyBody> {
        let store = self.cache.acquire(&self.node, request.tenant_id)?;

        let body = match &request.operation {
            DatabaseOperation::Insert { record, .. } => {
                ReplyBody::PreviousSize(store.insert(&slot(request)?, record)?)
            }
            DatabaseOperation::Lookup { .. } => {
                let key = slot(request)?;
                match store.lookup(&key)? {
                    Some(record) => ReplyBody::Lookup(Some(record)),
                    None => return Err(ServerError::NotFound(key)),
                }
            }
            DatabaseOperation::Delete { timestamp, .. } => {
                ReplyBody::PreviousSize(store.delete(&slot(request)?, *timestamp)?)
            }
            DatabaseOperation::List { cursor, limit } => {
                let limit = match *limit as usize {
                    0 => MAX_LIST_ENTRIES,
                    n => n.min(MAX_LIST_ENTRIES),
                };
                let page = store.list(&request.key, cursor.as_deref(), limit)?;

                let mut entries = Vec::with_capacity(page.entries.len());
                let mut next_cursor = page.next_cursor.map(Bytes::from);
                let mut last_key = None;
                let mut reply_bytes = 0;
                for (key, record) in page.entries {
                    let encoded_key = key.encode();
                    let entry = ListEntry {
                        key: key.key,
                        version_number: key.version_number,
                        segment_number: key.segment_number,
                        record,
                    };
                    reply_bytes += entry.encoded_len();
                    if reply_bytes > MAX_LIST_REPLY_BYTES {
                        debug!(entries = entries.len(), "list reply cut at byte limit");
                        next_cursor = last_key.map(Bytes::from);
                        break;
                    }
                    last_key = Some(encoded_key);
                    entries.push(entry);
                }
                ReplyBody::List {
                    entries,
                    next_cursor,
                }
            }
        };
        Ok(body)
    }
}

fn slot(request: &DatabaseRequest) -> ServerResult<SegmentKey> {
    request
        .segment_key()
        .ok_or_else(|| ServerError::InvalidRequest("operation has no segment key".into()))
}

impl Service for DatabaseService {
    fn name(&self) -> &'static str {
        "database-server"
    }

    fn handle(&mut self, request: WireFrame) -> Option<WireFrame> {
        match request {
            WireFrame::DatabaseRequest(request) => Some(self.execute(&request).into()),
            other => unexpected(self.name(), &other),
        }
    }
}
