//! Binary request and reply envelopes for the database service.
//!
//! ```text
//! request:  request-id (32 hex) | tenant u64 | segment u8
//!           | u16 exchange | u16 routing-header | u16 key | op u8 | trailer
//! reply:    request-id (32 hex) | op u8 | result u8 | body or u16 error message
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nimbus_types::{REQUEST_ID_HEX_LEN, RequestId, SegmentKey, TenantId, Timestamp, ValueRecord};
use serde::{Deserialize, Serialize};

use crate::error::{WireError, WireResult};
use crate::frame::{Frame, FrameKind};

/// Largest value a u16 length prefix can describe.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

// ============================================================================
// Result codes
// ============================================================================

/// Outcome carried by every reply, binary or structured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ReplyResult {
    Success = 0,
    NotFound = 1,
    KeyDeleted = 2,
    StorageError = 3,
    StorageUnavailable = 4,
    ChecksumMismatch = 5,
    OutOfSequence = 6,
    InvalidRequest = 7,
    InternalError = 8,
}

impl ReplyResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ReplyResult::Success)
    }
}

impl TryFrom<u8> for ReplyResult {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ReplyResult::Success,
            1 => ReplyResult::NotFound,
            2 => ReplyResult::KeyDeleted,
            3 => ReplyResult::StorageError,
            4 => ReplyResult::StorageUnavailable,
            5 => ReplyResult::ChecksumMismatch,
            6 => ReplyResult::OutOfSequence,
            7 => ReplyResult::InvalidRequest,
            8 => ReplyResult::InternalError,
            other => return Err(WireError::Malformed(format!("unknown result code {other}"))),
        })
    }
}

impl std::fmt::Display for ReplyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ReplyResult::Success => "success",
            ReplyResult::NotFound => "not-found",
            ReplyResult::KeyDeleted => "key-deleted",
            ReplyResult::StorageError => "storage-error",
            ReplyResult::StorageUnavailable => "storage-unavailable",
            ReplyResult::ChecksumMismatch => "checksum-mismatch",
            ReplyResult::OutOfSequence => "out-of-sequence",
            ReplyResult::InvalidRequest => "invalid-request",
            ReplyResult::InternalError => "internal-error",
        };
        f.write_str(text)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Database operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationCode {
    Insert = 1,
    Lookup = 2,
    Delete = 3,
    List = 4,
}

impl TryFrom<u8> for OperationCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OperationCode::Insert),
            2 => Ok(OperationCode::Lookup),
            3 => Ok(OperationCode::Delete),
            4 => Ok(OperationCode::List),
            other => Err(WireError::Malformed(format!("unknown operation {other}"))),
        }
    }
}

/// Operation-specific trailer of a database request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseOperation {
    Insert {
        version_number: u32,
        record: ValueRecord,
    },
    Lookup {
        version_number: u32,
    },
    /// Writes a tombstone at `timestamp`.
    Delete {
        version_number: u32,
        timestamp: Timestamp,
    },
    /// Lists keys starting with the request key, resuming after `cursor`.
    List { cursor: Option<Bytes>, limit: u32 },
}

impl DatabaseOperation {
    pub fn code(&self) -> OperationCode {
        match self {
            DatabaseOperation::Insert { .. } => OperationCode::Insert,
            DatabaseOperation::Lookup { .. } => OperationCode::Lookup,
            DatabaseOperation::Delete { .. } => OperationCode::Delete,
            DatabaseOperation::List { .. } => OperationCode::List,
        }
    }
}

/// A request to the database service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRequest {
    pub request_id: RequestId,
    pub tenant_id: TenantId,
    pub segment_number: u8,
    pub reply_exchange: String,
    pub reply_routing_header: String,
    pub key: Bytes,
    pub operation: DatabaseOperation,
}

impl DatabaseRequest {
    /// The slot addressed by this request, for operations that name a version.
    pub fn segment_key(&self) -> Option<SegmentKey> {
        let version_number = match &self.operation {
            DatabaseOperation::Insert { version_number, .. }
            | DatabaseOperation::Lookup { version_number }
            | DatabaseOperation::Delete { version_number, .. } => *version_number,
            DatabaseOperation::List { .. } => return None,
        };
        Some(SegmentKey::new(
            self.tenant_id,
            self.key.clone(),
            version_number,
            self.segment_number,
        ))
    }

    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        buf.put_slice(&self.request_id.to_hex_bytes());
        buf.put_u64(self.tenant_id.as_u64());
        buf.put_u8(self.segment_number);
        put_field(buf, "reply-exchange", self.reply_exchange.as_bytes())?;
        put_field(buf, "reply-routing-header", self.reply_routing_header.as_bytes())?;
        put_field(buf, "key", &self.key)?;
        buf.put_u8(self.operation.code() as u8);
        match &self.operation {
            DatabaseOperation::Insert {
                version_number,
                record,
            } => {
                buf.put_u32(*version_number);
                record.encode(buf);
            }
            DatabaseOperation::Lookup { version_number } => buf.put_u32(*version_number),
            DatabaseOperation::Delete {
                version_number,
                timestamp,
            } => {
                buf.put_u32(*version_number);
                buf.put_u64(timestamp.as_nanos());
            }
            DatabaseOperation::List { cursor, limit } => {
                put_optional_field(buf, "cursor", cursor.as_deref())?;
                buf.put_u32(*limit);
            }
        }
        Ok(())
    }

    pub fn decode(mut buf: Bytes) -> WireResult<Self> {
        let request_id = get_request_id(&mut buf)?;
        need(&buf, 9)?;
        let tenant_id = TenantId::new(buf.get_u64());
        let segment_number = buf.get_u8();
        let reply_exchange = get_string(&mut buf, "reply-exchange")?;
        let reply_routing_header = get_string(&mut buf, "reply-routing-header")?;
        let key = get_field(&mut buf)?;
        need(&buf, 1)?;
        let operation = match OperationCode::try_from(buf.get_u8())? {
            OperationCode::Insert => {
                need(&buf, 4)?;
                let version_number = buf.get_u32();
                let record = ValueRecord::decode(&mut buf)?;
                DatabaseOperation::Insert {
                    version_number,
                    record,
                }
            }
            OperationCode::Lookup => {
                need(&buf, 4)?;
                DatabaseOperation::Lookup {
                    version_number: buf.get_u32(),
                }
            }
            OperationCode::Delete => {
                need(&buf, 12)?;
                DatabaseOperation::Delete {
                    version_number: buf.get_u32(),
                    timestamp: Timestamp::from_nanos(buf.get_u64()),
                }
            }
            OperationCode::List => {
                let cursor = get_optional_field(&mut buf)?;
                need(&buf, 4)?;
                DatabaseOperation::List {
                    cursor,
                    limit: buf.get_u32(),
                }
            }
        };
        expect_end(&buf)?;

        Ok(Self {
            request_id,
            tenant_id,
            segment_number,
            reply_exchange,
            reply_routing_header,
            key,
            operation,
        })
    }

    pub fn to_frame(&self) -> WireResult<Frame> {
        let mut buf = BytesMut::with_capacity(64 + self.key.len());
        self.encode(&mut buf)?;
        Frame::new(FrameKind::DatabaseRequest, buf.freeze())
    }
}

// ============================================================================
// Replies
// ============================================================================

/// One row of a list reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub key: Bytes,
    pub version_number: u32,
    pub segment_number: u8,
    pub record: ValueRecord,
}

impl ListEntry {
    /// Bytes this entry adds to an encoded list reply.
    pub fn encoded_len(&self) -> usize {
        4 + 1 + 2 + self.key.len() + self.record.encoded_len()
    }
}

/// Successful reply bodies, one per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// Insert and delete: size of the superseded record.
    PreviousSize(u64),
    Lookup(Option<ValueRecord>),
    List {
        entries: Vec<ListEntry>,
        next_cursor: Option<Bytes>,
    },
}

/// Failed reply: a non-success result and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFailure {
    pub result: ReplyResult,
    pub message: String,
}

/// A reply from the database service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseReply {
    pub request_id: RequestId,
    pub operation: OperationCode,
    pub outcome: Result<ReplyBody, ReplyFailure>,
}

impl DatabaseReply {
    pub fn success(request_id: RequestId, operation: OperationCode, body: ReplyBody) -> Self {
        Self {
            request_id,
            operation,
            outcome: Ok(body),
        }
    }

    pub fn failure(
        request_id: RequestId,
        operation: OperationCode,
        result: ReplyResult,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            operation,
            outcome: Err(ReplyFailure {
                result,
                message: message.into(),
            }),
        }
    }

    pub fn result(&self) -> ReplyResult {
        match &self.outcome {
            Ok(_) => ReplyResult::Success,
            Err(failure) => failure.result,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        buf.put_slice(&self.request_id.to_hex_bytes());
        buf.put_u8(self.operation as u8);
        buf.put_u8(self.result() as u8);

        match &self.outcome {
            Err(failure) => put_field(buf, "error-message", failure.message.as_bytes())?,
            Ok(body) => match (self.operation, body) {
                (OperationCode::Insert | OperationCode::Delete, ReplyBody::PreviousSize(size)) => {
                    buf.put_u64(*size);
                }
                (OperationCode::Lookup, ReplyBody::Lookup(record)) => match record {
                    Some(record) => {
                        buf.put_u8(1);
                        record.encode(buf);
                    }
                    None => buf.put_u8(0),
                },
                (
                    OperationCode::List,
                    ReplyBody::List {
                        entries,
                        next_cursor,
                    },
                ) => {
                    buf.put_u32(entries.len() as u32);
                    for entry in entries {
                        buf.put_u32(entry.version_number);
                        buf.put_u8(entry.segment_number);
                        put_field(buf, "key", &entry.key)?;
                        entry.record.encode(buf);
                    }
                    put_optional_field(buf, "cursor", next_cursor.as_deref())?;
                }
                (operation, _) => {
                    return Err(WireError::Serialization(format!(
                        "reply body does not match operation {operation:?}"
                    )));
                }
            },
        }
        Ok(())
    }

    pub fn decode(mut buf: Bytes) -> WireResult<Self> {
        let request_id = get_request_id(&mut buf)?;
        need(&buf, 2)?;
        let operation = OperationCode::try_from(buf.get_u8())?;
        let result = ReplyResult::try_from(buf.get_u8())?;

        let outcome = if result.is_success() {
            let body = match operation {
                OperationCode::Insert | OperationCode::Delete => {
                    need(&buf, 8)?;
                    ReplyBody::PreviousSize(buf.get_u64())
                }
                OperationCode::Lookup => {
                    need(&buf, 1)?;
                    match buf.get_u8() {
                        0 => ReplyBody::Lookup(None),
                        _ => ReplyBody::Lookup(Some(ValueRecord::decode(&mut buf)?)),
                    }
                }
                OperationCode::List => {
                    need(&buf, 4)?;
                    let count = buf.get_u32() as usize;
                    let mut entries = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        need(&buf, 5)?;
                        let version_number = buf.get_u32();
                        let segment_number = buf.get_u8();
                        let key = get_field(&mut buf)?;
                        let record = ValueRecord::decode(&mut buf)?;
                        entries.push(ListEntry {
                            key,
                            version_number,
                            segment_number,
                            record,
                        });
                    }
                    let next_cursor = get_optional_field(&mut buf)?;
                    ReplyBody::List {
                        entries,
                        next_cursor,
                    }
                }
            };
            Ok(body)
        } else {
            Err(ReplyFailure {
                result,
                message: get_string(&mut buf, "error-message")?,
            })
        };
        expect_end(&buf)?;

        Ok(Self {
            request_id,
            operation,
            outcome,
        })
    }

    pub fn to_frame(&self) -> WireResult<Frame> {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf)?;
        Frame::new(FrameKind::DatabaseReply, buf.freeze())
    }
}

// ============================================================================
// Field helpers
// ============================================================================

fn need(buf: &Bytes, n: usize) -> WireResult<()> {
    if buf.remaining() < n {
        return Err(WireError::Malformed(format!(
            "truncated envelope: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn expect_end(buf: &Bytes) -> WireResult<()> {
    if buf.has_remaining() {
        return Err(WireError::Malformed(format!(
            "{} trailing bytes after envelope",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_request_id(buf: &mut Bytes) -> WireResult<RequestId> {
    need(buf, REQUEST_ID_HEX_LEN)?;
    let raw = buf.split_to(REQUEST_ID_HEX_LEN);
    Ok(RequestId::from_hex_bytes(&raw)?)
}

fn put_field(buf: &mut BytesMut, field: &'static str, value: &[u8]) -> WireResult<()> {
    if value.len() > MAX_FIELD_LEN {
        return Err(WireError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    Ok(())
}

fn get_field(buf: &mut Bytes) -> WireResult<Bytes> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes, field: &str) -> WireResult<String> {
    let raw = get_field(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| WireError::Malformed(format!("{field} is not valid utf-8")))
}

fn put_optional_field(
    buf: &mut BytesMut,
    field: &'static str,
    value: Option<&[u8]>,
) -> WireResult<()> {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_field(buf, field, value)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn get_optional_field(buf: &mut Bytes) -> WireResult<Option<Bytes>> {
    need(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        _ => get_field(buf).map(Some),
    }
}
