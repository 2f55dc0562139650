//! Structured messages for the writer, reader, handoff and space accounting
//! services.
//!
//! A message payload is `json_len u32 | json | data`. The JSON object names
//! its kind in the `message-type` field; all other field names are kebab-case.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nimbus_types::{NodeName, RequestId, SegmentKey, TenantId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::envelope::ReplyResult;
use crate::error::{WireError, WireResult};
use crate::frame::{Frame, FrameKind, MAX_PAYLOAD_SIZE};

/// Largest data section a message may carry. The rest of the frame is left
/// for the JSON part.
pub const MAX_DATA_SIZE: usize = MAX_PAYLOAD_SIZE as usize - 64 * 1024;

/// A structured message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message-type", rename_all = "kebab-case")]
pub enum Message {
    Ping(Ping),
    PingReply(PingReply),
    ArchiveKeyEntire(ArchiveKeyEntire),
    ArchiveKeyStart(ArchiveKeyStart),
    ArchiveKeyStartReply(ArchiveKeyChunkReply),
    ArchiveKeyNext(ArchiveKeyNext),
    ArchiveKeyNextReply(ArchiveKeyChunkReply),
    ArchiveKeyFinal(ArchiveKeyFinal),
    /// Reply to both `archive-key-entire` and `archive-key-final`.
    ArchiveKeyFinalReply(ArchiveKeyFinalReply),
    DestroyKey(DestroyKey),
    DestroyKeyReply(DestroyKeyReply),
    RetrieveKeyEntire(RetrieveKeyEntire),
    RetrieveKeyEntireReply(RetrieveKeyEntireReply),
    HintedHandoff(HintedHandoff),
    HintedHandoffReply(HintedHandoffReply),
    SpaceAccountingDetail(SpaceAccountingDetail),
    SpaceUsageRequest(SpaceUsageRequest),
    SpaceUsageReply(SpaceUsageReply),
}

impl Message {
    /// The kebab-case kind name, as carried in `message-type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping(_) => "ping",
            Message::PingReply(_) => "ping-reply",
            Message::ArchiveKeyEntire(_) => "archive-key-entire",
            Message::ArchiveKeyStart(_) => "archive-key-start",
            Message::ArchiveKeyStartReply(_) => "archive-key-start-reply",
            Message::ArchiveKeyNext(_) => "archive-key-next",
            Message::ArchiveKeyNextReply(_) => "archive-key-next-reply",
            Message::ArchiveKeyFinal(_) => "archive-key-final",
            Message::ArchiveKeyFinalReply(_) => "archive-key-final-reply",
            Message::DestroyKey(_) => "destroy-key",
            Message::DestroyKeyReply(_) => "destroy-key-reply",
            Message::RetrieveKeyEntire(_) => "retrieve-key-entire",
            Message::RetrieveKeyEntireReply(_) => "retrieve-key-entire-reply",
            Message::HintedHandoff(_) => "hinted-handoff",
            Message::HintedHandoffReply(_) => "hinted-handoff-reply",
            Message::SpaceAccountingDetail(_) => "space-accounting-detail",
            Message::SpaceUsageRequest(_) => "space-usage-request",
            Message::SpaceUsageReply(_) => "space-usage-reply",
        }
    }

    /// The correlation id (`message-id` or `request-id`), if the kind has one.
    pub fn message_id(&self) -> Option<RequestId> {
        Some(match self {
            Message::Ping(m) => m.message_id,
            Message::PingReply(m) => m.message_id,
            Message::ArchiveKeyEntire(m) => m.message_id,
            Message::ArchiveKeyStart(m) => m.message_id,
            Message::ArchiveKeyStartReply(m) | Message::ArchiveKeyNextReply(m) => m.message_id,
            Message::ArchiveKeyNext(m) => m.message_id,
            Message::ArchiveKeyFinal(m) => m.message_id,
            Message::ArchiveKeyFinalReply(m) => m.message_id,
            Message::DestroyKey(m) => m.message_id,
            Message::DestroyKeyReply(m) => m.message_id,
            Message::RetrieveKeyEntire(m) => m.message_id,
            Message::RetrieveKeyEntireReply(m) => m.message_id,
            Message::HintedHandoff(m) => m.message_id,
            Message::HintedHandoffReply(m) => m.message_id,
            Message::SpaceUsageRequest(m) => m.request_id,
            Message::SpaceUsageReply(m) => m.request_id,
            Message::SpaceAccountingDetail(_) => return None,
        })
    }

    /// Replaces the correlation id. Kinds without one are left unchanged.
    pub fn set_message_id(&mut self, id: RequestId) {
        let slot = match self {
            Message::Ping(m) => &mut m.message_id,
            Message::PingReply(m) => &mut m.message_id,
            Message::ArchiveKeyEntire(m) => &mut m.message_id,
            Message::ArchiveKeyStart(m) => &mut m.message_id,
            Message::ArchiveKeyStartReply(m) | Message::ArchiveKeyNextReply(m) => {
                &mut m.message_id
            }
            Message::ArchiveKeyNext(m) => &mut m.message_id,
            Message::ArchiveKeyFinal(m) => &mut m.message_id,
            Message::ArchiveKeyFinalReply(m) => &mut m.message_id,
            Message::DestroyKey(m) => &mut m.message_id,
            Message::DestroyKeyReply(m) => &mut m.message_id,
            Message::RetrieveKeyEntire(m) => &mut m.message_id,
            Message::RetrieveKeyEntireReply(m) => &mut m.message_id,
            Message::HintedHandoff(m) => &mut m.message_id,
            Message::HintedHandoffReply(m) => &mut m.message_id,
            Message::SpaceUsageRequest(m) => &mut m.request_id,
            Message::SpaceUsageReply(m) => &mut m.request_id,
            Message::SpaceAccountingDetail(_) => return,
        };
        *slot = id;
    }

    /// `result` of a reply kind; `None` for requests.
    pub fn result(&self) -> Option<ReplyResult> {
        match self {
            Message::PingReply(m) => Some(m.result),
            Message::ArchiveKeyStartReply(m) | Message::ArchiveKeyNextReply(m) => {
                Some(m.status.result)
            }
            Message::ArchiveKeyFinalReply(m) => Some(m.status.result),
            Message::DestroyKeyReply(m) => Some(m.status.result),
            Message::RetrieveKeyEntireReply(m) => Some(m.status.result),
            Message::HintedHandoffReply(m) => Some(m.status.result),
            Message::SpaceUsageReply(m) => Some(m.status.result),
            _ => None,
        }
    }
}

// ============================================================================
// Shared pieces
// ============================================================================

/// `result` plus an `error-message` present only on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplyStatus {
    pub result: ReplyResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ReplyStatus {
    pub fn success() -> Self {
        Self {
            result: ReplyResult::Success,
            error_message: None,
        }
    }

    pub fn failure(result: ReplyResult, message: impl Into<String>) -> Self {
        Self {
            result,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

/// Everything needed to place one complete segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SegmentDescriptor {
    pub tenant_id: TenantId,
    pub key: String,
    pub version_number: u32,
    pub segment_number: u8,
    pub timestamp: Timestamp,
    pub total_size: u64,
    pub file_adler32: i64,
    #[serde(with = "md5_base64")]
    pub file_md5: [u8; 16],
    pub segment_adler32: i64,
    #[serde(with = "md5_base64")]
    pub segment_md5: [u8; 16],
}

impl SegmentDescriptor {
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::new(
            self.tenant_id,
            Bytes::from(self.key.clone().into_bytes()),
            self.version_number,
            self.segment_number,
        )
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Ping {
    pub message_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PingReply {
    pub message_id: RequestId,
    pub result: ReplyResult,
}

// ============================================================================
// Writer
// ============================================================================

/// Whole segment in one message; the data section holds the segment bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveKeyEntire {
    pub message_id: RequestId,
    #[serde(flatten)]
    pub segment: SegmentDescriptor,
}

/// First chunk of a multi-message archive. `archive-id` ties the chunks
/// together; `message-id` is unique per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveKeyStart {
    pub message_id: RequestId,
    pub archive_id: RequestId,
    pub tenant_id: TenantId,
    pub key: String,
    pub version_number: u32,
    pub segment_number: u8,
    pub timestamp: Timestamp,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveKeyNext {
    pub message_id: RequestId,
    pub archive_id: RequestId,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveKeyFinal {
    pub message_id: RequestId,
    pub archive_id: RequestId,
    pub sequence: u32,
    pub total_size: u64,
    pub file_adler32: i64,
    #[serde(with = "md5_base64")]
    pub file_md5: [u8; 16],
    pub segment_adler32: i64,
    #[serde(with = "md5_base64")]
    pub segment_md5: [u8; 16],
}

/// Reply to `archive-key-start` and `archive-key-next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveKeyChunkReply {
    pub message_id: RequestId,
    #[serde(flatten)]
    pub status: ReplyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveKeyFinalReply {
    pub message_id: RequestId,
    #[serde(flatten)]
    pub status: ReplyStatus,
    #[serde(default)]
    pub previous_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DestroyKey {
    pub message_id: RequestId,
    pub tenant_id: TenantId,
    pub key: String,
    pub version_number: u32,
    pub segment_number: u8,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DestroyKeyReply {
    pub message_id: RequestId,
    #[serde(flatten)]
    pub status: ReplyStatus,
    #[serde(default)]
    pub previous_size: u64,
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrieveKeyEntire {
    pub message_id: RequestId,
    pub tenant_id: TenantId,
    pub key: String,
    pub version_number: u32,
    pub segment_number: u8,
}

/// On success the data section holds the verified segment bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrieveKeyEntireReply {
    pub message_id: RequestId,
    #[serde(flatten)]
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub segment_size: u64,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub segment_adler32: i64,
    #[serde(default, with = "md5_base64_opt", skip_serializing_if = "Option::is_none")]
    pub segment_md5: Option<[u8; 16]>,
}

impl RetrieveKeyEntireReply {
    pub fn failure(message_id: RequestId, result: ReplyResult, message: impl Into<String>) -> Self {
        Self {
            message_id,
            status: ReplyStatus::failure(result, message),
            timestamp: None,
            segment_size: 0,
            total_size: 0,
            segment_adler32: 0,
            segment_md5: None,
        }
    }
}

// ============================================================================
// Handoff
// ============================================================================

/// A segment redirected to a backup because `original-destination` was
/// unreachable. The data section holds the segment bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HintedHandoff {
    pub message_id: RequestId,
    pub original_destination: NodeName,
    #[serde(flatten)]
    pub segment: SegmentDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HintedHandoffReply {
    pub message_id: RequestId,
    #[serde(flatten)]
    pub status: ReplyStatus,
}

// ============================================================================
// Space accounting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpaceEvent {
    BytesAdded,
    BytesRetrieved,
    BytesRemoved,
}

/// One-way usage event pushed to the accounting collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpaceAccountingDetail {
    pub tenant_id: TenantId,
    pub timestamp: Timestamp,
    pub event: SpaceEvent,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpaceUsageRequest {
    pub request_id: RequestId,
    pub tenant_id: TenantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpaceUsageReply {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub status: ReplyStatus,
    #[serde(default)]
    pub bytes_added: u64,
    #[serde(default)]
    pub bytes_removed: u64,
    #[serde(default)]
    pub bytes_retrieved: u64,
}

// ============================================================================
// Envelope
// ============================================================================

/// A message together with its raw data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub message: Message,
    pub data: Bytes,
}

impl MessageEnvelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            data: Bytes::new(),
        }
    }

    pub fn with_data(message: Message, data: impl Into<Bytes>) -> Self {
        Self {
            message,
            data: data.into(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        let json = serde_json::to_vec(&self.message)
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        buf.reserve(4 + json.len() + self.data.len());
        buf.put_u32(json.len() as u32);
        buf.put_slice(&json);
        buf.put_slice(&self.data);
        Ok(())
    }

    pub fn decode(mut buf: Bytes) -> WireResult<Self> {
        if buf.remaining() < 4 {
            return Err(WireError::Malformed("message shorter than json length".into()));
        }
        let json_len = buf.get_u32() as usize;
        if buf.remaining() < json_len {
            return Err(WireError::Malformed(format!(
                "json length {json_len} exceeds payload of {} bytes",
                buf.remaining()
            )));
        }
        let json = buf.split_to(json_len);
        let message = serde_json::from_slice(&json)?;
        Ok(Self { message, data: buf })
    }

    pub fn to_frame(&self) -> WireResult<Frame> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Frame::new(FrameKind::Message, buf.freeze())
    }
}

impl From<Message> for MessageEnvelope {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}

// ============================================================================
// MD5 as base64
// ============================================================================

mod md5_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(digest: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 16], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)?;
        <[u8; 16]>::try_from(decoded.as_slice())
            .map_err(|_| serde::de::Error::custom("md5 digest must be 16 bytes"))
    }
}

mod md5_base64_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(digest: &Option<[u8; 16]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match digest {
            Some(digest) => super::md5_base64::serialize(digest, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 16]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::md5_base64")] [u8; 16]);

        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
    }
}
