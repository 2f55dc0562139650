//! # nimbus-wire: Wire protocol for nimbus storage node services
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────┬─────────┬──────┬──────────┬──────────┬──────────────────┐
//! │ Magic   │ Version │ Kind │ Length   │ Checksum │     Payload      │
//! │ (4 B)   │ (2 B)   │ (1 B)│ (4 B)    │ (4 B)    │     (var)        │
//! └─────────┴─────────┴──────┴──────────┴──────────┴──────────────────┘
//! ```
//!
//! - **Magic**: `0x4E494D42` ("NIMB")
//! - **Version**: Protocol version (currently 1)
//! - **Kind**: 1 database request, 2 database reply, 3 structured message
//! - **Length**: Payload length in bytes (max 16 MiB)
//! - **Checksum**: CRC32 of payload
//!
//! ## Payloads
//!
//! Database traffic uses the fixed binary envelope in [`envelope`]. Writer,
//! reader, handoff and space accounting traffic uses JSON messages with an
//! optional raw data section, see [`message`].

pub mod envelope;
mod error;
mod frame;
pub mod message;

use nimbus_types::RequestId;

pub use envelope::{
    DatabaseOperation, DatabaseReply, DatabaseRequest, ListEntry, MAX_FIELD_LEN, OperationCode,
    ReplyBody, ReplyFailure, ReplyResult,
};
pub use error::{WireError, WireResult};
pub use frame::{
    FRAME_HEADER_SIZE, Frame, FrameHeader, FrameKind, MAGIC, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
pub use message::{MAX_DATA_SIZE, Message, MessageEnvelope, ReplyStatus, SegmentDescriptor};

#[cfg(test)]
mod tests;

/// Any decoded frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    DatabaseRequest(DatabaseRequest),
    DatabaseReply(DatabaseReply),
    Message(MessageEnvelope),
}

impl WireFrame {
    pub fn to_frame(&self) -> WireResult<Frame> {
        match self {
            WireFrame::DatabaseRequest(request) => request.to_frame(),
            WireFrame::DatabaseReply(reply) => reply.to_frame(),
            WireFrame::Message(envelope) => envelope.to_frame(),
        }
    }

    /// Decodes the payload of an intact frame.
    ///
    /// Errors are always [`WireError::Malformed`]: the frame is dropped but
    /// the stream stays usable.
    pub fn from_frame(frame: &Frame) -> WireResult<Self> {
        let payload = frame.payload.clone();
        Ok(match frame.kind {
            FrameKind::DatabaseRequest => WireFrame::DatabaseRequest(DatabaseRequest::decode(payload)?),
            FrameKind::DatabaseReply => WireFrame::DatabaseReply(DatabaseReply::decode(payload)?),
            FrameKind::Message => WireFrame::Message(MessageEnvelope::decode(payload)?),
        })
    }

    /// The id used to correlate this frame with its reply.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            WireFrame::DatabaseRequest(request) => Some(request.request_id),
            WireFrame::DatabaseReply(reply) => Some(reply.request_id),
            WireFrame::Message(envelope) => envelope.message.message_id(),
        }
    }

    pub fn set_request_id(&mut self, id: RequestId) {
        match self {
            WireFrame::DatabaseRequest(request) => request.request_id = id,
            WireFrame::DatabaseReply(reply) => reply.request_id = id,
            WireFrame::Message(envelope) => envelope.message.set_message_id(id),
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> &'static str {
        match self {
            WireFrame::DatabaseRequest(_) => "database-request",
            WireFrame::DatabaseReply(_) => "database-reply",
            WireFrame::Message(envelope) => envelope.message.kind(),
        }
    }
}

impl From<DatabaseRequest> for WireFrame {
    fn from(request: DatabaseRequest) -> Self {
        WireFrame::DatabaseRequest(request)
    }
}

impl From<DatabaseReply> for WireFrame {
    fn from(reply: DatabaseReply) -> Self {
        WireFrame::DatabaseReply(reply)
    }
}

impl From<MessageEnvelope> for WireFrame {
    fn from(envelope: MessageEnvelope) -> Self {
        WireFrame::Message(envelope)
    }
}

impl From<Message> for WireFrame {
    fn from(message: Message) -> Self {
        WireFrame::Message(MessageEnvelope::new(message))
    }
}
