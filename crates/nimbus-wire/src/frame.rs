//! Length-delimited, checksummed frames.
//!
//! Every message between nimbus services travels as one frame. A reader
//! accumulates bytes in a `BytesMut` and calls [`Frame::decode`] until it
//! yields `None`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};

/// "NIMB" read as a big-endian u32.
pub const MAGIC: u32 = 0x4E49_4D42;

pub const PROTOCOL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4) + crc32 (4).
pub const FRAME_HEADER_SIZE: usize = 15;

/// Largest payload a peer may announce (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// What the payload of a frame contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Binary database request envelope.
    DatabaseRequest = 1,
    /// Binary database reply envelope.
    DatabaseReply = 2,
    /// Structured (JSON + data) message.
    Message = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::DatabaseRequest),
            2 => Ok(FrameKind::DatabaseReply),
            3 => Ok(FrameKind::Message),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// The fixed-size prefix of a frame, as read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub kind: u8,
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    fn for_payload(kind: FrameKind, payload: &[u8]) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            kind: kind as u8,
            length: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            checksum: crc32fast::hash(payload),
        }
    }

    fn parse(mut raw: &[u8]) -> Self {
        Self {
            magic: raw.get_u32(),
            version: raw.get_u16(),
            kind: raw.get_u8(),
            length: raw.get_u32(),
            checksum: raw.get_u32(),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE);
        buf.put_u32(self.magic);
        buf.put_u16(self.version);
        buf.put_u8(self.kind);
        buf.put_u32(self.length);
        buf.put_u32(self.checksum);
    }

    /// Checks everything that can be checked before the payload arrives.
    ///
    /// A failure here means the stream is no longer aligned on frame
    /// boundaries.
    pub fn check(&self) -> WireResult<FrameKind> {
        if self.magic != MAGIC {
            return Err(WireError::InvalidMagic(self.magic));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(self.version));
        }
        if self.length > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge {
                size: u64::from(self.length),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        FrameKind::try_from(self.kind)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Fails with [`WireError::PayloadTooLarge`] if a peer would reject
    /// the payload, so an oversized request fails at the sender instead of
    /// breaking the connection.
    pub fn new(kind: FrameKind, payload: Bytes) -> WireResult<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(WireError::PayloadTooLarge {
                size: payload.len() as u64,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self { kind, payload })
    }

    /// Appends header and payload to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        FrameHeader::for_payload(self.kind, &self.payload).write(buf);
        buf.extend_from_slice(&self.payload);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Takes one complete frame off the front of `buf`.
    ///
    /// `Ok(None)` leaves `buf` untouched and means more bytes are needed.
    /// A header error is reported as soon as the header is complete, so an
    /// oversized length is rejected without buffering the payload.
    pub fn decode(buf: &mut BytesMut) -> WireResult<Option<Self>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::parse(&buf[..FRAME_HEADER_SIZE]);
        let kind = header.check()?;

        let end = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < end {
            buf.reserve(end - buf.len());
            return Ok(None);
        }

        let mut raw = buf.split_to(end);
        let payload = raw.split_off(FRAME_HEADER_SIZE).freeze();
        let actual = crc32fast::hash(&payload);
        if actual != header.checksum {
            return Err(WireError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        Ok(Some(Self { kind, payload }))
    }

    pub fn total_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod frame_tests {
    use super::*;

    fn raw_header(magic: u32, kind: u8, length: u32, checksum: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameHeader {
            magic,
            version: PROTOCOL_VERSION,
            kind,
            length,
            checksum,
        }
        .write(&mut buf);
        buf
    }

    #[test]
    fn decodes_what_it_encodes() {
        let frame = Frame::new(FrameKind::Message, Bytes::from_static(b"{\"message-type\":\"ping\"}")).unwrap();
        let mut buf = BytesMut::from(&frame.encode_to_bytes()[..]);

        assert_eq!(buf.len(), frame.total_size());
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn byte_at_a_time_yields_one_frame() {
        let frame = Frame::new(FrameKind::DatabaseReply, Bytes::from_static(b"reply body")).unwrap();
        let encoded = frame.encode_to_bytes();

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in encoded.iter() {
            buf.put_u8(*byte);
            if let Some(f) = Frame::decode(&mut buf).unwrap() {
                decoded.push(f);
            }
        }
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let mut buf = BytesMut::new();
        Frame::new(FrameKind::DatabaseRequest, Bytes::from_static(b"one")).unwrap().encode(&mut buf);
        Frame::new(FrameKind::DatabaseReply, Bytes::new()).unwrap().encode(&mut buf);

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(second.kind, FrameKind::DatabaseReply);
        assert!(second.payload.is_empty());
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_payload_is_left_in_place() {
        let encoded = Frame::new(FrameKind::Message, Bytes::from_static(b"abcdef"))
            .unwrap()
            .encode_to_bytes();
        let mut buf = BytesMut::from(&encoded[..FRAME_HEADER_SIZE + 3]);

        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &encoded[..FRAME_HEADER_SIZE + 3]);
    }

    #[test]
    fn header_errors_are_framing_errors() {
        let mut bad_magic = raw_header(0xDEAD_BEEF, FrameKind::Message as u8, 0, 0);
        let err = Frame::decode(&mut bad_magic).unwrap_err();
        assert!(matches!(err, WireError::InvalidMagic(0xDEAD_BEEF)));
        assert!(err.is_framing());

        let mut bad_kind = raw_header(MAGIC, 77, 0, 0);
        assert!(matches!(
            Frame::decode(&mut bad_kind),
            Err(WireError::UnknownKind(77))
        ));

        let mut oversized = raw_header(MAGIC, FrameKind::Message as u8, MAX_PAYLOAD_SIZE + 1, 0);
        assert!(matches!(
            Frame::decode(&mut oversized),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut buf = raw_header(MAGIC, FrameKind::Message as u8, 4, 0x00BA_DBAD);
        buf.put_slice(b"test");

        let err = Frame::decode(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::ChecksumMismatch { expected: 0x00BA_DBAD, .. }));
        assert!(err.is_framing());
    }

    #[test]
    fn oversized_payload_cannot_be_framed() {
        let at_limit = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE as usize]);
        assert!(Frame::new(FrameKind::Message, at_limit).is_ok());

        let over = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE as usize + 1]);
        let err = Frame::new(FrameKind::Message, over).unwrap_err();
        assert!(matches!(
            err,
            WireError::PayloadTooLarge { size, max: MAX_PAYLOAD_SIZE } if size == u64::from(MAX_PAYLOAD_SIZE) + 1
        ));
    }

    #[test]
    fn magic_spells_nimb() {
        assert_eq!(MAGIC.to_be_bytes(), *b"NIMB");
    }
}
