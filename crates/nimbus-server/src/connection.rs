//! Connection state management.

use std::io;
use std::time::{Duration, Instant};

use mio::Interest;
use nimbus_client::{FramedStream, Stream};
use nimbus_wire::{Frame, WireFrame, WireResult};

use crate::error::ServerResult;

/// Which listener a connection came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Request/reply: every request gets a reply.
    Reply,
    /// One-way: requests are processed, their replies discarded. Pings
    /// are still answered.
    Pull,
}

/// State of an inbound connection.
#[derive(Debug)]
pub struct Connection {
    pub role: EndpointRole,
    /// Peer description for logs.
    pub peer: String,
    pub framed: FramedStream,
    /// Whether the connection is closing.
    pub closing: bool,
    /// Last activity timestamp for idle timeout tracking.
    pub last_activity: Instant,
}

impl Connection {
    pub fn new(
        role: EndpointRole,
        peer: String,
        stream: Stream,
        buffer_size: usize,
    ) -> Self {
        Self {
            role,
            peer,
            framed: FramedStream::new(stream, buffer_size),
            closing: false,
            last_activity: Instant::now(),
        }
    }

    /// Updates the last activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Checks if the connection has been idle for longer than the timeout.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Reads everything available. Returns `true` if the peer has not
    /// closed its side.
    pub fn read(&mut self) -> io::Result<bool> {
        self.framed.fill()?;
        Ok(!self.framed.is_eof())
    }

    /// Writes buffered replies. Returns `true` if all data was written.
    pub fn write(&mut self) -> io::Result<bool> {
        self.framed.flush()
    }

    /// Next complete inbound frame.
    pub fn next_frame(&mut self) -> WireResult<Option<Frame>> {
        self.framed.next_frame()
    }

    /// Queues a reply for writing.
    pub fn queue_reply(&mut self, reply: &WireFrame) -> ServerResult<()> {
        let frame = reply.to_frame()?;
        self.framed.enqueue(&frame);
        Ok(())
    }

    /// Returns the interest flags for this connection.
    pub fn interest(&self) -> Interest {
        if self.framed.has_pending_writes() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    pub fn stream_mut(&mut self) -> &mut Stream {
        self.framed.stream_mut()
    }
}
