//! Stream transports over TCP and Unix domain sockets.
//!
//! Services are addressed as `tcp://host:port` or `ipc:///path/to/socket`.
//! [`Stream`] and [`Listener`] hide the socket family behind one type each;
//! both are mio event sources so a poll loop can register either kind.
//! [`FramedStream`] adds frame buffering on top and is the single
//! [`Transport`] implementation.

use std::fmt;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::BytesMut;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use nimbus_wire::{Frame, WireResult};
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};

// ============================================================================
// Constants
// ============================================================================

/// Size of the temporary buffer used per socket read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default initial capacity of the read and write buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Endpoint
// ============================================================================

/// Address of a service socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn tcp(addr: SocketAddr) -> Self {
        Endpoint::Tcp(addr)
    }

    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Endpoint::Ipc(path.into())
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidEndpoint(s.to_string());

        if let Some(rest) = s.strip_prefix("tcp://") {
            let addr = rest
                .to_socket_addrs()
                .map_err(|_| invalid())?
                .next()
                .ok_or_else(invalid)?;
            Ok(Endpoint::Tcp(addr))
        } else if let Some(rest) = s.strip_prefix("ipc://") {
            if rest.is_empty() {
                return Err(invalid());
            }
            Ok(Endpoint::Ipc(PathBuf::from(rest)))
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A non-blocking connected socket of either family.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Starts a non-blocking connect. Completion is signalled by the stream
    /// becoming writable; check it with [`Stream::connection_status`].
    pub fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Stream::Tcp(TcpStream::connect(*addr)?)),
            Endpoint::Ipc(path) => Ok(Stream::Unix(UnixStream::connect(path)?)),
        }
    }

    /// Returns `Ok(true)` once connected, `Ok(false)` while the connect is
    /// still in progress, and the socket error if it failed.
    pub fn connection_status(&self) -> io::Result<bool> {
        let (pending_error, peer) = match self {
            Stream::Tcp(stream) => (stream.take_error()?, stream.peer_addr().map(|_| ())),
            Stream::Unix(stream) => (stream.take_error()?, stream.peer_addr().map(|_| ())),
        };
        if let Some(e) = pending_error {
            return Err(e);
        }
        match peer {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Shuts down both directions. Errors are ignored; the socket may
    /// already be gone.
    pub fn shutdown(&self) {
        let _ = match self {
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
    }
}

/// `EINPROGRESS` on Linux and the BSDs.
const EINPROGRESS: i32 = if cfg!(target_os = "linux") { 115 } else { 36 };

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.register(registry, token, interests),
            Stream::Unix(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.reregister(registry, token, interests),
            Stream::Unix(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.deregister(registry),
            Stream::Unix(stream) => stream.deregister(registry),
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// A bound, non-blocking listening socket of either family.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Binds the endpoint. A stale socket file left at an ipc path is
    /// replaced.
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(*addr)?)),
            Endpoint::Ipc(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                remove_socket_file(path)?;
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Accepts one pending connection and describes the peer for logs.
    pub fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((Stream::Tcp(stream), addr.to_string()))
            }
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept()?;
                Ok((Stream::Unix(stream), path.display().to_string()))
            }
        }
    }

    /// The bound endpoint, with the actual port when bound to port 0.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
            Listener::Unix { path, .. } => Ok(Endpoint::Ipc(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = remove_socket_file(path);
        }
    }
}

fn remove_socket_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed socket file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.register(registry, token, interests),
            Listener::Unix { listener, .. } => listener.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.reregister(registry, token, interests),
            Listener::Unix { listener, .. } => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.deregister(registry),
            Listener::Unix { listener, .. } => listener.deregister(registry),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Narrow frame transport: higher layers never see the socket family.
pub trait Transport: Send {
    /// Queues a frame and writes as much of the backlog as the socket takes.
    fn send(&mut self, frame: &Frame) -> ClientResult<()>;

    /// Returns the next complete frame, or `None` if none is available yet.
    ///
    /// Fails with [`ClientError::ConnectionClosed`] once the peer has closed
    /// and no buffered frame remains.
    fn receive(&mut self) -> ClientResult<Option<Frame>>;

    /// Flushes what it can and shuts the socket down.
    fn close(&mut self);
}

/// A [`Stream`] with frame read and write buffers.
#[derive(Debug)]
pub struct FramedStream {
    stream: Stream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    eof: bool,
    closed: bool,
}

impl FramedStream {
    pub fn new(stream: Stream, buffer_size: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(buffer_size),
            write_buf: BytesMut::with_capacity(buffer_size),
            eof: false,
            closed: false,
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// The underlying socket, for poll registration.
    pub fn stream_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    /// Reads everything the socket has. Returns the number of bytes read;
    /// sets the EOF flag when the peer has closed.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if total > 0 {
            trace!(bytes = total, buffered = self.read_buf.len(), "read");
        }
        Ok(total)
    }

    /// Decodes the next buffered frame. Framing errors leave the stream
    /// unusable.
    pub fn next_frame(&mut self) -> WireResult<Option<Frame>> {
        Frame::decode(&mut self.read_buf)
    }

    /// Appends a frame to the write buffer without touching the socket.
    pub fn enqueue(&mut self, frame: &Frame) {
        frame.encode(&mut self.write_buf);
    }

    /// Writes buffered data until the socket would block. Returns true when
    /// the write buffer is empty.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket closed")),
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// True once the peer has closed its side.
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

impl Transport for FramedStream {
    fn send(&mut self, frame: &Frame) -> ClientResult<()> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        self.enqueue(frame);
        self.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> ClientResult<Option<Frame>> {
        if let Some(frame) = self.next_frame()? {
            return Ok(Some(frame));
        }
        if self.closed {
            return Err(ClientError::Closed);
        }
        if !self.eof {
            self.fill()?;
            if let Some(frame) = self.next_frame()? {
                return Ok(Some(frame));
            }
        }
        if self.eof {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(None)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.flush();
        self.stream.shutdown();
        self.closed = true;
    }
}
