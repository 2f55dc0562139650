//! A logical connection to one remote service that survives disconnects.
//!
//! Each [`ResilientClient`] owns a background I/O thread running a mio poll
//! loop. Callers hand it frames through a queue and a [`Waker`]; replies are
//! matched back to callers by the client's [`Deliverator`], so the order in
//! which replies arrive does not matter.
//!
//! # State machine
//!
//! ```text
//! Connecting ──connected──▶ Connected ──heartbeat timeout / I/O error──▶ Disconnected
//!     ▲                                                                      │
//!     └───────────────────────────backoff elapsed────────────────────────────┘
//!
//! any state ──close()──▶ Closed
//! ```
//!
//! Sends fail immediately with [`ClientError::DestinationUnreachable`]
//! unless the client is connected. Requests in flight when the connection
//! drops fail with the same error; they are never resent.

use std::collections::VecDeque;
use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use nimbus_types::{NodeName, RequestId};
use nimbus_wire::message::Ping;
use nimbus_wire::{Frame, Message, WireFrame};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::deliverator::{Completion, Deliverator};
use crate::error::{ClientError, ClientResult};
use crate::transport::{DEFAULT_BUFFER_SIZE, Endpoint, FramedStream, Stream, Transport};

// ============================================================================
// Constants
// ============================================================================

const WAKER_TOKEN: Token = Token(0);
const STREAM_TOKEN: Token = Token(1);

const MAX_EVENTS: usize = 64;

/// Upper bound on one poll wait, so timers are checked regularly.
const MAX_POLL_WAIT: Duration = Duration::from_millis(50);

// ============================================================================
// Configuration
// ============================================================================

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Default deadline for [`ResilientClient::request`].
    pub request_timeout: Duration,
    /// How often a ping is sent on an otherwise quiet connection.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// How long a connect attempt may stay in progress.
    pub connect_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_max: Duration,
    /// Initial read and write buffer capacity.
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout.max(interval);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

// ============================================================================
// Connection State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

type Reply = ClientResult<WireFrame>;

/// A frame waiting for the I/O thread, with the request it answers to.
/// One-way frames carry no id.
type Outbound = (Option<RequestId>, Frame);

/// State shared between callers and the I/O thread.
#[derive(Debug)]
struct Shared {
    node: NodeName,
    state: AtomicU8,
    outbound: Mutex<VecDeque<Outbound>>,
    deliverator: Deliverator<Reply>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `next` unless already closed. Returns the previous state.
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::Closed as u8).then_some(next as u8)
            })
            .unwrap_or_else(|closed| closed);
        ConnectionState::from_u8(previous)
    }

    fn outbound(&self) -> MutexGuard<'_, VecDeque<Outbound>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the requests of frames that will never be written.
    fn fail_dropped(&self, dropped: &[Outbound], reply: impl Fn() -> ClientError) -> usize {
        let mut failed = 0;
        for request_id in dropped.iter().filter_map(|(request_id, _)| *request_id) {
            if self.deliverator.deliver(request_id, Err(reply())) {
                failed += 1;
            }
        }
        failed
    }
}

// ============================================================================
// Client
// ============================================================================

/// Resilient request/reply client for one remote service.
pub struct ResilientClient {
    endpoint: Endpoint,
    config: ClientConfig,
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientClient {
    /// Creates the client and starts connecting in the background.
    ///
    /// Returns immediately in the `Connecting` state.
    pub fn connect(node: NodeName, endpoint: Endpoint, config: ClientConfig) -> ClientResult<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let shared = Arc::new(Shared {
            node: node.clone(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbound: Mutex::new(VecDeque::new()),
            deliverator: Deliverator::new(),
        });

        let io = IoLoop::new(poll, endpoint.clone(), config.clone(), Arc::clone(&shared));
        let handle = thread::Builder::new()
            .name(format!("nimbus-client-{node}"))
            .spawn(move || io.run())?;

        debug!(node = %node, endpoint = %endpoint, "client started");

        Ok(Self {
            endpoint,
            config,
            shared,
            waker,
            io_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn node(&self) -> &NodeName {
        &self.shared.node
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Requests registered and not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.shared.deliverator.pending_count()
    }

    /// Sends a request and returns the slot its reply will arrive in.
    ///
    /// The request id carried by `request` is replaced with a freshly
    /// registered one before the frame is encoded.
    pub fn send(&self, request: impl Into<WireFrame>) -> ClientResult<Completion<Reply>> {
        self.ensure_connected()?;

        let mut request = request.into();
        let completion = self.shared.deliverator.register();
        let request_id = completion.request_id();
        request.set_request_id(request_id);

        let queued = request
            .to_frame()
            .map_err(ClientError::from)
            .and_then(|frame| self.enqueue(Some(request_id), frame));
        if let Err(e) = queued {
            self.shared.deliverator.cancel(request_id);
            return Err(e);
        }
        // The I/O thread may have stopped after the state check above, in
        // which case nothing will drain the queue.
        if self.state() == ConnectionState::Closed {
            self.shared.deliverator.deliver(request_id, Err(ClientError::Closed));
        }

        trace!(node = %self.shared.node, request_id = %request_id, kind = request.describe(), "sent");
        Ok(completion)
    }

    /// Waits for the reply to an earlier [`send`](Self::send).
    pub fn await_reply(&self, completion: Completion<Reply>, timeout: Duration) -> ClientResult<WireFrame> {
        self.shared.deliverator.await_reply(completion, timeout)?
    }

    /// Sends a request and waits for its reply with the configured timeout.
    pub fn request(&self, request: impl Into<WireFrame>) -> ClientResult<WireFrame> {
        self.request_with_timeout(request, self.config.request_timeout)
    }

    pub fn request_with_timeout(
        &self,
        request: impl Into<WireFrame>,
        timeout: Duration,
    ) -> ClientResult<WireFrame> {
        let completion = self.send(request)?;
        self.await_reply(completion, timeout)
    }

    /// Sends a one-way frame. Nothing is registered and no reply is expected.
    pub fn push(&self, frame: impl Into<WireFrame>) -> ClientResult<()> {
        self.ensure_connected()?;
        let frame = frame.into().to_frame()?;
        self.enqueue(None, frame)
    }

    /// Blocks until connected or the timeout elapses.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                ConnectionState::Connected => return true,
                ConnectionState::Closed => return false,
                _ if Instant::now() >= deadline => return false,
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    /// Stops the I/O thread. Pending requests fail with
    /// [`ClientError::Closed`]. Idempotent.
    pub fn close(&self) {
        let previous = ConnectionState::from_u8(
            self.shared
                .state
                .swap(ConnectionState::Closed as u8, Ordering::AcqRel),
        );
        if previous != ConnectionState::Closed {
            debug!(node = %self.shared.node, "closing client");
        }
        let _ = self.waker.wake();

        let handle = self
            .io_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(node = %self.shared.node, "client I/O thread panicked");
            }
        }
    }

    fn ensure_connected(&self) -> ClientResult<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(ClientError::Closed),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                Err(ClientError::DestinationUnreachable {
                    node: self.shared.node.clone(),
                })
            }
        }
    }

    fn enqueue(&self, request_id: Option<RequestId>, frame: Frame) -> ClientResult<()> {
        self.shared.outbound().push_back((request_id, frame));
        self.waker.wake()?;
        Ok(())
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("node", &self.shared.node)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

// ============================================================================
// I/O Thread
// ============================================================================

struct IoLoop {
    poll: Poll,
    endpoint: Endpoint,
    config: ClientConfig,
    shared: Arc<Shared>,
    stream: Option<FramedStream>,
    backoff: Backoff,
    next_attempt: Instant,
    connect_started: Instant,
    last_received: Instant,
    last_ping: Instant,
}

impl IoLoop {
    fn new(poll: Poll, endpoint: Endpoint, config: ClientConfig, shared: Arc<Shared>) -> Self {
        let now = Instant::now();
        let backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
        Self {
            poll,
            endpoint,
            config,
            shared,
            stream: None,
            backoff,
            next_attempt: now,
            connect_started: now,
            last_received: now,
            last_ping: now,
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.shared.state() != ConnectionState::Closed {
            if self.stream.is_none() && Instant::now() >= self.next_attempt {
                self.start_connect();
            }

            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout())) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(node = %self.shared.node, error = %e, "client poll failed");
                break;
            }

            for event in &events {
                if event.token() == STREAM_TOKEN {
                    self.handle_stream_event(event.is_readable(), event.is_writable());
                }
            }

            self.drain_outbound();
            self.check_timers();
        }

        self.shutdown();
    }

    fn poll_timeout(&self) -> Duration {
        if self.stream.is_none() {
            self.next_attempt
                .saturating_duration_since(Instant::now())
                .min(MAX_POLL_WAIT)
        } else {
            MAX_POLL_WAIT
        }
    }

    fn start_connect(&mut self) {
        self.connect_started = Instant::now();
        let result = Stream::connect(&self.endpoint).and_then(|stream| {
            let mut framed = FramedStream::new(stream, self.config.buffer_size);
            self.poll.registry().register(
                framed.stream_mut(),
                STREAM_TOKEN,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            Ok(framed)
        });

        match result {
            Ok(framed) => {
                trace!(node = %self.shared.node, endpoint = %self.endpoint, "connecting");
                self.stream = Some(framed);
                self.shared.set_state(ConnectionState::Connecting);
            }
            Err(e) => self.disconnect(&format!("connect failed: {e}")),
        }
    }

    fn handle_stream_event(&mut self, readable: bool, writable: bool) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };

        if self.shared.state() == ConnectionState::Connecting {
            match stream.stream().connection_status() {
                Ok(true) => self.on_connected(),
                Ok(false) => return,
                Err(e) => {
                    self.disconnect(&format!("connect failed: {e}"));
                    return;
                }
            }
        }

        if readable {
            self.read_frames();
        }
        if writable {
            self.flush();
        }
    }

    fn on_connected(&mut self) {
        let now = Instant::now();
        self.last_received = now;
        self.last_ping = now;
        self.backoff.reset();
        self.shared.set_state(ConnectionState::Connected);
        info!(node = %self.shared.node, endpoint = %self.endpoint, "connected");
    }

    fn read_frames(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut frames = Vec::new();
        let failure = loop {
            match stream.receive() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };

        if !frames.is_empty() {
            self.last_received = Instant::now();
        }
        for frame in frames {
            self.dispatch(&frame);
        }
        if let Some(e) = failure {
            self.disconnect(&e.to_string());
        }
    }

    fn dispatch(&self, frame: &Frame) {
        let reply = match WireFrame::from_frame(frame) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(node = %self.shared.node, error = %e, "dropping malformed reply");
                return;
            }
        };

        if let WireFrame::Message(envelope) = &reply {
            if let Message::PingReply(_) = envelope.message {
                trace!(node = %self.shared.node, "ping reply");
                return;
            }
        }

        match reply.request_id() {
            Some(request_id) => {
                self.shared.deliverator.deliver(request_id, Ok(reply));
            }
            None => debug!(node = %self.shared.node, kind = reply.describe(), "reply without id"),
        }
    }

    /// Writes queued frames. Frames that cannot be written fail their
    /// requests at once instead of leaving them to time out.
    fn drain_outbound(&mut self) {
        let queued: Vec<Outbound> = self.shared.outbound().drain(..).collect();
        if queued.is_empty() {
            return;
        }

        if self.stream.is_none() || self.shared.state() != ConnectionState::Connected {
            let failed = self.fail_unreachable(&queued);
            debug!(node = %self.shared.node, dropped = queued.len(), failed, "not connected, dropping queued frames");
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        for (sent, (_, frame)) in queued.iter().enumerate() {
            if let Err(e) = stream.send(frame) {
                self.fail_unreachable(&queued[sent..]);
                self.disconnect(&format!("write failed: {e}"));
                return;
            }
        }
    }

    fn fail_unreachable(&self, dropped: &[Outbound]) -> usize {
        let node = &self.shared.node;
        self.shared
            .fail_dropped(dropped, || ClientError::DestinationUnreachable { node: node.clone() })
    }

    fn flush(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if let Err(e) = stream.flush() {
            self.disconnect(&format!("write failed: {e}"));
        }
    }

    fn check_timers(&mut self) {
        let now = Instant::now();
        match self.shared.state() {
            ConnectionState::Connecting if self.stream.is_some() => {
                if now.duration_since(self.connect_started) > self.config.connect_timeout {
                    self.disconnect("connect timed out");
                }
            }
            ConnectionState::Connected => {
                if now.duration_since(self.last_received) > self.config.heartbeat_timeout {
                    self.disconnect("heartbeat timed out");
                } else if now.duration_since(self.last_ping) >= self.config.heartbeat_interval {
                    self.last_ping = now;
                    self.send_ping();
                }
            }
            _ => {}
        }
    }

    fn send_ping(&mut self) {
        let ping = WireFrame::from(Message::Ping(Ping {
            message_id: RequestId::random(),
        }));
        let result = ping.to_frame().map_err(ClientError::from).and_then(|frame| {
            match self.stream.as_mut() {
                Some(stream) => stream.send(&frame),
                None => Ok(()),
            }
        });
        if let Err(e) = result {
            self.disconnect(&format!("ping failed: {e}"));
        }
    }

    /// Drops the stream, fails everything in flight and schedules a
    /// reconnect.
    fn disconnect(&mut self, reason: &str) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(stream.stream_mut());
            stream.close();
        }

        let previous = self.shared.set_state(ConnectionState::Disconnected);
        let delay = self.backoff.next_delay();
        self.next_attempt = Instant::now() + delay;

        if previous == ConnectionState::Connected {
            warn!(
                node = %self.shared.node,
                endpoint = %self.endpoint,
                reason,
                retry_in_ms = delay.as_millis() as u64,
                "disconnected"
            );
        } else {
            debug!(
                node = %self.shared.node,
                endpoint = %self.endpoint,
                reason,
                attempts = self.backoff.attempts(),
                retry_in_ms = delay.as_millis() as u64,
                "connect attempt failed"
            );
        }

        let dropped: Vec<Outbound> = self.shared.outbound().drain(..).collect();
        self.fail_unreachable(&dropped);
        let node = self.shared.node.clone();
        let failed = self
            .shared
            .deliverator
            .resolve_all(|_| Err(ClientError::DestinationUnreachable { node: node.clone() }));
        if failed > 0 {
            debug!(node = %node, failed, "failed in-flight requests");
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(stream.stream_mut());
            stream.close();
        }
        let dropped: Vec<Outbound> = self.shared.outbound().drain(..).collect();
        self.shared.fail_dropped(&dropped, || ClientError::Closed);
        self.shared.deliverator.resolve_all(|_| Err(ClientError::Closed));
        debug!(node = %self.shared.node, "client I/O thread stopped");
    }
}

#[cfg(test)]
mod resilient_tests {
    use super::*;

    fn io_loop(state: ConnectionState) -> IoLoop {
        let shared = Arc::new(Shared {
            node: NodeName::new("node-b"),
            state: AtomicU8::new(state as u8),
            outbound: Mutex::new(VecDeque::new()),
            deliverator: Deliverator::new(),
        });
        let endpoint: Endpoint = "tcp://127.0.0.1:1".parse().unwrap();
        IoLoop::new(Poll::new().unwrap(), endpoint, ClientConfig::default(), shared)
    }

    fn ping_frame() -> Frame {
        WireFrame::from(Message::Ping(Ping {
            message_id: RequestId::random(),
        }))
        .to_frame()
        .unwrap()
    }

    #[test]
    fn queued_request_fails_fast_when_it_cannot_be_written() {
        for state in [ConnectionState::Disconnected, ConnectionState::Connected] {
            let mut io = io_loop(state);
            let completion = io.shared.deliverator.register();
            io.shared
                .outbound()
                .push_back((Some(completion.request_id()), ping_frame()));
            io.shared.outbound().push_back((None, ping_frame()));

            io.drain_outbound();

            let started = Instant::now();
            let reply = io
                .shared
                .deliverator
                .await_reply(completion, Duration::from_secs(5))
                .unwrap();
            assert!(matches!(reply, Err(ClientError::DestinationUnreachable { .. })));
            assert!(started.elapsed() < Duration::from_secs(1));
            assert_eq!(io.shared.deliverator.pending_count(), 0);
            assert!(io.shared.outbound().is_empty());
        }
    }

    #[test]
    fn queued_request_fails_as_closed_on_shutdown() {
        let mut io = io_loop(ConnectionState::Closed);
        let completion = io.shared.deliverator.register();
        io.shared
            .outbound()
            .push_back((Some(completion.request_id()), ping_frame()));

        io.shutdown();

        let reply = io
            .shared
            .deliverator
            .await_reply(completion, Duration::from_secs(5))
            .unwrap();
        assert!(matches!(reply, Err(ClientError::Closed)));
    }
}
