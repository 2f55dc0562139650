//! Message-driven service loop using mio for non-blocking I/O.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use nimbus_client::{Endpoint, Listener};
use nimbus_wire::message::PingReply;
use nimbus_wire::{Message, MessageEnvelope, ReplyResult, WireFrame};
use tracing::{debug, error, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::connection::{Connection, EndpointRole};
use crate::error::{ServerError, ServerResult};
use crate::service::Service;

/// Token for the request/reply listener.
const REPLY_LISTENER: Token = Token(0);

/// Token for the one-way pull listener.
const PULL_LISTENER: Token = Token(1);

/// First token handed to a connection.
const FIRST_CONNECTION: usize = 2;

/// Maximum events to process per poll iteration.
const MAX_EVENTS: usize = 1024;

/// Single-threaded dispatch loop for one service.
///
/// Accepts connections on one reply endpoint and, optionally, one pull
/// endpoint whose requests get no replies. Every decoded request is
/// routed to the [`Service`]; `ping` is answered here so heartbeats work
/// on every endpoint.
///
/// Frames with an intact header but an unparseable payload are dropped and
/// the connection is kept; framing errors close the connection.
pub struct Dispatcher<S> {
    config: DispatcherConfig,
    poll: Poll,
    listener: Listener,
    pull_listener: Option<Listener>,
    connections: HashMap<Token, Connection>,
    service: S,
    next_token: usize,
}

impl<S: Service> Dispatcher<S> {
    /// Binds the reply endpoint.
    pub fn bind(config: DispatcherConfig, endpoint: &Endpoint, service: S) -> ServerResult<Self> {
        Self::bind_with_pull(config, endpoint, None, service)
    }

    /// Binds the reply endpoint and, if given, a pull endpoint.
    pub fn bind_with_pull(
        config: DispatcherConfig,
        endpoint: &Endpoint,
        pull: Option<&Endpoint>,
        service: S,
    ) -> ServerResult<Self> {
        let poll = Poll::new()?;

        let mut listener = bind_listener(endpoint)?;
        poll.registry()
            .register(&mut listener, REPLY_LISTENER, Interest::READABLE)?;

        let pull_listener = match pull {
            Some(pull) => {
                let mut listener = bind_listener(pull)?;
                poll.registry()
                    .register(&mut listener, PULL_LISTENER, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };

        info!(
            service = service.name(),
            endpoint = %endpoint,
            pull = ?pull.map(ToString::to_string),
            "service listening"
        );

        Ok(Self {
            config,
            poll,
            listener,
            pull_listener,
            connections: HashMap::new(),
            service,
            next_token: FIRST_CONNECTION,
        })
    }

    /// The bound reply endpoint, with the actual port when bound to port 0.
    pub fn local_endpoint(&self) -> ServerResult<Endpoint> {
        Ok(self.listener.local_endpoint()?)
    }

    pub fn pull_endpoint(&self) -> ServerResult<Option<Endpoint>> {
        match &self.pull_listener {
            Some(listener) => Ok(Some(listener.local_endpoint()?)),
            None => Ok(None),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    /// Returns the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs the loop until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> ServerResult<()> {
        let service = self.service.name();
        info!(service, "dispatch loop started");

        while !shutdown.load(Ordering::SeqCst) {
            self.poll_once(Some(self.config.poll_interval))?;
        }

        info!(service, connections = self.connections.len(), "dispatch loop stopped");
        Ok(())
    }

    /// Runs a single iteration of the event loop.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> ServerResult<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);

        if let Err(e) = self.poll.poll(&mut events, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        for event in &events {
            match event.token() {
                REPLY_LISTENER => self.accept_connections(EndpointRole::Reply)?,
                PULL_LISTENER => self.accept_connections(EndpointRole::Pull)?,
                token => {
                    if event.is_readable() {
                        self.handle_readable(token)?;
                    }
                    if event.is_writable() {
                        self.handle_writable(token)?;
                    }
                }
            }
        }

        self.service.tick();
        self.cleanup_closed();
        Ok(())
    }

    fn accept_connections(&mut self, role: EndpointRole) -> ServerResult<()> {
        let listener = match role {
            EndpointRole::Reply => &self.listener,
            EndpointRole::Pull => match &self.pull_listener {
                Some(listener) => listener,
                None => return Ok(()),
            },
        };

        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.len() >= self.config.max_connections {
                        warn!(
                            service = self.service.name(),
                            peer = %peer,
                            "max connections reached, rejecting connection"
                        );
                        continue;
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;

                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    debug!(service = self.service.name(), peer = %peer, ?role, ?token, "accepted connection");
                    self.connections.insert(
                        token,
                        Connection::new(role, peer, stream, self.config.buffer_size),
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(service = self.service.name(), error = %e, "error accepting connection");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_readable(&mut self, token: Token) -> ServerResult<()> {
        let Some(conn) = self.connections.get_mut(&token) else {
            trace!(?token, "readable event for unknown token");
            return Ok(());
        };
        conn.touch();

        let open = match conn.read() {
            Ok(open) => open,
            Err(e) => {
                debug!(peer = %conn.peer, error = %e, "read failed");
                conn.closing = true;
                false
            }
        };

        // Frames buffered before a close are still served.
        self.process_requests(token);

        if let Some(conn) = self.connections.get_mut(&token) {
            if let Err(e) = conn.write() {
                debug!(peer = %conn.peer, error = %e, "write failed");
                conn.closing = true;
            }
            if !open {
                debug!(peer = %conn.peer, "connection closed by peer");
                conn.closing = true;
            }
        }

        self.update_interest(token)
    }

    fn handle_writable(&mut self, token: Token) -> ServerResult<()> {
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };

        match conn.write() {
            Ok(true) => trace!(?token, "all data written"),
            Ok(false) => trace!(?token, "more data to write"),
            Err(e) => {
                debug!(peer = %conn.peer, error = %e, "write failed");
                conn.closing = true;
            }
        }

        self.update_interest(token)
    }

    fn process_requests(&mut self, token: Token) {
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };

            let frame = match conn.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %conn.peer, error = %e, "framing error, closing connection");
                    conn.closing = true;
                    break;
                }
            };

            let request = match WireFrame::from_frame(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!(peer = %conn.peer, error = %e, "dropping malformed request");
                    continue;
                }
            };
            trace!(
                service = self.service.name(),
                kind = request.describe(),
                request_id = ?request.request_id(),
                "received request"
            );

            let role = conn.role;
            let reply = match request {
                WireFrame::Message(MessageEnvelope {
                    message: Message::Ping(ping),
                    ..
                }) => Some(WireFrame::from(Message::PingReply(PingReply {
                    message_id: ping.message_id,
                    result: ReplyResult::Success,
                }))),
                request => {
                    let reply = self.service.handle(request);
                    reply.filter(|_| role == EndpointRole::Reply)
                }
            };

            if let Some(reply) = reply {
                if let Some(conn) = self.connections.get_mut(&token) {
                    // Nothing was queued, so the stream is still aligned.
                    if let Err(e) = conn.queue_reply(&reply) {
                        error!(
                            peer = %conn.peer,
                            kind = reply.describe(),
                            error = %e,
                            "reply could not be encoded, dropping it"
                        );
                    }
                }
            }
        }
    }

    fn update_interest(&mut self, token: Token) -> ServerResult<()> {
        let Some(conn) = self.connections.get_mut(&token) else {
            return Ok(());
        };

        let interest = conn.interest();
        self.poll
            .registry()
            .reregister(conn.stream_mut(), token, interest)?;
        Ok(())
    }

    /// Drops connections that are closing or idle.
    fn cleanup_closed(&mut self) {
        let idle_timeout = self.config.idle_timeout;

        let to_close: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.closing || idle_timeout.is_some_and(|timeout| c.is_idle(timeout)))
            .map(|(token, _)| *token)
            .collect();

        for token in to_close {
            if let Some(mut conn) = self.connections.remove(&token) {
                if conn.closing {
                    debug!(peer = %conn.peer, "closing connection");
                } else {
                    debug!(peer = %conn.peer, "closing idle connection");
                }
                let _ = self.poll.registry().deregister(conn.stream_mut());
            }
        }
    }
}

fn bind_listener(endpoint: &Endpoint) -> ServerResult<Listener> {
    Listener::bind(endpoint).map_err(|source| ServerError::BindFailed {
        endpoint: endpoint.clone(),
        source,
    })
}

impl<S: Service> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("service", &self.service.name())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
