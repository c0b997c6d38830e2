//! Relay driver: connection lifecycle and the event loop.
//!
//! Ties together the listener, the [`Multiplexer`], the
//! [`ConnectionRegistry`] and the broadcast engine. One iteration
//! ([`Relay::poll_once`]) blocks on the multiplexer, services the listener if
//! it is ready, then services every ready client in slot order.
//!
//! # Connection lifecycle
//!
//! ```text
//! ┌────────────┐  registered  ┌─────────────┐  zero-byte read  ┌───────────────────┐
//! │ Connecting │─────────────>│ Established │─────────────────>│ Closing(Graceful) │──┐
//! └────────────┘              └─────────────┘                  └───────────────────┘  │
//!       │ registry full              │ receive error           ┌───────────────────┐  │
//!       │                            └────────────────────────>│ Closing(Error)    │──┤
//!       ↓                                                      └───────────────────┘  ↓
//!  capacity notice, dropped                                                       ┌────────┐
//!                                                                                 │ Closed │
//!                                                                                 └────────┘
//! ```
//!
//! Closed connections are reclaimed immediately with the registry's
//! swap-with-last removal, which moves a different live connection into the
//! vacated slot. The service loop re-examines that slot before advancing.

use std::{
    collections::HashMap,
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
    time::Duration,
};

use crate::{
    broadcast::{
        self, CAPACITY_NOTICE, DEFAULT_SEND_RETRY_LIMIT, DEFAULT_SEND_STALL_TIMEOUT, FanoutReport,
        Outbound, SendPolicy, UNKNOWN_PEER,
    },
    error::ServerError,
    registry::{ConnectionId, ConnectionRegistry, PeerInfo, RegistryError},
    transport::{Listener, Multiplexer, PeerStream},
};

/// Default slot count: 1 listener + 5 clients.
pub const DEFAULT_MAX_CONNECTIONS: usize = 6;

/// Default maximum bytes per receive, and so per relayed message.
pub const DEFAULT_RECV_CHUNK_SIZE: usize = 256;

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum live slots, listener included
    pub max_connections: usize,
    /// Maximum bytes read per receive
    pub recv_chunk_size: usize,
    /// Consecutive would-block retries per broadcast target
    pub send_retry_limit: u32,
    /// Minimum time a broadcast target may stay blocked before it is skipped
    pub send_stall_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            recv_chunk_size: DEFAULT_RECV_CHUNK_SIZE,
            send_retry_limit: DEFAULT_SEND_RETRY_LIMIT,
            send_stall_timeout: DEFAULT_SEND_STALL_TIMEOUT,
        }
    }
}

impl RelayConfig {
    /// Reject limits the relay cannot operate with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections < 2 {
            return Err(ServerError::Config(format!(
                "max connections must allow at least one client (got {})",
                self.max_connections
            )));
        }
        if self.recv_chunk_size == 0 {
            return Err(ServerError::Config("receive chunk size must be non-zero".to_string()));
        }
        Ok(())
    }

    fn send_policy(&self) -> SendPolicy {
        SendPolicy { retry_limit: self.send_retry_limit, stall_timeout: self.send_stall_timeout }
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer shut down its side (zero-byte read)
    Graceful,
    /// Receive failed; peer is unreachable
    Error,
}

/// Result of accepting one pending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Connection registered under this handle
    Registered(ConnectionId),
    /// Registry was full; the connection got the capacity notice and was closed
    Rejected,
}

/// Result of servicing one ready client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serviced {
    /// Connection stays open and may have more to read
    Continued,
    /// Connection stays open; nothing left to read (would-block)
    Drained,
    /// Connection was removed and closed
    Disconnected(CloseReason),
}

/// Single-threaded broadcast relay.
pub struct Relay<M: Multiplexer> {
    /// Listening socket, registered at slot 0
    listener: M::Listener,
    /// Readiness multiplexer
    multiplexer: M,
    /// Handle → slot registry and readiness array
    registry: ConnectionRegistry,
    /// Open client sockets. Keys always match the registry's members
    streams: HashMap<ConnectionId, M::Stream>,
    /// Configuration
    config: RelayConfig,
    /// Next client handle to hand out
    next_id: usize,
    /// Receive buffer reused across reads
    recv_buf: Vec<u8>,
}

impl<M: Multiplexer> Relay<M> {
    /// Register `listener` at slot 0 and build an empty relay.
    pub fn new(
        mut listener: M::Listener,
        mut multiplexer: M,
        config: RelayConfig,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let registry = ConnectionRegistry::new(ConnectionId::LISTENER, config.max_connections)?;
        multiplexer.watch_listener(ConnectionId::LISTENER, &mut listener)?;

        Ok(Self {
            listener,
            multiplexer,
            registry,
            streams: HashMap::with_capacity(config.max_connections),
            recv_buf: vec![0; config.recv_chunk_size],
            next_id: ConnectionId::LISTENER.0 + 1,
            config,
        })
    }

    /// Run until the multiplexer fails. Never returns `Ok`.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// One event loop iteration.
    ///
    /// Blocks for up to `timeout` (forever if `None`) unless a slot still
    /// carries readiness from the previous iteration, in which case the wait
    /// does not block. A wait interrupted by a signal ends the iteration
    /// without servicing anything.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), ServerError> {
        let timeout = if self.registry.has_pending() { Some(Duration::ZERO) } else { timeout };

        match self.multiplexer.wait(&mut self.registry, timeout) {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                tracing::debug!("readiness wait interrupted by signal");
                return Ok(());
            },
            Err(e) => {
                tracing::error!(error = %e, "readiness wait failed");
                return Err(ServerError::Multiplexer(e));
            },
        }

        self.dispatch();
        Ok(())
    }

    /// Service the listener, then every ready client in slot order.
    fn dispatch(&mut self) {
        if self.registry.slot(0).is_some_and(|slot| slot.readiness.is_ready()) {
            match self.accept_new() {
                Ok(_) => {},
                Err(e) if e.kind() == ErrorKind::WouldBlock => self.registry.clear_ready(0),
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }

        let mut index = 1;
        while let Some(slot) = self.registry.slot(index).copied() {
            if !slot.readiness.is_ready() {
                index += 1;
                continue;
            }

            match self.service_existing(slot.id) {
                Serviced::Continued => index += 1,
                Serviced::Drained => {
                    self.registry.clear_ready(index);
                    index += 1;
                },
                // Swap-with-last moved another connection into `index`
                Serviced::Disconnected(_) => {},
            }
        }
    }

    /// Accept one pending connection.
    ///
    /// When the registry is full the connection receives a single best-effort
    /// capacity notice and is closed without being registered. Otherwise it
    /// is registered, watched, and announced to every other client.
    pub fn accept_new(&mut self) -> io::Result<Accepted> {
        let mut stream = self.listener.accept()?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let peer = stream.peer_addr().map_or_else(
            |e| {
                tracing::debug!(%id, error = %e, "peer address unavailable");
                UNKNOWN_PEER.to_string()
            },
            |addr| addr.ip().to_string(),
        );

        let slot = match self.registry.insert(id, PeerInfo::new(peer.clone())) {
            Ok(slot) => slot,
            Err(RegistryError::Capacity { capacity }) => {
                tracing::warn!(%id, %peer, capacity, "server at capacity, rejecting connection");
                reject(&mut stream);
                return Ok(Accepted::Rejected);
            },
            Err(e) => {
                tracing::warn!(%id, error = %e, "could not register connection");
                reject(&mut stream);
                return Ok(Accepted::Rejected);
            },
        };

        if let Err(e) = self.multiplexer.watch(id, &mut stream) {
            if let Err(removal) = self.registry.remove(id) {
                tracing::warn!(%id, error = %removal, "registry removal failed");
            }
            return Err(e);
        }
        self.streams.insert(id, stream);

        tracing::info!(%id, %peer, slot, "new client connected");
        let text = broadcast::join_notice(&peer);
        self.broadcast(&Outbound::Announcement { text: &text, exclude: Some(id) });

        Ok(Accepted::Registered(id))
    }

    /// Perform one receive on `id` and act on the outcome.
    ///
    /// - data: relayed to every other client as one message
    /// - zero bytes: "has left" is announced to every client, then closed
    /// - would-block: nothing to do
    /// - any other error: closed without an announcement
    pub fn service_existing(&mut self, id: ConnectionId) -> Serviced {
        let Some(stream) = self.streams.get_mut(&id) else {
            tracing::warn!(%id, "ready connection has no stream");
            self.close(id);
            return Serviced::Disconnected(CloseReason::Error);
        };

        let mut buf = std::mem::take(&mut self.recv_buf);
        let outcome = match stream.read(&mut buf) {
            Ok(0) => {
                tracing::info!(%id, "client has left");
                self.broadcast(&Outbound::Departure { leaver: id });
                self.close(id);
                Serviced::Disconnected(CloseReason::Graceful)
            },
            Ok(n) => {
                tracing::debug!(%id, bytes = n, "relaying chunk");
                self.broadcast(&Outbound::Relay { sender: id, payload: &buf[..n] });
                Serviced::Continued
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => Serviced::Drained,
            Err(e) if e.kind() == ErrorKind::Interrupted => Serviced::Continued,
            Err(e) => {
                tracing::warn!(%id, error = %e, "receive failed, dropping connection");
                self.close(id);
                Serviced::Disconnected(CloseReason::Error)
            },
        };
        self.recv_buf = buf;

        outcome
    }

    /// Fan `message` out to every client except its excluded sender.
    pub fn broadcast(&mut self, message: &Outbound<'_>) -> FanoutReport {
        broadcast::fan_out(message, &self.registry, &mut self.streams, self.config.send_policy())
    }

    /// Remove `id` from the registry, stop watching it and close it.
    fn close(&mut self, id: ConnectionId) {
        if let Err(e) = self.registry.remove(id) {
            tracing::warn!(%id, error = %e, "registry removal failed");
        }

        if let Some(mut stream) = self.streams.remove(&id) {
            if let Err(e) = self.multiplexer.unwatch(&mut stream) {
                tracing::debug!(%id, error = %e, "deregister failed");
            }
        }
    }

    /// Registry of live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Mutable registry access, for connection metadata.
    pub fn registry_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.registry
    }

    /// Relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Best-effort capacity notice. A failed or partial send is ignored since
/// the stream is dropped right after.
fn reject<S: Write>(stream: &mut S) {
    match stream.write(CAPACITY_NOTICE) {
        Ok(sent) if sent < CAPACITY_NOTICE.len() => {
            tracing::debug!(sent, "capacity notice truncated");
        },
        Ok(_) => {},
        Err(e) => tracing::debug!(error = %e, "capacity notice not delivered"),
    }
}
