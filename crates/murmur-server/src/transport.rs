//! Socket seams and the mio-backed readiness multiplexer.
//!
//! The relay only talks to sockets through [`Listener`], [`PeerStream`] and
//! [`Multiplexer`]. Production uses mio's non-blocking TCP types and a single
//! `mio::Poll`; tests substitute in-memory doubles.
//!
//! mio reports readiness edges, not levels. [`MioMultiplexer::wait`] merges
//! each event into the registry's readiness array, and the relay keeps a bit
//! set until it observes would-block, so the effective behavior matches a
//! level-triggered `poll(2)` loop.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener, TcpStream},
};

use crate::{
    error::ServerError,
    registry::{ConnectionId, ConnectionRegistry, Readiness},
};

/// A connected, non-blocking client socket.
pub trait PeerStream: Read + Write {
    /// Remote address of the peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// A bound, listening, non-blocking socket.
pub trait Listener {
    /// Stream type produced by [`Listener::accept`].
    type Stream: PeerStream;

    /// Accept one pending connection. Returns `WouldBlock` when none is queued.
    ///
    /// The returned stream is already non-blocking.
    fn accept(&mut self) -> io::Result<Self::Stream>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Single blocking wait over the listener and all client sockets.
pub trait Multiplexer {
    /// Listener type this multiplexer can watch.
    type Listener: Listener<Stream = Self::Stream>;
    /// Client stream type this multiplexer can watch.
    type Stream: PeerStream;

    /// Watch the listener for pending connections.
    fn watch_listener(&mut self, id: ConnectionId, listener: &mut Self::Listener)
    -> io::Result<()>;

    /// Watch a client for readable, hangup and error conditions.
    fn watch(&mut self, id: ConnectionId, stream: &mut Self::Stream) -> io::Result<()>;

    /// Stop watching a client before it is closed.
    fn unwatch(&mut self, stream: &mut Self::Stream) -> io::Result<()>;

    /// Block until at least one watched handle is ready (or `timeout`
    /// elapses) and merge the reported bits into `registry`.
    ///
    /// A wait interrupted by a signal surfaces as `ErrorKind::Interrupted`;
    /// the relay treats it as an empty iteration.
    fn wait(
        &mut self,
        registry: &mut ConnectionRegistry,
        timeout: Option<Duration>,
    ) -> io::Result<()>;
}

impl PeerStream for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> io::Result<TcpStream> {
        TcpListener::accept(self).map(|(stream, _)| stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Readiness multiplexer over `mio::Poll` (epoll/kqueue/IOCP).
pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
}

impl MioMultiplexer {
    /// Create a poller sized for `capacity` handles per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(capacity.max(1)) })
    }
}

impl Multiplexer for MioMultiplexer {
    type Listener = TcpListener;
    type Stream = TcpStream;

    fn watch_listener(&mut self, id: ConnectionId, listener: &mut TcpListener) -> io::Result<()> {
        self.poll.registry().register(listener, Token(id.0), Interest::READABLE)
    }

    fn watch(&mut self, id: ConnectionId, stream: &mut TcpStream) -> io::Result<()> {
        // Hangup and error are always reported, regardless of interest
        self.poll.registry().register(stream, Token(id.0), Interest::READABLE)
    }

    fn unwatch(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }

    fn wait(
        &mut self,
        registry: &mut ConnectionRegistry,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;

        for event in &self.events {
            let id = ConnectionId(event.token().0);
            let readiness = Readiness {
                readable: event.is_readable(),
                hangup: event.is_read_closed() || event.is_write_closed(),
                error: event.is_error(),
            };

            if !registry.mark_ready(id, readiness) {
                tracing::trace!(%id, "readiness for unregistered connection");
            }
        }

        Ok(())
    }
}

/// Resolve `host:port` and bind the first address that accepts a bind.
///
/// The returned listener is non-blocking. The address family is logged but
/// otherwise irrelevant to the relay.
pub fn obtain_listener(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    tracing::info!(host, port, "resolving listen address");

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ServerError::Config(format!("failed to resolve '{host}:{port}': {e}")))?;

    let mut last_error = None;
    for addr in addrs {
        match std::net::TcpListener::bind(addr) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                let family = if addr.is_ipv4() { "IPv4" } else { "IPv6" };
                tracing::info!(%addr, family, "listener bound, waiting for connections");
                return Ok(TcpListener::from_std(listener));
            },
            Err(e) => {
                tracing::warn!(%addr, error = %e, "bind failed, trying next address");
                last_error = Some(e);
            },
        }
    }

    Err(match last_error {
        Some(e) => ServerError::Transport(e),
        None => ServerError::Config(format!("'{host}:{port}' resolved to no addresses")),
    })
}
