//! Deterministic in-memory transport for Murmur relay testing.
//!
//! [`SimNetwork`] hands out a [`SimListener`] and a [`SimMultiplexer`] that
//! plug into [`murmur_server::Relay`], plus [`SimPeer`] handles for the test
//! side of each connection. No sockets are involved, so every run is
//! reproducible.
//!
//! The multiplexer computes readiness from the simulated sockets' state each
//! time it is asked, which is level-triggered: a peer with queued inbound
//! data, a queued hangup or a queued error is reported until the relay
//! consumes it. `wait` never blocks.
//!
//! Peers can be configured to misbehave on the write path (trickle bytes
//! with a would-block after every partial write, fail outright, or stay
//! blocked forever) to exercise the broadcast engine's retry handling.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
    time::Duration,
};

use murmur_server::{
    ConnectionId, ConnectionRegistry, Listener, Multiplexer, PeerStream, Readiness,
};

/// Something the peer did that the relay will observe on its next read.
///
/// `readable` controls whether the multiplexer reports the readable bit
/// alongside the hangup or error bit.
#[derive(Debug, Clone)]
enum Inbound {
    Data(Vec<u8>),
    Eof { readable: bool },
    Error { kind: ErrorKind, readable: bool },
}

/// How the simulated socket reacts to relay writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteBehavior {
    /// Accept everything
    #[default]
    Accept,
    /// Accept at most `step` bytes, then would-block once, repeatedly
    Trickle {
        /// Bytes accepted per successful write
        step: usize,
    },
    /// Always would-block
    Stall,
    /// Always fail with this error kind
    Fail(ErrorKind),
}

#[derive(Debug)]
struct PeerState {
    addr: Option<SocketAddr>,
    inbound: VecDeque<Inbound>,
    received: Vec<u8>,
    write_behavior: WriteBehavior,
    blocked: bool,
    closed: bool,
}

impl PeerState {
    fn readiness(&self) -> Readiness {
        match self.inbound.front() {
            None => Readiness::default(),
            Some(Inbound::Data(_)) => Readiness::READABLE,
            Some(&Inbound::Eof { readable }) => Readiness { readable, hangup: true, error: false },
            Some(&Inbound::Error { readable, .. }) => {
                Readiness { readable, hangup: false, error: true }
            },
        }
    }
}

#[derive(Debug, Default)]
struct NetState {
    pending: VecDeque<SimStream>,
    listener: Option<ConnectionId>,
    watched: Vec<(ConnectionId, Rc<RefCell<PeerState>>)>,
    wait_failure: Option<ErrorKind>,
    waits: usize,
    next_port: u16,
}

/// Shared in-memory network.
///
/// Clone freely; all clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    state: Rc<RefCell<NetState>>,
}

impl SimNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener that accepts connections queued by [`SimNetwork::connect`].
    pub fn listener(&self) -> SimListener {
        SimListener { state: Rc::clone(&self.state) }
    }

    /// Multiplexer reporting readiness of this network's sockets.
    pub fn multiplexer(&self) -> SimMultiplexer {
        SimMultiplexer { state: Rc::clone(&self.state) }
    }

    /// Queue an inbound connection from `127.0.0.1`.
    pub fn connect(&self) -> SimPeer {
        let port = {
            let mut state = self.state.borrow_mut();
            state.next_port += 1;
            state.next_port
        };
        self.connect_from(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)))
    }

    /// Queue an inbound connection whose peer address cannot be resolved.
    pub fn connect_anonymous(&self) -> SimPeer {
        self.connect_from(None)
    }

    fn connect_from(&self, addr: Option<SocketAddr>) -> SimPeer {
        let peer = Rc::new(RefCell::new(PeerState {
            addr,
            inbound: VecDeque::new(),
            received: Vec::new(),
            write_behavior: WriteBehavior::Accept,
            blocked: false,
            closed: false,
        }));

        self.state
            .borrow_mut()
            .pending
            .push_back(SimStream { peer: Rc::clone(&peer), token: None });

        SimPeer { state: peer }
    }

    /// Make the next multiplexer wait fail with `kind`.
    pub fn fail_next_wait(&self, kind: ErrorKind) {
        self.state.borrow_mut().wait_failure = Some(kind);
    }

    /// Number of multiplexer waits performed so far.
    pub fn waits(&self) -> usize {
        self.state.borrow().waits
    }

    /// Number of client sockets currently watched.
    pub fn watched(&self) -> usize {
        self.state.borrow().watched.len()
    }
}

/// Test-side handle of a simulated connection.
#[derive(Debug, Clone)]
pub struct SimPeer {
    state: Rc<RefCell<PeerState>>,
}

impl SimPeer {
    /// Queue bytes for the relay to read.
    ///
    /// Bytes queued by one call are read back-to-back and may be split
    /// across reads at the relay's chunk size.
    pub fn send(&self, bytes: &[u8]) {
        self.state.borrow_mut().inbound.push_back(Inbound::Data(bytes.to_vec()));
    }

    /// Orderly shutdown: the relay reads zero bytes once queued data is gone.
    pub fn hang_up(&self) {
        self.state.borrow_mut().inbound.push_back(Inbound::Eof { readable: true });
    }

    /// Like [`SimPeer::hang_up`], but readiness reports only the hangup bit.
    pub fn hang_up_silently(&self) {
        self.state.borrow_mut().inbound.push_back(Inbound::Eof { readable: false });
    }

    /// Make the relay's next read (after queued data) fail with `kind`.
    pub fn fail_reads(&self, kind: ErrorKind) {
        self.state.borrow_mut().inbound.push_back(Inbound::Error { kind, readable: true });
    }

    /// Like [`SimPeer::fail_reads`], but readiness reports only the error bit.
    pub fn fail_reads_silently(&self, kind: ErrorKind) {
        self.state.borrow_mut().inbound.push_back(Inbound::Error { kind, readable: false });
    }

    /// Change how relay writes to this peer behave.
    pub fn set_write_behavior(&self, behavior: WriteBehavior) {
        let mut state = self.state.borrow_mut();
        state.write_behavior = behavior;
        state.blocked = false;
    }

    /// Everything the relay has written to this peer so far.
    pub fn received(&self) -> Vec<u8> {
        self.state.borrow().received.clone()
    }

    /// Drain what the relay has written so far.
    pub fn take_received(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().received)
    }

    /// Drain what the relay has written so far, lossily decoded.
    pub fn take_text(&self) -> String {
        String::from_utf8_lossy(&self.take_received()).into_owned()
    }

    /// Whether the relay has dropped its end of the connection.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

/// Relay-side end of a simulated connection.
#[derive(Debug)]
pub struct SimStream {
    peer: Rc<RefCell<PeerState>>,
    token: Option<ConnectionId>,
}

impl Read for SimStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.peer.borrow_mut();
        match state.inbound.pop_front() {
            None => Err(ErrorKind::WouldBlock.into()),
            Some(Inbound::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    state.inbound.push_front(Inbound::Data(data.split_off(n)));
                }
                Ok(n)
            },
            Some(eof @ Inbound::Eof { .. }) => {
                // Stays readable at EOF
                state.inbound.push_front(eof);
                Ok(0)
            },
            Some(Inbound::Error { kind, .. }) => Err(kind.into()),
        }
    }
}

impl Write for SimStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.peer.borrow_mut();
        match state.write_behavior {
            WriteBehavior::Accept => {
                state.received.extend_from_slice(buf);
                Ok(buf.len())
            },
            WriteBehavior::Trickle { step } => {
                if state.blocked {
                    state.blocked = false;
                    return Err(ErrorKind::WouldBlock.into());
                }
                state.blocked = true;
                let n = buf.len().min(step);
                state.received.extend_from_slice(&buf[..n]);
                Ok(n)
            },
            WriteBehavior::Stall => Err(ErrorKind::WouldBlock.into()),
            WriteBehavior::Fail(kind) => Err(kind.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PeerStream for SimStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.peer.borrow().addr.ok_or_else(|| ErrorKind::NotConnected.into())
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        self.peer.borrow_mut().closed = true;
    }
}

/// Simulated listening socket.
#[derive(Debug)]
pub struct SimListener {
    state: Rc<RefCell<NetState>>,
}

impl Listener for SimListener {
    type Stream = SimStream;

    fn accept(&mut self) -> io::Result<SimStream> {
        self.state.borrow_mut().pending.pop_front().ok_or_else(|| ErrorKind::WouldBlock.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }
}

/// Level-triggered multiplexer over a [`SimNetwork`].
#[derive(Debug)]
pub struct SimMultiplexer {
    state: Rc<RefCell<NetState>>,
}

impl Multiplexer for SimMultiplexer {
    type Listener = SimListener;
    type Stream = SimStream;

    fn watch_listener(&mut self, id: ConnectionId, _listener: &mut SimListener) -> io::Result<()> {
        self.state.borrow_mut().listener = Some(id);
        Ok(())
    }

    fn watch(&mut self, id: ConnectionId, stream: &mut SimStream) -> io::Result<()> {
        stream.token = Some(id);
        self.state.borrow_mut().watched.push((id, Rc::clone(&stream.peer)));
        Ok(())
    }

    fn unwatch(&mut self, stream: &mut SimStream) -> io::Result<()> {
        let token = stream.token.take().ok_or_else(|| io::Error::from(ErrorKind::NotFound))?;
        self.state.borrow_mut().watched.retain(|(id, _)| *id != token);
        Ok(())
    }

    fn wait(
        &mut self,
        registry: &mut ConnectionRegistry,
        _timeout: Option<Duration>,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.waits += 1;

        if let Some(kind) = state.wait_failure.take() {
            return Err(kind.into());
        }

        if let Some(listener) = state.listener {
            if !state.pending.is_empty() {
                registry.mark_ready(listener, Readiness::READABLE);
            }
        }

        for (id, peer) in &state.watched {
            let readiness = peer.borrow().readiness();
            if readiness.is_ready() {
                registry.mark_ready(*id, readiness);
            }
        }

        Ok(())
    }
}
