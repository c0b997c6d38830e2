//! Murmur broadcast relay.
//!
//! Clients connect over TCP and every chunk one client sends is rebroadcast
//! to all other connected clients. Everything runs on one thread: a single
//! readiness wait multiplexes the listener and all clients, and every socket
//! operation after it is non-blocking.
//!
//! # Components
//!
//! - [`ConnectionRegistry`]: fixed-capacity handle → slot table with O(1)
//!   swap-with-last removal
//! - [`Multiplexer`]: blocking readiness wait ([`MioMultiplexer`] in
//!   production)
//! - [`Relay`]: connection lifecycle and the event loop
//! - [`broadcast`]: message formatting and per-target fan-out
//! - [`Server`]: production wiring of a resolved TCP listener and mio

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broadcast;
mod error;
mod registry;
mod relay;
pub mod transport;

use std::{net::SocketAddr, time::Duration};

pub use broadcast::{FanoutReport, Outbound, SendError, SendPolicy};
pub use error::ServerError;
pub use registry::{ConnectionId, ConnectionRegistry, PeerInfo, Readiness, RegistryError, Slot};
pub use relay::{
    Accepted, CloseReason, DEFAULT_MAX_CONNECTIONS, DEFAULT_RECV_CHUNK_SIZE, Relay, RelayConfig,
    Serviced,
};
pub use transport::{Listener, MioMultiplexer, Multiplexer, PeerStream, obtain_listener};

/// Default host to resolve and bind.
pub const DEFAULT_HOST: &str = "localhost";

/// Default port to bind.
pub const DEFAULT_PORT: u16 = 3490;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Host to resolve and bind (e.g., "localhost", "0.0.0.0")
    pub host: String,
    /// Port to bind. 0 picks an ephemeral port.
    pub port: u16,
    /// Relay configuration (capacity, chunk size, send retries)
    pub relay: RelayConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self { host: DEFAULT_HOST.to_string(), port: DEFAULT_PORT, relay: RelayConfig::default() }
    }
}

/// Production Murmur server.
///
/// Wraps [`Relay`] with a resolved mio TCP listener and a `mio::Poll`.
pub struct Server {
    relay: Relay<MioMultiplexer>,
}

impl Server {
    /// Resolve, bind and listen.
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let listener = obtain_listener(&config.host, config.port)?;
        let multiplexer = MioMultiplexer::new(config.relay.max_connections)?;
        let relay = Relay::new(listener, multiplexer, config.relay)?;

        Ok(Self { relay })
    }

    /// Run the event loop.
    ///
    /// Only returns on a fatal multiplexer failure.
    pub fn run(mut self) -> Result<(), ServerError> {
        tracing::info!(
            addr = %self.local_addr()?,
            max_connections = self.relay.config().max_connections,
            "relay running"
        );
        self.relay.run()
    }

    /// Run a single event loop iteration, waiting at most `timeout`.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), ServerError> {
        self.relay.poll_once(timeout)
    }

    /// The underlying relay.
    pub fn relay(&self) -> &Relay<MioMultiplexer> {
        &self.relay
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.relay.local_addr()?)
    }
}
