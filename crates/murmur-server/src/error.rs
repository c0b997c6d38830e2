//! Server error types.

use std::io;

use thiserror::Error;

use crate::registry::RegistryError;

/// Errors that can occur in the server.
///
/// Everything here is terminal for the process: startup failures and the
/// failure of the readiness wait itself. Per-connection and per-target
/// failures are logged and absorbed by the relay, never surfaced.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (unresolvable host, invalid limits, etc.).
    ///
    /// Fatal at startup. Fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error while setting up sockets.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The blocking readiness wait failed outside of a signal interruption.
    #[error("multiplexer failed: {0}")]
    Multiplexer(#[source] io::Error),

    /// Registry could not be constructed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let err = ServerError::Config("chunk size must be non-zero".to_string());
        assert_eq!(err.to_string(), "configuration error: chunk size must be non-zero");

        let err = ServerError::Registry(RegistryError::Capacity { capacity: 6 });
        assert_eq!(err.to_string(), "registry error: registry is at capacity (6 slots)");

        let err = ServerError::Multiplexer(io::Error::other("epoll gone"));
        assert_eq!(err.to_string(), "multiplexer failed: epoll gone");
    }
}
