//! Murmur relay binary.
//!
//! # Usage
//!
//! ```bash
//! # Reference sizing: localhost:3490, 1 listener + 5 clients
//! murmur-server
//!
//! # Public interface, larger room
//! murmur-server --host 0.0.0.0 --port 4000 --max-connections 64
//! ```

use std::time::Duration;

use clap::Parser;
use murmur_server::{
    DEFAULT_HOST, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT, DEFAULT_RECV_CHUNK_SIZE, RelayConfig,
    Server, ServerRuntimeConfig,
    broadcast::{DEFAULT_SEND_RETRY_LIMIT, DEFAULT_SEND_STALL_TIMEOUT},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Murmur broadcast relay
#[derive(Parser, Debug)]
#[command(name = "murmur-server")]
#[command(about = "Single-threaded TCP broadcast relay")]
#[command(version)]
struct Args {
    /// Host to resolve and bind
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to bind
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum live connections, listener included
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Maximum bytes read (and relayed) per receive
    #[arg(long, default_value_t = DEFAULT_RECV_CHUNK_SIZE)]
    chunk_size: usize,

    /// Would-block retries per target before a send is abandoned
    #[arg(long, default_value_t = DEFAULT_SEND_RETRY_LIMIT)]
    send_retry_limit: u32,

    /// Milliseconds a blocked target is retried before a send is abandoned
    #[arg(long, default_value_t = DEFAULT_SEND_STALL_TIMEOUT.as_millis() as u64)]
    send_stall_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Murmur relay starting");

    let config = ServerRuntimeConfig {
        host: args.host,
        port: args.port,
        relay: RelayConfig {
            max_connections: args.max_connections,
            recv_chunk_size: args.chunk_size,
            send_retry_limit: args.send_retry_limit,
            send_stall_timeout: Duration::from_millis(args.send_stall_timeout_ms),
        },
    };

    let server = Server::bind(config)?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run()?;

    Ok(())
}
