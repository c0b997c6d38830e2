//! Broadcast engine: message formatting and fan-out.
//!
//! A broadcast encodes one [`Outbound`] message into a wire payload, computes
//! its targets (every registered client except the excluded sender) and
//! writes the full payload to each target independently. A target that fails
//! is skipped; delivery to the rest continues.
//!
//! # Backpressure
//!
//! Sockets are non-blocking, so a full send buffer shows up as
//! `WouldBlock`. The write to that target is retried in place without
//! returning to the event loop. A target is abandoned with
//! [`SendError::Stalled`] only once it has been blocked for both
//! [`SendPolicy::retry_limit`] consecutive attempts and
//! [`SendPolicy::stall_timeout`] of wall time. An abandoned target may have
//! received a prefix of the payload.

use std::{
    collections::HashMap,
    io::{self, ErrorKind, Write},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::registry::{ConnectionId, ConnectionRegistry};

/// Consecutive would-block retries allowed per target before giving up.
pub const DEFAULT_SEND_RETRY_LIMIT: u32 = 1024;

/// Minimum time a target may stay blocked before it is abandoned.
pub const DEFAULT_SEND_STALL_TIMEOUT: Duration = Duration::from_millis(50);

/// Notice sent to a connection rejected because the registry is full.
pub const CAPACITY_NOTICE: &[u8] = b"server at capacity. please try again later.\n";

/// Display string used when a peer address cannot be resolved.
pub const UNKNOWN_PEER: &str = "unknown";

// Longest `usize` in decimal plus ": "
const PREFIX_BUDGET: usize = 22;

/// Announcement sent to existing clients when a peer joins.
pub fn join_notice(peer: &str) -> String {
    format!("new client connecting from {peer}\n")
}

/// Announcement sent to all clients when a peer leaves.
pub fn leave_notice(id: ConnectionId) -> String {
    format!("client {id} has left the chat!\n")
}

/// A message to fan out, alive for the duration of one broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound<'a> {
    /// Bytes received from a client, relayed to everyone else
    Relay {
        /// Client the bytes came from
        sender: ConnectionId,
        /// Raw chunk as received
        payload: &'a [u8],
    },

    /// Server-generated text, sent as-is
    Announcement {
        /// Announcement text
        text: &'a str,
        /// Connection that must not receive it. `None` reaches every client.
        exclude: Option<ConnectionId>,
    },

    /// "Has left" notice, sent to every client including the one leaving
    Departure {
        /// Connection that shut down
        leaver: ConnectionId,
    },
}

impl Outbound<'_> {
    /// Connection excluded from the target set.
    pub fn excluded(&self) -> Option<ConnectionId> {
        match self {
            Self::Relay { sender, .. } => Some(*sender),
            Self::Announcement { exclude, .. } => *exclude,
            Self::Departure { .. } => None,
        }
    }

    /// Connection that is shutting down, if this message announces one.
    ///
    /// Sends to it are expected to fail.
    pub fn departing(&self) -> Option<ConnectionId> {
        match self {
            Self::Departure { leaver } => Some(*leaver),
            _ => None,
        }
    }

    /// Wire payload: `"<sender>: <bytes>"` for relayed chunks, the bare text
    /// for announcements and departures.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Relay { sender, payload } => {
                let mut buf = BytesMut::with_capacity(payload.len() + PREFIX_BUDGET);
                buf.extend_from_slice(sender.to_string().as_bytes());
                buf.extend_from_slice(b": ");
                buf.extend_from_slice(payload);
                buf.freeze()
            },
            Self::Announcement { text, .. } => Bytes::copy_from_slice(text.as_bytes()),
            Self::Departure { leaver } => Bytes::from(leave_notice(*leaver)),
        }
    }
}

/// Retry policy for a single target's send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPolicy {
    /// Consecutive would-block results tolerated before abandoning the target
    pub retry_limit: u32,
    /// Wall time a target must stay blocked before it can be abandoned
    pub stall_timeout: Duration,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self { retry_limit: DEFAULT_SEND_RETRY_LIMIT, stall_timeout: DEFAULT_SEND_STALL_TIMEOUT }
    }
}

/// Why a single target did not receive the full payload.
#[derive(Error, Debug)]
pub enum SendError {
    /// Target kept returning would-block past the retry limit
    #[error("target stalled after {retries} would-block retries")]
    Stalled {
        /// Retries spent before giving up
        retries: u32,
    },

    /// Target accepted zero bytes
    #[error("target closed")]
    Closed,

    /// Any other send error (reset, broken pipe, ...)
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct FanoutReport {
    /// Targets that received the full payload, in slot order
    pub delivered: Vec<ConnectionId>,
    /// Targets that were abandoned
    pub failed: Vec<(ConnectionId, SendError)>,
}

/// Targets for a message excluding `excluded`, in slot order.
///
/// The listener is never a target.
pub fn targets(
    registry: &ConnectionRegistry,
    excluded: Option<ConnectionId>,
) -> impl Iterator<Item = ConnectionId> + '_ {
    registry.members().filter(move |id| Some(*id) != excluded)
}

/// Write all of `bytes` to `target`, retrying partial writes.
///
/// Would-block is retried in place until the target has been blocked for
/// `policy.retry_limit` consecutive attempts and `policy.stall_timeout`;
/// any progress resets both. Interrupted writes are retried without
/// counting.
pub fn send_all<W: Write + ?Sized>(
    target: &mut W,
    mut bytes: &[u8],
    policy: SendPolicy,
) -> Result<(), SendError> {
    let mut retries = 0;
    let mut blocked_since: Option<Instant> = None;

    while !bytes.is_empty() {
        match target.write(bytes) {
            Ok(0) => return Err(SendError::Closed),
            Ok(sent) => {
                bytes = &bytes[sent..];
                retries = 0;
                blocked_since = None;
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let since = *blocked_since.get_or_insert_with(Instant::now);
                if retries >= policy.retry_limit {
                    if since.elapsed() >= policy.stall_timeout {
                        return Err(SendError::Stalled { retries });
                    }
                    std::thread::yield_now();
                } else {
                    retries += 1;
                    std::hint::spin_loop();
                }
            },
            Err(e) => return Err(SendError::Io(e)),
        }
    }

    Ok(())
}

/// Deliver `message` to every target, isolating per-target failures.
///
/// A registered target with no stream in `streams` is counted as failed.
pub fn fan_out<W: Write>(
    message: &Outbound<'_>,
    registry: &ConnectionRegistry,
    streams: &mut HashMap<ConnectionId, W>,
    policy: SendPolicy,
) -> FanoutReport {
    let payload = message.encode();
    let mut report = FanoutReport::default();

    for id in targets(registry, message.excluded()) {
        let Some(stream) = streams.get_mut(&id) else {
            tracing::warn!(%id, "no stream for registered connection");
            report.failed.push((id, SendError::Closed));
            continue;
        };

        match send_all(stream, &payload, policy) {
            Ok(()) => report.delivered.push(id),
            Err(e) if message.departing() == Some(id) => {
                tracing::debug!(%id, error = %e, "leave notice not delivered to departing client");
                report.failed.push((id, e));
            },
            Err(e) => {
                tracing::warn!(%id, error = %e, "broadcast send failed, skipping target");
                report.failed.push((id, e));
            },
        }
    }

    report
}
