//! Connection registry mapping live handles to readiness slots.
//!
//! The registry owns two parallel structures: a dense readiness array (one
//! [`Slot`] per live handle, the listener pinned at index 0) and a map from
//! [`ConnectionId`] to the entry recording that handle's current slot index.
//! Every live entry satisfies `slots[entry.slot].id == id`. Insertion appends
//! and removal is swap-with-last, so both are O(1) and the invariant holds
//! after every operation.

use std::{collections::HashMap, fmt};

use thiserror::Error;

/// Opaque, process-unique handle for an open socket.
///
/// The same value is used as the readiness token for the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl ConnectionId {
    /// Handle reserved for the listening socket.
    pub const LISTENER: Self = Self(0);
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Readiness bits reported for one handle after a multiplexer wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or a pending inbound connection) is available
    pub readable: bool,
    /// Peer hung up
    pub hangup: bool,
    /// Socket reported an error condition
    pub error: bool,
}

impl Readiness {
    /// Only the readable bit set.
    pub const READABLE: Self = Self { readable: true, hangup: false, error: false };

    /// Whether any bit is set.
    pub fn is_ready(&self) -> bool {
        self.readable || self.hangup || self.error
    }

    /// Bitwise-or `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        self.readable |= other.readable;
        self.hangup |= other.hangup;
        self.error |= other.error;
    }
}

/// One position in the readiness array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Handle occupying this slot
    pub id: ConnectionId,
    /// Readiness accumulated for the handle since it was last serviced
    pub readiness: Readiness,
}

impl Slot {
    fn new(id: ConnectionId) -> Self {
        Self { id, readiness: Readiness::default() }
    }
}

/// Per-connection metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Display form of the peer address (`"unknown"` when unresolvable)
    pub addr: String,
    /// Optional nickname. Not used on the wire.
    pub nickname: Option<String>,
}

impl PeerInfo {
    /// Metadata for a peer at `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), nickname: None }
    }
}

/// Errors from registry mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Capacity must leave room for at least the listener
    #[error("registry capacity must be at least 1")]
    InvalidCapacity,

    /// All slots are taken
    #[error("registry is at capacity ({capacity} slots)")]
    Capacity {
        /// Maximum number of slots, listener included
        capacity: usize,
    },

    /// Handle is already registered
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),

    /// Handle is not registered
    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),

    /// The listener cannot be removed
    #[error("the listener cannot be removed")]
    Listener,
}

#[derive(Debug)]
struct Entry {
    slot: usize,
    info: PeerInfo,
}

/// Fixed-capacity table of live connections.
///
/// The listener is inserted at slot 0 on construction and stays there for the
/// registry's whole lifetime. Clients fill slots `1..count`.
#[derive(Debug)]
pub struct ConnectionRegistry {
    /// Readiness array, index 0 is the listener
    slots: Vec<Slot>,
    /// Handle → entry holding its current slot index
    entries: HashMap<ConnectionId, Entry>,
    /// Maximum number of slots, listener included
    capacity: usize,
}

impl ConnectionRegistry {
    /// Create a registry with `listener` at slot 0.
    ///
    /// `capacity` counts the listener, so a registry of capacity N holds up
    /// to N-1 clients.
    pub fn new(listener: ConnectionId, capacity: usize) -> Result<Self, RegistryError> {
        if capacity == 0 {
            return Err(RegistryError::InvalidCapacity);
        }

        let mut entries = HashMap::with_capacity(capacity);
        entries.insert(listener, Entry { slot: 0, info: PeerInfo::default() });

        let mut slots = Vec::with_capacity(capacity);
        slots.push(Slot::new(listener));

        Ok(Self { slots, entries, capacity })
    }

    /// Register a client handle, returning its slot index.
    ///
    /// Fails without mutating anything when the registry is full or the
    /// handle is already present.
    pub fn insert(&mut self, id: ConnectionId, info: PeerInfo) -> Result<usize, RegistryError> {
        if self.entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        if self.is_full() {
            return Err(RegistryError::Capacity { capacity: self.capacity });
        }

        let slot = self.slots.len();
        self.slots.push(Slot::new(id));
        self.entries.insert(id, Entry { slot, info });
        Ok(slot)
    }

    /// Remove a client handle with swap-with-last.
    ///
    /// The handle in the last slot moves into the vacated slot and its entry
    /// is updated to match. Removing the listener is rejected and leaves the
    /// registry untouched.
    pub fn remove(&mut self, id: ConnectionId) -> Result<PeerInfo, RegistryError> {
        if id == self.listener() {
            return Err(RegistryError::Listener);
        }

        let entry = self.entries.remove(&id).ok_or(RegistryError::NotFound(id))?;
        self.slots.swap_remove(entry.slot);

        if let Some(moved) = self.slots.get(entry.slot) {
            if let Some(moved_entry) = self.entries.get_mut(&moved.id) {
                moved_entry.slot = entry.slot;
            }
        }

        Ok(entry.info)
    }

    /// Handle pinned at slot 0.
    pub fn listener(&self) -> ConnectionId {
        self.slots[0].id
    }

    /// Registered client handles in slot order, listener excluded.
    pub fn members(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.slots[1..].iter().map(|slot| slot.id)
    }

    /// Whether `id` is registered (listener included).
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Current slot index of `id`.
    pub fn slot_of(&self, id: ConnectionId) -> Option<usize> {
        self.entries.get(&id).map(|entry| entry.slot)
    }

    /// Slot at `index`, if live.
    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// The readiness array.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Metadata for `id`.
    pub fn info(&self, id: ConnectionId) -> Option<&PeerInfo> {
        self.entries.get(&id).map(|entry| &entry.info)
    }

    /// Mutable metadata for `id`.
    pub fn info_mut(&mut self, id: ConnectionId) -> Option<&mut PeerInfo> {
        self.entries.get_mut(&id).map(|entry| &mut entry.info)
    }

    /// Live slots, listener included.
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Maximum number of slots, listener included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether another insert would fail.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Merge readiness bits into the slot of `id`.
    ///
    /// Returns `false` if `id` is not registered (stale token).
    pub fn mark_ready(&mut self, id: ConnectionId, readiness: Readiness) -> bool {
        match self.entries.get(&id) {
            Some(entry) => {
                self.slots[entry.slot].readiness.merge(readiness);
                true
            },
            None => false,
        }
    }

    /// Reset the readiness bits of the slot at `index`.
    pub fn clear_ready(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.readiness = Readiness::default();
        }
    }

    /// Whether any slot still carries readiness from an earlier wait.
    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(|slot| slot.readiness.is_ready())
    }
}
