//! Connection registry: authoritative metadata for every live socket.
//!
//! Entries live in an explicit arena keyed by connection id. The gateway
//! calls [`ConnectionRegistry::cleanup`] on every close path; the
//! [`Registration`] guard releases an entry whose owner vanished without
//! doing so (task panic or abort).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use tether_protocol::{ConnectionId, ConnectionState, RoomId, UserId};

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),
}

/// Per-socket metadata.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub state: ConnectionState,
    pub rooms: HashSet<RoomId>,
    pub reconnect_attempts: u32,
    pub last_ping: Option<Instant>,
    pub last_pong: Option<Instant>,
    /// Set by a fabric failover; consumed on the next heartbeat.
    pub needs_revalidation: bool,
}

impl Connection {
    fn new(id: ConnectionId, user_id: UserId) -> Self {
        Self {
            id,
            user_id,
            state: ConnectionState::Disconnected,
            rooms: HashSet::new(),
            reconnect_attempts: 0,
            last_ping: None,
            last_pong: None,
            needs_revalidation: false,
        }
    }

    /// Round-trip time of the last answered ping.
    pub fn rtt(&self) -> Option<Duration> {
        match (self.last_ping, self.last_pong) {
            (Some(ping), Some(pong)) if pong >= ping => Some(pong - ping),
            _ => None,
        }
    }
}

/// Process-wide table of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_connection<T>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection) -> T,
    ) -> Result<T, RegistryError> {
        let mut map = self.write();
        map.get_mut(&id).map(f).ok_or(RegistryError::NotFound(id))
    }

    /// Registers a new connection in `disconnected` state.
    ///
    /// Never overwrites: an existing id is rejected.
    pub fn register(
        &self,
        id: ConnectionId,
        user_id: impl Into<UserId>,
    ) -> Result<Connection, RegistryError> {
        let mut map = self.write();
        if map.contains_key(&id) {
            warn!(connection = %id, "duplicate registration rejected");
            return Err(RegistryError::AlreadyRegistered(id));
        }
        let conn = Connection::new(id, user_id.into());
        map.insert(id, conn.clone());
        debug!(connection = %id, user = %conn.user_id, "connection registered");
        Ok(conn)
    }

    /// Like [`register`](Self::register) but returns a guard that releases
    /// the entry if it is dropped without an explicit cleanup.
    pub fn register_guarded(
        self: &Arc<Self>,
        id: ConnectionId,
        user_id: impl Into<UserId>,
    ) -> Result<Registration, RegistryError> {
        self.register(id, user_id)?;
        Ok(Registration {
            registry: Arc::clone(self),
            id,
            released: false,
        })
    }

    /// Moves a connection to `next` if the lifecycle graph allows it.
    ///
    /// An illegal transition is a protocol anomaly, not a failure: it is
    /// logged, the state stays as it was, and `Ok(false)` is returned.
    pub fn update_state(
        &self,
        id: ConnectionId,
        next: ConnectionState,
    ) -> Result<bool, RegistryError> {
        self.with_connection(id, |conn| match conn.state.transition(next) {
            Ok(state) => {
                debug!(connection = %id, from = %conn.state, to = %state, "state changed");
                conn.state = state;
                true
            }
            Err(e) => {
                warn!(connection = %id, "{e}; keeping {}", conn.state);
                false
            }
        })
    }

    /// Adds a room to the connection's subscriptions.
    ///
    /// Returns `Ok(false)` (and warns) if the room was already subscribed.
    pub fn add_room_subscription(
        &self,
        id: ConnectionId,
        room_id: &str,
    ) -> Result<bool, RegistryError> {
        self.with_connection(id, |conn| {
            let added = conn.rooms.insert(room_id.to_string());
            if !added {
                warn!(connection = %id, room = %room_id, "room already subscribed");
            }
            added
        })
    }

    /// Removes a room from the connection's subscriptions.
    pub fn remove_room_subscription(
        &self,
        id: ConnectionId,
        room_id: &str,
    ) -> Result<bool, RegistryError> {
        self.with_connection(id, |conn| conn.rooms.remove(room_id))
    }

    /// Current subscription set, sorted, for batch re-join.
    pub fn rooms_for_resubscription(&self, id: ConnectionId) -> Result<Vec<RoomId>, RegistryError> {
        let map = self.read();
        let conn = map.get(&id).ok_or(RegistryError::NotFound(id))?;
        let mut rooms: Vec<RoomId> = conn.rooms.iter().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }

    /// Increments the reconnect counter, returning the new value.
    pub fn increment_reconnect_attempts(&self, id: ConnectionId) -> Result<u32, RegistryError> {
        self.with_connection(id, |conn| {
            conn.reconnect_attempts = conn.reconnect_attempts.saturating_add(1);
            conn.reconnect_attempts
        })
    }

    pub fn reset_reconnect_attempts(&self, id: ConnectionId) -> Result<(), RegistryError> {
        self.with_connection(id, |conn| conn.reconnect_attempts = 0)
    }

    pub fn record_ping(&self, id: ConnectionId, at: Instant) -> Result<(), RegistryError> {
        self.with_connection(id, |conn| conn.last_ping = Some(at))
    }

    /// Records a pong and returns the resulting round-trip time.
    pub fn record_pong(
        &self,
        id: ConnectionId,
        at: Instant,
    ) -> Result<Option<Duration>, RegistryError> {
        self.with_connection(id, |conn| {
            conn.last_pong = Some(at);
            conn.rtt()
        })
    }

    /// Flags every connection for room re-validation. Returns how many.
    pub fn mark_all_for_revalidation(&self) -> usize {
        let mut map = self.write();
        for conn in map.values_mut() {
            conn.needs_revalidation = true;
        }
        map.len()
    }

    /// Clears and returns the re-validation flag.
    pub fn take_revalidation(&self, id: ConnectionId) -> bool {
        self.with_connection(id, |conn| std::mem::take(&mut conn.needs_revalidation))
            .unwrap_or(false)
    }

    /// Connections subscribed to `room_id`.
    pub fn subscribers(&self, room_id: &str) -> Vec<ConnectionId> {
        self.read()
            .values()
            .filter(|conn| conn.rooms.contains(room_id))
            .map(|conn| conn.id)
            .collect()
    }

    /// Snapshot of one connection.
    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Releases a connection's metadata (and its room subscriptions).
    pub fn cleanup(&self, id: ConnectionId) -> Option<Connection> {
        let removed = self.write().remove(&id);
        if let Some(conn) = &removed {
            debug!(connection = %id, rooms = conn.rooms.len(), "connection cleaned up");
        }
        removed
    }
}

/// Ownership token for a registry entry.
///
/// Call [`cleanup`](Registration::cleanup) on the normal close path. If the
/// guard is dropped first, the entry is released anyway and a warning is
/// logged.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    released: bool,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Explicitly releases the entry.
    pub fn cleanup(mut self) -> Option<Connection> {
        self.released = true;
        self.registry.cleanup(self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released && self.registry.cleanup(self.id).is_some() {
            warn!(connection = %self.id, "connection released without explicit cleanup");
        }
    }
}
