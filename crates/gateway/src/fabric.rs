//! Cross-process pub/sub seam.
//!
//! Gateways in a cluster exchange room traffic through a [`Fabric`]. The
//! gateway only needs three things from it: publish a room frame, declare
//! interest in rooms, and observe events (remote broadcasts and failovers).

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use tether_protocol::RoomId;

/// Boxed future returned by [`Fabric`] methods.
pub type FabricFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FabricError>> + Send + 'a>>;

/// Capacity of the event channel. Lagging receivers skip events.
const EVENT_CAPACITY: usize = 4096;

/// Errors from the fabric.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FabricError {
    #[error("fabric unavailable")]
    Unavailable,

    #[error("fabric rejected request: {0}")]
    Rejected(String),
}

/// A room frame travelling between gateway nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricEnvelope {
    /// Node that published the frame; receivers skip their own.
    pub origin_node: uuid::Uuid,
    pub room_id: RoomId,
    /// Serialized protocol envelope, delivered to sockets verbatim.
    pub payload: String,
}

/// Something the fabric wants the gateway to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    /// A frame published by some node.
    Broadcast(FabricEnvelope),
    /// The fabric lost state (e.g. a broker node failed over); room interest
    /// must be re-declared.
    Failover { reason: String },
}

/// Cross-process pub/sub used by the gateway.
pub trait Fabric: Send + Sync + 'static {
    /// Publishes a frame to every node subscribed to its room.
    fn publish(&self, envelope: FabricEnvelope) -> FabricFuture<'_, ()>;

    /// Declares this node's interest in `rooms`.
    fn subscribe_rooms<'a>(&'a self, rooms: &'a [RoomId]) -> FabricFuture<'a, ()>;

    /// Returns a fresh receiver for fabric events.
    fn events(&self) -> broadcast::Receiver<FabricEvent>;
}

/// In-process [`Fabric`] built on a tokio broadcast channel.
///
/// Several gateways can share one instance to emulate a cluster. The
/// availability switch and [`signal_failover`](Self::signal_failover) drive
/// degraded-mode behavior.
pub struct LocalFabric {
    events: broadcast::Sender<FabricEvent>,
    available: AtomicBool,
    rooms: Mutex<HashSet<RoomId>>,
}

impl LocalFabric {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            available: AtomicBool::new(true),
            rooms: Mutex::new(HashSet::new()),
        }
    }

    /// Toggles availability. While unavailable every call fails with
    /// [`FabricError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        tracing::info!(available, "local fabric availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Emits a failover event and forgets all declared room interest.
    pub fn signal_failover(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::warn!(%reason, "local fabric failover");
        // No receivers is fine.
        let _ = self.events.send(FabricEvent::Failover { reason });
    }

    /// Rooms some node has declared interest in since the last failover.
    pub fn subscribed_rooms(&self) -> HashSet<RoomId> {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_available(&self) -> Result<(), FabricError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(FabricError::Unavailable)
        }
    }
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric for LocalFabric {
    fn publish(&self, envelope: FabricEnvelope) -> FabricFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            let _ = self.events.send(FabricEvent::Broadcast(envelope));
            Ok(())
        })
    }

    fn subscribe_rooms<'a>(&'a self, rooms: &'a [RoomId]) -> FabricFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            self.rooms
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(rooms.iter().cloned());
            Ok(())
        })
    }

    fn events(&self) -> broadcast::Receiver<FabricEvent> {
        self.events.subscribe()
    }
}
