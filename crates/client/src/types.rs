//! Public types for the client connection manager.

use std::time::Duration;

use rand::Rng;

use tether_protocol::constants::MAX_RESUBSCRIBE_BATCH;
use tether_protocol::{ConnectionState, RoomId, RoomMessage};

use crate::outbox::{DEFAULT_OUTBOX_CAPACITY, DEFAULT_OUTBOX_TTL};

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The session moved to a new lifecycle state.
    StateChanged(ConnectionState),
    /// A reconnection attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Room membership was restored and the session is ready.
    Restored { rooms: usize },
    /// A room frame from another member.
    Message(RoomMessage),
    RoomJoined(RoomId),
    RoomLeft(RoomId),
    /// A queued message was discarded before delivery.
    MessageDropped { room_id: RoomId, reason: DropReason },
    /// The gateway refused the credential. Terminal until `connect()`.
    AuthFailed(String),
    /// Reconnection stopped after too many failures. Terminal until `connect()`.
    GaveUp { attempts: u32 },
    /// The gateway answered a request with an error frame.
    ServerError { code: i32, message: String },
}

/// Why a queued message was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Outlived its TTL while waiting for `ready`.
    Expired,
    /// Pushed out by newer messages when the outbox was full.
    Evicted,
}

/// What going to the background does to the socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackgroundPolicy {
    /// Keep the socket, stop sending keepalive pings.
    #[default]
    SuspendPings,
    /// Close the socket and do not reconnect until foregrounded.
    CloseSocket,
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Fractional jitter applied to every delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: 0.1,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (0-based), with random
    /// jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, unit)
    }

    /// `min(max_delay, base_delay * 2^attempt)` scaled by
    /// `1 + jitter * unit`, where `unit` is in `[-1, 1]`.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let exp = attempt.min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let factor = 1.0 + self.jitter * unit.clamp(-1.0, 1.0);
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway endpoint, e.g. `ws://chat.example.com/`.
    pub url: String,
    /// Opaque credential presented during the handshake.
    pub token: String,
    pub reconnect: ReconnectConfig,
    pub outbox_capacity: usize,
    /// Default lifetime of a queued message.
    pub outbox_ttl: Duration,
    /// Keepalive ping period.
    pub ping_interval: Duration,
    /// Silence after which the link is considered dead.
    pub read_deadline: Duration,
    pub background: BackgroundPolicy,
    /// Batch cap used until the gateway's welcome says otherwise.
    pub max_resubscribe_batch: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            reconnect: ReconnectConfig::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            outbox_ttl: DEFAULT_OUTBOX_TTL,
            ping_interval: tether_protocol::constants::CLIENT_PING_PERIOD,
            read_deadline: tether_protocol::constants::CLIENT_READ_DEADLINE,
            background: BackgroundPolicy::default(),
            max_resubscribe_batch: MAX_RESUBSCRIBE_BATCH,
        }
    }
}
