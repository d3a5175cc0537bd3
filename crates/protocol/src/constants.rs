use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Baseline interval between gateway pings on a healthy link.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Time to wait for a pong (or any inbound frame) after a ping.
///
/// Fixed regardless of the adaptive ping interval; a link that stays silent
/// this long after a ping is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(30);

/// How often the client pings the gateway while in the foreground.
pub const CLIENT_PING_PERIOD: Duration = Duration::from_secs(15);

/// Client-side read deadline. Anything arriving from the gateway resets it.
pub const CLIENT_READ_DEADLINE: Duration = Duration::from_secs(45);

/// Time allowed for the socket upgrade plus the `welcome` frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum message size in bytes (1 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of room ids in a single `resubscribe_batch`.
pub const MAX_RESUBSCRIBE_BATCH: usize = 50;

/// Query parameter carrying the opaque auth credential.
pub const QUERY_TOKEN: &str = "token";

/// Query parameter carrying the client's reconnect-attempt counter.
pub const QUERY_ATTEMPT: &str = "attempt";

/// WebSocket message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Handshake
    #[serde(rename = "welcome")]
    Welcome,

    // Keepalive
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Membership
    #[serde(rename = "join_room")]
    JoinRoom,
    #[serde(rename = "leave_room")]
    LeaveRoom,
    #[serde(rename = "room_joined")]
    RoomJoined,
    #[serde(rename = "room_left")]
    RoomLeft,
    #[serde(rename = "resubscribe_batch")]
    ResubscribeBatch,
    #[serde(rename = "resubscribe_ack")]
    ResubscribeAck,

    // Application payload
    #[serde(rename = "room_message")]
    RoomMessage,

    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_FORBIDDEN: i32 = 403;
pub const WS_ERR_CODE_TOO_LARGE: i32 = 413;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
