use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, RoomId};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First frame the gateway sends once the socket is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub connection_id: ConnectionId,
    pub ping_interval_ms: u64,
    pub max_resubscribe_batch: usize,
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Payload of `join_room`, `leave_room`, `room_joined` and `room_left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRef {
    pub room_id: RoomId,
}

/// Batch of rooms a reconnecting client believes it is in.
///
/// Never longer than the `max_resubscribe_batch` advertised in [`Welcome`].
/// The final batch of a restoration carries `last = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResubscribeBatch {
    pub room_ids: Vec<RoomId>,
    #[serde(default)]
    pub last: bool,
}

/// Gateway acknowledgement of one [`ResubscribeBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResubscribeAck {
    /// Rooms from the batch that are now subscribed.
    pub room_ids: Vec<RoomId>,
    /// How many of them were not already present.
    pub added: usize,
    /// `true` once the connection has reached `ready`.
    pub ready: bool,
}

// ---------------------------------------------------------------------------
// Application payload
// ---------------------------------------------------------------------------

/// Application frame addressed to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub room_id: RoomId,
    pub body: serde_json::Value,
}

/// Splits `rooms` into resubscription batches of at most `max` ids.
///
/// Always yields at least one batch; the last one is flagged.
pub fn resubscribe_batches(rooms: &[RoomId], max: usize) -> Vec<ResubscribeBatch> {
    let max = max.max(1);
    if rooms.is_empty() {
        return vec![ResubscribeBatch {
            room_ids: Vec::new(),
            last: true,
        }];
    }
    let chunks: Vec<&[RoomId]> = rooms.chunks(max).collect();
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| ResubscribeBatch {
            room_ids: chunk.to_vec(),
            last: i + 1 == total,
        })
        .collect()
}
