//! Messages waiting for the session to become ready.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use tether_protocol::RoomId;

pub const DEFAULT_OUTBOX_CAPACITY: usize = 100;
pub const DEFAULT_OUTBOX_TTL: Duration = Duration::from_secs(60);

/// One queued room frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub room_id: RoomId,
    pub body: serde_json::Value,
    pub enqueued_at: Instant,
    pub ttl: Duration,
}

impl OutboxEntry {
    pub fn new(room_id: impl Into<RoomId>, body: serde_json::Value, ttl: Duration) -> Self {
        Self {
            room_id: room_id.into(),
            body,
            enqueued_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.enqueued_at + self.ttl <= now
    }
}

/// Result of [`Outbox::drain`].
#[derive(Debug, Default)]
pub struct Drained {
    /// Entries to send, oldest first.
    pub live: Vec<OutboxEntry>,
    pub expired: Vec<OutboxEntry>,
}

/// Bounded FIFO with oldest eviction.
#[derive(Debug)]
pub struct Outbox {
    buf: VecDeque<OutboxEntry>,
    capacity: usize,
}

impl Outbox {
    /// Creates an empty outbox. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queues an entry, returning the one evicted to make room.
    pub fn push(&mut self, entry: OutboxEntry) -> Option<OutboxEntry> {
        let evicted = if self.buf.len() >= self.capacity {
            self.buf.pop_front()
        } else {
            None
        };
        self.buf.push_back(entry);
        evicted
    }

    /// Empties the outbox, splitting entries into live and expired.
    pub fn drain(&mut self, now: Instant) -> Drained {
        let mut out = Drained::default();
        for entry in self.buf.drain(..) {
            if entry.is_expired(now) {
                out.expired.push(entry);
            } else {
                out.live.push(entry);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(n: usize, ttl: Duration) -> OutboxEntry {
        OutboxEntry::new("room", json!(n), ttl)
    }

    #[tokio::test]
    async fn overflow_drops_first_and_keeps_order() {
        let mut outbox = Outbox::default();
        let mut evicted = Vec::new();
        for n in 1..=101 {
            if let Some(e) = outbox.push(entry(n, DEFAULT_OUTBOX_TTL)) {
                evicted.push(e);
            }
        }
        assert_eq!(outbox.len(), 100);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].body, json!(1));

        let drained = outbox.drain(Instant::now());
        let bodies: Vec<serde_json::Value> = drained.live.into_iter().map(|e| e.body).collect();
        let expected: Vec<serde_json::Value> = (2..=101).map(|n| json!(n)).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_separates_expired() {
        let mut outbox = Outbox::new(10);
        outbox.push(entry(1, Duration::from_secs(1)));
        outbox.push(entry(2, Duration::from_secs(60)));
        outbox.push(entry(3, Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(5)).await;

        let drained = outbox.drain(Instant::now());
        assert_eq!(drained.live.len(), 1);
        assert_eq!(drained.live[0].body, json!(2));
        assert_eq!(drained.expired.len(), 2);
        assert!(outbox.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(Outbox::new(0).capacity(), 1);
    }
}
