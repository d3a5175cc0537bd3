//! Degraded-mode support for fabric outages.
//!
//! [`BroadcastRetryQueue`] parks room frames that could not be published;
//! [`batch_resubscribe_rooms`] re-declares room interest with bounded,
//! exponentially spaced retries.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use tether_protocol::{ConnectionId, RoomId};

use crate::fabric::{Fabric, FabricError};

/// Default queue capacity.
pub const DEFAULT_RETRY_CAPACITY: usize = 1000;

/// Default time a parked frame stays deliverable.
pub const DEFAULT_RETRY_TTL: Duration = Duration::from_secs(30);

/// A room frame waiting for the fabric to come back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEnvelope {
    pub room_id: RoomId,
    /// Serialized protocol envelope.
    pub payload: String,
    pub origin: ConnectionId,
    pub enqueued_at: Instant,
    pub ttl: Duration,
}

impl RetryEnvelope {
    pub fn new(
        room_id: impl Into<RoomId>,
        payload: impl Into<String>,
        origin: ConnectionId,
        ttl: Duration,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            payload: payload.into(),
            origin,
            enqueued_at: Instant::now(),
            ttl,
        }
    }

    /// Returns `true` once `enqueued_at + ttl` is not after `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.enqueued_at + self.ttl <= now
    }
}

/// Counters exposed for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryQueueStats {
    pub len: usize,
    pub evicted: u64,
    pub expired: u64,
}

#[derive(Debug)]
struct Inner {
    buf: VecDeque<RetryEnvelope>,
    evicted: u64,
    expired: u64,
}

/// Bounded FIFO of [`RetryEnvelope`]s.
///
/// Never blocks the caller: when full, the oldest envelope is evicted.
#[derive(Debug)]
pub struct BroadcastRetryQueue {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl BroadcastRetryQueue {
    /// Creates an empty queue. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                evicted: 0,
                expired: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buf.is_empty()
    }

    /// Appends an envelope, returning the one evicted to make room.
    pub fn enqueue(&self, envelope: RetryEnvelope) -> Option<RetryEnvelope> {
        let mut inner = self.lock();
        let evicted = if inner.buf.len() >= self.capacity {
            let old = inner.buf.pop_front();
            inner.evicted += 1;
            if let Some(old) = &old {
                tracing::warn!(
                    room = %old.room_id,
                    origin = %old.origin,
                    "retry queue full, evicting oldest broadcast"
                );
            }
            old
        } else {
            None
        };
        inner.buf.push_back(envelope);
        evicted
    }

    /// Empties the queue and returns the envelopes still live at `now`,
    /// oldest first. Expired envelopes are discarded and counted.
    pub fn drain(&self, now: Instant) -> Vec<RetryEnvelope> {
        let mut inner = self.lock();
        let all: Vec<RetryEnvelope> = inner.buf.drain(..).collect();
        let before = all.len();
        let live: Vec<RetryEnvelope> = all.into_iter().filter(|e| !e.is_expired(now)).collect();
        let expired = (before - live.len()) as u64;
        if expired > 0 {
            inner.expired += expired;
            tracing::debug!(expired, "dropped expired broadcasts");
        }
        live
    }

    /// Puts undelivered envelopes back at the front, preserving their order.
    ///
    /// If the result exceeds capacity the oldest entries are evicted.
    pub fn restore(&self, envelopes: Vec<RetryEnvelope>) {
        if envelopes.is_empty() {
            return;
        }
        let mut inner = self.lock();
        for envelope in envelopes.into_iter().rev() {
            inner.buf.push_front(envelope);
        }
        while inner.buf.len() > self.capacity {
            inner.buf.pop_front();
            inner.evicted += 1;
        }
    }

    pub fn stats(&self) -> RetryQueueStats {
        let inner = self.lock();
        RetryQueueStats {
            len: inner.buf.len(),
            evicted: inner.evicted,
            expired: inner.expired,
        }
    }
}

impl Default for BroadcastRetryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_CAPACITY)
    }
}

/// How [`batch_resubscribe_rooms`] chunks and retries.
#[derive(Debug, Clone)]
pub struct ResubscribePolicy {
    pub batch_size: usize,
    /// Retries per batch after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self {
            batch_size: tether_protocol::constants::MAX_RESUBSCRIBE_BATCH,
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ResubscribePolicy {
    /// `min(max_delay, base_delay * 2^retry)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Errors from [`batch_resubscribe_rooms`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("resubscribe batch {batch} failed after {attempts} attempts: {source}")]
    Exhausted {
        batch: usize,
        attempts: u32,
        #[source]
        source: FabricError,
    },
}

/// Declares interest in `rooms` on the fabric, batch by batch.
///
/// Each batch is retried with exponential delay; the first batch that runs
/// out of retries aborts the whole call.
pub async fn batch_resubscribe_rooms(
    fabric: &dyn Fabric,
    rooms: &[RoomId],
    policy: &ResubscribePolicy,
) -> Result<(), RetryError> {
    for (batch, chunk) in rooms.chunks(policy.batch_size.max(1)).enumerate() {
        let mut retry = 0u32;
        loop {
            match fabric.subscribe_rooms(chunk).await {
                Ok(()) => break,
                Err(e) if retry < policy.max_retries => {
                    let delay = policy.delay_for_retry(retry);
                    tracing::warn!(batch, retry, ?delay, "resubscribe batch failed: {e}");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    return Err(RetryError::Exhausted {
                        batch,
                        attempts: retry + 1,
                        source: e,
                    });
                }
            }
        }
    }
    Ok(())
}
