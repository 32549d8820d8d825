//! In-process spin event stream with at-least-once delivery.
//!
//! Spins land in a bounded replay buffer and stay there until the consumer
//! acks them, so a consumer crash between reading and applying redelivers
//! instead of losing the entry. Delivery hands out a short lease; entries
//! whose lease lapses are offered again. Retention is bounded by length and
//! age, which is deliberately lossy for old entries: anything that old has
//! already been folded into the durable rollups.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, RwLock};

use crate::metrics::EngineMetrics;
use paydirt_types::SpinEvent;

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub max_len: usize,
    pub max_age: Duration,
    /// How long a consumed entry stays leased before it is offered again.
    pub redelivery: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_len: 10_000,
            max_age: Duration::from_secs(3_600),
            redelivery: Duration::from_secs(30),
        }
    }
}

struct PendingSpin {
    seq: u64,
    published_at: Instant,
    lease_until: Option<Instant>,
    event: SpinEvent,
}

pub struct SpinStream {
    pending: RwLock<VecDeque<PendingSpin>>,
    notify: Notify,
    sequence: AtomicU64,
    config: StreamConfig,
    metrics: Arc<EngineMetrics>,
}

impl SpinStream {
    pub fn new(config: StreamConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            pending: RwLock::new(VecDeque::new()),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            config,
            metrics,
        }
    }

    /// Append an event, then trim the retention window and wake the
    /// consumer. Returns the assigned sequence number.
    pub async fn publish(&self, event: SpinEvent) -> u64 {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut pending = self.pending.write().await;
            pending.push_back(PendingSpin {
                seq,
                published_at: Instant::now(),
                lease_until: None,
                event,
            });

            let mut trimmed = 0u64;
            // checked_sub: the monotonic clock's origin may be closer than
            // max_age right after boot.
            if let Some(cutoff) = Instant::now().checked_sub(self.config.max_age) {
                while pending
                    .front()
                    .map(|entry| entry.published_at < cutoff)
                    .unwrap_or(false)
                {
                    pending.pop_front();
                    trimmed += 1;
                }
            }
            while pending.len() > self.config.max_len {
                pending.pop_front();
                trimmed += 1;
            }
            if trimmed > 0 {
                self.metrics.add_stream_trimmed(trimmed);
            }
        }
        self.metrics.inc_stream_published();
        self.notify.notify_waiters();
        seq
    }

    /// Take up to `batch` entries that are unleased or whose lease has
    /// lapsed, re-leasing each. Entries stay buffered until acked.
    pub async fn consume(&self, batch: usize) -> Vec<(u64, SpinEvent)> {
        let now = Instant::now();
        let mut delivered = Vec::new();
        let mut redelivered = 0u64;

        let mut pending = self.pending.write().await;
        for entry in pending.iter_mut() {
            if delivered.len() >= batch {
                break;
            }
            match entry.lease_until {
                Some(lease) if lease > now => continue,
                Some(_) => redelivered += 1,
                None => {}
            }
            entry.lease_until = Some(now + self.config.redelivery);
            delivered.push((entry.seq, entry.event.clone()));
        }
        drop(pending);

        if redelivered > 0 {
            self.metrics.add_stream_redelivered(redelivered);
        }
        delivered
    }

    /// Drop a delivered entry for good. Only called after its side effects
    /// are applied. Returns false when the entry is unknown (already acked
    /// or trimmed).
    pub async fn ack(&self, seq: u64) -> bool {
        let mut pending = self.pending.write().await;
        if let Some(index) = pending.iter().position(|entry| entry.seq == seq) {
            pending.remove(index);
            self.metrics.inc_stream_acked();
            true
        } else {
            false
        }
    }

    /// Block until something is published or the timeout lapses, whichever
    /// comes first.
    pub async fn wait_for_events(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    pub async fn depth(&self) -> usize {
        self.pending.read().await.len()
    }
}
