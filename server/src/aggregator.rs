//! Daily rollup aggregation job.
//!
//! Periodically recomputes `daily_metrics` rows from the durable spin
//! events. Each pass covers every UTC day touched since the previous
//! successful pass, plus one day of slack so spins landing just before
//! midnight are folded into the right row even when the job runs after the
//! day flips. Rows are derived, never incremented, so re-running a pass is
//! idempotent. A failed pass is logged and retried on the next tick; it
//! never takes the host down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::jittered_backoff;
use crate::metrics::EngineMetrics;
use crate::store::Store;
use paydirt_types::{day_start_ms, EngineError, DAY_MS};

const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How far back the first pass after a restart reaches. Older days were
/// already rolled up while the previous process was alive.
const FIRST_RUN_LOOKBACK_DAYS: u64 = 7;

pub struct Aggregator {
    store: Store,
    metrics: Arc<EngineMetrics>,
    /// Epoch ms of the last successful pass; 0 when none yet.
    last_success_ms: AtomicU64,
}

impl Aggregator {
    pub fn new(store: Store, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            store,
            metrics,
            last_success_ms: AtomicU64::new(0),
        }
    }

    fn window_start_ms(&self, now_ms: u64) -> u64 {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        if last == 0 {
            day_start_ms(now_ms.saturating_sub(FIRST_RUN_LOOKBACK_DAYS * DAY_MS))
        } else {
            day_start_ms(last.saturating_sub(DAY_MS))
        }
    }

    /// One aggregation pass. Returns the number of rollup rows rewritten.
    pub async fn run_once(&self, now_ms: u64) -> Result<usize, EngineError> {
        let start_ms = self.window_start_ms(now_ms);
        match self
            .store
            .rebuild_daily_metrics(start_ms, now_ms.saturating_add(1))
            .await
        {
            Ok(rows) => {
                self.last_success_ms.store(now_ms, Ordering::SeqCst);
                self.metrics.record_aggregator_run(now_ms);
                Ok(rows)
            }
            Err(err) => {
                self.metrics.inc_aggregator_failure();
                Err(err)
            }
        }
    }

    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match aggregator.run_once(crate::now_ms()).await {
                    Ok(rows) => debug!("Rollup pass rewrote {rows} daily rows"),
                    Err(err) => {
                        warn!("Rollup pass failed: {err}");
                        let delay = jittered_backoff(&mut rand::thread_rng(), ERROR_BACKOFF);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }
}
