use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
pub struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    pub fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.update_max(ms);

        if let Some((idx, _)) = LATENCY_BUCKETS_MS
            .iter()
            .enumerate()
            .find(|(_, bucket)| ms <= **bucket)
        {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        } else {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        let counts = self
            .buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect::<Vec<_>>();

        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts,
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }

    fn update_max(&self, value: u64) {
        let mut current = self.max_ms.load(Ordering::Relaxed);
        while value > current {
            match self.max_ms.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HttpMetricsSnapshot {
    pub create_session: LatencySnapshot,
    pub get_session: LatencySnapshot,
    pub select: LatencySnapshot,
    pub query_metrics: LatencySnapshot,
    pub query_realtime: LatencySnapshot,
    pub rejected_origin: u64,
    pub rejected_body_limit: u64,
    pub rejected_rate_limit: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    create_session: LatencyMetrics,
    get_session: LatencyMetrics,
    select: LatencyMetrics,
    query_metrics: LatencyMetrics,
    query_realtime: LatencyMetrics,
    rejected_origin: AtomicU64,
    rejected_body_limit: AtomicU64,
    rejected_rate_limit: AtomicU64,
}

impl HttpMetrics {
    pub fn record_create_session(&self, duration: Duration) {
        self.create_session.record(duration);
    }

    pub fn record_get_session(&self, duration: Duration) {
        self.get_session.record(duration);
    }

    pub fn record_select(&self, duration: Duration) {
        self.select.record(duration);
    }

    pub fn record_query_metrics(&self, duration: Duration) {
        self.query_metrics.record(duration);
    }

    pub fn record_query_realtime(&self, duration: Duration) {
        self.query_realtime.record(duration);
    }

    pub fn inc_reject_origin(&self) {
        self.rejected_origin.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_body_limit(&self) {
        self.rejected_body_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_rate_limit(&self) {
        self.rejected_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            create_session: self.create_session.snapshot(),
            get_session: self.get_session.snapshot(),
            select: self.select.snapshot(),
            query_metrics: self.query_metrics.snapshot(),
            query_realtime: self.query_realtime.snapshot(),
            rejected_origin: self.rejected_origin.load(Ordering::Relaxed),
            rejected_body_limit: self.rejected_body_limit.load(Ordering::Relaxed),
            rejected_rate_limit: self.rejected_rate_limit.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineMetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_reused: u64,
    pub sessions_invalidated: u64,
    pub sessions_swept: u64,
    pub spins_accepted: u64,
    pub rejected_round_over: u64,
    pub rejected_invalid_bid: u64,
    pub rejected_region_blocked: u64,
    pub fallback_selections: u64,
    pub balance_write_failures: u64,
    pub stream_published: u64,
    pub stream_acked: u64,
    pub stream_redelivered: u64,
    pub stream_trimmed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub aggregator_runs: u64,
    pub aggregator_failures: u64,
    pub aggregator_last_run_ms: u64,
}

/// Process-wide engine counters. Everything is monotonic except
/// `aggregator_last_run_ms`, which tracks the most recent successful run.
#[derive(Default)]
pub struct EngineMetrics {
    sessions_created: AtomicU64,
    sessions_reused: AtomicU64,
    sessions_invalidated: AtomicU64,
    sessions_swept: AtomicU64,
    spins_accepted: AtomicU64,
    rejected_round_over: AtomicU64,
    rejected_invalid_bid: AtomicU64,
    rejected_region_blocked: AtomicU64,
    fallback_selections: AtomicU64,
    balance_write_failures: AtomicU64,
    stream_published: AtomicU64,
    stream_acked: AtomicU64,
    stream_redelivered: AtomicU64,
    stream_trimmed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
    aggregator_runs: AtomicU64,
    aggregator_failures: AtomicU64,
    aggregator_last_run_ms: AtomicU64,
}

impl EngineMetrics {
    pub fn inc_sessions_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_reused(&self) {
        self.sessions_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_invalidated(&self) {
        self.sessions_invalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sessions_swept(&self, count: u64) {
        self.sessions_swept.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_spins_accepted(&self) {
        self.spins_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_round_over(&self) {
        self.rejected_round_over.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_invalid_bid(&self) {
        self.rejected_invalid_bid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_region_blocked(&self) {
        self.rejected_region_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fallback_selections(&self) {
        self.fallback_selections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_balance_write_failures(&self) {
        self.balance_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_published(&self) {
        self.stream_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_acked(&self) {
        self.stream_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stream_redelivered(&self, count: u64) {
        self.stream_redelivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_stream_trimmed(&self, count: u64) {
        self.stream_trimmed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregator_run(&self, now_ms: u64) {
        self.aggregator_runs.fetch_add(1, Ordering::Relaxed);
        self.aggregator_last_run_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn inc_aggregator_failure(&self) {
        self.aggregator_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_reused: self.sessions_reused.load(Ordering::Relaxed),
            sessions_invalidated: self.sessions_invalidated.load(Ordering::Relaxed),
            sessions_swept: self.sessions_swept.load(Ordering::Relaxed),
            spins_accepted: self.spins_accepted.load(Ordering::Relaxed),
            rejected_round_over: self.rejected_round_over.load(Ordering::Relaxed),
            rejected_invalid_bid: self.rejected_invalid_bid.load(Ordering::Relaxed),
            rejected_region_blocked: self.rejected_region_blocked.load(Ordering::Relaxed),
            fallback_selections: self.fallback_selections.load(Ordering::Relaxed),
            balance_write_failures: self.balance_write_failures.load(Ordering::Relaxed),
            stream_published: self.stream_published.load(Ordering::Relaxed),
            stream_acked: self.stream_acked.load(Ordering::Relaxed),
            stream_redelivered: self.stream_redelivered.load(Ordering::Relaxed),
            stream_trimmed: self.stream_trimmed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            aggregator_runs: self.aggregator_runs.load(Ordering::Relaxed),
            aggregator_failures: self.aggregator_failures.load(Ordering::Relaxed),
            aggregator_last_run_ms: self.aggregator_last_run_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SystemMetricsSnapshot {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_usage_percent: f64,
}

pub struct SystemMetrics {
    system: Mutex<System>,
    pid: Pid,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let system = System::new();
        let pid = Pid::from_u32(std::process::id());
        Self {
            system: Mutex::new(system),
            pid,
        }
    }

    pub fn snapshot(&self) -> SystemMetricsSnapshot {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_cpu_usage();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), false);

        if let Some(process) = system.process(self.pid) {
            SystemMetricsSnapshot {
                rss_bytes: process.memory(),
                virtual_bytes: process.virtual_memory(),
                cpu_usage_percent: process.cpu_usage() as f64,
            }
        } else {
            SystemMetricsSnapshot {
                rss_bytes: 0,
                virtual_bytes: 0,
                cpu_usage_percent: 0.0,
            }
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}
