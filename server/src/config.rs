//! Runtime configuration for the engine service.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SESSION_TTL_SECONDS: u64 = 4 * 60 * 60;
const DEFAULT_STARTING_BALANCE: u64 = 100_000;
const DEFAULT_SESSION_SWEEP_INTERVAL_SECONDS: u64 = 600;
const DEFAULT_STREAM_MAX_LEN: usize = 10_000;
const DEFAULT_STREAM_MAX_AGE_SECONDS: u64 = 3_600;
const DEFAULT_STREAM_REDELIVERY_SECONDS: u64 = 30;
const DEFAULT_CONSUMER_POLL_MS: u64 = 500;
const DEFAULT_CONSUMER_BATCH_SIZE: usize = 100;
const DEFAULT_AGGREGATE_INTERVAL_SECONDS: u64 = 3_600;
const DEFAULT_COUNTER_TTL_SECONDS: u64 = 25 * 60 * 60;
const DEFAULT_HTTP_RATE_LIMIT_PER_SECOND: u64 = 1_000;
const DEFAULT_HTTP_RATE_LIMIT_BURST: u32 = 5_000;
const DEFAULT_SELECT_RATE_LIMIT_PER_MINUTE: u64 = 300;
const DEFAULT_SELECT_RATE_LIMIT_BURST: u32 = 20;
const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;
const DEFAULT_STORE_BUFFER: usize = 1_024;
const DEFAULT_CACHE_REDIS_PREFIX: &str = "paydirt:session:";
const DEFAULT_METRICS_RANGE_DAYS: u32 = 7;

/// Tunables for the engine service. Every knob is optional; accessors apply
/// the documented defaults. `None` for a rate limit disables it.
#[derive(Clone, Debug, Serialize)]
pub struct EngineConfig {
    pub db_path: Option<PathBuf>,
    pub session_ttl_seconds: Option<u64>,
    /// Demo credits granted to a fresh session, in minor units.
    pub starting_balance: Option<u64>,
    pub session_sweep_interval_seconds: Option<u64>,
    pub stream_max_len: Option<usize>,
    pub stream_max_age_seconds: Option<u64>,
    pub stream_redelivery_seconds: Option<u64>,
    pub consumer_poll_ms: Option<u64>,
    pub consumer_batch_size: Option<usize>,
    pub aggregate_interval_seconds: Option<u64>,
    pub counter_ttl_seconds: Option<u64>,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub select_rate_limit_per_minute: Option<u64>,
    pub select_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
    pub store_buffer: Option<usize>,
    pub cache_redis_url: Option<String>,
    pub cache_redis_prefix: Option<String>,
    pub metrics_range_days: Option<u32>,
    /// Seeds the reward RNG for reproducible runs (load tests, demos).
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            session_ttl_seconds: Some(DEFAULT_SESSION_TTL_SECONDS),
            starting_balance: Some(DEFAULT_STARTING_BALANCE),
            session_sweep_interval_seconds: Some(DEFAULT_SESSION_SWEEP_INTERVAL_SECONDS),
            stream_max_len: Some(DEFAULT_STREAM_MAX_LEN),
            stream_max_age_seconds: Some(DEFAULT_STREAM_MAX_AGE_SECONDS),
            stream_redelivery_seconds: Some(DEFAULT_STREAM_REDELIVERY_SECONDS),
            consumer_poll_ms: Some(DEFAULT_CONSUMER_POLL_MS),
            consumer_batch_size: Some(DEFAULT_CONSUMER_BATCH_SIZE),
            aggregate_interval_seconds: Some(DEFAULT_AGGREGATE_INTERVAL_SECONDS),
            counter_ttl_seconds: Some(DEFAULT_COUNTER_TTL_SECONDS),
            http_rate_limit_per_second: Some(DEFAULT_HTTP_RATE_LIMIT_PER_SECOND),
            http_rate_limit_burst: Some(DEFAULT_HTTP_RATE_LIMIT_BURST),
            select_rate_limit_per_minute: Some(DEFAULT_SELECT_RATE_LIMIT_PER_MINUTE),
            select_rate_limit_burst: Some(DEFAULT_SELECT_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            store_buffer: Some(DEFAULT_STORE_BUFFER),
            cache_redis_url: None,
            cache_redis_prefix: Some(DEFAULT_CACHE_REDIS_PREFIX.to_string()),
            metrics_range_days: Some(DEFAULT_METRICS_RANGE_DAYS),
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(
            self.session_ttl_seconds
                .unwrap_or(DEFAULT_SESSION_TTL_SECONDS)
                .max(1),
        )
    }

    pub fn starting_balance(&self) -> u64 {
        self.starting_balance.unwrap_or(DEFAULT_STARTING_BALANCE)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(
            self.session_sweep_interval_seconds
                .unwrap_or(DEFAULT_SESSION_SWEEP_INTERVAL_SECONDS)
                .max(1),
        )
    }

    pub fn stream_max_len(&self) -> usize {
        self.stream_max_len.unwrap_or(DEFAULT_STREAM_MAX_LEN).max(1)
    }

    pub fn stream_max_age(&self) -> Duration {
        Duration::from_secs(
            self.stream_max_age_seconds
                .unwrap_or(DEFAULT_STREAM_MAX_AGE_SECONDS)
                .max(1),
        )
    }

    pub fn stream_redelivery(&self) -> Duration {
        Duration::from_secs(
            self.stream_redelivery_seconds
                .unwrap_or(DEFAULT_STREAM_REDELIVERY_SECONDS)
                .max(1),
        )
    }

    pub fn consumer_poll(&self) -> Duration {
        Duration::from_millis(
            self.consumer_poll_ms
                .unwrap_or(DEFAULT_CONSUMER_POLL_MS)
                .max(1),
        )
    }

    pub fn consumer_batch_size(&self) -> usize {
        self.consumer_batch_size
            .unwrap_or(DEFAULT_CONSUMER_BATCH_SIZE)
            .max(1)
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_secs(
            self.aggregate_interval_seconds
                .unwrap_or(DEFAULT_AGGREGATE_INTERVAL_SECONDS)
                .max(1),
        )
    }

    pub fn counter_ttl(&self) -> Duration {
        Duration::from_secs(
            self.counter_ttl_seconds
                .unwrap_or(DEFAULT_COUNTER_TTL_SECONDS)
                .max(1),
        )
    }

    pub fn store_buffer_capacity(&self) -> usize {
        self.store_buffer.unwrap_or(DEFAULT_STORE_BUFFER).max(1)
    }

    pub fn cache_redis_prefix(&self) -> String {
        self.cache_redis_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_CACHE_REDIS_PREFIX.to_string())
    }

    pub fn metrics_range_days(&self) -> u32 {
        self.metrics_range_days
            .unwrap_or(DEFAULT_METRICS_RANGE_DAYS)
            .max(1)
    }
}
