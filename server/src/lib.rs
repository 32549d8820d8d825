//! Session and reward engine service.
//!
//! This crate wires the pure reward logic from `paydirt-engine` to durable
//! storage, the session cache, the spin event stream, the real-time counters,
//! and the HTTP surface. [`Engine`] is the composition seam: request handlers
//! call its operations, and the binary explicitly starts the background jobs
//! and holds the [`Jobs`] handle they return. Every operation takes `now_ms`
//! so tests drive a logical clock; only the service boundary stamps real time.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Days, NaiveDate};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

mod aggregator;
pub use aggregator::Aggregator;
mod api;
pub use api::Api;
pub(crate) mod backoff;
mod cache;
pub use cache::SessionCache;
mod config;
pub use config::EngineConfig;
mod consumer;
mod counters;
pub use counters::RealtimeCounters;
mod metrics;
pub use metrics::{
    EngineMetrics, EngineMetricsSnapshot, HttpMetricsSnapshot, LatencySnapshot,
    SystemMetricsSnapshot,
};
use metrics::{HttpMetrics, SystemMetrics};
mod sessions;
pub use sessions::SessionRepository;
mod store;
pub use store::Store;
mod stream;
pub use stream::{SpinStream, StreamConfig};

use paydirt_engine::{reward, round};
use paydirt_types::{
    CreateSessionRequest, CreateSessionResponse, EngineError, GameConfig, GameMetrics,
    RealtimeStats, SelectRequest, SelectResponse, SessionSnapshot, SessionView, SpinEvent,
};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// UTC calendar date containing `now_ms`.
fn utc_date(now_ms: u64) -> NaiveDate {
    DateTime::from_timestamp_millis(now_ms as i64)
        .map(|moment| moment.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

/// The assembled service: storage, cache, stream, counters, and the reward
/// RNG behind one operation surface.
pub struct Engine {
    config: EngineConfig,
    store: Store,
    sessions: SessionRepository,
    stream: Arc<SpinStream>,
    counters: Arc<RealtimeCounters>,
    aggregator: Arc<Aggregator>,
    rng: Mutex<StdRng>,
    cache_mode: &'static str,
    metrics: Arc<EngineMetrics>,
    http_metrics: HttpMetrics,
    system_metrics: SystemMetrics,
    started_at: Instant,
}

/// Handles for the background jobs the composition root started. Jobs never
/// start themselves and are never restarted here; `stop` aborts all three.
pub struct Jobs {
    pub consumer: JoinHandle<()>,
    pub aggregator: JoinHandle<()>,
    pub sweeper: JoinHandle<()>,
}

impl Jobs {
    pub fn stop(&self) {
        self.consumer.abort();
        self.aggregator.abort();
        self.sweeper.abort();
    }
}

impl Engine {
    pub fn new() -> anyhow::Result<Self> {
        Self::new_with_config(EngineConfig::default())
    }

    pub fn new_with_config(config: EngineConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(EngineMetrics::default());

        let db_path = match &config.db_path {
            Some(path) => path.clone(),
            None => {
                let path = std::env::temp_dir().join(format!("paydirt-{}.db", Uuid::new_v4()));
                info!(
                    "No database path configured; using throwaway store at {}",
                    path.display()
                );
                path
            }
        };
        let store = Store::open(&db_path, config.store_buffer_capacity())?;

        let cache = match config.cache_redis_url.as_deref() {
            Some(url) => {
                match SessionCache::redis(url, config.cache_redis_prefix(), Arc::clone(&metrics)) {
                    Ok(cache) => Arc::new(cache),
                    Err(err) => {
                        warn!("Redis session cache disabled: {err}");
                        Arc::new(SessionCache::in_memory(Arc::clone(&metrics)))
                    }
                }
            }
            None => Arc::new(SessionCache::in_memory(Arc::clone(&metrics))),
        };
        let cache_mode = cache.mode();

        let sessions = SessionRepository::new(
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            config.session_ttl(),
            config.starting_balance(),
        );
        let stream = Arc::new(SpinStream::new(
            StreamConfig {
                max_len: config.stream_max_len(),
                max_age: config.stream_max_age(),
                redelivery: config.stream_redelivery(),
            },
            Arc::clone(&metrics),
        ));
        let counters = Arc::new(RealtimeCounters::new(
            config.counter_ttl().as_millis() as u64
        ));
        let aggregator = Arc::new(Aggregator::new(store.clone(), Arc::clone(&metrics)));

        let rng = match config.rng_seed {
            Some(seed) => {
                info!("Reward RNG seeded with {seed}; outcomes are deterministic");
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            store,
            sessions,
            stream,
            counters,
            aggregator,
            rng: Mutex::new(rng),
            cache_mode,
            metrics,
            http_metrics: HttpMetrics::default(),
            system_metrics: SystemMetrics::new(),
            started_at: Instant::now(),
        })
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a session, or return the live one for this (game, player) pair.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
        now_ms: u64,
    ) -> Result<CreateSessionResponse, EngineError> {
        let session = self
            .sessions
            .create(
                &request.game_id,
                &request.player_ref,
                request.country.as_deref(),
                now_ms,
            )
            .await?;
        Ok(CreateSessionResponse {
            session_id: session.session_id,
            expires_at_ms: session.expires_at_ms,
            balance: session.balance,
            round: session.round,
        })
    }

    /// Load a session for the client: live fields plus the config snapshot,
    /// region-filtered when the session is bound to a country.
    pub async fn get_session(
        &self,
        session_id: &str,
        now_ms: u64,
    ) -> Result<SessionView, EngineError> {
        let SessionSnapshot { session, config } = self.sessions.get(session_id, now_ms).await?;
        let game_config = config.region_view(session.country.as_deref());
        Ok(SessionView {
            session_id: session.session_id,
            game_id: session.game_id,
            balance: session.balance,
            round: session.round,
            expires_at_ms: session.expires_at_ms,
            game_config,
        })
    }

    /// One spin. Validate the bid, draw a reward, record the event (the move
    /// limit is enforced inside the insert, so a ROUND_OVER rejection writes
    /// nothing), settle the balance, and publish to the metrics stream.
    pub async fn select(
        &self,
        request: SelectRequest,
        now_ms: u64,
    ) -> Result<SelectResponse, EngineError> {
        let snapshot = self.sessions.get(&request.session_id, now_ms).await?;
        let session = &snapshot.session;
        let config = &snapshot.config;

        if let Err(err) = round::validate_bid(config, request.bid) {
            self.metrics.inc_rejected_invalid_bid();
            return Err(err);
        }

        let (reward_kind, multiplier, fallback) = {
            let mut rng = self.rng();
            match reward::select_reward(&config.reward_table, &mut *rng) {
                Some(selection) => (
                    selection.entry.kind.clone(),
                    selection.entry.multiplier,
                    selection.fallback,
                ),
                None => return Err(EngineError::invalid_config("reward table has no entries")),
            }
        };
        if fallback {
            warn!(
                "Reward table for game {} has zero total weight; paying fallback kind {reward_kind}",
                session.game_id
            );
            self.metrics.inc_fallback_selections();
        }
        let payout = reward::payout(multiplier, request.bid);

        let event = SpinEvent {
            event_id: Uuid::new_v4().to_string(),
            session_id: session.session_id.clone(),
            game_id: session.game_id.clone(),
            player_ref: session.player_ref.clone(),
            country: session.country.clone(),
            round: session.round,
            bid: request.bid,
            reward_kind: reward_kind.clone(),
            payout,
            win: payout > 0,
            created_at_ms: now_ms,
        };
        let moves_used = match self
            .store
            .record_spin(event.clone(), config.moves_per_round)
            .await
        {
            Ok(moves_used) => moves_used,
            Err(err) => {
                if matches!(err, EngineError::RoundOver { .. }) {
                    self.metrics.inc_rejected_round_over();
                }
                return Err(err);
            }
        };
        self.metrics.inc_spins_accepted();

        // The spin already settled against the event log; a failed balance
        // write is logged inside and play continues.
        let balance = session
            .balance
            .saturating_sub(request.bid)
            .saturating_add(payout);
        self.sessions.settle_balance(&snapshot, balance, now_ms).await;
        self.stream.publish(event).await;

        Ok(SelectResponse {
            session_id: request.session_id,
            choice_id: request.choice_id,
            reward_kind,
            payout,
            win: payout > 0,
            balance,
            round: snapshot.session.round,
            moves_used,
            moves_per_round: snapshot.config.moves_per_round,
        })
    }

    /// Advance the session to its next round, resetting the move count.
    pub async fn new_round(&self, session_id: &str, now_ms: u64) -> Result<u32, EngineError> {
        self.sessions.advance_round(session_id, now_ms).await
    }

    /// End a session now. Idempotent.
    pub async fn invalidate_session(
        &self,
        session_id: &str,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        self.sessions.invalidate(session_id, now_ms).await
    }

    /// Admin seam: store a validated game config. Sessions bind whichever
    /// snapshot was live when they opened; this never touches them.
    pub async fn upsert_game(&self, config: GameConfig, now_ms: u64) -> Result<(), EngineError> {
        config.validate()?;
        let game_id = config.game_id.clone();
        self.store.upsert_game(config, now_ms).await?;
        info!("Game {game_id} config stored");
        Ok(())
    }

    /// Dashboard query over the durable daily rollups. Defaults to the most
    /// recent `metrics_range_days` ending today; without a country filter the
    /// per-country rows are collapsed per day.
    pub async fn query_metrics(
        &self,
        game_id: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        country: Option<&str>,
        now_ms: u64,
    ) -> Result<GameMetrics, EngineError> {
        let country = sessions::normalize_country(country);
        let end = end_date.unwrap_or_else(|| utc_date(now_ms));
        let start = start_date.unwrap_or_else(|| {
            end.checked_sub_days(Days::new(u64::from(self.config.metrics_range_days() - 1)))
                .unwrap_or(NaiveDate::MIN)
        });
        let days = self
            .store
            .query_daily_metrics(game_id, start, end, country.clone())
            .await?;
        Ok(GameMetrics::from_days(
            game_id.to_string(),
            start,
            end,
            country,
            days,
        ))
    }

    /// Best-effort live view: the retained hourly windows, newest first.
    pub fn realtime_stats(&self, game_id: &str, now_ms: u64) -> RealtimeStats {
        RealtimeStats {
            game_id: game_id.to_string(),
            generated_at_ms: now_ms,
            windows: self.counters.stats_for(game_id, now_ms),
        }
    }

    /// Readiness probe: the store worker answers a ping.
    pub async fn ready(&self) -> Result<(), EngineError> {
        self.store.ping().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start all background jobs. The caller owns the returned handles.
    pub fn start_jobs(self: &Arc<Self>) -> Jobs {
        Jobs {
            consumer: self.start_consumer(),
            aggregator: self.start_aggregator(),
            sweeper: self.start_sweeper(),
        }
    }

    /// Single logical consumer: drains the spin stream into the real-time
    /// counters and acks each applied event.
    pub fn start_consumer(&self) -> JoinHandle<()> {
        consumer::start(
            Arc::clone(&self.stream),
            Arc::clone(&self.counters),
            self.config.consumer_poll(),
            self.config.consumer_batch_size(),
        )
    }

    /// Periodic rollup of spin events into the daily metric rows.
    pub fn start_aggregator(&self) -> JoinHandle<()> {
        self.aggregator.start(self.config.aggregate_interval())
    }

    /// Periodic deletion of session rows already past expiry.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = self.config.session_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match engine.sessions.cleanup_expired(now_ms()).await {
                    Ok(0) => {}
                    Ok(deleted) => info!("Sweep reclaimed {deleted} expired sessions"),
                    Err(err) => warn!("Session sweep failed: {err}"),
                }
            }
        })
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn cache_mode(&self) -> &'static str {
        self.cache_mode
    }

    pub(crate) async fn stream_depth(&self) -> usize {
        self.stream.depth().await
    }

    pub(crate) fn counter_windows(&self) -> usize {
        self.counters.window_count()
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub(crate) fn engine_metrics_snapshot(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn http_metrics_snapshot(&self) -> HttpMetricsSnapshot {
        self.http_metrics.snapshot()
    }

    pub(crate) fn system_metrics_snapshot(&self) -> SystemMetricsSnapshot {
        self.system_metrics.snapshot()
    }
}
