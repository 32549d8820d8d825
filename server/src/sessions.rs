//! Session lifecycle: create, load, settle, invalidate, sweep.
//!
//! All call sites go through this repository so the cache and the durable
//! rows cannot drift in TTL bookkeeping. The store wins whenever the two
//! disagree, and a session past its deadline is expired no matter how fresh
//! the cached copy still is.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::SessionCache;
use crate::metrics::EngineMetrics;
use crate::store::Store;
use paydirt_types::{EngineError, Session, SessionSnapshot};

pub struct SessionRepository {
    store: Store,
    cache: Arc<SessionCache>,
    metrics: Arc<EngineMetrics>,
    session_ttl: Duration,
    starting_balance: u64,
}

impl SessionRepository {
    pub fn new(
        store: Store,
        cache: Arc<SessionCache>,
        metrics: Arc<EngineMetrics>,
        session_ttl: Duration,
        starting_balance: u64,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            session_ttl,
            starting_balance,
        }
    }

    /// Start (or resume) a session. Unknown and unpublished games are
    /// indistinguishable to the caller; a blocked country is rejected before
    /// anything is written. While a live session exists for the (game,
    /// player) pair, creation returns it instead of opening a second one.
    pub async fn create(
        &self,
        game_id: &str,
        player_ref: &str,
        country: Option<&str>,
        now_ms: u64,
    ) -> Result<Session, EngineError> {
        let Some(config) = self.store.get_game(game_id).await? else {
            return Err(EngineError::GameNotFound);
        };
        if !config.published {
            return Err(EngineError::GameNotFound);
        }

        let country = normalize_country(country);
        if let Some(bound) = &country {
            if config.is_region_blocked(Some(bound)) {
                self.metrics.inc_rejected_region_blocked();
                return Err(EngineError::RegionBlocked {
                    country: bound.clone(),
                });
            }
        }

        let candidate = SessionSnapshot {
            session: Session {
                session_id: Uuid::new_v4().to_string(),
                game_id: game_id.to_string(),
                player_ref: player_ref.to_string(),
                country,
                balance: self.starting_balance,
                round: 1,
                created_at_ms: now_ms,
                expires_at_ms: now_ms + self.session_ttl.as_millis() as u64,
            },
            config,
        };
        let (snapshot, created) = self.store.find_or_insert_session(candidate, now_ms).await?;
        self.cache
            .put(&snapshot, snapshot.session.remaining_ttl(now_ms))
            .await;
        if created {
            self.metrics.inc_sessions_created();
            debug!(
                "Session {} created for game {}",
                snapshot.session.session_id, snapshot.session.game_id
            );
        } else {
            self.metrics.inc_sessions_reused();
        }
        Ok(snapshot.session)
    }

    /// Cache-first load. A cached snapshot past its deadline is evicted and
    /// reported expired; a miss rebuilds the snapshot from the durable row's
    /// own config copy and re-caches it for the remaining lifetime.
    pub async fn get(
        &self,
        session_id: &str,
        now_ms: u64,
    ) -> Result<SessionSnapshot, EngineError> {
        if let Some(snapshot) = self.cache.get(session_id).await {
            if snapshot.session.is_expired(now_ms) {
                self.cache.delete(session_id).await;
                return Err(EngineError::Expired);
            }
            return Ok(snapshot);
        }

        let Some(snapshot) = self.store.get_session(session_id).await? else {
            return Err(EngineError::SessionNotFound);
        };
        if snapshot.session.is_expired(now_ms) {
            return Err(EngineError::Expired);
        }
        self.cache
            .put(&snapshot, snapshot.session.remaining_ttl(now_ms))
            .await;
        Ok(snapshot)
    }

    /// Write the settled balance and refresh the cached snapshot. Best
    /// effort by contract: the spin already settled against the event log,
    /// so a failed write is logged and play continues.
    pub async fn settle_balance(
        &self,
        snapshot: &SessionSnapshot,
        balance: u64,
        now_ms: u64,
    ) -> bool {
        let session_id = &snapshot.session.session_id;
        match self.store.update_balance(session_id, balance).await {
            Ok(true) => {
                let mut refreshed = snapshot.clone();
                refreshed.session.balance = balance;
                self.cache
                    .put(&refreshed, refreshed.session.remaining_ttl(now_ms))
                    .await;
                true
            }
            Ok(false) => {
                warn!("Balance write skipped: session {session_id} row is gone");
                self.metrics.inc_balance_write_failures();
                self.cache.delete(session_id).await;
                false
            }
            Err(err) => {
                warn!("Balance write failed for session {session_id}: {err}");
                self.metrics.inc_balance_write_failures();
                false
            }
        }
    }

    /// Move the session to its next round and refresh the cache.
    pub async fn advance_round(&self, session_id: &str, now_ms: u64) -> Result<u32, EngineError> {
        let snapshot = self.get(session_id, now_ms).await?;
        match self.store.advance_round(session_id, now_ms).await? {
            Some(round) => {
                let mut refreshed = snapshot;
                refreshed.session.round = round;
                self.cache
                    .put(&refreshed, refreshed.session.remaining_ttl(now_ms))
                    .await;
                Ok(round)
            }
            // The row went away between the load and the update; only expiry
            // (or the sweeper behind it) does that.
            None => Err(EngineError::Expired),
        }
    }

    /// End the session now. Idempotent: unknown and already-expired sessions
    /// are fine.
    pub async fn invalidate(&self, session_id: &str, now_ms: u64) -> Result<(), EngineError> {
        self.cache.delete(session_id).await;
        self.store.expire_session(session_id, now_ms).await?;
        self.metrics.inc_sessions_invalidated();
        debug!("Session {session_id} invalidated");
        Ok(())
    }

    /// Delete rows already past expiry. Safe alongside live traffic; expired
    /// sessions are unreachable through `get` either way.
    pub async fn cleanup_expired(&self, now_ms: u64) -> Result<usize, EngineError> {
        let deleted = self.store.delete_expired(now_ms).await?;
        if deleted > 0 {
            self.metrics.add_sessions_swept(deleted as u64);
        }
        Ok(deleted)
    }
}

pub(crate) fn normalize_country(country: Option<&str>) -> Option<String> {
    country
        .map(|country| country.trim().to_uppercase())
        .filter(|country| !country.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paydirt_types::{GameConfig, RewardEntry, RewardTable};
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(10);

    fn test_config(game_id: &str, published: bool) -> GameConfig {
        GameConfig {
            game_id: game_id.into(),
            name: "Test Mine".into(),
            rows: 5,
            columns: 6,
            reward_table: RewardTable::new(vec![
                RewardEntry {
                    kind: "DUST".into(),
                    weight: 70,
                    multiplier: 0.0,
                },
                RewardEntry {
                    kind: "ROCK".into(),
                    weight: 30,
                    multiplier: 1.0,
                },
            ]),
            allowed_bids: vec![1, 5],
            moves_per_round: 2,
            blocked_regions: vec!["XX".into()],
            available_regions: vec![],
            languages: vec!["en".into()],
            published,
        }
    }

    async fn test_repo() -> (SessionRepository, Store, Arc<SessionCache>, TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(&dir.path().join("store.db"), 64).expect("open store");
        let metrics = Arc::new(EngineMetrics::default());
        let cache = Arc::new(SessionCache::in_memory(metrics.clone()));
        let repo = SessionRepository::new(
            store.clone(),
            cache.clone(),
            metrics,
            TTL,
            1_000,
        );
        store
            .upsert_game(test_config("g1", true), 0)
            .await
            .expect("seed game");
        (repo, store, cache, dir)
    }

    #[tokio::test]
    async fn create_persists_and_serves_from_cache() {
        let (repo, _store, _cache, _dir) = test_repo().await;
        let session = repo.create("g1", "p1", Some("us"), 0).await.unwrap();
        assert_eq!(session.balance, 1_000);
        assert_eq!(session.round, 1);
        assert_eq!(session.country.as_deref(), Some("US"));
        assert_eq!(session.expires_at_ms, TTL.as_millis() as u64);

        let snapshot = repo.get(&session.session_id, 1).await.unwrap();
        assert_eq!(snapshot.session, session);
        assert_eq!(repo.metrics.snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn create_rejects_unknown_and_unpublished_games() {
        let (repo, store, _cache, _dir) = test_repo().await;
        assert_eq!(
            repo.create("nope", "p1", None, 0).await,
            Err(EngineError::GameNotFound)
        );

        store.upsert_game(test_config("g2", false), 0).await.unwrap();
        assert_eq!(
            repo.create("g2", "p1", None, 0).await,
            Err(EngineError::GameNotFound)
        );
    }

    #[tokio::test]
    async fn blocked_region_writes_nothing() {
        let (repo, store, _cache, _dir) = test_repo().await;
        assert_eq!(
            repo.create("g1", "p1", Some("xx"), 0).await,
            Err(EngineError::RegionBlocked {
                country: "XX".into()
            })
        );
        assert!(store.find_live_session("g1", "p1", 0).await.unwrap().is_none());
        // An unbound country never blocks.
        assert!(repo.create("g1", "p1", None, 0).await.is_ok());
    }

    #[tokio::test]
    async fn create_reuses_the_live_session() {
        let (repo, _store, _cache, _dir) = test_repo().await;
        let first = repo.create("g1", "p1", None, 0).await.unwrap();
        let second = repo.create("g1", "p1", None, 1_000).await.unwrap();
        assert_eq!(first.session_id, second.session_id);

        // A different player gets their own session.
        let other = repo.create("g1", "p2", None, 0).await.unwrap();
        assert_ne!(first.session_id, other.session_id);

        let counts = repo.metrics.snapshot();
        assert_eq!(counts.sessions_created, 2);
        assert_eq!(counts.sessions_reused, 1);

        // Once the first expires, the pair gets a fresh session.
        let after_expiry = TTL.as_millis() as u64;
        let third = repo.create("g1", "p1", None, after_expiry).await.unwrap();
        assert_ne!(first.session_id, third.session_id);
    }

    #[tokio::test]
    async fn expiry_wins_over_a_fresh_cache_entry() {
        let (repo, _store, _cache, _dir) = test_repo().await;
        let session = repo.create("g1", "p1", None, 0).await.unwrap();

        // The cached copy is seconds old in wall time, but the session's own
        // deadline decides.
        let at_deadline = session.expires_at_ms;
        assert!(repo.get(&session.session_id, at_deadline - 1).await.is_ok());
        assert_eq!(
            repo.get(&session.session_id, at_deadline).await,
            Err(EngineError::Expired)
        );
    }

    #[tokio::test]
    async fn get_rebuilds_snapshot_from_the_durable_row() {
        let (repo, _store, cache, _dir) = test_repo().await;
        let session = repo.create("g1", "p1", None, 0).await.unwrap();
        cache.delete(&session.session_id).await;

        let snapshot = repo.get(&session.session_id, 1).await.unwrap();
        assert_eq!(snapshot.session, session);
        assert_eq!(snapshot.config.game_id, "g1");
        // The rebuild re-cached it.
        repo.get(&session.session_id, 2).await.unwrap();
        assert_eq!(repo.metrics.snapshot().cache_hits, 1);

        assert_eq!(
            repo.get("missing", 0).await,
            Err(EngineError::SessionNotFound)
        );
    }

    #[tokio::test]
    async fn settle_balance_refreshes_row_and_cache() {
        let (repo, store, _cache, _dir) = test_repo().await;
        let session = repo.create("g1", "p1", None, 0).await.unwrap();
        let snapshot = repo.get(&session.session_id, 1).await.unwrap();

        assert!(repo.settle_balance(&snapshot, 750, 1).await);
        assert_eq!(
            repo.get(&session.session_id, 2).await.unwrap().session.balance,
            750
        );
        assert_eq!(
            store
                .get_session(&session.session_id)
                .await
                .unwrap()
                .unwrap()
                .session
                .balance,
            750
        );

        // A vanished row is non-fatal.
        let mut orphan = snapshot.clone();
        orphan.session.session_id = "missing".into();
        assert!(!repo.settle_balance(&orphan, 1, 1).await);
        assert_eq!(repo.metrics.snapshot().balance_write_failures, 1);
    }

    #[tokio::test]
    async fn advance_round_bumps_and_recaches() {
        let (repo, _store, _cache, _dir) = test_repo().await;
        let session = repo.create("g1", "p1", None, 0).await.unwrap();
        assert_eq!(repo.advance_round(&session.session_id, 1).await.unwrap(), 2);
        assert_eq!(repo.advance_round(&session.session_id, 2).await.unwrap(), 3);
        assert_eq!(
            repo.get(&session.session_id, 3).await.unwrap().session.round,
            3
        );
        assert_eq!(
            repo.advance_round("missing", 0).await,
            Err(EngineError::SessionNotFound)
        );
    }

    #[tokio::test]
    async fn invalidate_is_idempotent_and_sweep_reclaims() {
        let (repo, _store, _cache, _dir) = test_repo().await;
        let session = repo.create("g1", "p1", None, 0).await.unwrap();

        repo.invalidate(&session.session_id, 5).await.unwrap();
        assert_eq!(
            repo.get(&session.session_id, 5).await,
            Err(EngineError::Expired)
        );
        repo.invalidate(&session.session_id, 6).await.unwrap();
        repo.invalidate("missing", 6).await.unwrap();

        assert_eq!(repo.cleanup_expired(6).await.unwrap(), 1);
        assert_eq!(
            repo.get(&session.session_id, 6).await,
            Err(EngineError::SessionNotFound)
        );
        assert_eq!(repo.metrics.snapshot().sessions_swept, 1);
    }

    #[tokio::test]
    async fn concurrent_creates_share_one_session() {
        let (repo, store, _cache, _dir) = test_repo().await;
        let repo = Arc::new(repo);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            tasks.push(tokio::spawn(
                async move { repo.create("g1", "p1", None, 0).await },
            ));
        }
        let mut ids = std::collections::HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap().unwrap().session_id);
        }
        assert_eq!(ids.len(), 1);
        assert!(store.find_live_session("g1", "p1", 0).await.unwrap().is_some());

        let counts = repo.metrics.snapshot();
        assert_eq!(counts.sessions_created, 1);
        assert_eq!(counts.sessions_reused, 7);
    }
}
