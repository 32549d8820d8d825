//! Session snapshot cache.
//!
//! Best-effort by contract: a backend failure is logged and counted, then
//! answered as a miss so the durable store stays the source of truth. The
//! Redis backend dials lazily and drops its connection on any error so the
//! next call re-dials.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::warn;

use crate::metrics::EngineMetrics;
use paydirt_types::SessionSnapshot;

enum Backend {
    Memory {
        entries: Mutex<HashMap<String, (String, Instant)>>,
    },
    Redis {
        client: redis::Client,
        connection: Mutex<Option<redis::aio::ConnectionManager>>,
        prefix: String,
    },
}

pub struct SessionCache {
    backend: Backend,
    metrics: Arc<EngineMetrics>,
}

impl SessionCache {
    pub fn in_memory(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            backend: Backend::Memory {
                entries: Mutex::new(HashMap::new()),
            },
            metrics,
        }
    }

    pub fn redis(
        url: &str,
        prefix: String,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            backend: Backend::Redis {
                client,
                connection: Mutex::new(None),
                prefix,
            },
            metrics,
        })
    }

    pub fn mode(&self) -> &'static str {
        match &self.backend {
            Backend::Memory { .. } => "memory",
            Backend::Redis { .. } => "redis",
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        let payload = match &self.backend {
            Backend::Memory { entries } => {
                let entries = entries.lock().await;
                entries.get(session_id).and_then(|(payload, deadline)| {
                    (*deadline > Instant::now()).then(|| payload.clone())
                })
            }
            Backend::Redis { .. } => self.redis_get(session_id).await,
        };

        let Some(payload) = payload else {
            self.metrics.inc_cache_miss();
            return None;
        };
        match serde_json::from_str(&payload) {
            Ok(snapshot) => {
                self.metrics.inc_cache_hit();
                Some(snapshot)
            }
            Err(err) => {
                warn!("Session cache entry unreadable: {err}");
                self.metrics.inc_cache_error();
                self.delete(session_id).await;
                None
            }
        }
    }

    /// Cache the snapshot for `ttl`. A zero TTL means the session is already
    /// past its deadline and nothing is stored.
    pub async fn put(&self, snapshot: &SessionSnapshot, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let payload = match serde_json::to_string(snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Session cache serialize failed: {err}");
                self.metrics.inc_cache_error();
                return;
            }
        };

        match &self.backend {
            Backend::Memory { entries } => {
                let now = Instant::now();
                let mut entries = entries.lock().await;
                entries.retain(|_, (_, deadline)| *deadline > now);
                entries.insert(snapshot.session.session_id.clone(), (payload, now + ttl));
            }
            Backend::Redis { .. } => {
                self.redis_put(&snapshot.session.session_id, &payload, ttl)
                    .await;
            }
        }
    }

    pub async fn delete(&self, session_id: &str) {
        match &self.backend {
            Backend::Memory { entries } => {
                entries.lock().await.remove(session_id);
            }
            Backend::Redis { .. } => self.redis_delete(session_id).await,
        }
    }

    fn redis_key(prefix: &str, session_id: &str) -> String {
        format!("{prefix}{session_id}")
    }

    async fn ensure_connection<'a>(
        client: &redis::Client,
        connection: &'a Mutex<Option<redis::aio::ConnectionManager>>,
    ) -> Result<tokio::sync::MutexGuard<'a, Option<redis::aio::ConnectionManager>>, redis::RedisError>
    {
        let mut guard = connection.lock().await;
        if guard.is_none() {
            *guard = Some(client.get_connection_manager().await?);
        }
        Ok(guard)
    }

    async fn redis_get(&self, session_id: &str) -> Option<String> {
        let Backend::Redis {
            client,
            connection,
            prefix,
        } = &self.backend
        else {
            return None;
        };
        let mut guard = match Self::ensure_connection(client, connection).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!("Session cache connection failed: {err}");
                self.metrics.inc_cache_error();
                return None;
            }
        };
        let Some(conn) = guard.as_mut() else {
            return None;
        };
        match conn
            .get::<_, Option<String>>(Self::redis_key(prefix, session_id))
            .await
        {
            Ok(value) => value,
            Err(err) => {
                warn!("Session cache get failed: {err}");
                self.metrics.inc_cache_error();
                *guard = None;
                None
            }
        }
    }

    async fn redis_put(&self, session_id: &str, payload: &str, ttl: Duration) {
        let Backend::Redis {
            client,
            connection,
            prefix,
        } = &self.backend
        else {
            return;
        };
        let mut guard = match Self::ensure_connection(client, connection).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!("Session cache connection failed: {err}");
                self.metrics.inc_cache_error();
                return;
            }
        };
        let Some(conn) = guard.as_mut() else {
            return;
        };
        let key = Self::redis_key(prefix, session_id);
        let result: redis::RedisResult<()> =
            conn.set_ex(key, payload, ttl.as_secs().max(1)).await;
        if let Err(err) = result {
            warn!("Session cache set failed: {err}");
            self.metrics.inc_cache_error();
            *guard = None;
        }
    }

    async fn redis_delete(&self, session_id: &str) {
        let Backend::Redis {
            client,
            connection,
            prefix,
        } = &self.backend
        else {
            return;
        };
        let mut guard = match Self::ensure_connection(client, connection).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!("Session cache connection failed: {err}");
                self.metrics.inc_cache_error();
                return;
            }
        };
        let Some(conn) = guard.as_mut() else {
            return;
        };
        let result: redis::RedisResult<()> =
            conn.del(Self::redis_key(prefix, session_id)).await;
        if let Err(err) = result {
            warn!("Session cache delete failed: {err}");
            self.metrics.inc_cache_error();
            *guard = None;
        }
    }
}
