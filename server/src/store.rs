//! Durable storage for games, sessions, spin events, and daily rollups.
//!
//! One SQLite connection lives on a dedicated worker thread; async callers
//! talk to it through a command channel where every command carries a oneshot
//! reply. Serializing all access through the worker is also what makes
//! `record_spin` race-free: the count-then-insert runs inside a single
//! transaction that nothing can interleave with, so a round can never exceed
//! its move limit no matter how many requests race.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use paydirt_types::{DailyMetric, EngineError, GameConfig, Session, SessionSnapshot, SpinEvent};

/// Outcome of a record-spin attempt, decided inside the worker transaction.
enum SpinRecord {
    Accepted { moves_used: u32 },
    RoundOver { limit: u32 },
}

enum StoreRequest {
    UpsertGame {
        config: GameConfig,
        now_ms: u64,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    GetGame {
        game_id: String,
        resp: oneshot::Sender<anyhow::Result<Option<GameConfig>>>,
    },
    InsertSession {
        snapshot: SessionSnapshot,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    FindOrInsertSession {
        snapshot: SessionSnapshot,
        now_ms: u64,
        resp: oneshot::Sender<anyhow::Result<(SessionSnapshot, bool)>>,
    },
    GetSession {
        session_id: String,
        resp: oneshot::Sender<anyhow::Result<Option<SessionSnapshot>>>,
    },
    FindLiveSession {
        game_id: String,
        player_ref: String,
        now_ms: u64,
        resp: oneshot::Sender<anyhow::Result<Option<SessionSnapshot>>>,
    },
    UpdateBalance {
        session_id: String,
        balance: u64,
        resp: oneshot::Sender<anyhow::Result<bool>>,
    },
    AdvanceRound {
        session_id: String,
        now_ms: u64,
        resp: oneshot::Sender<anyhow::Result<Option<u32>>>,
    },
    ExpireSession {
        session_id: String,
        now_ms: u64,
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
    DeleteExpired {
        now_ms: u64,
        resp: oneshot::Sender<anyhow::Result<usize>>,
    },
    RecordSpin {
        event: SpinEvent,
        moves_per_round: u32,
        resp: oneshot::Sender<anyhow::Result<SpinRecord>>,
    },
    QueryDailyMetrics {
        game_id: String,
        start: NaiveDate,
        end: NaiveDate,
        country: Option<String>,
        resp: oneshot::Sender<anyhow::Result<Vec<DailyMetric>>>,
    },
    RebuildDailyMetrics {
        start_ms: u64,
        end_ms: u64,
        resp: oneshot::Sender<anyhow::Result<usize>>,
    },
    Ping {
        resp: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Async handle to the store worker. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    sender: mpsc::Sender<StoreRequest>,
}

impl Store {
    /// Open (or create) the database and initialize the schema, then start
    /// the worker thread. Schema errors surface here rather than on first use.
    pub fn open(path: &Path, buffer: usize) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open store db {}", path.display()))?;
        init_schema(&conn)?;
        drop(conn);

        Ok(Self::start_worker(path.to_path_buf(), buffer))
    }

    fn start_worker(path: PathBuf, buffer: usize) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        std::thread::spawn(move || store_worker(path, receiver));
        Self { sender }
    }

    async fn send(&self, request: StoreRequest) -> Result<(), EngineError> {
        self.sender
            .send(request)
            .await
            .map_err(|_| EngineError::store("store worker unavailable"))
    }

    pub async fn upsert_game(&self, config: GameConfig, now_ms: u64) -> Result<(), EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::UpsertGame {
            config,
            now_ms,
            resp,
        })
        .await?;
        recv(rx).await
    }

    pub async fn get_game(&self, game_id: &str) -> Result<Option<GameConfig>, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::GetGame {
            game_id: game_id.to_string(),
            resp,
        })
        .await?;
        recv(rx).await
    }

    pub async fn insert_session(&self, snapshot: SessionSnapshot) -> Result<(), EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::InsertSession { snapshot, resp })
            .await?;
        recv(rx).await
    }

    /// Insert the candidate session unless a live one already exists for its
    /// (game, player) pair, all in one transaction; returns the surviving
    /// snapshot and whether it was freshly created. Two racing creates can
    /// never both insert.
    pub async fn find_or_insert_session(
        &self,
        snapshot: SessionSnapshot,
        now_ms: u64,
    ) -> Result<(SessionSnapshot, bool), EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::FindOrInsertSession {
            snapshot,
            now_ms,
            resp,
        })
        .await?;
        recv(rx).await
    }

    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSnapshot>, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::GetSession {
            session_id: session_id.to_string(),
            resp,
        })
        .await?;
        recv(rx).await
    }

    pub async fn find_live_session(
        &self,
        game_id: &str,
        player_ref: &str,
        now_ms: u64,
    ) -> Result<Option<SessionSnapshot>, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::FindLiveSession {
            game_id: game_id.to_string(),
            player_ref: player_ref.to_string(),
            now_ms,
            resp,
        })
        .await?;
        recv(rx).await
    }

    /// Returns false when the session row no longer exists.
    pub async fn update_balance(
        &self,
        session_id: &str,
        balance: u64,
    ) -> Result<bool, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::UpdateBalance {
            session_id: session_id.to_string(),
            balance,
            resp,
        })
        .await?;
        recv(rx).await
    }

    /// Bump the session to its next round; `None` when the session is absent
    /// or already expired.
    pub async fn advance_round(
        &self,
        session_id: &str,
        now_ms: u64,
    ) -> Result<Option<u32>, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::AdvanceRound {
            session_id: session_id.to_string(),
            now_ms,
            resp,
        })
        .await?;
        recv(rx).await
    }

    /// Pull the session's expiry back to `now_ms`. Idempotent; never extends
    /// a deadline.
    pub async fn expire_session(&self, session_id: &str, now_ms: u64) -> Result<(), EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::ExpireSession {
            session_id: session_id.to_string(),
            now_ms,
            resp,
        })
        .await?;
        recv(rx).await
    }

    pub async fn delete_expired(&self, now_ms: u64) -> Result<usize, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::DeleteExpired { now_ms, resp }).await?;
        recv(rx).await
    }

    /// Atomically count the round's events and insert this one if the limit
    /// allows. Returns the move number consumed, or `RoundOver` with nothing
    /// written.
    pub async fn record_spin(
        &self,
        event: SpinEvent,
        moves_per_round: u32,
    ) -> Result<u32, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::RecordSpin {
            event,
            moves_per_round,
            resp,
        })
        .await?;
        match recv(rx).await? {
            SpinRecord::Accepted { moves_used } => Ok(moves_used),
            SpinRecord::RoundOver { limit } => Err(EngineError::RoundOver { limit }),
        }
    }

    pub async fn query_daily_metrics(
        &self,
        game_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        country: Option<String>,
    ) -> Result<Vec<DailyMetric>, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::QueryDailyMetrics {
            game_id: game_id.to_string(),
            start,
            end,
            country,
            resp,
        })
        .await?;
        recv(rx).await
    }

    /// Recompute rollup rows for every (game, day, country) touched by spin
    /// events in `[start_ms, end_ms)`. `start_ms` must be day-aligned so the
    /// affected days are recomputed in full. Idempotent: rows are derived
    /// from the durable events, not incremented.
    pub async fn rebuild_daily_metrics(
        &self,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<usize, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::RebuildDailyMetrics {
            start_ms,
            end_ms,
            resp,
        })
        .await?;
        recv(rx).await
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        let (resp, rx) = oneshot::channel();
        self.send(StoreRequest::Ping { resp }).await?;
        recv(rx).await
    }
}

async fn recv<T>(rx: oneshot::Receiver<anyhow::Result<T>>) -> Result<T, EngineError> {
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(EngineError::store(format!("{err:#}"))),
        Err(_) => Err(EngineError::store("store worker dropped request")),
    }
}

fn store_worker(path: PathBuf, mut receiver: mpsc::Receiver<StoreRequest>) {
    let mut conn = match Connection::open(&path) {
        Ok(conn) => conn,
        Err(err) => {
            error!("Store open failed: {err}");
            return;
        }
    };
    if let Err(err) = init_schema(&conn) {
        error!("Store schema init failed: {err}");
        return;
    }

    while let Some(request) = receiver.blocking_recv() {
        handle_request(&mut conn, request);
    }
}

fn handle_request(conn: &mut Connection, request: StoreRequest) {
    match request {
        StoreRequest::UpsertGame {
            config,
            now_ms,
            resp,
        } => {
            let _ = resp.send(upsert_game(conn, &config, now_ms));
        }
        StoreRequest::GetGame { game_id, resp } => {
            let _ = resp.send(get_game(conn, &game_id));
        }
        StoreRequest::InsertSession { snapshot, resp } => {
            let _ = resp.send(insert_session(conn, &snapshot));
        }
        StoreRequest::FindOrInsertSession {
            snapshot,
            now_ms,
            resp,
        } => {
            let _ = resp.send(find_or_insert_session(conn, &snapshot, now_ms));
        }
        StoreRequest::GetSession { session_id, resp } => {
            let _ = resp.send(get_session(conn, &session_id));
        }
        StoreRequest::FindLiveSession {
            game_id,
            player_ref,
            now_ms,
            resp,
        } => {
            let _ = resp.send(find_live_session(conn, &game_id, &player_ref, now_ms));
        }
        StoreRequest::UpdateBalance {
            session_id,
            balance,
            resp,
        } => {
            let _ = resp.send(update_balance(conn, &session_id, balance));
        }
        StoreRequest::AdvanceRound {
            session_id,
            now_ms,
            resp,
        } => {
            let _ = resp.send(advance_round(conn, &session_id, now_ms));
        }
        StoreRequest::ExpireSession {
            session_id,
            now_ms,
            resp,
        } => {
            let _ = resp.send(expire_session(conn, &session_id, now_ms));
        }
        StoreRequest::DeleteExpired { now_ms, resp } => {
            let _ = resp.send(delete_expired(conn, now_ms));
        }
        StoreRequest::RecordSpin {
            event,
            moves_per_round,
            resp,
        } => {
            let _ = resp.send(record_spin(conn, &event, moves_per_round));
        }
        StoreRequest::QueryDailyMetrics {
            game_id,
            start,
            end,
            country,
            resp,
        } => {
            let _ = resp.send(query_daily_metrics(
                conn,
                &game_id,
                start,
                end,
                country.as_deref(),
            ));
        }
        StoreRequest::RebuildDailyMetrics {
            start_ms,
            end_ms,
            resp,
        } => {
            let _ = resp.send(rebuild_daily_metrics(conn, start_ms, end_ms));
        }
        StoreRequest::Ping { resp } => {
            let _ = resp.send(ping(conn));
        }
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS games (
             game_id TEXT PRIMARY KEY,
             config TEXT NOT NULL,
             published INTEGER NOT NULL,
             updated_at_ms INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS sessions (
             session_id TEXT PRIMARY KEY,
             game_id TEXT NOT NULL,
             player_ref TEXT NOT NULL,
             country TEXT,
             balance INTEGER NOT NULL,
             round INTEGER NOT NULL,
             created_at_ms INTEGER NOT NULL,
             expires_at_ms INTEGER NOT NULL,
             config TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS sessions_live
             ON sessions(game_id, player_ref, expires_at_ms);
         CREATE INDEX IF NOT EXISTS sessions_expiry ON sessions(expires_at_ms);
         CREATE TABLE IF NOT EXISTS spin_events (
             event_id TEXT PRIMARY KEY,
             session_id TEXT NOT NULL,
             game_id TEXT NOT NULL,
             player_ref TEXT NOT NULL,
             country TEXT,
             round INTEGER NOT NULL,
             bid INTEGER NOT NULL,
             reward_kind TEXT NOT NULL,
             payout INTEGER NOT NULL,
             win INTEGER NOT NULL,
             created_at_ms INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS spin_events_session_round
             ON spin_events(session_id, round);
         CREATE INDEX IF NOT EXISTS spin_events_game_time
             ON spin_events(game_id, created_at_ms);
         CREATE TABLE IF NOT EXISTS daily_metrics (
             game_id TEXT NOT NULL,
             date TEXT NOT NULL,
             country TEXT NOT NULL,
             total_bets INTEGER NOT NULL,
             total_wins INTEGER NOT NULL,
             net_revenue INTEGER NOT NULL,
             spin_count INTEGER NOT NULL,
             player_count INTEGER NOT NULL,
             PRIMARY KEY (game_id, date, country)
         );",
    )
    .context("init store schema")?;
    Ok(())
}

fn upsert_game(conn: &Connection, config: &GameConfig, now_ms: u64) -> anyhow::Result<()> {
    let json = serde_json::to_string(config).context("serialize game config")?;
    conn.execute(
        "INSERT OR REPLACE INTO games (game_id, config, published, updated_at_ms)
         VALUES (?, ?, ?, ?)",
        params![config.game_id, json, config.published, now_ms],
    )
    .context("upsert game")?;
    Ok(())
}

fn get_game(conn: &Connection, game_id: &str) -> anyhow::Result<Option<GameConfig>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT config FROM games WHERE game_id = ?",
            params![game_id],
            |row| row.get(0),
        )
        .optional()
        .context("query game")?;
    match json {
        Some(json) => Ok(Some(
            serde_json::from_str(&json).context("parse stored game config")?,
        )),
        None => Ok(None),
    }
}

fn insert_session(conn: &Connection, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
    let session = &snapshot.session;
    let config = serde_json::to_string(&snapshot.config).context("serialize session config")?;
    conn.execute(
        "INSERT INTO sessions
             (session_id, game_id, player_ref, country, balance, round,
              created_at_ms, expires_at_ms, config)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            session.session_id,
            session.game_id,
            session.player_ref,
            session.country,
            session.balance,
            session.round,
            session.created_at_ms,
            session.expires_at_ms,
            config,
        ],
    )
    .context("insert session")?;
    Ok(())
}

fn find_or_insert_session(
    conn: &mut Connection,
    snapshot: &SessionSnapshot,
    now_ms: u64,
) -> anyhow::Result<(SessionSnapshot, bool)> {
    let tx = conn.transaction()?;
    let session = &snapshot.session;
    let existing = tx
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE game_id = ? AND player_ref = ? AND expires_at_ms > ?
                 ORDER BY expires_at_ms DESC LIMIT 1"
            ),
            params![session.game_id, session.player_ref, now_ms],
            row_to_snapshot,
        )
        .optional()
        .context("query live session")?;
    if let Some(existing) = parse_snapshot(existing)? {
        return Ok((existing, false));
    }
    insert_session(&tx, snapshot)?;
    tx.commit()?;
    Ok((snapshot.clone(), true))
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Session, String)> {
    Ok((
        Session {
            session_id: row.get(0)?,
            game_id: row.get(1)?,
            player_ref: row.get(2)?,
            country: row.get(3)?,
            balance: row.get(4)?,
            round: row.get(5)?,
            created_at_ms: row.get(6)?,
            expires_at_ms: row.get(7)?,
        },
        row.get(8)?,
    ))
}

const SESSION_COLUMNS: &str = "session_id, game_id, player_ref, country, balance, round, \
                               created_at_ms, expires_at_ms, config";

fn get_session(conn: &Connection, session_id: &str) -> anyhow::Result<Option<SessionSnapshot>> {
    let row = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?"),
            params![session_id],
            row_to_snapshot,
        )
        .optional()
        .context("query session")?;
    parse_snapshot(row)
}

fn find_live_session(
    conn: &Connection,
    game_id: &str,
    player_ref: &str,
    now_ms: u64,
) -> anyhow::Result<Option<SessionSnapshot>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE game_id = ? AND player_ref = ? AND expires_at_ms > ?
                 ORDER BY expires_at_ms DESC LIMIT 1"
            ),
            params![game_id, player_ref, now_ms],
            row_to_snapshot,
        )
        .optional()
        .context("query live session")?;
    parse_snapshot(row)
}

fn parse_snapshot(row: Option<(Session, String)>) -> anyhow::Result<Option<SessionSnapshot>> {
    match row {
        Some((session, config)) => {
            let config = serde_json::from_str(&config).context("parse session config")?;
            Ok(Some(SessionSnapshot { session, config }))
        }
        None => Ok(None),
    }
}

fn update_balance(conn: &Connection, session_id: &str, balance: u64) -> anyhow::Result<bool> {
    let changed = conn
        .execute(
            "UPDATE sessions SET balance = ? WHERE session_id = ?",
            params![balance, session_id],
        )
        .context("update session balance")?;
    Ok(changed > 0)
}

fn advance_round(
    conn: &mut Connection,
    session_id: &str,
    now_ms: u64,
) -> anyhow::Result<Option<u32>> {
    let tx = conn.transaction()?;
    let changed = tx
        .execute(
            "UPDATE sessions SET round = round + 1
             WHERE session_id = ? AND expires_at_ms > ?",
            params![session_id, now_ms],
        )
        .context("advance session round")?;
    if changed == 0 {
        return Ok(None);
    }
    let round: u32 = tx
        .query_row(
            "SELECT round FROM sessions WHERE session_id = ?",
            params![session_id],
            |row| row.get(0),
        )
        .context("read advanced round")?;
    tx.commit()?;
    Ok(Some(round))
}

fn expire_session(conn: &Connection, session_id: &str, now_ms: u64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE sessions SET expires_at_ms = ?
         WHERE session_id = ? AND expires_at_ms > ?",
        params![now_ms, session_id, now_ms],
    )
    .context("expire session")?;
    Ok(())
}

fn delete_expired(conn: &Connection, now_ms: u64) -> anyhow::Result<usize> {
    conn.execute(
        "DELETE FROM sessions WHERE expires_at_ms <= ?",
        params![now_ms],
    )
    .context("delete expired sessions")
}

fn record_spin(
    conn: &mut Connection,
    event: &SpinEvent,
    moves_per_round: u32,
) -> anyhow::Result<SpinRecord> {
    let tx = conn.transaction()?;
    let moves_used: u32 = tx
        .query_row(
            "SELECT COUNT(*) FROM spin_events WHERE session_id = ? AND round = ?",
            params![event.session_id, event.round],
            |row| row.get(0),
        )
        .context("count round moves")?;
    if moves_used >= moves_per_round {
        return Ok(SpinRecord::RoundOver {
            limit: moves_per_round,
        });
    }
    tx.execute(
        "INSERT INTO spin_events
             (event_id, session_id, game_id, player_ref, country, round,
              bid, reward_kind, payout, win, created_at_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            event.event_id,
            event.session_id,
            event.game_id,
            event.player_ref,
            event.country,
            event.round,
            event.bid,
            event.reward_kind,
            event.payout,
            event.win,
            event.created_at_ms,
        ],
    )
    .context("insert spin event")?;
    tx.commit()?;
    Ok(SpinRecord::Accepted {
        moves_used: moves_used + 1,
    })
}

fn query_daily_metrics(
    conn: &Connection,
    game_id: &str,
    start: NaiveDate,
    end: NaiveDate,
    country: Option<&str>,
) -> anyhow::Result<Vec<DailyMetric>> {
    let start = start.to_string();
    let end = end.to_string();
    let mut rows = Vec::new();
    match country {
        Some(country) => {
            let mut stmt = conn.prepare(
                "SELECT date, country, total_bets, total_wins, net_revenue,
                        spin_count, player_count
                 FROM daily_metrics
                 WHERE game_id = ? AND date >= ? AND date <= ? AND country = ?
                 ORDER BY date",
            )?;
            let mapped = stmt.query_map(
                params![game_id, start, end, country.to_uppercase()],
                daily_metric_row,
            )?;
            for row in mapped {
                rows.push(finish_metric(game_id, row?)?);
            }
        }
        None => {
            // No country filter: collapse the per-country rows per day.
            let mut stmt = conn.prepare(
                "SELECT date, '' AS country, SUM(total_bets), SUM(total_wins),
                        SUM(net_revenue), SUM(spin_count), SUM(player_count)
                 FROM daily_metrics
                 WHERE game_id = ? AND date >= ? AND date <= ?
                 GROUP BY date ORDER BY date",
            )?;
            let mapped = stmt.query_map(params![game_id, start, end], daily_metric_row)?;
            for row in mapped {
                rows.push(finish_metric(game_id, row?)?);
            }
        }
    }
    Ok(rows)
}

type MetricRow = (String, String, u64, u64, i64, u64, u64);

fn daily_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn finish_metric(game_id: &str, row: MetricRow) -> anyhow::Result<DailyMetric> {
    let (date, country, total_bets, total_wins, net_revenue, spin_count, player_count) = row;
    Ok(DailyMetric {
        game_id: game_id.to_string(),
        date: date.parse().context("parse rollup date")?,
        country: (!country.is_empty()).then_some(country),
        total_bets,
        total_wins,
        net_revenue,
        spin_count,
        player_count,
    })
}

fn rebuild_daily_metrics(
    conn: &mut Connection,
    start_ms: u64,
    end_ms: u64,
) -> anyhow::Result<usize> {
    let tx = conn.transaction()?;
    let mut written = 0usize;
    {
        let mut stmt = tx.prepare(
            "SELECT game_id,
                    date(created_at_ms / 1000, 'unixepoch') AS day,
                    UPPER(COALESCE(country, '')) AS region,
                    SUM(bid), SUM(payout), COUNT(*), COUNT(DISTINCT player_ref)
             FROM spin_events
             WHERE created_at_ms >= ? AND created_at_ms < ?
             GROUP BY game_id, day, region",
        )?;
        let groups = stmt.query_map(params![start_ms, end_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, u64>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, u64>(6)?,
            ))
        })?;
        let mut upsert = tx.prepare(
            "INSERT OR REPLACE INTO daily_metrics
                 (game_id, date, country, total_bets, total_wins, net_revenue,
                  spin_count, player_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for group in groups {
            let (game_id, day, region, bets, wins, spins, players) = group?;
            upsert.execute(params![
                game_id,
                day,
                region,
                bets,
                wins,
                bets as i64 - wins as i64,
                spins,
                players,
            ])?;
            written += 1;
        }
    }
    tx.commit().context("commit rollup rebuild")?;
    Ok(written)
}

fn ping(conn: &Connection) -> anyhow::Result<()> {
    conn.query_row("SELECT 1", [], |_| Ok(()))
        .context("store ping")
}

#[cfg(test)]
mod tests {
    use super::*;
    use paydirt_types::{RewardEntry, RewardTable};
    use tempfile::TempDir;

    fn test_store() -> (Store, TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(&dir.path().join("store.db"), 64).expect("open store");
        (store, dir)
    }

    fn test_config(game_id: &str) -> GameConfig {
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
            published: true,
        }
    }

    fn test_snapshot(session_id: &str, expires_at_ms: u64) -> SessionSnapshot {
        SessionSnapshot {
            session: Session {
                session_id: session_id.into(),
                game_id: "g1".into(),
                player_ref: "p1".into(),
                country: Some("US".into()),
                balance: 1_000,
                round: 1,
                created_at_ms: 0,
                expires_at_ms,
            },
            config: test_config("g1"),
        }
    }

    fn test_event(session_id: &str, round: u32, created_at_ms: u64) -> SpinEvent {
        SpinEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            game_id: "g1".into(),
            player_ref: "p1".into(),
            country: Some("US".into()),
            round,
            bid: 5,
            reward_kind: "ROCK".into(),
            payout: 5,
            win: true,
            created_at_ms,
        }
    }

    #[tokio::test]
    async fn game_upsert_and_get() {
        let (store, _dir) = test_store();
        assert!(store.get_game("g1").await.unwrap().is_none());

        let config = test_config("g1");
        store.upsert_game(config.clone(), 1).await.unwrap();
        assert_eq!(store.get_game("g1").await.unwrap().unwrap(), config);

        let mut updated = config;
        updated.published = false;
        store.upsert_game(updated.clone(), 2).await.unwrap();
        assert!(!store.get_game("g1").await.unwrap().unwrap().published);
    }

    #[tokio::test]
    async fn session_roundtrip_preserves_config_snapshot() {
        let (store, _dir) = test_store();
        let snapshot = test_snapshot("s1", 10_000);
        store.insert_session(snapshot.clone()).await.unwrap();

        let loaded = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(store.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_live_session_ignores_expired_rows() {
        let (store, _dir) = test_store();
        store.insert_session(test_snapshot("s1", 5_000)).await.unwrap();

        let live = store.find_live_session("g1", "p1", 4_999).await.unwrap();
        assert_eq!(live.unwrap().session.session_id, "s1");
        assert!(store
            .find_live_session("g1", "p1", 5_000)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn record_spin_enforces_move_limit() {
        let (store, _dir) = test_store();
        assert_eq!(
            store.record_spin(test_event("s1", 1, 100), 2).await.unwrap(),
            1
        );
        assert_eq!(
            store.record_spin(test_event("s1", 1, 200), 2).await.unwrap(),
            2
        );
        assert_eq!(
            store.record_spin(test_event("s1", 1, 300), 2).await,
            Err(EngineError::RoundOver { limit: 2 })
        );
        // A new round counts from zero again.
        assert_eq!(
            store.record_spin(test_event("s1", 2, 400), 2).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_spins_cannot_exceed_limit() {
        let (store, _dir) = test_store();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.record_spin(test_event("s1", 1, 100), 3).await
            }));
        }
        let mut accepted = 0;
        let mut round_over = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(EngineError::RoundOver { .. }) => round_over += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(round_over, 13);
    }

    #[tokio::test]
    async fn concurrent_creates_keep_one_live_session() {
        let (store, _dir) = test_store();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .find_or_insert_session(test_snapshot(&format!("s{i}"), 10_000), 0)
                    .await
            }));
        }
        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for task in tasks {
            let (snapshot, fresh) = task.await.unwrap().unwrap();
            ids.insert(snapshot.session.session_id);
            if fresh {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn balance_round_and_expiry_updates() {
        let (store, _dir) = test_store();
        store.insert_session(test_snapshot("s1", 10_000)).await.unwrap();

        assert!(store.update_balance("s1", 750).await.unwrap());
        assert!(!store.update_balance("missing", 1).await.unwrap());
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().session.balance,
            750
        );

        assert_eq!(store.advance_round("s1", 100).await.unwrap(), Some(2));
        // Advancing an expired session is refused.
        assert_eq!(store.advance_round("s1", 10_000).await.unwrap(), None);

        store.expire_session("s1", 500).await.unwrap();
        let expired = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(expired.session.expires_at_ms, 500);
        // Idempotent: a second call does not move the deadline.
        store.expire_session("s1", 900).await.unwrap();
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().session.expires_at_ms,
            500
        );
    }

    #[tokio::test]
    async fn delete_expired_only_touches_past_deadlines() {
        let (store, _dir) = test_store();
        store.insert_session(test_snapshot("dead", 1_000)).await.unwrap();
        store.insert_session(test_snapshot("live", 9_000)).await.unwrap();

        assert_eq!(store.delete_expired(2_000).await.unwrap(), 1);
        assert!(store.get_session("dead").await.unwrap().is_none());
        assert!(store.get_session("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rollup_rebuild_is_idempotent() {
        let (store, _dir) = test_store();
        let day_ms = 86_400_000u64;
        // Two spins on day one (US), one on day two (DE), one without country.
        let mut event = test_event("s1", 1, day_ms / 2);
        event.bid = 10;
        event.payout = 0;
        store.record_spin(event, 10).await.unwrap();
        let mut event = test_event("s1", 1, day_ms / 2 + 1_000);
        event.bid = 10;
        event.payout = 30;
        store.record_spin(event, 10).await.unwrap();
        let mut event = test_event("s2", 1, day_ms + 5_000);
        event.country = Some("DE".into());
        event.player_ref = "p2".into();
        event.bid = 4;
        event.payout = 4;
        store.record_spin(event, 10).await.unwrap();
        let mut event = test_event("s3", 1, day_ms + 6_000);
        event.country = None;
        event.bid = 2;
        event.payout = 0;
        store.record_spin(event, 10).await.unwrap();

        let end_ms = 3 * day_ms;
        assert_eq!(store.rebuild_daily_metrics(0, end_ms).await.unwrap(), 3);

        let start = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(1970, 1, 3).unwrap();
        let rows = store
            .query_daily_metrics("g1", start, end, None)
            .await
            .unwrap();
        let again = store.rebuild_daily_metrics(0, end_ms).await.unwrap();
        assert_eq!(again, 3);
        let rows_after = store
            .query_daily_metrics("g1", start, end, None)
            .await
            .unwrap();
        assert_eq!(rows, rows_after);

        // Day one: 20 bet, 30 won, one player.
        assert_eq!(rows[0].total_bets, 20);
        assert_eq!(rows[0].total_wins, 30);
        assert_eq!(rows[0].net_revenue, -10);
        assert_eq!(rows[0].spin_count, 2);
        assert_eq!(rows[0].player_count, 1);
        // Day two collapses DE and the countryless event.
        assert_eq!(rows[1].total_bets, 6);
        assert_eq!(rows[1].spin_count, 2);
        assert_eq!(rows[1].player_count, 2);
        for row in &rows {
            assert_eq!(
                row.net_revenue,
                row.total_bets as i64 - row.total_wins as i64
            );
        }

        // Country filter returns only the matching rollup row.
        let de = store
            .query_daily_metrics("g1", start, end, Some("de".into()))
            .await
            .unwrap();
        assert_eq!(de.len(), 1);
        assert_eq!(de[0].country.as_deref(), Some("DE"));
        assert_eq!(de[0].total_bets, 4);
    }

    #[tokio::test]
    async fn ping_answers() {
        let (store, _dir) = test_store();
        store.ping().await.unwrap();
    }
}
