//! Shared data model for the paydirt session and reward engine.
//!
//! Everything here is plain data: game configuration snapshots, sessions,
//! spin events, metric rollups, and the error taxonomy surfaced over the
//! wire. Behavior lives in `paydirt-engine` (selection/round policy) and
//! `paydirt-server` (storage, caching, aggregation).

pub mod api;
pub mod error;
pub mod event;
pub mod game;
pub mod metrics;
pub mod session;

pub use api::{
    CreateSessionRequest, CreateSessionResponse, GameMetrics, SelectRequest, SelectResponse,
    SessionView,
};
pub use error::EngineError;
pub use event::SpinEvent;
pub use game::{GameConfig, Region, RewardEntry, RewardTable};
pub use metrics::{DailyMetric, RealtimeStats, RealtimeWindow};
pub use session::{Session, SessionSnapshot};

/// Milliseconds in one hour, the real-time counter window size.
pub const HOUR_MS: u64 = 60 * 60 * 1000;

/// Milliseconds in one UTC day, the rollup granularity.
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Truncate an epoch-millisecond timestamp to the start of its hour window.
pub fn hour_start_ms(now_ms: u64) -> u64 {
    now_ms - (now_ms % HOUR_MS)
}

/// Truncate an epoch-millisecond timestamp to the start of its UTC day.
pub fn day_start_ms(now_ms: u64) -> u64 {
    now_ms - (now_ms % DAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_starts_truncate() {
        assert_eq!(hour_start_ms(0), 0);
        assert_eq!(hour_start_ms(HOUR_MS - 1), 0);
        assert_eq!(hour_start_ms(HOUR_MS), HOUR_MS);
        assert_eq!(hour_start_ms(3 * HOUR_MS + 17), 3 * HOUR_MS);

        assert_eq!(day_start_ms(DAY_MS - 1), 0);
        assert_eq!(day_start_ms(2 * DAY_MS + 5), 2 * DAY_MS);
    }
}
