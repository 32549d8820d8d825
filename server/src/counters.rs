//! Best-effort real-time counters, one window per (game, UTC hour).
//!
//! Fed by the spin stream consumer. The stream is at-least-once, so each
//! window remembers the highest applied sequence and ignores anything at or
//! below it; a crash between apply and ack redelivers the event but cannot
//! double-count it. Windows age out on their own and are never zeroed by the
//! daily aggregator. This is a dashboard aid, not a source of truth.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use paydirt_types::{hour_start_ms, RealtimeWindow, SpinEvent};

#[derive(Default)]
struct Window {
    total_bets: u64,
    total_wins: u64,
    spin_count: u64,
    last_seq: u64,
}

pub struct RealtimeCounters {
    windows: Mutex<HashMap<(String, u64), Window>>,
    ttl_ms: u64,
}

impl RealtimeCounters {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            ttl_ms: ttl_ms.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, u64), Window>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fold one delivered event into its hour window. `seq` is the stream
    /// sequence; a seq at or below the window's high-water mark has already
    /// been counted and is skipped.
    pub fn apply(&self, seq: u64, event: &SpinEvent, now_ms: u64) {
        let hour = hour_start_ms(event.created_at_ms);
        let ttl_ms = self.ttl_ms;
        let mut windows = self.lock();
        windows.retain(|(_, start), _| start.saturating_add(ttl_ms) > now_ms);

        let window = windows
            .entry((event.game_id.clone(), hour))
            .or_default();
        if seq <= window.last_seq {
            return;
        }
        window.last_seq = seq;
        window.total_bets += event.bid;
        window.total_wins += event.payout;
        window.spin_count += 1;
    }

    /// Retained windows for one game, newest hour first.
    pub fn stats_for(&self, game_id: &str, now_ms: u64) -> Vec<RealtimeWindow> {
        let ttl_ms = self.ttl_ms;
        let windows = self.lock();
        let mut stats = windows
            .iter()
            .filter(|((game, start), _)| {
                game == game_id && start.saturating_add(ttl_ms) > now_ms
            })
            .map(|((_, start), window)| RealtimeWindow {
                hour_start_ms: *start,
                total_bets: window.total_bets,
                total_wins: window.total_wins,
                net_revenue: window.total_bets as i64 - window.total_wins as i64,
                spin_count: window.spin_count,
            })
            .collect::<Vec<_>>();
        stats.sort_by(|a, b| b.hour_start_ms.cmp(&a.hour_start_ms));
        stats
    }

    pub fn window_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paydirt_types::HOUR_MS;

    fn spin(game_id: &str, bid: u64, payout: u64, created_at_ms: u64) -> SpinEvent {
        SpinEvent {
            event_id: "e".into(),
            session_id: "s1".into(),
            game_id: game_id.into(),
            player_ref: "p1".into(),
            country: None,
            round: 1,
            bid,
            reward_kind: "ROCK".into(),
            payout,
            win: payout > 0,
            created_at_ms,
        }
    }

    #[test]
    fn windows_accumulate_per_game_and_hour() {
        let counters = RealtimeCounters::new(25 * HOUR_MS);
        counters.apply(1, &spin("g1", 10, 0, 100), 0);
        counters.apply(2, &spin("g1", 10, 50, HOUR_MS / 2), 0);
        counters.apply(3, &spin("g1", 5, 5, HOUR_MS + 1), 0);
        counters.apply(4, &spin("g2", 7, 0, 100), 0);

        let stats = counters.stats_for("g1", 0);
        assert_eq!(stats.len(), 2);
        // Newest hour first.
        assert_eq!(stats[0].hour_start_ms, HOUR_MS);
        assert_eq!(stats[0].total_bets, 5);
        assert_eq!(stats[1].hour_start_ms, 0);
        assert_eq!(stats[1].total_bets, 20);
        assert_eq!(stats[1].total_wins, 50);
        assert_eq!(stats[1].net_revenue, -30);
        assert_eq!(stats[1].spin_count, 2);

        let other = counters.stats_for("g2", 0);
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].total_bets, 7);
    }

    #[test]
    fn redelivered_sequences_do_not_double_count() {
        let counters = RealtimeCounters::new(25 * HOUR_MS);
        let event = spin("g1", 10, 0, 100);
        counters.apply(1, &event, 0);
        counters.apply(1, &event, 0);
        counters.apply(1, &event, 0);

        let stats = counters.stats_for("g1", 0);
        assert_eq!(stats[0].total_bets, 10);
        assert_eq!(stats[0].spin_count, 1);

        counters.apply(2, &spin("g1", 3, 0, 200), 0);
        assert_eq!(counters.stats_for("g1", 0)[0].spin_count, 2);
    }

    #[test]
    fn dedupe_tracks_each_window_separately() {
        let counters = RealtimeCounters::new(25 * HOUR_MS);
        counters.apply(5, &spin("g1", 10, 0, 100), 0);
        counters.apply(6, &spin("g1", 10, 0, HOUR_MS + 1), 0);
        // Redelivery of both; neither may count again.
        counters.apply(5, &spin("g1", 10, 0, 100), 0);
        counters.apply(6, &spin("g1", 10, 0, HOUR_MS + 1), 0);
        // A genuinely new event in the older window still lands.
        counters.apply(7, &spin("g1", 1, 0, 200), 0);

        let stats = counters.stats_for("g1", 0);
        assert_eq!(stats[1].total_bets, 11);
        assert_eq!(stats[0].total_bets, 10);
    }

    #[test]
    fn windows_age_out() {
        let counters = RealtimeCounters::new(2 * HOUR_MS);
        counters.apply(1, &spin("g1", 10, 0, 0), 0);
        assert_eq!(counters.stats_for("g1", 0).len(), 1);
        // Past the retention horizon the window is neither reported...
        assert!(counters.stats_for("g1", 2 * HOUR_MS).is_empty());
        // ...nor kept in memory once a write sweeps it.
        counters.apply(2, &spin("g1", 1, 0, 3 * HOUR_MS), 3 * HOUR_MS);
        assert_eq!(counters.window_count(), 1);
    }
}
