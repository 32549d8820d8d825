//! Metric aggregates: the durable daily rollup and the best-effort
//! real-time window.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Durable per-(game, date, country) rollup. The only metrics data
/// dashboards read for historical queries; rebuilt from spin events by the
/// scheduled aggregator, so rows hold `net_revenue == total_bets - total_wins`
/// by construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyMetric {
    pub game_id: String,
    pub date: NaiveDate,
    /// None when events carried no country.
    #[serde(default)]
    pub country: Option<String>,
    pub total_bets: u64,
    pub total_wins: u64,
    pub net_revenue: i64,
    pub spin_count: u64,
    /// Distinct players seen that day.
    pub player_count: u64,
}

impl DailyMetric {
    /// Return-to-player ratio: wins over bets, 0 when nothing was bet.
    pub fn rtp(&self) -> f64 {
        rtp(self.total_wins, self.total_bets)
    }
}

/// One hourly real-time counter window. In-memory and short-lived; never a
/// source of truth.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeWindow {
    pub hour_start_ms: u64,
    pub total_bets: u64,
    pub total_wins: u64,
    pub net_revenue: i64,
    pub spin_count: u64,
}

/// Live view returned by the realtime metrics endpoint: the retained hourly
/// windows for a game, newest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RealtimeStats {
    pub game_id: String,
    pub generated_at_ms: u64,
    pub windows: Vec<RealtimeWindow>,
}

pub fn rtp(total_wins: u64, total_bets: u64) -> f64 {
    if total_bets == 0 {
        0.0
    } else {
        total_wins as f64 / total_bets as f64
    }
}
