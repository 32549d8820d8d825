//! Request and response payloads for the HTTP surface.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::game::GameConfig;
use crate::metrics::{rtp, DailyMetric};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub game_id: String,
    pub player_ref: String,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub expires_at_ms: u64,
    pub balance: u64,
    pub round: u32,
}

/// Session state handed to the client: the live fields plus the config
/// snapshot, region-filtered when the session is bound to a country.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub game_id: String,
    pub balance: u64,
    pub round: u32,
    pub expires_at_ms: u64,
    pub game_config: GameConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectRequest {
    pub session_id: String,
    /// Grid cell the player clicked. Echoed back for placement; it does not
    /// influence the outcome.
    pub choice_id: u32,
    /// Stake in minor units; must be one of the game's allowed bids.
    pub bid: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectResponse {
    pub session_id: String,
    pub choice_id: u32,
    pub reward_kind: String,
    pub payout: u64,
    pub win: bool,
    pub balance: u64,
    pub round: u32,
    pub moves_used: u32,
    pub moves_per_round: u32,
}

/// Aggregated dashboard response for a date range: the per-day rollup rows
/// plus totals computed from them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameMetrics {
    pub game_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub country: Option<String>,
    pub total_bets: u64,
    pub total_wins: u64,
    pub net_revenue: i64,
    pub spin_count: u64,
    pub rtp: f64,
    pub days: Vec<DailyMetric>,
}

impl GameMetrics {
    /// Fold rollup rows into range totals. `rtp` is recomputed from the
    /// summed bets/wins rather than averaged per day.
    pub fn from_days(
        game_id: String,
        start_date: NaiveDate,
        end_date: NaiveDate,
        country: Option<String>,
        days: Vec<DailyMetric>,
    ) -> Self {
        let total_bets = days.iter().map(|day| day.total_bets).sum();
        let total_wins = days.iter().map(|day| day.total_wins).sum();
        let spin_count = days.iter().map(|day| day.spin_count).sum();
        Self {
            game_id,
            start_date,
            end_date,
            country,
            total_bets,
            total_wins,
            net_revenue: total_bets as i64 - total_wins as i64,
            spin_count,
            rtp: rtp(total_wins, total_bets),
            days,
        }
    }
}
