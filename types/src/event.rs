//! Append-only record of one play.

use serde::{Deserialize, Serialize};

/// One accepted action: the unit that enforces the move limit (by count per
/// session and round) and the atomic input to every metrics rollup. Written
/// once, never mutated. `player_ref` and `country` are denormalized from the
/// session so rollups keep working after expired session rows are reclaimed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpinEvent {
    pub event_id: String,
    pub session_id: String,
    pub game_id: String,
    pub player_ref: String,
    #[serde(default)]
    pub country: Option<String>,
    pub round: u32,
    /// Stake in minor units.
    pub bid: u64,
    pub reward_kind: String,
    /// Amount returned to the player in minor units.
    pub payout: u64,
    pub win: bool,
    pub created_at_ms: u64,
}
