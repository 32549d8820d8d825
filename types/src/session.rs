//! Player sessions and the denormalized snapshot cached alongside them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::game::GameConfig;

/// One player's binding to a game. Created once per (game, player_ref) while
/// a live session exists; ends by expiry or explicit invalidation. Only the
/// balance and the round number mutate after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub game_id: String,
    /// Player or affiliate identity the session was opened for.
    pub player_ref: String,
    /// Country bound at creation, used for region policy and metrics.
    #[serde(default)]
    pub country: Option<String>,
    /// Balance in minor units.
    pub balance: u64,
    /// Current round, starting at 1.
    pub round: u32,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Session {
    /// Expiry is inclusive: a session whose deadline equals the current time
    /// is already expired.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }

    /// Remaining lifetime, zero once expired. Used as the cache TTL so a
    /// cached snapshot can never outlive the session it denormalizes.
    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }
}

/// Session plus the immutable config copy bound at creation. This is the
/// unit the cache stores and the unit request handlers work from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub config: GameConfig,
}
