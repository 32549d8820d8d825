//! Game configuration as snapshotted at session creation.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One market a game is available in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// ISO-3166 alpha-2 country code, uppercase.
    pub code: String,
    /// Display currency for the region, if it differs from the default.
    #[serde(default)]
    pub currency: Option<String>,
}

/// A single weighted outcome in a game's reward table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardEntry {
    /// Author-chosen label (DUST, ROCK, GOLD, or an arbitrary slot-item id).
    pub kind: String,
    /// Relative selection weight. Weights do not need to sum to anything.
    pub weight: u32,
    /// Payout multiplier applied to the stake: 0 pays nothing, 1 returns it.
    pub multiplier: f64,
}

/// Weighted outcome table. Entry order is the selection order and is part of
/// the configuration: selection walks the entries exactly as listed.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct RewardTable {
    pub entries: Vec<RewardEntry>,
}

impl RewardTable {
    pub fn new(entries: Vec<RewardEntry>) -> Self {
        Self { entries }
    }

    /// Sum of all weights, widened so large tables cannot overflow.
    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|entry| entry.weight as u64).sum()
    }

    /// The entry paid out when the table is unusable (total weight zero):
    /// the lowest multiplier in the table, first listed on a tie.
    pub fn fallback_entry(&self) -> Option<&RewardEntry> {
        self.entries.iter().min_by(|a, b| {
            a.multiplier
                .partial_cmp(&b.multiplier)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    pub fn entry(&self, kind: &str) -> Option<&RewardEntry> {
        self.entries.iter().find(|entry| entry.kind == kind)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.entries.is_empty() {
            return Err(EngineError::invalid_config("reward table has no entries"));
        }
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.kind.trim().is_empty() {
                return Err(EngineError::invalid_config(format!(
                    "reward entry {index} has an empty kind"
                )));
            }
            if !entry.multiplier.is_finite() || entry.multiplier < 0.0 {
                return Err(EngineError::invalid_config(format!(
                    "reward entry {} has invalid multiplier {}",
                    entry.kind, entry.multiplier
                )));
            }
            if self.entries[..index]
                .iter()
                .any(|other| other.kind == entry.kind)
            {
                return Err(EngineError::invalid_config(format!(
                    "duplicate reward kind {}",
                    entry.kind
                )));
            }
        }
        Ok(())
    }
}

/// Immutable game configuration. Sessions bind a copy of this at creation;
/// later edits to the live game never reach an in-flight session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    pub game_id: String,
    pub name: String,
    pub rows: u32,
    pub columns: u32,
    pub reward_table: RewardTable,
    /// Stake amounts a player may bid, in minor units.
    pub allowed_bids: Vec<u64>,
    /// Accepted actions per round before ROUND_OVER.
    pub moves_per_round: u32,
    /// Country codes rejected at session creation.
    #[serde(default)]
    pub blocked_regions: Vec<String>,
    #[serde(default)]
    pub available_regions: Vec<Region>,
    #[serde(default)]
    pub languages: Vec<String>,
    /// Only published games accept sessions.
    pub published: bool,
}

impl GameConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.game_id.trim().is_empty() {
            return Err(EngineError::invalid_config("game_id is empty"));
        }
        if self.rows == 0 || self.columns == 0 {
            return Err(EngineError::invalid_config("grid must be at least 1x1"));
        }
        self.reward_table.validate()?;
        if self.allowed_bids.is_empty() {
            return Err(EngineError::invalid_config("allowed_bids is empty"));
        }
        if self.allowed_bids.contains(&0) {
            return Err(EngineError::invalid_config("bid amounts must be positive"));
        }
        if self.moves_per_round == 0 {
            return Err(EngineError::invalid_config("moves_per_round must be >= 1"));
        }
        Ok(())
    }

    pub fn allows_bid(&self, bid: u64) -> bool {
        self.allowed_bids.contains(&bid)
    }

    pub fn is_region_blocked(&self, country: Option<&str>) -> bool {
        match country {
            Some(country) => self
                .blocked_regions
                .iter()
                .any(|blocked| blocked.eq_ignore_ascii_case(country)),
            None => false,
        }
    }

    /// Copy of the config shaped for a client response: when the session is
    /// bound to a country, `available_regions` is narrowed to that entry.
    /// Response shaping only; the server keeps working with the full config.
    pub fn region_view(&self, country: Option<&str>) -> GameConfig {
        let mut view = self.clone();
        if let Some(country) = country {
            view.available_regions
                .retain(|region| region.code.eq_ignore_ascii_case(country));
        }
        view
    }
}
