//! Weighted reward selection.
//!
//! Selection walks the table's entries in their configured order,
//! accumulating weights until the draw falls inside an entry's band:
//! a draw `r` in `[0, total)` selects the first entry where
//! `r < sum(weights up to and including it)`. Zero-weight entries have an
//! empty band and can never be selected.
//!
//! A table whose total weight is zero is misconfigured but must not fail the
//! player: selection falls back to the table's lowest-multiplier entry and
//! flags it, so the caller can log while the player simply receives the
//! lowest-tier reward.

use paydirt_types::{RewardEntry, RewardTable};
use rand::Rng;

/// Outcome of one selection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Selection<'a> {
    pub entry: &'a RewardEntry,
    /// True when the table's total weight was zero and the documented
    /// fallback entry was paid instead of a weighted draw.
    pub fallback: bool,
}

/// Select the entry owning `draw`. Callers must supply `draw` in
/// `[0, total_weight)`; out-of-range draws select nothing.
pub fn select_at(table: &RewardTable, draw: u64) -> Option<&RewardEntry> {
    let mut accumulated = 0u64;
    for entry in &table.entries {
        accumulated += entry.weight as u64;
        if draw < accumulated {
            return Some(entry);
        }
    }
    None
}

/// Draw uniformly over the table's total weight and select the matching
/// entry. Returns `None` only for an empty table; a zero-weight table yields
/// the fallback entry with `fallback = true`.
pub fn select_reward<'a, R: Rng + ?Sized>(
    table: &'a RewardTable,
    rng: &mut R,
) -> Option<Selection<'a>> {
    let total = table.total_weight();
    if total == 0 {
        return table
            .fallback_entry()
            .map(|entry| Selection {
                entry,
                fallback: true,
            });
    }
    let draw = rng.gen_range(0..total);
    select_at(table, draw).map(|entry| Selection {
        entry,
        fallback: false,
    })
}

/// Amount returned to the player for a stake: `stake * multiplier`, rounded
/// to the nearest minor unit. A multiplier of 0 pays nothing and 1 returns
/// the stake exactly.
pub fn payout(multiplier: f64, stake: u64) -> u64 {
    (stake as f64 * multiplier).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use paydirt_types::RewardEntry;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn entry(kind: &str, weight: u32, multiplier: f64) -> RewardEntry {
        RewardEntry {
            kind: kind.into(),
            weight,
            multiplier,
        }
    }

    fn mining_table() -> RewardTable {
        RewardTable::new(vec![
            entry("DUST", 70, 0.0),
            entry("ROCK", 30, 1.0),
            entry("OIL", 0, 3.0),
            entry("GOLD", 5, 10.0),
        ])
    }

    #[test]
    fn test_select_at_band_boundaries() {
        let table = mining_table();
        // Bands: DUST [0,70), ROCK [70,100), OIL empty, GOLD [100,105).
        assert_eq!(select_at(&table, 0).unwrap().kind, "DUST");
        assert_eq!(select_at(&table, 69).unwrap().kind, "DUST");
        assert_eq!(select_at(&table, 70).unwrap().kind, "ROCK");
        assert_eq!(select_at(&table, 99).unwrap().kind, "ROCK");
        assert_eq!(select_at(&table, 100).unwrap().kind, "GOLD");
        assert_eq!(select_at(&table, 104).unwrap().kind, "GOLD");
        assert!(select_at(&table, 105).is_none());
    }

    #[test]
    fn test_zero_weight_entry_never_selected() {
        let table = mining_table();
        for draw in 0..table.total_weight() {
            assert_ne!(select_at(&table, draw).unwrap().kind, "OIL");
        }
    }

    #[test]
    fn test_zero_total_falls_back_to_lowest_multiplier() {
        let table = RewardTable::new(vec![
            entry("GOLD", 0, 10.0),
            entry("DUST", 0, 0.0),
            entry("ROCK", 0, 1.0),
        ]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            let selection = select_reward(&table, &mut rng).unwrap();
            assert_eq!(selection.entry.kind, "DUST");
            assert!(selection.fallback);
        }
    }

    #[test]
    fn test_empty_table_selects_nothing() {
        let table = RewardTable::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(select_reward(&table, &mut rng).is_none());
    }

    #[test]
    fn test_seeded_rng_reproduces_outcomes() {
        let table = mining_table();
        let draws = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..64)
                .map(|_| select_reward(&table, &mut rng).unwrap().entry.kind.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(draws(42), draws(42));
        assert_ne!(draws(42), draws(43));
    }

    #[test]
    fn test_selection_tracks_weights_roughly() {
        let table = mining_table();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut dust = 0u32;
        for _ in 0..10_000 {
            let selection = select_reward(&table, &mut rng).unwrap();
            assert!(!selection.fallback);
            if selection.entry.kind == "DUST" {
                dust += 1;
            }
        }
        // DUST carries 70/105 of the weight; allow a generous band.
        assert!((6_200..7_200).contains(&dust), "dust draws: {dust}");
    }

    #[test]
    fn test_payout_is_stake_times_multiplier() {
        assert_eq!(payout(0.0, 500), 0);
        assert_eq!(payout(1.0, 500), 500);
        assert_eq!(payout(2.5, 10), 25);
        assert_eq!(payout(10.0, 7), 70);
        assert_eq!(payout(0.5, 3), 2); // rounds to nearest
    }
}
