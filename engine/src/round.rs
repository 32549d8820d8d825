//! Bid validation and the per-round move limit.
//!
//! `can_act` is the advisory form of the policy; the authoritative move
//! count is enforced inside the store's record-spin transaction so two
//! concurrent spins cannot both slip under the limit. Both paths share the
//! checks below.

use paydirt_types::{EngineError, GameConfig};

/// Reject bids that are not in the game's configured list. Applies to every
/// round, including the first.
pub fn validate_bid(config: &GameConfig, bid: u64) -> Result<(), EngineError> {
    if config.allows_bid(bid) {
        Ok(())
    } else {
        Err(EngineError::InvalidBid { bid })
    }
}

/// Reject once a round has used up its moves: the `moves_used + 1`-th action
/// is allowed only while `moves_used < moves_per_round`.
pub fn check_move_limit(moves_used: u32, moves_per_round: u32) -> Result<(), EngineError> {
    if moves_used >= moves_per_round {
        Err(EngineError::RoundOver {
            limit: moves_per_round,
        })
    } else {
        Ok(())
    }
}

/// Combined policy check for one prospective action. Bid validation runs
/// first, so an invalid bid reports INVALID_BID even in an exhausted round.
pub fn can_act(config: &GameConfig, moves_used: u32, bid: u64) -> Result<(), EngineError> {
    validate_bid(config, bid)?;
    check_move_limit(moves_used, config.moves_per_round)
}

#[cfg(test)]
mod tests {
    use super::*;
    use paydirt_types::{RewardEntry, RewardTable};

    fn config() -> GameConfig {
        GameConfig {
            game_id: "g1".into(),
            name: "Test Mine".into(),
            rows: 3,
            columns: 3,
            reward_table: RewardTable::new(vec![RewardEntry {
                kind: "DUST".into(),
                weight: 1,
                multiplier: 0.0,
            }]),
            allowed_bids: vec![1, 5],
            moves_per_round: 2,
            blocked_regions: vec![],
            available_regions: vec![],
            languages: vec![],
            published: true,
        }
    }

    #[test]
    fn test_bid_must_be_configured() {
        let config = config();
        assert!(validate_bid(&config, 1).is_ok());
        assert!(validate_bid(&config, 5).is_ok());
        assert_eq!(
            validate_bid(&config, 2),
            Err(EngineError::InvalidBid { bid: 2 })
        );
    }

    #[test]
    fn test_move_limit_boundary() {
        assert!(check_move_limit(0, 2).is_ok());
        assert!(check_move_limit(1, 2).is_ok());
        assert_eq!(
            check_move_limit(2, 2),
            Err(EngineError::RoundOver { limit: 2 })
        );
        assert_eq!(
            check_move_limit(3, 2),
            Err(EngineError::RoundOver { limit: 2 })
        );
    }

    #[test]
    fn test_invalid_bid_rejected_on_first_move() {
        let config = config();
        assert_eq!(
            can_act(&config, 0, 3),
            Err(EngineError::InvalidBid { bid: 3 })
        );
    }

    #[test]
    fn test_invalid_bid_takes_precedence_over_round_over() {
        let config = config();
        assert_eq!(
            can_act(&config, 2, 3),
            Err(EngineError::InvalidBid { bid: 3 })
        );
        assert_eq!(
            can_act(&config, 2, 1),
            Err(EngineError::RoundOver { limit: 2 })
        );
    }
}
