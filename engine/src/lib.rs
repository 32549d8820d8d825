//! Paydirt reward and round logic.
//!
//! This crate contains the pure decision logic behind a spin: weighted reward
//! selection, payout arithmetic, and the bid/move-limit policy. The server
//! wires it to storage and HTTP.
//!
//! ## Determinism requirements
//! - No wall-clock time and no I/O in this crate.
//! - Randomness only enters through the caller-supplied [`rand::Rng`], so a
//!   seeded generator reproduces outcomes exactly.
//! - Reward tables are walked in entry order; no hash-based iteration may
//!   influence which entry wins a draw.

pub mod reward;
pub mod round;

pub use reward::{payout, select_at, select_reward, Selection};
pub use round::{can_act, check_move_limit, validate_bid};
