//! Error taxonomy shared across the engine and the HTTP surface.

use thiserror::Error;

/// Every failure a session/reward operation can surface. Policy rejections
/// (region blocked, round over, invalid bid) are expected outcomes carried
/// as values, not logged as errors; `Store` is the only infrastructure
/// variant and is the only one that maps to a 5xx.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("session not found")]
    SessionNotFound,

    #[error("game not found or not published")]
    GameNotFound,

    #[error("session expired")]
    Expired,

    #[error("country {country} is not available for this game")]
    RegionBlocked { country: String },

    #[error("round move limit reached ({limit} moves per round)")]
    RoundOver { limit: u32 },

    #[error("bid {bid} is not one of the allowed amounts")]
    InvalidBid { bid: u64 },

    #[error("invalid game config: {message}")]
    InvalidConfig { message: String },

    #[error("storage unavailable: {message}")]
    Store { message: String },
}

impl EngineError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }

    /// Stable machine-readable code included in every error response.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound | Self::GameNotFound => "NOT_FOUND",
            Self::Expired => "EXPIRED",
            Self::RegionBlocked { .. } => "REGION_BLOCKED",
            Self::RoundOver { .. } => "ROUND_OVER",
            Self::InvalidBid { .. } => "INVALID_BID",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Store { .. } => "STORE_UNAVAILABLE",
        }
    }

    /// Whether the failure is a client-recoverable outcome rather than an
    /// infrastructure problem.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Store { .. })
    }
}
