// =============================================================================
// Shared types used across the tickfold engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade. Feeds that do not tag the aggressor deliver
/// `Unknown`, which is counted in total volume but in neither side bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
    Unknown,
}

impl Default for TradeSide {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single normalised trade event from the stream.
///
/// Produced by the connection manager when decoding one wire message and
/// consumed exactly once by the candle aggregator. `time` is stamped at
/// decode, so it is monotonic per stream as long as the transport delivers
/// messages in order (true of the feeds in scope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub side: TradeSide,
}
