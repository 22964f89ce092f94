pub mod aggregator;
pub mod candle;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use aggregator::{AggregatorSnapshot, CandleAggregator, IngestError, DEFAULT_MAX_HISTORY};
pub use candle::Candle;
