// =============================================================================
// Candle — OHLCV aggregate over one frame
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Tick, TradeSide};

/// A single OHLCV candle aggregated from raw trade ticks.
///
/// Mutable while open; once `seal()` is called the aggregator treats it as
/// immutable history. Invariants maintained by `open_at` and `apply`:
/// `low <= open <= high`, `low <= close <= high`, and `volume` equals
/// `buy_volume + sell_volume` whenever every contributing tick carried a
/// known side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub frame_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// Number of ticks folded into this candle (zero for synthetic frames).
    pub trades_count: u64,
    pub sealed: bool,
}

impl Candle {
    /// Open a new candle at `frame_start` from the first tick of the frame.
    pub fn open_at(frame_start: DateTime<Utc>, tick: &Tick) -> Self {
        let mut candle = Self {
            frame_start,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            trades_count: 0,
            sealed: false,
        };
        candle.credit_volume(tick.volume, tick.side);
        candle.trades_count = 1;
        candle
    }

    /// Open a synthetic flat candle for an idle frame: all OHLC fields equal
    /// the previous close, zero volume, no trades.
    pub fn open_flat(frame_start: DateTime<Utc>, last_close: f64) -> Self {
        Self {
            frame_start,
            open: last_close,
            high: last_close,
            low: last_close,
            close: last_close,
            volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            trades_count: 0,
            sealed: false,
        }
    }

    /// Fold one more in-frame tick into the candle.
    pub fn apply(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.credit_volume(tick.volume, tick.side);
        self.trades_count += 1;
    }

    /// Freeze the candle. Sealed candles are never mutated again.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    fn credit_volume(&mut self, volume: f64, side: TradeSide) {
        self.volume += volume;
        match side {
            TradeSide::Buy => self.buy_volume += volume,
            TradeSide::Sell => self.sell_volume += volume,
            TradeSide::Unknown => {}
        }
    }
}
