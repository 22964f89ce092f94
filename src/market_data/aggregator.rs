// =============================================================================
// Candle Aggregator — tick-to-candle bucketing with bounded history
// =============================================================================
//
// The single writer of candle state. The ingestion task calls `ingest` for
// every decoded tick; readers (REST handlers, the liveness monitor) call
// `snapshot` / `last_price` at any time. All state lives behind one
// parking_lot::RwLock with short critical sections, so a snapshot can never
// observe a candle mid-mutation.
//
// Rollover: a tick at or past `next_frame_start` seals the current candle,
// appends it to history (evicting the oldest entry past capacity), hands it
// to the history sink exactly once, and opens a fresh candle in the tick's
// own frame. Frames that were silent between the two ticks are skipped, not
// synthesized — synthetic flat frames are the liveness monitor's job, via
// `advance_idle`.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::frame_clock::FrameSpec;
use crate::market_data::Candle;
use crate::sink::HistorySink;
use crate::types::Tick;

/// Bounded wait for the write lock in `ingest`. Exceeding it is a soft
/// failure: the tick is skipped and reported, never a crash.
const INGEST_LOCK_WAIT: Duration = Duration::from_millis(250);

/// Default history capacity: one full day of minute candles.
pub const DEFAULT_MAX_HISTORY: usize = 1440;

/// A tick the aggregator refuses to fold in. Rejections are reported to the
/// caller, never silently dropped, and leave aggregator state untouched.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid price {price}: must be finite and positive")]
    InvalidPrice { price: f64 },

    #[error("invalid volume {volume}: must be finite and positive")]
    InvalidVolume { volume: f64 },

    #[error("tick time {time} precedes current frame start {frame_start}")]
    StaleTick {
        time: DateTime<Utc>,
        frame_start: DateTime<Utc>,
    },

    #[error("aggregator write lock not acquired within {0:?} — tick skipped")]
    LockTimeout(Duration),
}

/// Read-only copy of the aggregator state: the in-progress candle (if any)
/// plus the sealed history in chronological order.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorSnapshot {
    pub current: Option<Candle>,
    pub history: Vec<Candle>,
}

struct Inner {
    current: Option<Candle>,
    next_frame_start: Option<DateTime<Utc>>,
    history: VecDeque<Candle>,
}

/// Owns the current candle and the bounded candle history for one symbol.
pub struct CandleAggregator {
    spec: FrameSpec,
    max_history: usize,
    sink: Option<Arc<dyn HistorySink>>,
    inner: RwLock<Inner>,
}

impl CandleAggregator {
    /// Construct an aggregator for `spec`, retaining at most `max_history`
    /// sealed candles. Fails fast on a frame spec that cannot resolve
    /// boundaries.
    pub fn new(
        spec: FrameSpec,
        max_history: usize,
        sink: Option<Arc<dyn HistorySink>>,
    ) -> anyhow::Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            max_history,
            sink,
            inner: RwLock::new(Inner {
                current: None,
                next_frame_start: None,
                history: VecDeque::with_capacity(max_history + 1),
            }),
        })
    }

    /// Fold one tick into the current candle, rolling the frame when the
    /// tick belongs to a later one.
    pub fn ingest(&self, tick: &Tick) -> Result<(), IngestError> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return Err(IngestError::InvalidPrice { price: tick.price });
        }
        if !tick.volume.is_finite() || tick.volume <= 0.0 {
            return Err(IngestError::InvalidVolume {
                volume: tick.volume,
            });
        }

        let mut inner = self
            .inner
            .try_write_for(INGEST_LOCK_WAIT)
            .ok_or(IngestError::LockTimeout(INGEST_LOCK_WAIT))?;

        // DateTime is Copy; matching on copied bounds keeps the borrow of
        // `inner` free for mutation inside the arms.
        let current_frame_start = inner.current.as_ref().map(|c| c.frame_start);

        let sealed = match (current_frame_start, inner.next_frame_start) {
            // First tick ever: open the initial candle.
            (None, _) => {
                let (frame_start, next) = self.spec.frame_bounds(tick.time);
                info!(frame_start = %frame_start, price = tick.price, "opening first candle");
                inner.current = Some(Candle::open_at(frame_start, tick));
                inner.next_frame_start = Some(next);
                None
            }
            (Some(frame_start), _) if tick.time < frame_start => {
                return Err(IngestError::StaleTick {
                    time: tick.time,
                    frame_start,
                });
            }
            // In-frame update.
            (Some(_), Some(next)) if tick.time < next => {
                if let Some(current) = inner.current.as_mut() {
                    current.apply(tick);
                }
                None
            }
            // Rollover: seal and open in the tick's own frame. Silent frames
            // in between are skipped here by design.
            _ => {
                let sealed = self.roll(&mut inner);
                let (frame_start, next) = self.spec.frame_bounds(tick.time);
                debug!(frame_start = %frame_start, "opening candle after rollover");
                inner.current = Some(Candle::open_at(frame_start, tick));
                inner.next_frame_start = Some(next);
                sealed
            }
        };

        drop(inner);

        // Sink hand-off happens outside the critical section.
        if let Some(candle) = sealed {
            self.emit(&candle);
        }

        Ok(())
    }

    /// Liveness-monitor entry point: roll forward through every frame whose
    /// boundary `now` has passed, sealing flat zero-volume candles priced at
    /// the previous close. Returns the number of frames advanced.
    ///
    /// This is the only path that synthesizes candles. It takes the same
    /// write lock as `ingest`, so a late real tick and the idle filler can
    /// never both fill the same frame.
    pub fn advance_idle(&self, now: DateTime<Utc>) -> usize {
        let mut sealed_batch = Vec::new();

        {
            let mut inner = self.inner.write();

            while let Some(next) = inner.next_frame_start {
                if inner.current.is_none() || now < next {
                    break;
                }
                if let Some(candle) = self.roll(&mut inner) {
                    let last_close = candle.close;
                    sealed_batch.push(candle);
                    // Each synthetic frame starts exactly where the previous
                    // one ended, keeping the series contiguous.
                    let (frame_start, new_next) = self.spec.frame_bounds(next);
                    inner.current = Some(Candle::open_flat(frame_start, last_close));
                    inner.next_frame_start = Some(new_next);
                }
            }
        }

        for candle in &sealed_batch {
            self.emit(candle);
        }

        sealed_batch.len()
    }

    /// Read-only copy of `(current, history)`. Idempotent between ingests;
    /// never exposes the live buffer for external mutation.
    pub fn snapshot(&self) -> AggregatorSnapshot {
        let inner = self.inner.read();
        AggregatorSnapshot {
            current: inner.current.clone(),
            history: inner.history.iter().cloned().collect(),
        }
    }

    /// Best-effort last traded price, from the in-progress candle's close.
    pub fn last_price(&self) -> Option<f64> {
        self.inner.read().current.as_ref().map(|c| c.close)
    }

    /// Number of sealed candles currently retained.
    pub fn history_len(&self) -> usize {
        self.inner.read().history.len()
    }

    /// Seal the current candle into history, trimming past capacity.
    /// Returns the sealed candle for sink hand-off.
    fn roll(&self, inner: &mut Inner) -> Option<Candle> {
        let mut candle = inner.current.take()?;
        candle.seal();
        inner.history.push_back(candle.clone());
        while inner.history.len() > self.max_history {
            inner.history.pop_front();
        }
        Some(candle)
    }

    fn emit(&self, candle: &Candle) {
        debug!(
            frame_start = %candle.frame_start,
            close = candle.close,
            volume = candle.volume,
            "candle sealed"
        );
        if let Some(sink) = &self.sink {
            sink.candle_sealed(candle);
        }
    }
}
