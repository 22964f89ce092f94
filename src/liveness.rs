// =============================================================================
// Liveness Monitor — idle-frame synthesis on a fixed tick
// =============================================================================
//
// Runs as a background Tokio task, waking once per second. When the feed is
// Open but silent for longer than the configured threshold, the monitor
// advances the aggregator's frame with flat zero-volume candles at the last
// close price, so a quiet market still produces a contiguous candle series.
//
// This is the only place synthetic candles originate; the ingestion path
// never fills gaps. `advance_idle` takes the aggregator's write lock, so the
// monitor and a late real tick can never both fill the same frame.
//
// Spawn once at engine startup:
//
//   tokio::spawn(run_liveness_monitor(aggregator, connection, cfg));
//
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, info};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::market_data::CandleAggregator;

/// Fixed cadence of the monitor.
const MONITOR_INTERVAL_SECS: u64 = 1;

/// Settings consumed by the monitor, lifted from the runtime config.
#[derive(Debug, Clone, Copy)]
pub struct LivenessSettings {
    /// Master switch for idle-frame synthesis.
    pub synthesize_idle_frames: bool,
    /// Last-message age beyond which the feed counts as idle.
    pub idle_threshold: Duration,
}

/// Run the liveness monitor loop. Runs forever; spawn as a background task.
pub async fn run_liveness_monitor(
    aggregator: Arc<CandleAggregator>,
    connection: Arc<ConnectionManager>,
    settings: LivenessSettings,
) {
    if !settings.synthesize_idle_frames {
        info!("idle-frame synthesis disabled — liveness monitor not running");
        return;
    }

    info!(
        interval_secs = MONITOR_INTERVAL_SECS,
        idle_threshold_secs = settings.idle_threshold.as_secs(),
        "liveness monitor started"
    );

    let mut ticker = interval(Duration::from_secs(MONITOR_INTERVAL_SECS));

    loop {
        ticker.tick().await;

        if connection.state() != ConnectionState::Open {
            continue;
        }

        let idle = matches!(
            connection.last_message_age(),
            Some(age) if age > settings.idle_threshold
        );
        if !idle {
            continue;
        }

        let advanced = aggregator.advance_idle(Utc::now());
        if advanced > 0 {
            debug!(frames = advanced, "synthesized flat candles for idle feed");
        }
    }
}
