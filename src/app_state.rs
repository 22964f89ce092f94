// =============================================================================
// Central Application State — tickfold engine
// =============================================================================
//
// Ties the aggregator, the connection manager and the runtime config together
// and builds the serialisable snapshot served by the query API. All candle
// state is owned by the aggregator; readers only ever receive copies.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::market_data::{Candle, CandleAggregator};
use crate::runtime_config::RuntimeConfig;

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub aggregator: Arc<CandleAggregator>,
    pub connection: Arc<ConnectionManager>,
    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        aggregator: Arc<CandleAggregator>,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            aggregator,
            connection,
            start_time: Instant::now(),
        }
    }

    /// Build a complete, serialisable snapshot of the engine state: the
    /// in-progress candle, the sealed history and the connection status.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let agg = self.aggregator.snapshot();

        StateSnapshot {
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            symbol: self.config.symbol.clone(),
            frame: self.config.frame_spec().to_string(),
            connection: self.connection_snapshot(),
            current: agg.current,
            history: agg.history,
        }
    }

    /// Connection status only, for the lighter `/connection` endpoint.
    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.connection.state(),
            last_message_age_ms: self
                .connection
                .last_message_age()
                .map(|d| d.as_millis() as u64),
            total_reconnects: self.connection.total_reconnects(),
            consecutive_failures: self.connection.consecutive_failures(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Full engine state snapshot served by `GET /api/v1/snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub server_time: i64,
    pub uptime_secs: u64,
    pub symbol: String,
    pub frame: String,
    pub connection: ConnectionSnapshot,
    pub current: Option<Candle>,
    pub history: Vec<Candle>,
}

/// Connection status summary.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_age_ms: Option<u64>,
    pub total_reconnects: u64,
    pub consecutive_failures: u32,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BackoffPolicy;
    use crate::frame_clock::FrameSpec;
    use crate::market_data::DEFAULT_MAX_HISTORY;
    use crate::types::{Tick, TradeSide};
    use chrono::TimeZone;
    use std::time::Duration;

    fn test_state() -> AppState {
        let config = RuntimeConfig::default();
        let aggregator = Arc::new(
            CandleAggregator::new(FrameSpec::Minutes(5), DEFAULT_MAX_HISTORY, None).unwrap(),
        );
        let connection = Arc::new(ConnectionManager::new(
            config.endpoint.clone(),
            config.symbol.clone(),
            BackoffPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                max_failures: 3,
            },
            aggregator.clone(),
        ));
        AppState::new(config, aggregator, connection)
    }

    #[test]
    fn snapshot_reflects_aggregator_state() {
        let state = test_state();
        state
            .aggregator
            .ingest(&Tick {
                time: Utc.with_ymd_and_hms(2024, 3, 7, 10, 2, 0).unwrap(),
                symbol: "BTC-USD".into(),
                price: 100.0,
                volume: 1.0,
                side: TradeSide::Buy,
            })
            .unwrap();

        let snap = state.build_snapshot();
        assert_eq!(snap.symbol, "BTC-USD");
        assert_eq!(snap.frame, "1m");
        assert!(snap.history.is_empty());
        assert!((snap.current.unwrap().close - 100.0).abs() < f64::EPSILON);
        assert_eq!(snap.connection.state, ConnectionState::Closed);
        assert_eq!(snap.connection.total_reconnects, 0);
    }

    #[test]
    fn snapshot_serialises_to_json() {
        let snap = test_state().build_snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"connection\""));
        assert!(json.contains("\"history\""));
        // No message received yet, so the age field is omitted entirely.
        assert!(!json.contains("last_message_age_ms"));
    }
}
