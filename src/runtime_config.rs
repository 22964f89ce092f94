// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration for the tickfold engine: which feed to consume, how
// to frame candles, history bounds, liveness thresholds and reconnect
// policy.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::connection::BackoffPolicy;
use crate::frame_clock::FrameSpec;
use crate::liveness::LivenessSettings;
use crate::market_data::DEFAULT_MAX_HISTORY;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTC-USD".to_string()
}

fn default_endpoint() -> String {
    "wss://feed.example.com/stream".to_string()
}

fn default_frame_minutes() -> u32 {
    1
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

fn default_true() -> bool {
    true
}

fn default_idle_threshold_secs() -> u64 {
    30
}

fn default_reconnect_initial_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_max_failures() -> u32 {
    20
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the tickfold engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed ----------------------------------------------------------------

    /// Symbol whose trade channel is subscribed (e.g. "BTC-USD").
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// WebSocket endpoint of the trade feed.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    // --- Framing -------------------------------------------------------------

    /// Frame duration in minutes. Ignored when `calendar_month` is set.
    #[serde(default = "default_frame_minutes")]
    pub frame_minutes: u32,

    /// Use calendar-month frames instead of a fixed duration.
    #[serde(default)]
    pub calendar_month: bool,

    /// Maximum number of sealed candles retained in memory.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    // --- Liveness ------------------------------------------------------------

    /// Synthesize flat candles when the feed is idle.
    #[serde(default = "default_true")]
    pub synthesize_idle_frames: bool,

    /// Last-message age in seconds beyond which the feed counts as idle.
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,

    // --- Reconnect policy ----------------------------------------------------

    /// Initial reconnect backoff delay in milliseconds.
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    /// Maximum reconnect backoff delay in milliseconds.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Consecutive connection failures tolerated before giving up.
    #[serde(default = "default_reconnect_max_failures")]
    pub reconnect_max_failures: u32,

    // --- Collaborators -------------------------------------------------------

    /// Path of the CSV history log. `None` disables the sink.
    #[serde(default)]
    pub history_csv_path: Option<String>,

    /// Bind address of the query API server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            endpoint: default_endpoint(),
            frame_minutes: default_frame_minutes(),
            calendar_month: false,
            max_history: default_max_history(),
            synthesize_idle_frames: true,
            idle_threshold_secs: default_idle_threshold_secs(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_failures: default_reconnect_max_failures(),
            history_csv_path: None,
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            frame = %config.frame_spec(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    // ── Derived views ───────────────────────────────────────────────────

    /// Frame spec derived from `calendar_month` / `frame_minutes`.
    pub fn frame_spec(&self) -> FrameSpec {
        if self.calendar_month {
            FrameSpec::CalendarMonth
        } else {
            FrameSpec::Minutes(self.frame_minutes)
        }
    }

    /// Reconnect backoff policy for the connection manager.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_failures: self.reconnect_max_failures,
        }
    }

    /// Settings consumed by the liveness monitor.
    pub fn liveness_settings(&self) -> LivenessSettings {
        LivenessSettings {
            synthesize_idle_frames: self.synthesize_idle_frames,
            idle_threshold: Duration::from_secs(self.idle_threshold_secs),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbol, "BTC-USD");
        assert_eq!(cfg.frame_minutes, 1);
        assert!(!cfg.calendar_month);
        assert_eq!(cfg.max_history, 1440);
        assert!(cfg.synthesize_idle_frames);
        assert_eq!(cfg.idle_threshold_secs, 30);
        assert_eq!(cfg.reconnect_max_failures, 20);
        assert!(cfg.history_csv_path.is_none());
        assert_eq!(cfg.frame_spec(), FrameSpec::Minutes(1));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "BTC-USD");
        assert_eq!(cfg.max_history, 1440);
        assert!(cfg.synthesize_idle_frames);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETH-USD", "frame_minutes": 5, "calendar_month": false }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETH-USD");
        assert_eq!(cfg.frame_spec(), FrameSpec::Minutes(5));
        assert_eq!(cfg.reconnect_initial_delay_ms, 1000);
    }

    #[test]
    fn calendar_month_flag_overrides_minutes() {
        let json = r#"{ "frame_minutes": 5, "calendar_month": true }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.frame_spec(), FrameSpec::CalendarMonth);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.frame_minutes, cfg2.frame_minutes);
        assert_eq!(cfg.max_history, cfg2.max_history);
        assert_eq!(cfg.reconnect_max_failures, cfg2.reconnect_max_failures);
    }

    #[test]
    fn backoff_policy_converts_millis() {
        let cfg = RuntimeConfig::default();
        let policy = cfg.backoff_policy();
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(60_000));
        assert_eq!(policy.max_failures, 20);
    }
}
