// =============================================================================
// History Sink — durable hand-off for sealed candles
// =============================================================================
//
// The aggregator invokes the sink exactly once per sealed candle, from inside
// its ingestion path. The contract therefore forbids blocking: `CsvHistorySink`
// hands the candle to a background writer task through a bounded channel with
// `try_send`, logging and dropping on overflow. Delivery is at-least-once
// across a process restart near a rollover, so the CSV consumer must tolerate
// a duplicated row.
// =============================================================================

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::market_data::Candle;

/// Collaborator invoked once per sealed candle.
///
/// Implementations must return quickly; any durable work happens on the
/// implementation's own task.
pub trait HistorySink: Send + Sync {
    fn candle_sealed(&self, candle: &Candle);
}

/// Capacity of the hand-off channel between the aggregator and the writer
/// task. Sealing happens at most once per frame, so a small buffer is ample.
const SINK_CHANNEL_CAPACITY: usize = 64;

/// Appends one CSV row per sealed candle to a log file.
pub struct CsvHistorySink {
    tx: mpsc::Sender<Candle>,
}

impl CsvHistorySink {
    /// Create the sink and spawn its background writer task.
    ///
    /// The file is opened in append mode; a header row is written only when
    /// the file is newly created.
    pub fn new(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        tokio::spawn(run_csv_writer(path, rx));
        Self { tx }
    }
}

impl HistorySink for CsvHistorySink {
    fn candle_sealed(&self, candle: &Candle) {
        // Bounded, non-blocking hand-off. Overflow means the writer task has
        // stalled; the seal itself is unconditional, so the row is dropped.
        if let Err(e) = self.tx.try_send(candle.clone()) {
            warn!(error = %e, frame_start = %candle.frame_start, "history sink channel full — dropping row");
        }
    }
}

/// Background writer loop. Runs until the sending side is dropped.
async fn run_csv_writer(path: PathBuf, mut rx: mpsc::Receiver<Candle>) {
    info!(path = %path.display(), "history CSV writer started");

    while let Some(candle) = rx.recv().await {
        if let Err(e) = append_row(&path, &candle) {
            // Sink failures never roll back sealing; log and carry on.
            error!(error = %e, path = %path.display(), "failed to append candle row");
        } else {
            debug!(frame_start = %candle.frame_start, close = candle.close, "candle row appended");
        }
    }

    info!(path = %path.display(), "history CSV writer stopped");
}

/// Append a single candle row, writing the header first on a fresh file.
fn append_row(path: &PathBuf, candle: &Candle) -> Result<()> {
    let fresh = !path.exists();

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open history file {}", path.display()))?;

    if fresh {
        writeln!(
            file,
            "frame_start,open,high,low,close,volume,buy_volume,sell_volume,trades_count"
        )
        .context("failed to write CSV header")?;
    }

    writeln!(file, "{}", format_row(candle)).context("failed to write CSV row")?;
    Ok(())
}

fn format_row(c: &Candle) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{}",
        c.frame_start.to_rfc3339(),
        c.open,
        c.high,
        c.low,
        c.close,
        c.volume,
        c.buy_volume,
        c.sell_volume,
        c.trades_count
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn sample_candle() -> Candle {
        Candle {
            frame_start: Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap(),
            open: 100.0,
            high: 105.0,
            low: 99.0,
            close: 103.0,
            volume: 12.5,
            buy_volume: 7.5,
            sell_volume: 5.0,
            trades_count: 42,
            sealed: true,
        }
    }

    #[test]
    fn row_contains_all_fields_in_order() {
        let row = format_row(&sample_candle());
        assert_eq!(
            row,
            "2024-03-07T10:00:00+00:00,100,105,99,103,12.5,7.5,5,42"
        );
    }

    #[test]
    fn append_creates_file_with_header_once() {
        let dir = std::env::temp_dir().join(format!("tickfold-sink-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("history.csv");
        let _ = std::fs::remove_file(&path);

        append_row(&path, &sample_candle()).unwrap();
        append_row(&path, &sample_candle()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("frame_start,open,high,low"));
        assert_eq!(lines[1], lines[2]);

        let _ = std::fs::remove_file(&path);
    }
}
