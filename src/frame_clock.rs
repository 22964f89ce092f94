// =============================================================================
// Frame Clock — calendar-aware frame boundary computation
// =============================================================================
//
// Pure functions only: given an instant and a frame spec, compute the start
// of the frame containing that instant and the start of the following frame.
// Fixed-duration frames truncate UTC time fields (minute within the hour,
// hour within the day, day within the month). Calendar-month frames use real
// calendar arithmetic because month lengths vary.
//
// No I/O, no shared state — safe to call from any thread.
// =============================================================================

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Minutes in one whole day, the pivot between hour- and day-aligned frames.
const MINUTES_PER_DAY: u32 = 1440;

/// Frame specification: a fixed duration in minutes, or one calendar month.
///
/// Supplied once at aggregator construction and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameSpec {
    /// Fixed-duration frame of `n` minutes.
    Minutes(u32),
    /// One calendar month per frame (variable length, year-aware).
    CalendarMonth,
}

impl FrameSpec {
    /// Validate the spec at construction time.
    ///
    /// A non-positive duration cannot resolve frame boundaries and is fatal:
    /// fail fast here rather than producing undefined candle boundaries later.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Minutes(0) => bail!("frame duration must be positive, got 0 minutes"),
            _ => Ok(()),
        }
    }

    /// Compute `(frame_start, next_frame_start)` for the frame containing `t`.
    ///
    /// Invariant: `frame_start <= t < next_frame_start`.
    pub fn frame_bounds(&self, t: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match *self {
            Self::Minutes(m) if m < 60 => {
                let minute = t.minute() - t.minute() % m;
                let start = at_time(t.date_naive(), t.hour(), minute);
                (start, start + Duration::minutes(m as i64))
            }
            Self::Minutes(m) if m % MINUTES_PER_DAY == 0 => {
                let d = m / MINUTES_PER_DAY;
                let day0 = (t.day() - 1) - (t.day() - 1) % d;
                let date = NaiveDate::from_ymd_opt(t.year(), t.month(), day0 + 1)
                    .expect("truncated day is within the month");
                let start = at_time(date, 0, 0);
                (start, start + Duration::minutes(m as i64))
            }
            Self::Minutes(m) if m % 60 == 0 => {
                let h = m / 60;
                let hour = t.hour() - t.hour() % h;
                let start = at_time(t.date_naive(), hour, 0);
                (start, start + Duration::minutes(m as i64))
            }
            Self::Minutes(m) => {
                // Irregular duration (e.g. 90m): truncate minutes-of-day.
                let mins = t.hour() * 60 + t.minute();
                let aligned = mins - mins % m;
                let start = at_time(t.date_naive(), aligned / 60, aligned % 60);
                (start, start + Duration::minutes(m as i64))
            }
            Self::CalendarMonth => {
                let start_date = NaiveDate::from_ymd_opt(t.year(), t.month(), 1)
                    .expect("first of month is always a valid date");
                let (ny, nm) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                let next_date = NaiveDate::from_ymd_opt(ny, nm, 1)
                    .expect("first of month is always a valid date");
                (at_time(start_date, 0, 0), at_time(next_date, 0, 0))
            }
        }
    }
}

impl std::fmt::Display for FrameSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minutes(m) => write!(f, "{m}m"),
            Self::CalendarMonth => write!(f, "1M"),
        }
    }
}

/// Build a UTC instant at `hour:minute:00` on `date`.
fn at_time(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour, minute, 0)
        .expect("hour and minute are truncated into range")
        .and_utc()
}
