//! Wall-clock abstraction.
//!
//! All queued/retry timestamps and sleep computations go through an
//! injected [`Clock`] so eligibility and backoff behavior can be tested
//! deterministically.

use chrono::{DateTime, Local};
use std::sync::Mutex;

/// Date format used for all timestamps persisted to the database.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Provides the current local time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Local>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Settable clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Create a clock frozen at the current system time.
    pub fn at_system_now() -> Self {
        Self::new(Local::now())
    }

    /// Move the clock to an absolute instant.
    pub fn set(&self, now: DateTime<Local>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Advance the clock by the given number of seconds.
    pub fn advance_secs(&self, secs: i64) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += chrono::Duration::seconds(secs);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        self.now
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|_| Local::now())
    }
}

/// Format a timestamp the way the database stores it.
pub(crate) fn format_date(date: DateTime<Local>) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse a stored timestamp. Falls back to `fallback` on malformed input,
/// matching the lenient behavior expected of legacy rows.
pub(crate) fn parse_date(text: &str, fallback: DateTime<Local>) -> DateTime<Local> {
    chrono::NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .ok()
        .and_then(|naive| naive.and_local_timezone(Local).single())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn system_clock_returns_current_time() {
        let before = Local::now();
        let actual = SystemClock.now();
        let after = Local::now();
        assert!(actual >= before);
        assert!(actual <= after);
    }

    #[test]
    fn manual_clock_is_deterministic() {
        let start = Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start);

        clock.advance_secs(90);
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn date_format_round_trip() {
        let instant = Local.with_ymd_and_hms(2023, 6, 15, 18, 30, 45).unwrap();
        let text = format_date(instant);
        assert_eq!(text, "2023-06-15 18:30:45");
        assert_eq!(parse_date(&text, Local::now()), instant);
    }

    #[test]
    fn malformed_date_falls_back() {
        let fallback = Local.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap();
        assert_eq!(parse_date("not a date", fallback), fallback);
    }

    #[test]
    fn stored_format_sorts_chronologically() {
        let early = Local.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap();
        let late = Local.with_ymd_and_hms(2024, 11, 5, 9, 0, 0).unwrap();
        assert!(format_date(early) < format_date(late));
    }
}
