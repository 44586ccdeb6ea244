//! Wall-clock and monotonic time sources.
//!
//! The wall clock reports `None` until it has been synchronized (NTP or
//! equivalent); energy integration runs on the monotonic clock and never
//! stalls on an unsynced wall clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};

pub const MS_PER_HOUR: u64 = 3_600_000;

/// Anything earlier than 2001-09-09 is an unset RTC, not a real time.
const MINIMUM_WALL_MS: u64 = 1_000_000_000_000;
/// Anything later than 2100 is a corrupt RTC.
const MAXIMUM_WALL_MS: u64 = 4_102_444_800_000;

/// How far from the top of the hour the spool task still counts as
/// hour-aligned after an oversleep.
const HOUR_ALIGN_TOLERANCE_MS: u64 = 120_000;

pub trait Clock: Send + Sync + 'static {
    /// Unix time in milliseconds, or `None` while unsynchronized.
    fn wall_ms(&self) -> Option<u64>;

    /// Milliseconds from an arbitrary fixed origin; never goes backwards.
    fn monotonic_ms(&self) -> u64;
}

#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock { started: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall_ms(&self) -> Option<u64> {
        let now = Utc::now().timestamp_millis();
        if now < MINIMUM_WALL_MS as i64 || now > MAXIMUM_WALL_MS as i64 {
            None
        } else {
            Some(now as u64)
        }
    }

    fn monotonic_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    wall: AtomicU64,
    monotonic: AtomicU64,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock::default()
    }

    pub fn set_wall(&self, wall_ms: u64) {
        self.wall.store(wall_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.monotonic.fetch_add(delta_ms, Ordering::Relaxed);
        let wall = self.wall.load(Ordering::Relaxed);
        if wall != 0 {
            self.wall.store(wall + delta_ms, Ordering::Relaxed);
        }
    }
}

impl Clock for ManualClock {
    fn wall_ms(&self) -> Option<u64> {
        match self.wall.load(Ordering::Relaxed) {
            0 => None,
            wall => Some(wall),
        }
    }

    fn monotonic_ms(&self) -> u64 {
        self.monotonic.load(Ordering::Relaxed)
    }
}

fn datetime(wall_ms: u64) -> DateTime<Utc> {
    // Callers only pass wall clock readings, which are range checked.
    DateTime::from_timestamp_millis(wall_ms as i64).expect("wall time within range")
}

/// UTC calendar date, `YYYY-MM-DD`.
pub fn date_string(wall_ms: u64) -> String {
    datetime(wall_ms).format("%Y-%m-%d").to_string()
}

/// ISO-8601 UTC timestamp rounded to the nearest hour.
pub fn hour_timestamp(wall_ms: u64) -> String {
    let rounded = (wall_ms + MS_PER_HOUR / 2) / MS_PER_HOUR * MS_PER_HOUR;
    datetime(rounded).format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn ms_until_next_hour(wall_ms: u64) -> u64 {
    MS_PER_HOUR - wall_ms % MS_PER_HOUR
}

/// Whether `wall_ms` is close enough to the top of an hour for the spool.
pub fn is_near_hour(wall_ms: u64) -> bool {
    let offset = wall_ms % MS_PER_HOUR;
    offset < HOUR_ALIGN_TOLERANCE_MS || offset > MS_PER_HOUR - HOUR_ALIGN_TOLERANCE_MS
}

#[cfg(test)]
mod test {
    use super::*;

    // 2026-07-31 23:59:30 UTC
    const T: u64 = 1_785_542_370_000;

    #[test]
    fn test_date_string() {
        assert_eq!(date_string(T), "2026-07-31");
    }

    #[test]
    fn test_hour_rounding() {
        assert_eq!(hour_timestamp(T), "2026-08-01T00:00:00Z");
        // Early in an hour rounds down.
        assert_eq!(hour_timestamp(T + 630_000), "2026-08-01T00:00:00Z");
    }

    #[test]
    fn test_ms_until_next_hour() {
        let remaining = ms_until_next_hour(T);
        assert!(remaining <= MS_PER_HOUR);
        assert_eq!((T + remaining) % MS_PER_HOUR, 0);
    }

    #[test]
    fn test_near_hour() {
        assert!(is_near_hour(T)); // 30 s before the hour
        assert!(is_near_hour(T + 60_000)); // 30 s after
        assert!(!is_near_hour(T - 1_500_000));
    }

    #[test]
    fn test_manual_clock_sync_gate() {
        let clock = ManualClock::new();
        assert_eq!(clock.wall_ms(), None);
        clock.advance(500);
        assert_eq!(clock.monotonic_ms(), 500);
        assert_eq!(clock.wall_ms(), None);
        clock.set_wall(T);
        clock.advance(1_000);
        assert_eq!(clock.wall_ms(), Some(T + 1_000));
    }
}
