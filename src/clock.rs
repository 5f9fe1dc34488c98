use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Monotonic server time in milliseconds. Zero means "unset".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ServerTimestamp(u64);

impl ServerTimestamp {
    pub const ZERO: Self = Self(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn from_seconds(seconds: f64) -> Self {
        Self(seconds_to_millis(seconds))
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn diff_millis(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn diff_seconds(self, earlier: Self) -> f64 {
        self.diff_millis(earlier) as f64 / 1000.0
    }

    pub fn plus_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn minus_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    pub fn plus_seconds(self, seconds: f64) -> Self {
        if seconds < 0.0 {
            self.minus_millis(seconds_to_millis(-seconds))
        } else {
            self.plus_millis(seconds_to_millis(seconds))
        }
    }
}

impl fmt::Display for ServerTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

pub fn seconds_to_millis(seconds: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    (seconds * 1000.0).round() as u64
}

/// The first sample is 1 ms so a live timestamp never collides with the
/// zero "unset" encoding.
#[derive(Clone, Debug)]
pub struct ServerClock {
    origin: Instant,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> ServerTimestamp {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        ServerTimestamp(elapsed.saturating_add(1))
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn wall_clock_ms() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    now as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_seconds_rounds_to_nearest_millisecond() {
        let base = ServerTimestamp::from_millis(1_000);
        assert_eq!(base.plus_seconds(0.0004).as_millis(), 1_000);
        assert_eq!(base.plus_seconds(0.0006).as_millis(), 1_001);
        assert_eq!(base.plus_seconds(460.0).as_millis(), 461_000);
        assert_eq!(base.plus_seconds(-0.5).as_millis(), 500);
    }

    #[test]
    fn differences_saturate_instead_of_wrapping() {
        let early = ServerTimestamp::from_millis(10);
        let late = ServerTimestamp::from_millis(2_510);
        assert_eq!(late.diff_millis(early), 2_500);
        assert_eq!(early.diff_millis(late), 0);
        assert!((late.diff_seconds(early) - 2.5).abs() < f64::EPSILON);
        assert_eq!(early.minus_millis(50), ServerTimestamp::ZERO);
    }

    #[test]
    fn clock_never_yields_the_unset_timestamp() {
        let clock = ServerClock::new();
        let first = clock.now();
        assert!(!first.is_zero());
        assert!(clock.now() >= first);
    }

    #[test]
    fn seconds_to_millis_rejects_garbage() {
        assert_eq!(seconds_to_millis(f64::NAN), 0);
        assert_eq!(seconds_to_millis(f64::INFINITY), 0);
        assert_eq!(seconds_to_millis(-3.0), 0);
        assert_eq!(seconds_to_millis(1.5), 1_500);
    }
}
