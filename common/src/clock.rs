//! Monotonic time representation.
//!
//! [`Ticks`] counts nanoseconds on a process-local monotonic timeline. It is
//! never adjusted by wall-clock changes, so it is safe to use for playout
//! deadlines. Signed intervals between ticks are expressed as `f64` seconds,
//! since wait times and clock offsets are frequently negative.

use std::ops::{Add, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// A point on the monotonic playout timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticks(u64);

impl Ticks {
    // ---
    /// Start of the timeline.
    pub const ZERO: Ticks = Ticks(0);

    /// Current monotonic time.
    pub fn now() -> Self {
        // ---
        Self::from_duration(epoch().elapsed())
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Builds a tick from seconds since the timeline start. Negative or NaN
    /// input clamps to [`Ticks::ZERO`].
    pub fn from_secs_f64(secs: f64) -> Self {
        // ---
        if secs.is_nan() || secs <= 0.0 {
            return Self::ZERO;
        }
        Self((secs * NANOS_PER_SECOND).round() as u64)
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SECOND
    }

    pub const fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Returns this tick offset by `secs` (which may be negative), saturating
    /// at either end of the timeline.
    pub fn adding_time_interval(self, secs: f64) -> Self {
        // ---
        if secs.is_nan() {
            return self;
        }
        let delta = (secs.abs() * NANOS_PER_SECOND).round() as u64;
        if secs >= 0.0 {
            Self(self.0.saturating_add(delta))
        } else {
            Self(self.0.saturating_sub(delta))
        }
    }

    /// Signed seconds elapsed from `earlier` to `self`.
    pub fn time_interval_since(self, earlier: Ticks) -> f64 {
        (self.0 as i128 - earlier.0 as i128) as f64 / NANOS_PER_SECOND
    }

    /// The `std` instant this tick corresponds to in the current process.
    pub fn to_instant(self) -> Instant {
        epoch() + self.as_duration()
    }
}

impl Add<Duration> for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Duration) -> Ticks {
        Ticks(self.0.saturating_add(Ticks::from_duration(rhs).0))
    }
}

impl Sub<Duration> for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: Duration) -> Ticks {
        Ticks(self.0.saturating_sub(Ticks::from_duration(rhs).0))
    }
}
