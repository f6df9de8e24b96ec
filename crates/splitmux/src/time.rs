//! Clock times and signed running times.
//!
//! Timestamps on buffers and thresholds are unsigned [`ClockTime`] values in
//! nanoseconds. Running times are signed (`i64` nanoseconds) because a segment
//! with a base smaller than its start maps early timestamps to negative running
//! times. A missing running time is `None`; since `None < Some(_)` for
//! `Option<i64>`, an unknown running time always orders before any known one.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An unsigned timestamp or duration in nanoseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    pub const ZERO: ClockTime = ClockTime(0);
    pub const NSECOND: ClockTime = ClockTime(1);
    pub const USECOND: ClockTime = ClockTime(1_000);
    pub const MSECOND: ClockTime = ClockTime(1_000_000);
    pub const SECOND: ClockTime = ClockTime(1_000_000_000);
    pub const MAX: ClockTime = ClockTime(u64::MAX);

    pub const fn from_nseconds(ns: u64) -> Self {
        ClockTime(ns)
    }

    pub const fn from_useconds(us: u64) -> Self {
        ClockTime(us.saturating_mul(1_000))
    }

    pub const fn from_mseconds(ms: u64) -> Self {
        ClockTime(ms.saturating_mul(1_000_000))
    }

    pub const fn from_seconds(s: u64) -> Self {
        ClockTime(s.saturating_mul(1_000_000_000))
    }

    /// Converts fractional seconds, clamping negative and NaN input to zero.
    pub fn from_seconds_f64(s: f64) -> Self {
        if s.is_nan() || s <= 0.0 {
            return ClockTime::ZERO;
        }
        ClockTime((s * 1_000_000_000.0).min(u64::MAX as f64) as u64)
    }

    pub const fn nseconds(self) -> u64 {
        self.0
    }

    pub const fn mseconds(self) -> u64 {
        self.0 / 1_000_000
    }

    pub const fn seconds(self) -> u64 {
        self.0 / 1_000_000_000
    }

    pub fn seconds_f64(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, rhs: ClockTime) -> Option<ClockTime> {
        self.0.checked_sub(rhs.0).map(ClockTime)
    }

    pub fn saturating_sub(self, rhs: ClockTime) -> ClockTime {
        ClockTime(self.0.saturating_sub(rhs.0))
    }

    /// Signed view used for running-time arithmetic.
    pub fn as_stime(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Converts a non-negative running time back into a clock time.
    pub fn from_stime(stime: i64) -> Option<ClockTime> {
        u64::try_from(stime).ok().map(ClockTime)
    }
}

impl Add for ClockTime {
    type Output = ClockTime;

    fn add(self, rhs: ClockTime) -> ClockTime {
        ClockTime(self.0.saturating_add(rhs.0))
    }
}

impl Sub for ClockTime {
    type Output = ClockTime;

    fn sub(self, rhs: ClockTime) -> ClockTime {
        ClockTime(self.0.saturating_sub(rhs.0))
    }
}

impl From<Duration> for ClockTime {
    fn from(d: Duration) -> Self {
        ClockTime(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl From<ClockTime> for Duration {
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hms(f, self.0)
    }
}

fn write_hms(f: &mut fmt::Formatter<'_>, ns: u64) -> fmt::Result {
    let secs = ns / 1_000_000_000;
    write!(
        f,
        "{}:{:02}:{:02}.{:09}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        ns % 1_000_000_000
    )
}

/// Display adapter for optional signed running times.
pub struct DisplayStime(pub Option<i64>);

impl fmt::Display for DisplayStime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("none"),
            Some(v) if v < 0 => {
                f.write_str("-")?;
                write_hms(f, v.unsigned_abs())
            }
            Some(v) => write_hms(f, v as u64),
        }
    }
}
