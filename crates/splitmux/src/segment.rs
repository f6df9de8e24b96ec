//! Time segments and the running-time mapping.

use serde::{Deserialize, Serialize};

use crate::time::ClockTime;

/// A playback segment describing how stream timestamps map onto running time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Playback rate; negative for reverse playback.
    pub rate: f64,
    /// First timestamp of the segment.
    pub start: ClockTime,
    /// Last timestamp of the segment. Required for reverse playback.
    pub stop: Option<ClockTime>,
    /// Running time accumulated by previous segments.
    pub base: ClockTime,
    /// Offset into the segment applied before mapping.
    pub offset: ClockTime,
    /// Stream time of `start`.
    pub time: ClockTime,
}

impl Default for Segment {
    fn default() -> Self {
        Self::new()
    }
}

impl Segment {
    pub fn new() -> Self {
        Self {
            rate: 1.0,
            start: ClockTime::ZERO,
            stop: None,
            base: ClockTime::ZERO,
            offset: ClockTime::ZERO,
            time: ClockTime::ZERO,
        }
    }

    pub fn with_start(mut self, start: ClockTime) -> Self {
        self.start = start;
        self.time = start;
        self
    }

    pub fn with_stop(mut self, stop: ClockTime) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_base(mut self, base: ClockTime) -> Self {
        self.base = base;
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Maps `position` onto signed running time.
    ///
    /// Positions before the segment start yield negative running times unless
    /// the base absorbs them. Returns `None` for a degenerate segment (zero
    /// rate, or reverse playback without a stop position).
    pub fn to_running_time_full(&self, position: ClockTime) -> Option<i64> {
        if self.rate == 0.0 || !self.rate.is_finite() {
            return None;
        }

        let (mut result, positive) = if self.rate > 0.0 {
            let start = self.start + self.offset;
            if position >= start {
                (position.nseconds() - start.nseconds(), true)
            } else {
                (start.nseconds() - position.nseconds(), false)
            }
        } else {
            let stop = self.stop?.saturating_sub(self.offset);
            if position <= stop {
                (stop.nseconds() - position.nseconds(), true)
            } else {
                (position.nseconds() - stop.nseconds(), false)
            }
        };

        let abs_rate = self.rate.abs();
        if abs_rate != 1.0 {
            result = (result as f64 / abs_rate) as u64;
        }

        let base = self.base.nseconds();
        let signed = if positive {
            result.saturating_add(base) as i128
        } else if base >= result {
            (base - result) as i128
        } else {
            -((result - base) as i128)
        };
        Some(signed.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: u64 = 1_000_000_000;

    #[test]
    fn forward_segment_subtracts_start_and_adds_base() {
        let seg = Segment::new()
            .with_start(ClockTime::from_seconds(10))
            .with_base(ClockTime::from_seconds(2));
        assert_eq!(
            seg.to_running_time_full(ClockTime::from_seconds(11)),
            Some(3 * S as i64)
        );
        // before start, the base absorbs the difference
        assert_eq!(
            seg.to_running_time_full(ClockTime::from_seconds(9)),
            Some(S as i64)
        );
        // past the base, the running time goes negative
        assert_eq!(
            seg.to_running_time_full(ClockTime::from_seconds(7)),
            Some(-(S as i64))
        );
    }

    #[test]
    fn rate_scales_running_time() {
        let seg = Segment::new().with_rate(2.0);
        assert_eq!(
            seg.to_running_time_full(ClockTime::from_seconds(4)),
            Some(2 * S as i64)
        );
    }

    #[test]
    fn reverse_segment_counts_down_from_stop() {
        let seg = Segment::new()
            .with_rate(-1.0)
            .with_stop(ClockTime::from_seconds(10));
        assert_eq!(
            seg.to_running_time_full(ClockTime::from_seconds(8)),
            Some(2 * S as i64)
        );
        let open = Segment::new().with_rate(-1.0);
        assert_eq!(open.to_running_time_full(ClockTime::ZERO), None);
    }
}
