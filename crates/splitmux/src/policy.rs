//! Decides whether a collected GOP must start a new fragment.

use std::collections::VecDeque;
use std::fmt;

use tracing::trace;

use crate::time::{ClockTime, DisplayStime};
use crate::timecode::TimeCodeInterval;

/// Tolerance for timecode-driven cuts.
pub(crate) const TIMECODE_TOLERANCE_NS: i64 = 5_000;

/// Why a fragment was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SplitReason {
    /// `split_now` or `split_after`
    Requested,
    /// A queued split running time fell inside or before the GOP
    RunningTime(i64),
    Bytes,
    Time,
    Timecode,
    /// The muxer is about to run out of reserved header space
    ReservedSpace,
}

impl fmt::Display for SplitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitReason::Requested => f.write_str("requested"),
            SplitReason::RunningTime(t) => write!(f, "running time {}", DisplayStime(Some(*t))),
            SplitReason::Bytes => f.write_str("byte threshold"),
            SplitReason::Time => f.write_str("time threshold"),
            SplitReason::Timecode => f.write_str("timecode threshold"),
            SplitReason::ReservedSpace => f.write_str("reserved header space"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Thresholds {
    pub max_size_bytes: u64,
    pub max_size_time: ClockTime,
    pub timecode: Option<TimeCodeInterval>,
}

/// Totals describing the fragment if the GOP under evaluation were added.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct GopTotals {
    /// Reference-stream bytes already in the fragment, excluding this GOP
    pub fragment_reference_bytes: u64,
    /// Fragment bytes including this GOP, inflated by the muxer overhead
    pub queued_bytes: u64,
    /// Fragment duration including this GOP
    pub queued_time: i64,
    /// Unwritten duration including this GOP
    pub queued_gop_time: i64,
    /// Running time at which the next GOP starts (or the input high-water mark)
    pub next_gop_start: Option<i64>,
}

/// Everything the evaluator consults besides the totals.
#[derive(Debug)]
pub(crate) struct SplitPolicy<'a> {
    pub thresholds: &'a Thresholds,
    /// An explicit split was requested for this GOP
    pub split_requested: bool,
    /// User-queued split running times, ascending
    pub times_to_split: &'a mut VecDeque<i64>,
    /// Running time at which the current timecode interval ends
    pub next_fragment_start_tc_time: Option<i64>,
    /// Reserved duration left in the muxer, when robust muxing is active
    pub reserved_remaining: Option<ClockTime>,
}

impl SplitPolicy<'_> {
    /// Returns the reason to cut before the GOP, or `None` to keep muxing.
    ///
    /// Queued split times that the GOP reaches are consumed.
    pub(crate) fn evaluate(&mut self, totals: &GopTotals) -> Option<SplitReason> {
        // Nothing from the reference stream in the file yet, so nothing to close
        if totals.fragment_reference_bytes == 0 {
            trace!("Not ready to split - nothing muxed on the reference stream");
            return None;
        }

        if self.split_requested {
            return Some(SplitReason::Requested);
        }

        // The GOP spanning a requested time starts the new fragment
        if let (Some(&split_at), Some(next_start)) =
            (self.times_to_split.front(), totals.next_gop_start)
            && next_start > split_at
        {
            while self
                .times_to_split
                .front()
                .is_some_and(|&t| t < next_start)
            {
                self.times_to_split.pop_front();
            }
            return Some(SplitReason::RunningTime(split_at));
        }

        let thresholds = self.thresholds;
        if thresholds.max_size_bytes > 0 && totals.queued_bytes > thresholds.max_size_bytes {
            trace!(queued_bytes = totals.queued_bytes, "Queued bytes overrun byte limit");
            return Some(SplitReason::Bytes);
        }

        if !thresholds.max_size_time.is_zero()
            && totals.queued_time > thresholds.max_size_time.as_stime()
        {
            trace!(queued_time = %DisplayStime(Some(totals.queued_time)), "Queued time overruns time limit");
            return Some(SplitReason::Time);
        }

        if thresholds.timecode.is_some()
            && let (Some(limit), Some(next_start)) =
                (self.next_fragment_start_tc_time, totals.next_gop_start)
            && next_start > limit.saturating_add(TIMECODE_TOLERANCE_NS)
        {
            trace!(
                next_start = %DisplayStime(Some(next_start)),
                limit = %DisplayStime(Some(limit)),
                "Next GOP overruns timecode limit"
            );
            return Some(SplitReason::Timecode);
        }

        if let Some(remaining) = self.reserved_remaining
            && totals.queued_gop_time >= remaining.as_stime()
        {
            return Some(SplitReason::ReservedSpace);
        }

        None
    }
}
