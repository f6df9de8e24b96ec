//! SMPTE-style video timecodes and timecode intervals.
//!
//! Only what the timecode split threshold needs is modelled: frame counting
//! since the daily jam (including 29.97/59.94 drop-frame), adding an interval
//! and converting to nanoseconds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::ClockTime;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeCodeError {
    #[error("Malformed timecode string: {0:?}")]
    Malformed(String),

    #[error("Timecode field out of range: {0}")]
    OutOfRange(&'static str),

    #[error("Invalid frame rate {0}/{1}")]
    FrameRate(u32, u32),

    #[error("Drop-frame timecodes require 30000/1001 or 60000/1001, got {0}/{1}")]
    DropFrameRate(u32, u32),
}

/// A timecode duration, `HH:MM:SS:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeCodeInterval {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub frames: u32,
}

impl TimeCodeInterval {
    pub fn new(hours: u32, minutes: u32, seconds: u32, frames: u32) -> Result<Self, TimeCodeError> {
        if hours >= 24 {
            return Err(TimeCodeError::OutOfRange("hours"));
        }
        if minutes >= 60 {
            return Err(TimeCodeError::OutOfRange("minutes"));
        }
        if seconds >= 60 {
            return Err(TimeCodeError::OutOfRange("seconds"));
        }
        Ok(Self {
            hours,
            minutes,
            seconds,
            frames,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.hours == 0 && self.minutes == 0 && self.seconds == 0 && self.frames == 0
    }
}

impl FromStr for TimeCodeInterval {
    type Err = TimeCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (fields, _) = split_fields(s)?;
        Self::new(fields[0], fields[1], fields[2], fields[3])
    }
}

impl fmt::Display for TimeCodeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frames
        )
    }
}

/// Splits `HH:MM:SS:FF` (or `HH:MM:SS;FF` for drop-frame) into its fields.
fn split_fields(s: &str) -> Result<([u32; 4], bool), TimeCodeError> {
    let malformed = || TimeCodeError::Malformed(s.to_string());
    let s = s.trim();
    let drop_frame = s.contains(';') || s.contains(',');
    let mut fields = [0u32; 4];
    let mut count = 0;
    for part in s.split([':', ';', ',', '.']) {
        if count == 4 || part.is_empty() || part.len() > 2 {
            return Err(malformed());
        }
        fields[count] = part.parse().map_err(|_| malformed())?;
        count += 1;
    }
    if count != 4 {
        return Err(malformed());
    }
    Ok((fields, drop_frame))
}

/// A video timecode at a fixed frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoTimeCode {
    pub fps_n: u32,
    pub fps_d: u32,
    pub drop_frame: bool,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub frames: u32,
}

impl VideoTimeCode {
    pub fn new(
        fps_n: u32,
        fps_d: u32,
        drop_frame: bool,
        hours: u32,
        minutes: u32,
        seconds: u32,
        frames: u32,
    ) -> Result<Self, TimeCodeError> {
        let tc = Self {
            fps_n,
            fps_d,
            drop_frame,
            hours,
            minutes,
            seconds,
            frames,
        };
        tc.validate()?;
        Ok(tc)
    }

    /// Parses `HH:MM:SS:FF`; a `;` before the frames marks drop-frame.
    pub fn parse(s: &str, fps_n: u32, fps_d: u32) -> Result<Self, TimeCodeError> {
        let ([h, m, sec, fr], drop_frame) = split_fields(s)?;
        Self::new(fps_n, fps_d, drop_frame, h, m, sec, fr)
    }

    fn validate(&self) -> Result<(), TimeCodeError> {
        let nominal = nominal_fps(self.fps_n, self.fps_d)?;
        if self.hours >= 24 {
            return Err(TimeCodeError::OutOfRange("hours"));
        }
        if self.minutes >= 60 {
            return Err(TimeCodeError::OutOfRange("minutes"));
        }
        if self.seconds >= 60 {
            return Err(TimeCodeError::OutOfRange("seconds"));
        }
        if self.frames >= nominal {
            return Err(TimeCodeError::OutOfRange("frames"));
        }
        if self.drop_frame {
            let dropped = drop_count(self.fps_n, self.fps_d)?;
            if self.seconds == 0 && self.minutes % 10 != 0 && self.frames < dropped {
                return Err(TimeCodeError::OutOfRange("frames"));
            }
        }
        Ok(())
    }

    /// Frames elapsed since 00:00:00:00 of the same day.
    pub fn frames_since_daily_jam(&self) -> u64 {
        let nominal = nominal_fps(self.fps_n, self.fps_d).unwrap_or(1) as u64;
        let base = (self.hours as u64 * 3600 + self.minutes as u64 * 60 + self.seconds as u64)
            * nominal
            + self.frames as u64;
        if !self.drop_frame {
            return base;
        }
        let dropped = drop_count(self.fps_n, self.fps_d).unwrap_or(0) as u64;
        let whole_minutes = self.hours as u64 * 60 + self.minutes as u64;
        base - dropped * (whole_minutes - whole_minutes / 10)
    }

    /// Nanoseconds elapsed since 00:00:00:00 of the same day.
    pub fn nsec_since_daily_jam(&self) -> u64 {
        self.frames_to_nsec(self.frames_since_daily_jam())
    }

    fn frames_to_nsec(&self, frames: u64) -> u64 {
        if self.fps_n == 0 {
            return 0;
        }
        ((frames as u128 * self.fps_d as u128 * 1_000_000_000) / self.fps_n as u128) as u64
    }

    /// Number of frames in a full day at this rate.
    pub fn frames_per_day(&self) -> u64 {
        let nominal = nominal_fps(self.fps_n, self.fps_d).unwrap_or(1) as u64;
        if self.drop_frame {
            let dropped = drop_count(self.fps_n, self.fps_d).unwrap_or(0) as u64;
            24 * 6 * (600 * nominal - 9 * dropped)
        } else {
            24 * 3600 * nominal
        }
    }

    /// Duration of one full day at this rate.
    pub fn day_duration(&self) -> ClockTime {
        ClockTime::from_nseconds(self.frames_to_nsec(self.frames_per_day()))
    }

    /// Returns this timecode advanced by `frames`, wrapping at midnight.
    pub fn add_frames(&self, frames: i64) -> VideoTimeCode {
        let per_day = self.frames_per_day() as i64;
        let count = (self.frames_since_daily_jam() as i64 + frames).rem_euclid(per_day) as u64;
        let nominal = nominal_fps(self.fps_n, self.fps_d).unwrap_or(1) as u64;

        let display = if self.drop_frame {
            let dropped = drop_count(self.fps_n, self.fps_d).unwrap_or(0) as u64;
            let per_ten_minutes = 600 * nominal - 9 * dropped;
            let per_minute = 60 * nominal - dropped;
            let tens = count / per_ten_minutes;
            let rem = count % per_ten_minutes;
            let mut display = count + 9 * dropped * tens;
            if rem > dropped {
                display += dropped * ((rem - dropped) / per_minute);
            }
            display
        } else {
            count
        };

        let total_seconds = display / nominal;
        VideoTimeCode {
            frames: (display % nominal) as u32,
            seconds: (total_seconds % 60) as u32,
            minutes: ((total_seconds / 60) % 60) as u32,
            hours: ((total_seconds / 3600) % 24) as u32,
            ..*self
        }
    }

    /// Returns this timecode advanced by `interval`, wrapping at midnight.
    pub fn add_interval(&self, interval: &TimeCodeInterval) -> VideoTimeCode {
        let nominal = nominal_fps(self.fps_n, self.fps_d).unwrap_or(1) as u64;
        let mut frames = (interval.hours as u64 * 3600
            + interval.minutes as u64 * 60
            + interval.seconds as u64)
            * nominal
            + interval.frames as u64;
        if self.drop_frame {
            let dropped = drop_count(self.fps_n, self.fps_d).unwrap_or(0) as u64;
            let whole_minutes = interval.hours as u64 * 60 + interval.minutes as u64;
            frames = frames.saturating_sub(dropped * (whole_minutes - whole_minutes / 10));
        }
        self.add_frames(frames as i64)
    }
}

impl fmt::Display for VideoTimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.drop_frame { ';' } else { ':' };
        write!(
            f,
            "{:02}:{:02}:{:02}{}{:02}",
            self.hours, self.minutes, self.seconds, sep, self.frames
        )
    }
}

fn nominal_fps(fps_n: u32, fps_d: u32) -> Result<u32, TimeCodeError> {
    if fps_n == 0 || fps_d == 0 {
        return Err(TimeCodeError::FrameRate(fps_n, fps_d));
    }
    let nominal = ((fps_n as f64 / fps_d as f64) + 0.5) as u32;
    if nominal == 0 {
        return Err(TimeCodeError::FrameRate(fps_n, fps_d));
    }
    Ok(nominal)
}

fn drop_count(fps_n: u32, fps_d: u32) -> Result<u32, TimeCodeError> {
    match (fps_n, fps_d) {
        (30000, 1001) => Ok(2),
        (60000, 1001) => Ok(4),
        _ => Err(TimeCodeError::DropFrameRate(fps_n, fps_d)),
    }
}

/// Computes how far in running time the next timecode-driven cut lies.
///
/// Returns the interval length in nanoseconds together with the running time
/// at which the fragment starting at `running_time` (with timecode `cur_tc`)
/// should end. A target that wraps past midnight is pushed one day forward.
pub(crate) fn next_max_timecode(
    cur_tc: &VideoTimeCode,
    interval: &TimeCodeInterval,
    running_time: Option<i64>,
) -> (ClockTime, Option<i64>) {
    let target_tc = cur_tc.add_interval(interval);
    let cur_tc_time = cur_tc.nsec_since_daily_jam();
    let mut target_tc_time = target_tc.nsec_since_daily_jam();

    if target_tc_time < cur_tc_time {
        target_tc_time += cur_tc.day_duration().nseconds();
    }

    let target = ClockTime::from_nseconds(target_tc_time - cur_tc_time);
    let next_max = running_time.map(|rt| rt.saturating_add(target.as_stime()));
    (target, next_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interval_and_rejects_garbage() {
        let iv: TimeCodeInterval = "00:00:10:00".parse().unwrap();
        assert_eq!(iv, TimeCodeInterval::new(0, 0, 10, 0).unwrap());
        assert!("00:00:10".parse::<TimeCodeInterval>().is_err());
        assert!("aa:00:10:00".parse::<TimeCodeInterval>().is_err());
        assert!("00:61:00:00".parse::<TimeCodeInterval>().is_err());
    }

    #[test]
    fn non_drop_frame_counting() {
        let tc = VideoTimeCode::parse("01:00:00:05", 25, 1).unwrap();
        assert_eq!(tc.frames_since_daily_jam(), 3600 * 25 + 5);
        assert_eq!(tc.nsec_since_daily_jam(), 3600 * 1_000_000_000 + 200_000_000);
    }

    #[test]
    fn drop_frame_skips_two_frames_per_minute() {
        let tc = VideoTimeCode::parse("00:01:00;02", 30000, 1001).unwrap();
        // first displayable frame of minute one is frame count 1800
        assert_eq!(tc.frames_since_daily_jam(), 1800);
        let ten = VideoTimeCode::parse("00:10:00;00", 30000, 1001).unwrap();
        assert_eq!(ten.frames_since_daily_jam(), 17982);
        assert!(VideoTimeCode::parse("00:01:00;00", 30000, 1001).is_err());
    }

    #[test]
    fn add_frames_round_trips_drop_frame_display() {
        let tc = VideoTimeCode::parse("00:00:59;29", 30000, 1001).unwrap();
        let next = tc.add_frames(1);
        assert_eq!(next.to_string(), "00:01:00;02");
        assert_eq!(next.frames_since_daily_jam(), tc.frames_since_daily_jam() + 1);
    }

    #[test]
    fn add_interval_wraps_at_midnight() {
        let tc = VideoTimeCode::parse("23:59:50:00", 25, 1).unwrap();
        let iv: TimeCodeInterval = "00:00:20:00".parse().unwrap();
        assert_eq!(tc.add_interval(&iv).to_string(), "00:00:10:00");

        let (target, next) = next_max_timecode(&tc, &iv, Some(5_000_000_000));
        assert_eq!(target, ClockTime::from_seconds(20));
        assert_eq!(next, Some(25_000_000_000));
    }
}
