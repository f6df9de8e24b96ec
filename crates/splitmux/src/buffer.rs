//! Media buffers and stream descriptions consumed by the sink.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::segment::Segment;
use crate::time::ClockTime;
use crate::timecode::VideoTimeCode;

/// One encoded media unit.
///
/// A buffer without the delta-unit flag is a keyframe: it starts a new GOP when
/// it arrives on the reference stream.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    pub data: Bytes,
    pub pts: Option<ClockTime>,
    pub dts: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    pub delta_unit: bool,
    pub timecode: Option<VideoTimeCode>,
}

impl Buffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// A zero-filled buffer of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self::new(vec![0u8; size])
    }

    pub fn pts(mut self, pts: ClockTime) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn dts(mut self, dts: ClockTime) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn duration(mut self, duration: ClockTime) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Marks the buffer as depending on earlier buffers (not a keyframe).
    pub fn delta(mut self) -> Self {
        self.delta_unit = true;
        self
    }

    pub fn timecode(mut self, tc: VideoTimeCode) -> Self {
        self.timecode = Some(tc);
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_keyframe(&self) -> bool {
        !self.delta_unit
    }
}

/// The kind of stream requested on the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// The primary video stream. At most one; it always becomes the reference.
    Video,
    VideoAux,
    Audio,
    Subtitle,
    Caption,
}

impl StreamKind {
    /// Name prefix of the stream; numbered kinds append `_<n>`.
    pub fn prefix(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::VideoAux => "video_aux",
            StreamKind::Audio => "audio",
            StreamKind::Subtitle => "subtitle",
            StreamKind::Caption => "caption",
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, StreamKind::Video | StreamKind::VideoAux)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// The first reference buffer of a fragment and the segment it belongs to.
///
/// Handed to the location callback so names can depend on stream content.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub buffer: Option<Buffer>,
    pub segment: Option<Segment>,
}

/// A span of stream time with no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub timestamp: ClockTime,
    pub duration: Option<ClockTime>,
}

impl Gap {
    pub fn new(timestamp: ClockTime, duration: Option<ClockTime>) -> Self {
        Self {
            timestamp,
            duration,
        }
    }
}
