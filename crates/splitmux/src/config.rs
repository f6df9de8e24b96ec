//! Sink configuration.
//!
//! [`SplitMuxConfig`] carries every knob of the sink. Thresholds may also be
//! changed at runtime through the setters on
//! [`SplitMuxSink`](crate::SplitMuxSink); the rest is fixed once the sink is
//! built.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SplitMuxError;
use crate::time::ClockTime;
use crate::timecode::TimeCodeInterval;

pub const DEFAULT_MUXER_OVERHEAD: f64 = 0.02;
pub const DEFAULT_MUXER_FACTORY: &str = "rawmux";
pub const DEFAULT_WRITER_FACTORY: &str = "filesink";
pub const DEFAULT_QUEUE_MAX_BUFFERS: usize = 5;

/// How to construct a muxer or writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementConfig {
    /// Registered factory name
    pub factory: String,
    /// Optional preset applied right after construction
    pub preset: Option<String>,
    /// Properties applied after the preset, in key order
    pub properties: BTreeMap<String, String>,
}

impl ElementConfig {
    pub fn new(factory: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            preset: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

impl Default for ElementConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MUXER_FACTORY)
    }
}

/// Configuration for [`SplitMuxSink`](crate::SplitMuxSink)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitMuxConfig {
    /// printf-style fragment location pattern, e.g. `video%05d.mp4`
    pub location: Option<String>,
    /// Byte threshold per fragment (0 = disabled)
    pub max_size_bytes: u64,
    /// Duration threshold per fragment (0 = disabled)
    pub max_size_time: ClockTime,
    /// Timecode interval per fragment, `HH:MM:SS:FF`
    pub max_size_timecode: Option<String>,
    /// Fraction added to byte counts to cover container overhead
    pub muxer_overhead: f64,
    /// Number of fragment files kept before indices wrap (0 = unlimited)
    pub max_files: u32,
    /// How far behind the reference bound other streams may be cut
    pub alignment_threshold: ClockTime,
    /// Finalize old fragments in the background while the next one starts
    pub async_finalize: bool,
    /// Fully reset the muxer between fragments instead of flushing it
    pub reset_muxer: bool,
    /// Index of the first fragment
    pub start_index: u32,
    /// Ask the reference producer for keyframes at the expected cut points
    pub send_keyframe_requests: bool,
    /// Let the muxer reserve header space and split before it runs out
    pub use_robust_muxing: bool,
    /// Muxer construction
    pub muxer: ElementConfig,
    /// Writer construction
    pub writer: ElementConfig,
    /// Sink stream name to muxer pad name
    pub muxer_pad_map: BTreeMap<String, String>,
    /// Initial buffer limit of each per-stream queue
    pub queue_max_buffers: usize,
}

impl Default for SplitMuxConfig {
    fn default() -> Self {
        Self {
            location: None,
            max_size_bytes: 0,
            max_size_time: ClockTime::ZERO,
            max_size_timecode: None,
            muxer_overhead: DEFAULT_MUXER_OVERHEAD,
            max_files: 0,
            alignment_threshold: ClockTime::ZERO,
            async_finalize: false,
            reset_muxer: true,
            start_index: 0,
            send_keyframe_requests: false,
            use_robust_muxing: false,
            muxer: ElementConfig::new(DEFAULT_MUXER_FACTORY),
            writer: ElementConfig::new(DEFAULT_WRITER_FACTORY),
            muxer_pad_map: BTreeMap::new(),
            queue_max_buffers: DEFAULT_QUEUE_MAX_BUFFERS,
        }
    }
}

impl SplitMuxConfig {
    pub fn validate(&self) -> Result<(), SplitMuxError> {
        if !self.muxer_overhead.is_finite() || self.muxer_overhead < 0.0 {
            return Err(SplitMuxError::Config(format!(
                "muxer_overhead must be a finite, non-negative fraction (got {})",
                self.muxer_overhead
            )));
        }
        if self.muxer.factory.is_empty() {
            return Err(SplitMuxError::Config("muxer factory name is empty".into()));
        }
        if self.writer.factory.is_empty() {
            return Err(SplitMuxError::Config("writer factory name is empty".into()));
        }
        if self.queue_max_buffers == 0 {
            return Err(SplitMuxError::Config(
                "queue_max_buffers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parses the timecode threshold, ignoring it with a warning when malformed.
    pub(crate) fn timecode_interval(&self) -> Option<TimeCodeInterval> {
        parse_timecode_threshold(self.max_size_timecode.as_deref())
    }
}

pub(crate) fn parse_timecode_threshold(value: Option<&str>) -> Option<TimeCodeInterval> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match value.parse::<TimeCodeInterval>() {
        Ok(interval) if interval.is_zero() => None,
        Ok(interval) => Some(interval),
        Err(e) => {
            warn!(value, error = %e, "Ignoring malformed timecode threshold");
            None
        }
    }
}
