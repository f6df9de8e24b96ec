use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::{
    Buffer, ClockTime, ElementConfig, ElementRegistry, FlowResult, FragmentInfo, MemoryStore,
    Segment, SplitMuxConfig, SplitMuxEvent, SplitMuxSink, StreamHandle,
};

/// How long tests wait for the sink to finish.
pub const EOS_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer() // Write to test output
        .try_init();
}

/// A sink writing fragments into a [`MemoryStore`].
pub fn memory_sink(config: SplitMuxConfig) -> (SplitMuxSink, MemoryStore) {
    let store = MemoryStore::new();
    let mut registry = ElementRegistry::with_defaults();
    registry.register_writer("memory", store.factory());
    let config = SplitMuxConfig {
        writer: ElementConfig::new("memory"),
        ..config
    };
    let sink = SplitMuxSink::builder(config)
        .registry(registry)
        .build()
        .unwrap();
    (sink, store)
}

/// A video stream of fixed-length GOPs.
///
/// Every byte of a frame holds the index of its GOP, so the GOPs that ended
/// up in a fragment can be read back from its payload.
#[derive(Debug, Clone, Copy)]
pub struct VideoPattern {
    pub gops: usize,
    pub frames_per_gop: usize,
    pub frame_duration: ClockTime,
    pub frame_size: usize,
}

impl VideoPattern {
    pub fn frame_count(&self) -> usize {
        self.gops * self.frames_per_gop
    }

    pub fn frame(&self, index: usize) -> Buffer {
        let gop = index / self.frames_per_gop;
        let pts = ClockTime::from_nseconds(self.frame_duration.nseconds() * index as u64);
        let buffer = Buffer::new(vec![gop as u8; self.frame_size])
            .pts(pts)
            .duration(self.frame_duration);
        if index % self.frames_per_gop == 0 {
            buffer
        } else {
            buffer.delta()
        }
    }

    pub fn push_frames(&self, stream: &StreamHandle, frames: std::ops::Range<usize>) -> FlowResult {
        for i in frames {
            stream.push_buffer(self.frame(i))?;
        }
        Ok(())
    }

    /// Segment, every frame, then end of stream.
    pub fn push_all(&self, stream: &StreamHandle) -> FlowResult {
        stream.push_segment(Segment::new())?;
        self.push_frames(stream, 0..self.frame_count())?;
        stream.push_eos()
    }
}

/// Pushes frames of `size` bytes filled with `fill` every `step` until `end`.
pub fn push_filled(
    stream: &StreamHandle,
    end: ClockTime,
    step: ClockTime,
    size: usize,
    fill: u8,
) -> FlowResult {
    stream.push_segment(Segment::new())?;
    let mut pts = ClockTime::ZERO;
    while pts < end {
        stream.push_buffer(Buffer::new(vec![fill; size]).pts(pts).duration(step))?;
        pts = pts + step;
    }
    stream.push_eos()
}

/// The GOP indices found in a video-only payload, in order.
pub fn gops_in(data: &[u8]) -> Vec<u8> {
    let mut gops: Vec<u8> = data.to_vec();
    gops.dedup();
    gops
}

pub fn drain_events(rx: &Receiver<SplitMuxEvent>) -> Vec<SplitMuxEvent> {
    rx.try_iter().collect()
}

pub fn closed_fragments(events: &[SplitMuxEvent]) -> Vec<FragmentInfo> {
    events
        .iter()
        .filter_map(|e| match e {
            SplitMuxEvent::FragmentClosed(info) => Some(info.clone()),
            _ => None,
        })
        .collect()
}

pub fn opened_fragments(events: &[SplitMuxEvent]) -> Vec<FragmentInfo> {
    events
        .iter()
        .filter_map(|e| match e {
            SplitMuxEvent::FragmentOpened(info) => Some(info.clone()),
            _ => None,
        })
        .collect()
}
