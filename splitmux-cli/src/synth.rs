//! Generated test signal.
//!
//! Produces a video stream with a fixed GOP length and running timecodes,
//! plus an optional audio stream, each pushed from its own thread the way a
//! live capture would.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use splitmux::{
    Buffer, ClockTime, FlowResult, Segment, SplitMuxConfig, SplitMuxEvent, SplitMuxSink,
    StreamHandle, StreamKind, VideoTimeCode,
};
use tracing::{info, warn};

use crate::cli::RunArgs;

const AUDIO_FRAME: ClockTime = ClockTime::from_mseconds(20);
const AUDIO_FRAME_SIZE: usize = 256;

/// A fragment reported closed by the sink.
#[derive(Debug, Clone)]
pub struct FragmentReport {
    pub id: u32,
    pub location: Option<PathBuf>,
    pub duration: Option<ClockTime>,
}

#[derive(Debug, Clone, Copy)]
struct VideoSignal {
    end: ClockTime,
    frame_duration: ClockTime,
    frames_per_gop: u64,
    frame_size: usize,
    fps: u32,
}

impl VideoSignal {
    fn new(args: &RunArgs) -> Result<Self> {
        if args.fps == 0 {
            bail!("frame rate must be positive");
        }
        if args.gop <= 0.0 || args.duration <= 0.0 {
            bail!("GOP length and duration must be positive");
        }
        let frame_duration = ClockTime::from_nseconds(1_000_000_000 / args.fps as u64);
        let frames_per_gop = ((args.gop * args.fps as f64).round() as u64).max(1);
        Ok(Self {
            end: ClockTime::from_seconds_f64(args.duration),
            frame_duration,
            frames_per_gop,
            frame_size: args.frame_size.max(1),
            fps: args.fps,
        })
    }

    fn push(&self, stream: &StreamHandle) -> FlowResult {
        let tc0 = VideoTimeCode::new(self.fps, 1, false, 0, 0, 0, 0).ok();
        stream.push_segment(Segment::new())?;
        let mut n = 0u64;
        loop {
            let pts = ClockTime::from_nseconds(n * self.frame_duration.nseconds());
            if pts >= self.end {
                break;
            }
            let mut frame = Buffer::with_size(self.frame_size)
                .pts(pts)
                .duration(self.frame_duration);
            if n % self.frames_per_gop != 0 {
                frame = frame.delta();
            }
            if let Some(tc) = tc0 {
                frame = frame.timecode(tc.add_frames(n as i64));
            }
            stream.push_buffer(frame)?;
            n += 1;
        }
        stream.push_eos()
    }
}

fn push_audio(stream: &StreamHandle, end: ClockTime) -> FlowResult {
    stream.push_segment(Segment::new())?;
    let mut pts = ClockTime::ZERO;
    while pts < end {
        stream.push_buffer(
            Buffer::with_size(AUDIO_FRAME_SIZE)
                .pts(pts)
                .duration(AUDIO_FRAME),
        )?;
        pts = pts + AUDIO_FRAME;
    }
    stream.push_eos()
}

/// Runs the signal through a sink built from `config` and reports every
/// fragment it closed.
pub fn run(config: SplitMuxConfig, args: &RunArgs) -> Result<Vec<FragmentReport>> {
    let signal = VideoSignal::new(args)?;
    let sink = SplitMuxSink::new(config).context("creating the sink")?;
    let events = sink.subscribe();

    let video = sink.request_stream(StreamKind::Video)?;
    let audio = if args.audio {
        Some(sink.request_stream(StreamKind::Audio)?)
    } else {
        None
    };
    sink.start()?;
    info!(
        duration = %signal.end,
        gop_frames = signal.frames_per_gop,
        audio = args.audio,
        "Generating test signal"
    );

    thread::scope(|s| {
        let v = s.spawn(|| signal.push(&video));
        let a = audio
            .as_ref()
            .map(|audio| s.spawn(move || push_audio(audio, signal.end)));
        for (name, handle) in std::iter::once(("video", v)).chain(a.map(|a| ("audio", a))) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(stream = name, error = %e, "Producer stopped early"),
                Err(_) => warn!(stream = name, "Producer panicked"),
            }
        }
    });

    let timeout = Duration::from_secs_f64(args.duration.max(1.0) * 2.0 + 10.0);
    let result = sink.wait_for_eos(timeout);
    sink.stop();
    result?;

    Ok(events
        .try_iter()
        .filter_map(|event| match event {
            SplitMuxEvent::FragmentClosed(info) => Some(FragmentReport {
                id: info.fragment_id,
                location: info.location,
                duration: info.duration,
            }),
            _ => None,
        })
        .collect())
}
