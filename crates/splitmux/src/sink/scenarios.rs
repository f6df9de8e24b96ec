//! End-to-end runs of the sink against the in-memory writer.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::buffer::{Buffer, Gap, StreamKind};
use crate::config::{ElementConfig, SplitMuxConfig};
use crate::element::{ElementRegistry, Muxer, Writer};
use crate::elements::{MemoryStore, RawMuxer, WriterOp};
use crate::error::{ElementError, FlowError, SplitMuxError};
use crate::events::SplitMuxEvent;
use crate::segment::Segment;
use crate::test_utils::{
    EOS_TIMEOUT, VideoPattern, closed_fragments, drain_events, gops_in, init_tracing,
    memory_sink, opened_fragments, push_filled,
};
use crate::time::ClockTime;
use crate::timecode::VideoTimeCode;

use super::SplitMuxSink;

const HALF_SECOND_GOPS: VideoPattern = VideoPattern {
    gops: 0,
    frames_per_gop: 5,
    frame_duration: ClockTime::from_mseconds(100),
    frame_size: 100,
};

fn half_second_gops(gops: usize) -> VideoPattern {
    VideoPattern {
        gops,
        ..HALF_SECOND_GOPS
    }
}

fn fragment_gops(store: &MemoryStore) -> Vec<Vec<u8>> {
    store
        .fragments()
        .iter()
        .map(|f| gops_in(&f.data))
        .collect()
}

#[test]
fn byte_limit_packs_whole_gops() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig {
        max_size_bytes: 1_000_000,
        ..Default::default()
    });
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    // 130 kB per GOP; with 2% overhead the eighth GOP no longer fits
    let pattern = VideoPattern {
        gops: 10,
        frames_per_gop: 13,
        frame_duration: ClockTime::from_mseconds(40),
        frame_size: 10_000,
    };
    pattern.push_all(&video).unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let fragments = store.fragments();
    assert_eq!(fragments.len(), 2);
    assert!(fragments.iter().all(|f| f.finished));
    assert_eq!(fragments[0].data.len(), 910_000);
    assert_eq!(fragments[1].data.len(), 390_000);
    assert_eq!(
        fragment_gops(&store),
        vec![vec![0, 1, 2, 3, 4, 5, 6], vec![7, 8, 9]]
    );
    // The same writer is reused for every fragment
    assert!(fragments.iter().all(|f| f.writer_id == 0));
}

#[test]
fn time_limit_cuts_at_gop_boundaries() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig {
        max_size_time: ClockTime::from_seconds(10),
        ..Default::default()
    });
    let events = sink.subscribe();
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    half_second_gops(25).push_all(&video).unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let gops = fragment_gops(&store);
    assert_eq!(gops.len(), 2);
    assert_eq!(gops[0], (0..20).collect::<Vec<u8>>());
    assert_eq!(gops[1], (20..25).collect::<Vec<u8>>());

    let events = drain_events(&events);
    let opened: Vec<u32> = opened_fragments(&events)
        .iter()
        .map(|i| i.fragment_id)
        .collect();
    assert_eq!(opened, vec![0, 1]);

    let closed = closed_fragments(&events);
    assert_eq!(closed.len(), 2);
    assert_eq!(closed[0].fragment_id, 0);
    assert_eq!(closed[0].offset, Some(ClockTime::ZERO));
    assert_eq!(closed[0].duration, Some(ClockTime::from_seconds(10)));
    assert_eq!(closed[1].fragment_id, 1);
    assert_eq!(closed[1].offset, Some(ClockTime::from_seconds(10)));
    assert_eq!(closed[1].duration, Some(ClockTime::from_mseconds(2500)));
}

#[test]
fn split_now_moves_the_collecting_gop_to_a_new_fragment() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig::default());
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    let pattern = half_second_gops(6);
    video.push_segment(Segment::new()).unwrap();
    pattern.push_frames(&video, 0..15).unwrap();
    sink.split_now();
    pattern.push_frames(&video, 15..30).unwrap();
    video.push_eos().unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    assert_eq!(fragment_gops(&store), vec![vec![0, 1], vec![2, 3, 4, 5]]);
}

#[test]
fn repeated_split_now_cuts_once() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig::default());
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    let pattern = half_second_gops(6);
    video.push_segment(Segment::new()).unwrap();
    pattern.push_frames(&video, 0..15).unwrap();
    sink.split_now();
    sink.split_now();
    pattern.push_frames(&video, 15..30).unwrap();
    video.push_eos().unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    assert_eq!(fragment_gops(&store), vec![vec![0, 1], vec![2, 3, 4, 5]]);
}

#[test]
fn split_after_keeps_the_collecting_gop() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig::default());
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    let pattern = half_second_gops(6);
    video.push_segment(Segment::new()).unwrap();
    pattern.push_frames(&video, 0..15).unwrap();
    sink.split_after();
    pattern.push_frames(&video, 15..30).unwrap();
    video.push_eos().unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    assert_eq!(fragment_gops(&store), vec![vec![0, 1, 2], vec![3, 4, 5]]);
}

#[test]
fn split_times_start_fragments_at_the_enclosing_gop() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig::default());
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.split_at_running_time(ClockTime::from_mseconds(1200));
    sink.split_at_running_time(ClockTime::from_mseconds(2600));
    // Earlier than the last queued time, ignored
    sink.split_at_running_time(ClockTime::from_mseconds(100));
    sink.start().unwrap();

    half_second_gops(8).push_all(&video).unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    assert_eq!(
        fragment_gops(&store),
        vec![vec![0, 1], vec![2, 3, 4], vec![5, 6, 7]]
    );
}

#[test]
fn oversized_gops_get_a_fragment_of_their_own() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig {
        max_size_bytes: 1_000,
        ..Default::default()
    });
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    // GOPs 0 and 3 are 2500 bytes each, the others 200
    let frame = |i: usize| {
        let gop = i / 5;
        let size = if gop == 0 || gop == 3 { 500 } else { 40 };
        let buffer = Buffer::new(vec![gop as u8; size])
            .pts(ClockTime::from_mseconds(100 * i as u64))
            .duration(ClockTime::from_mseconds(100));
        if i % 5 == 0 { buffer } else { buffer.delta() }
    };
    video.push_segment(Segment::new()).unwrap();
    for i in 0..30 {
        video.push_buffer(frame(i)).unwrap();
    }
    video.push_eos().unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    assert_eq!(
        fragment_gops(&store),
        vec![vec![0], vec![1, 2], vec![3], vec![4, 5]]
    );
    let sizes: Vec<usize> = store.fragments().iter().map(|f| f.data.len()).collect();
    assert_eq!(sizes, vec![2500, 400, 2500, 400]);
}

/// Raw muxer that also logs the gaps and buffers reaching its pads.
struct LoggingMuxer {
    inner: RawMuxer,
    log: Arc<Mutex<Vec<String>>>,
}

impl Muxer for LoggingMuxer {
    fn request_pad(&mut self, kind: StreamKind, name: Option<&str>) -> Result<String, ElementError> {
        self.inner.request_pad(kind, name)
    }

    fn release_pad(&mut self, pad: &str) {
        self.inner.release_pad(pad);
    }

    fn gap(&mut self, pad: &str, gap: &Gap) -> Result<(), ElementError> {
        self.log
            .lock()
            .push(format!("gap {pad} {}", gap.timestamp.mseconds()));
        Ok(())
    }

    fn push_buffer(
        &mut self,
        pad: &str,
        buffer: &Buffer,
        out: &mut dyn Writer,
    ) -> Result<(), ElementError> {
        let pts = buffer.pts.map_or(0, |pts| pts.mseconds());
        self.log.lock().push(format!("buffer {pad} {pts}"));
        self.inner.push_buffer(pad, buffer, out)
    }

    fn finish(&mut self, out: &mut dyn Writer) -> Result<(), ElementError> {
        self.inner.finish(out)
    }

    fn flush(&mut self) {
        self.inner.flush();
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

#[test]
fn leading_gap_opens_the_first_gop() {
    init_tracing();
    let store = MemoryStore::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ElementRegistry::with_defaults();
    registry.register_writer("memory", store.factory());
    let muxer_log = Arc::clone(&log);
    registry.register_muxer("logging", move || -> Result<Box<dyn Muxer>, ElementError> {
        Ok(Box::new(LoggingMuxer {
            inner: RawMuxer::new(),
            log: Arc::clone(&muxer_log),
        }))
    });
    let sink = SplitMuxSink::builder(SplitMuxConfig {
        max_size_time: ClockTime::from_seconds(1),
        muxer: ElementConfig::new("logging"),
        writer: ElementConfig::new("memory"),
        ..Default::default()
    })
    .registry(registry)
    .build()
    .unwrap();
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    // No picture for the first half second
    let pattern = half_second_gops(6);
    video.push_segment(Segment::new()).unwrap();
    video
        .push_gap(Gap::new(ClockTime::ZERO, Some(ClockTime::from_mseconds(500))))
        .unwrap();
    {
        let state = sink.inner.state.lock();
        assert_eq!(state.pending_input_gops.len(), 1);
        let gop = state.pending_input_gops.head().unwrap();
        assert!(gop.from_gap);
        assert_eq!(gop.start_time, Some(0));
    }

    // The first keyframe extends the gap's GOP rather than opening another
    pattern.push_frames(&video, 5..10).unwrap();
    {
        let state = sink.inner.state.lock();
        assert_eq!(state.pending_input_gops.len(), 1);
        let gop = state.pending_input_gops.head().unwrap();
        assert!(!gop.from_gap);
        assert_eq!(gop.start_time, Some(0));
        assert_eq!(gop.reference_bytes, 500);
    }

    pattern.push_frames(&video, 10..30).unwrap();
    video.push_eos().unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    assert_eq!(
        fragment_gops(&store),
        vec![vec![1], vec![2, 3], vec![4, 5]]
    );
    assert!(store.fragments().iter().all(|f| f.finished));
    // The gap was held back and delivered just ahead of the first picture
    let log = log.lock();
    assert_eq!(log[0], "gap video_0 0");
    assert_eq!(log[1], "buffer video_0 500");
}

#[test]
fn streams_are_cut_at_the_same_running_time() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig {
        max_size_time: ClockTime::from_seconds(2),
        ..Default::default()
    });
    let video = sink.request_stream(StreamKind::Video).unwrap();
    let audio = sink.request_stream(StreamKind::Audio).unwrap();
    sink.start().unwrap();

    let pattern = VideoPattern {
        frame_size: 10,
        ..half_second_gops(20)
    };
    thread::scope(|s| {
        let v = s.spawn(|| pattern.push_all(&video));
        let a = s.spawn(|| {
            push_filled(
                &audio,
                ClockTime::from_seconds(10),
                ClockTime::from_mseconds(20),
                2,
                0xAA,
            )
        });
        v.join().unwrap().unwrap();
        a.join().unwrap().unwrap();
    });
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let fragments = store.fragments();
    assert_eq!(fragments.len(), 5);
    for (n, fragment) in fragments.iter().enumerate() {
        let audio_bytes = fragment.data.iter().filter(|&&b| b == 0xAA).count();
        let video: Vec<u8> = fragment.data.iter().copied().filter(|&b| b != 0xAA).collect();
        // 100 audio frames of 20 ms and four GOPs of video per 2 s fragment
        assert_eq!(audio_bytes, 200, "audio in fragment {n}");
        assert_eq!(video.len(), 200, "video in fragment {n}");
        let first_gop = (n * 4) as u8;
        assert_eq!(gops_in(&video), (first_gop..first_gop + 4).collect::<Vec<u8>>());
    }
}

#[test]
fn stream_ending_early_is_closed_in_every_fragment() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig {
        max_size_time: ClockTime::from_seconds(1),
        ..Default::default()
    });
    let video = sink.request_stream(StreamKind::Video).unwrap();
    let subtitle = sink.request_stream(StreamKind::Subtitle).unwrap();
    assert_eq!(subtitle.name(), "subtitle_0");
    sink.start().unwrap();

    thread::scope(|s| {
        let v = s.spawn(|| half_second_gops(6).push_all(&video));
        let t = s.spawn(|| {
            subtitle.push_segment(Segment::new())?;
            subtitle.push_buffer(Buffer::new(vec![0xCC; 3]).pts(ClockTime::ZERO))?;
            subtitle.push_eos()
        });
        v.join().unwrap().unwrap();
        t.join().unwrap().unwrap();
    });
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let fragments = store.fragments();
    assert_eq!(fragments.len(), 3);
    assert!(fragments.iter().all(|f| f.finished));
    let subtitle_bytes: Vec<usize> = fragments
        .iter()
        .map(|f| f.data.iter().filter(|&&b| b == 0xCC).count())
        .collect();
    assert_eq!(subtitle_bytes, vec![3, 0, 0]);
}

#[test]
fn queues_grow_instead_of_stalling() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig {
        max_size_time: ClockTime::from_seconds(1),
        queue_max_buffers: 1,
        ..Default::default()
    });
    let video = sink.request_stream(StreamKind::Video).unwrap();
    let audio = sink.request_stream(StreamKind::Audio).unwrap();
    sink.start().unwrap();

    let pattern = VideoPattern {
        frame_size: 10,
        ..half_second_gops(8)
    };
    thread::scope(|s| {
        let v = s.spawn(|| pattern.push_all(&video));
        let a = s.spawn(|| {
            push_filled(
                &audio,
                ClockTime::from_seconds(4),
                ClockTime::from_mseconds(10),
                1,
                0xAA,
            )
        });
        v.join().unwrap().unwrap();
        a.join().unwrap().unwrap();
    });
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let fragments = store.fragments();
    assert_eq!(fragments.len(), 4);
    let total: usize = fragments.iter().map(|f| f.data.len()).sum();
    assert_eq!(total, 8 * 5 * 10 + 400);
}

#[test]
fn flush_start_releases_a_waiting_producer() {
    init_tracing();
    let (sink, _store) = memory_sink(SplitMuxConfig::default());
    let video = sink.request_stream(StreamKind::Video).unwrap();
    let audio = sink.request_stream(StreamKind::Audio).unwrap();
    sink.start().unwrap();

    video.push_segment(Segment::new()).unwrap();
    video
        .push_buffer(Buffer::with_size(10).pts(ClockTime::ZERO))
        .unwrap();

    let res = thread::scope(|s| {
        // Audio at the reference's high-water mark waits for more video
        let a = s.spawn(|| {
            audio.push_segment(Segment::new())?;
            audio.push_buffer(Buffer::with_size(2).pts(ClockTime::ZERO))
        });
        thread::sleep(std::time::Duration::from_millis(100));
        audio.flush_start();
        a.join().unwrap()
    });
    assert!(matches!(res, Err(FlowError::Flushing)));

    audio.flush_stop();
    sink.stop();
}

#[test]
fn writer_failure_is_fatal() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig::default());
    store.fail_after(250);
    let events = sink.subscribe();
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    // Later pushes may already see the error; only the outcome matters here
    let _ = half_second_gops(4).push_all(&video);

    let err = sink.wait_for_eos(EOS_TIMEOUT).unwrap_err();
    assert!(matches!(err, SplitMuxError::Downstream { ref element, .. } if element == "muxer"));
    assert!(sink.error().is_some());
    assert!(
        drain_events(&events)
            .iter()
            .any(|e| matches!(e, SplitMuxEvent::Error(SplitMuxError::Downstream { .. })))
    );
    assert!(matches!(
        video.push_buffer(Buffer::with_size(1).pts(ClockTime::from_seconds(5))),
        Err(FlowError::Error(_))
    ));
    sink.stop();
}

#[test]
fn reference_ending_without_data_is_an_error() {
    init_tracing();
    let (sink, _store) = memory_sink(SplitMuxConfig::default());
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    video.push_segment(Segment::new()).unwrap();
    let res = video.push_eos();
    assert!(matches!(res, Err(FlowError::Error(SplitMuxError::NoData))));
    assert!(matches!(
        sink.wait_for_eos(EOS_TIMEOUT),
        Err(SplitMuxError::NoData)
    ));
}

#[test]
fn async_finalize_uses_a_writer_per_fragment() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig {
        location: Some("part%02d.bin".into()),
        max_size_time: ClockTime::from_seconds(1),
        async_finalize: true,
        ..Default::default()
    });
    let events = sink.subscribe();
    let video = sink.request_stream(StreamKind::Video).unwrap();
    let audio = sink.request_stream(StreamKind::Audio).unwrap();
    sink.start().unwrap();

    thread::scope(|s| {
        let v = s.spawn(|| half_second_gops(6).push_all(&video));
        let a = s.spawn(|| {
            push_filled(
                &audio,
                ClockTime::from_seconds(3),
                ClockTime::from_mseconds(20),
                2,
                0xAA,
            )
        });
        v.join().unwrap().unwrap();
        a.join().unwrap().unwrap();
    });
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let mut fragments = store.fragments();
    fragments.sort_by_key(|f| f.writer_id);
    assert_eq!(fragments.len(), 3);
    let mut audio_bytes = 0;
    for (n, fragment) in fragments.iter().enumerate() {
        assert_eq!(fragment.writer_id, n as u32);
        assert!(fragment.finished);
        assert_eq!(
            fragment.location,
            Some(PathBuf::from(format!("part{n:02}.bin")))
        );
        audio_bytes += fragment.data.iter().filter(|&&b| b == 0xAA).count();
        let video: Vec<u8> = fragment.data.iter().copied().filter(|&b| b != 0xAA).collect();
        let first = (n * 2) as u8;
        assert_eq!(gops_in(&video), vec![first, first + 1]);
    }
    assert_eq!(audio_bytes, 300);

    let journal = store.journal();
    let position = |id: u32, op: &WriterOp| {
        journal
            .iter()
            .position(|(w, o)| *w == id && o == op)
            .unwrap()
    };
    for id in 0..3u32 {
        let location = Some(PathBuf::from(format!("part{id:02}.bin")));
        let started = position(id, &WriterOp::Started { location });
        let finished = position(id, &WriterOp::Finished);
        assert!(started < finished, "writer {id} finished before starting");
        let finishes = journal
            .iter()
            .filter(|(w, o)| *w == id && *o == WriterOp::Finished)
            .count();
        assert_eq!(finishes, 1);

        // A writer is only torn down once it finished and its successor runs
        let stopped = position(id, &WriterOp::Stopped);
        assert!(finished < stopped, "writer {id} stopped before finishing");
        if id < 2 {
            let next = Some(PathBuf::from(format!("part{:02}.bin", id + 1)));
            let next_started = position(id + 1, &WriterOp::Started { location: next });
            assert!(
                next_started < stopped,
                "writer {id} stopped before writer {} started",
                id + 1
            );
        }
    }

    let writers: Vec<String> = drain_events(&events)
        .into_iter()
        .filter_map(|e| match e {
            SplitMuxEvent::WriterAdded { name } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(writers, vec!["writer", "writer_1", "writer_2"]);
}

#[test]
fn file_fragments_wrap_at_max_files() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let pattern = dir.path().join("frag%02d.raw");
    let sink = SplitMuxSink::new(SplitMuxConfig {
        location: Some(pattern.to_string_lossy().into_owned()),
        max_size_time: ClockTime::from_seconds(1),
        max_files: 2,
        ..Default::default()
    })
    .unwrap();
    let events = sink.subscribe();
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    half_second_gops(6).push_all(&video).unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let closed = closed_fragments(&drain_events(&events));
    let ids: Vec<u32> = closed.iter().map(|i| i.fragment_id).collect();
    assert_eq!(ids, vec![0, 1, 0]);
    assert_eq!(closed[2].location, Some(dir.path().join("frag00.raw")));

    let mut files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, vec!["frag00.raw", "frag01.raw"]);

    let first = std::fs::read(dir.path().join("frag00.raw")).unwrap();
    let second = std::fs::read(dir.path().join("frag01.raw")).unwrap();
    // The third fragment replaced the first one
    assert_eq!(gops_in(&first), vec![4, 5]);
    assert_eq!(gops_in(&second), vec![2, 3]);
}

#[test]
fn keyframe_requests_follow_the_time_limit() {
    init_tracing();
    let (sink, _store) = memory_sink(SplitMuxConfig {
        max_size_time: ClockTime::from_seconds(2),
        send_keyframe_requests: true,
        ..Default::default()
    });
    let events = sink.subscribe();
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    half_second_gops(10).push_all(&video).unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let requests: Vec<(ClockTime, bool)> = drain_events(&events)
        .into_iter()
        .filter_map(|e| match e {
            SplitMuxEvent::ForceKeyUnit {
                running_time,
                all_headers,
            } => Some((running_time, all_headers)),
            _ => None,
        })
        .collect();
    assert_eq!(
        requests,
        vec![
            (ClockTime::from_seconds(2), true),
            (ClockTime::from_seconds(4), true),
            (ClockTime::from_seconds(6), true),
        ]
    );
}

#[test]
fn timecode_limit_cuts_on_timecode_distance() {
    init_tracing();
    let (sink, store) = memory_sink(SplitMuxConfig {
        max_size_timecode: Some("00:00:03:00".into()),
        ..Default::default()
    });
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    // One-second GOPs at 25 fps with a running timecode
    let pattern = VideoPattern {
        gops: 7,
        frames_per_gop: 25,
        frame_duration: ClockTime::from_mseconds(40),
        frame_size: 4,
    };
    let tc0 = VideoTimeCode::new(25, 1, false, 0, 0, 0, 0).unwrap();
    video.push_segment(Segment::new()).unwrap();
    for i in 0..pattern.frame_count() {
        let frame = pattern.frame(i).timecode(tc0.add_frames(i as i64));
        video.push_buffer(frame).unwrap();
    }
    video.push_eos().unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    assert_eq!(
        fragment_gops(&store),
        vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
    );
}

#[test]
fn events_follow_the_fragment_lifecycle() {
    init_tracing();
    let store = MemoryStore::new();
    let mut registry = ElementRegistry::with_defaults();
    registry.register_writer("memory", store.factory());
    let sink = SplitMuxSink::builder(SplitMuxConfig {
        max_size_time: ClockTime::from_seconds(1),
        writer: ElementConfig::new("memory"),
        ..Default::default()
    })
    .registry(registry)
    .format_location(|index, sample| {
        let pts = sample.buffer.as_ref()?.pts?;
        Some(PathBuf::from(format!("cb-{index}-{}", pts.mseconds())))
    })
    .build()
    .unwrap();
    let events = sink.subscribe();
    let video = sink.request_stream(StreamKind::Video).unwrap();
    sink.start().unwrap();

    half_second_gops(4).push_all(&video).unwrap();
    sink.wait_for_eos(EOS_TIMEOUT).unwrap();
    sink.stop();

    let events = drain_events(&events);
    let summary: Vec<String> = events
        .iter()
        .map(|e| match e {
            SplitMuxEvent::WriterAdded { name } => format!("writer-added {name}"),
            SplitMuxEvent::MuxerAdded { name } => format!("muxer-added {name}"),
            SplitMuxEvent::FragmentOpened(info) => format!(
                "opened {} {}",
                info.fragment_id,
                info.location.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
            ),
            SplitMuxEvent::FragmentClosed(info) => format!("closed {}", info.fragment_id),
            SplitMuxEvent::ForceKeyUnit { .. } => "force-key-unit".to_string(),
            SplitMuxEvent::Eos => "eos".to_string(),
            SplitMuxEvent::Error(err) => format!("error {err}"),
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            "writer-added writer",
            "muxer-added muxer",
            "opened 0 cb-0-0",
            "closed 0",
            "opened 1 cb-1-1000",
            "closed 1",
            "eos",
        ]
    );
}
