//! The splitting sink.
//!
//! Data enters through a [`StreamHandle`] on the producer's thread. The input
//! side ([`input`]) attributes it to GOPs of the reference stream and decides
//! where fragments end. Each stream's data then waits in a per-stream queue
//! until an output worker ([`output`]) releases it to the current fragment's
//! muxer, in step with the commands issued by the input side.
//!
//! Locks are always taken in this order: the lifecycle lock, the state lock,
//! then any leaf lock (settings, a stream's queue or peer, a fragment chain,
//! the event bus).

pub(crate) mod fragment;
mod input;
mod output;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::buffer::{Buffer, Gap, Sample, StreamKind};
use crate::config::{SplitMuxConfig, parse_timecode_threshold};
use crate::context::{PeerLink, StreamCtx, StreamId, StreamShared};
use crate::element::ElementRegistry;
use crate::error::{ElementError, FlowError, FlowResult, SplitMuxError};
use crate::events::{EventBus, FragmentInfo, SplitMuxEvent};
use crate::gop::{CommandQueue, GopQueue};
use crate::location::FormatLocationFn;
use crate::queue::QueueItem;
use crate::segment::Segment;
use crate::time::ClockTime;
use crate::timecode::{TimeCodeInterval, VideoTimeCode};

use fragment::{Finalizer, MuxChain};

/// How long `stop` waits for background fragment finalization.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputState {
    Stopped,
    /// Waiting for the reference stream to start the next GOP
    CollectingGopStart,
    /// Waiting for every stream to pass the end of the GOP
    WaitingGopCollect,
    /// The reference stream ended; everything left is released
    FinishingUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputState {
    Stopped,
    AwaitingCommand,
    /// Releasing data up to the current bound
    OutputGop,
    /// Every stream must end the current fragment
    EndingFile,
    /// Every stream ended; the last fragment is being closed
    EndingStream,
    /// The reference stream opens the next fragment
    StartNextFile,
}

pub(crate) struct Settings {
    pub config: SplitMuxConfig,
    pub timecode: Option<TimeCodeInterval>,
}

/// Everything guarded by the state lock.
pub(crate) struct State {
    pub input_state: InputState,
    pub output_state: OutputState,
    pub contexts: Vec<StreamCtx>,

    pub pending_input_gops: GopQueue,
    pub out_cmd_q: CommandQueue,

    /// Highest running time seen on the reference stream, by PTS and by DTS
    pub max_in_running_time: Option<i64>,
    pub max_in_running_time_dts: Option<i64>,
    /// Data up to this running time may be released
    pub max_out_running_time: Option<i64>,

    pub fragment_start_time: Option<i64>,
    pub fragment_start_time_pts: Option<i64>,
    pub fragment_start_tc: Option<VideoTimeCode>,
    pub next_fragment_start_tc_time: Option<i64>,
    pub next_fku_time: Option<i64>,

    pub fragment_total_bytes: u64,
    pub fragment_reference_bytes: u64,
    pub muxed_out_bytes: u64,
    /// Keyframes of the reference stream sitting in its queue
    pub queued_keyframes: u32,

    pub out_start_runts: Option<i64>,
    pub out_fragment_start_runts: Option<i64>,
    pub out_fragment_info: FragmentInfo,

    pub start_index: u32,
    pub cur_fragment_id: u32,
    pub next_fragment_id: u32,

    pub ready_for_output: bool,
    pub switching_fragment: bool,
    pub do_split_next_gop: bool,
    pub split_requested: bool,
    pub times_to_split: VecDeque<i64>,

    pub muxer_has_reserved_props: bool,
    pub active_chain: u64,
    pub eos_posted: bool,
    pub error: Option<SplitMuxError>,

    next_stream_id: StreamId,
    stream_counters: HashMap<StreamKind, u32>,
}

impl State {
    fn new(start_index: u32) -> Self {
        Self {
            input_state: InputState::Stopped,
            output_state: OutputState::Stopped,
            contexts: Vec::new(),
            pending_input_gops: GopQueue::default(),
            out_cmd_q: CommandQueue::default(),
            max_in_running_time: None,
            max_in_running_time_dts: None,
            max_out_running_time: None,
            fragment_start_time: None,
            fragment_start_time_pts: None,
            fragment_start_tc: None,
            next_fragment_start_tc_time: None,
            next_fku_time: None,
            fragment_total_bytes: 0,
            fragment_reference_bytes: 0,
            muxed_out_bytes: 0,
            queued_keyframes: 0,
            out_start_runts: None,
            out_fragment_start_runts: None,
            out_fragment_info: FragmentInfo::default(),
            start_index,
            cur_fragment_id: start_index,
            next_fragment_id: start_index,
            ready_for_output: false,
            switching_fragment: false,
            do_split_next_gop: false,
            split_requested: false,
            times_to_split: VecDeque::new(),
            muxer_has_reserved_props: false,
            active_chain: 0,
            eos_posted: false,
            error: None,
            next_stream_id: 0,
            stream_counters: HashMap::new(),
        }
    }

    /// Forgets everything about the previous session, keeping the streams
    /// and any split requests queued for the next one.
    pub(crate) fn reset(&mut self, start_index: u32) {
        self.max_in_running_time = None;
        self.max_in_running_time_dts = None;
        self.max_out_running_time = None;
        self.fragment_start_time = None;
        self.fragment_start_time_pts = None;
        self.fragment_start_tc = None;
        self.next_fragment_start_tc_time = None;
        self.next_fku_time = None;
        self.pending_input_gops.clear();
        self.out_cmd_q.clear();
        self.fragment_total_bytes = 0;
        self.fragment_reference_bytes = 0;
        self.muxed_out_bytes = 0;
        self.queued_keyframes = 0;
        self.out_start_runts = None;
        self.out_fragment_start_runts = None;
        self.out_fragment_info = FragmentInfo::default();
        self.ready_for_output = false;
        self.switching_fragment = false;
        self.eos_posted = false;
        self.error = None;
        self.start_index = start_index;
        self.cur_fragment_id = start_index;
        self.next_fragment_id = start_index;
        for ctx in &mut self.contexts {
            ctx.reset();
        }
    }

    pub(crate) fn index_of(&self, id: StreamId) -> Result<usize, FlowError> {
        self.contexts
            .iter()
            .position(|c| c.id == id)
            .ok_or(FlowError::Flushing)
    }

    pub(crate) fn reference(&self) -> Option<&StreamCtx> {
        self.contexts.iter().find(|c| c.is_reference)
    }
}

pub(crate) struct Lifecycle {
    running: bool,
    shutdown: bool,
    /// The chain new streams are linked to
    chain: Option<Arc<MuxChain>>,
    workers: Vec<(StreamId, JoinHandle<()>)>,
    next_serial: u64,
}

pub(crate) struct Inner {
    weak_self: Weak<Inner>,
    settings: Mutex<Settings>,
    state: Mutex<State>,
    /// Signalled whenever input-side progress may unblock a producer
    input_cond: Condvar,
    /// Signalled whenever output-side progress may unblock a worker
    output_cond: Condvar,
    lifecycle: Mutex<Lifecycle>,
    registry: ElementRegistry,
    format_location: Option<FormatLocationFn>,
    events: EventBus,
    finalizer: Finalizer,
}

impl Inner {
    pub(crate) fn post(&self, event: SplitMuxEvent) {
        self.events.post(event);
    }

    /// Records the first fatal error and wakes everyone.
    pub(crate) fn post_error_locked(&self, state: &mut State, err: SplitMuxError) {
        if state.error.is_some() {
            return;
        }
        error!(error = %err, "Splitting failed");
        state.error = Some(err.clone());
        for ctx in &state.contexts {
            ctx.shared.queue.set_error(FlowError::Error(err.clone()));
        }
        self.post(SplitMuxEvent::Error(err));
        self.input_cond.notify_all();
        self.output_cond.notify_all();
    }

    pub(crate) fn post_error(&self, err: SplitMuxError) {
        let mut state = self.state.lock();
        self.post_error_locked(&mut state, err);
    }

    pub(crate) fn post_eos(&self, state: &mut State) {
        info!("All streams finished");
        state.eos_posted = true;
        self.post(SplitMuxEvent::Eos);
        self.output_cond.notify_all();
    }

    /// Builds a chain for fragment `index` and announces its elements.
    fn create_chain(
        &self,
        lc: &mut Lifecycle,
        index: u32,
        initial: bool,
    ) -> Result<Arc<MuxChain>, SplitMuxError> {
        let (writer_cfg, muxer_cfg, robust, max_time) = {
            let settings = self.settings.lock();
            let config = &settings.config;
            (
                config.writer.clone(),
                config.muxer.clone(),
                config.use_robust_muxing,
                config.max_size_time,
            )
        };
        let (writer_name, muxer_name) = if initial {
            ("writer".to_string(), "muxer".to_string())
        } else {
            (format!("writer_{index}"), format!("muxer_{index}"))
        };

        let writer = self.registry.make_writer(&writer_cfg, &writer_name)?;
        self.post(SplitMuxEvent::WriterAdded {
            name: writer_name.clone(),
        });
        let muxer = self.registry.make_muxer(&muxer_cfg, &muxer_name)?;
        self.post(SplitMuxEvent::MuxerAdded {
            name: muxer_name.clone(),
        });

        let serial = lc.next_serial;
        lc.next_serial += 1;
        let chain = Arc::new(MuxChain::new(serial, muxer_name, writer_name, muxer, writer));
        let has_reserved = apply_robust_muxing(&chain, robust, max_time);
        self.state.lock().muxer_has_reserved_props = has_reserved;
        Ok(chain)
    }

    /// Requests a pad on `chain` for every stream and repoints them at it.
    fn relink_streams(&self, chain: &Arc<MuxChain>) -> Result<(), SplitMuxError> {
        let streams: Vec<Arc<StreamShared>> = self
            .state
            .lock()
            .contexts
            .iter()
            .map(|c| Arc::clone(&c.shared))
            .collect();
        for shared in streams {
            link_stream(&shared, chain)?;
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, shared: Arc<StreamShared>) -> Result<JoinHandle<()>, SplitMuxError> {
        let inner = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("splitmux-{}", shared.name))
            .spawn(move || inner.output_loop(shared))
            .map_err(|e| SplitMuxError::creation("output worker", ElementError::Io(e)))
    }

    fn start(self: &Arc<Self>) -> Result<(), SplitMuxError> {
        let mut lc = self.lifecycle.lock();
        if lc.running {
            return Ok(());
        }
        let start_index = {
            let settings = self.settings.lock();
            settings.config.validate()?;
            settings.config.start_index
        };

        let chain = self.create_chain(&mut lc, start_index, true)?;
        let streams = {
            let mut state = self.state.lock();
            state.reset(start_index);
            state.input_state = InputState::CollectingGopStart;
            state.output_state = OutputState::StartNextFile;
            state.active_chain = chain.serial;
            state
                .contexts
                .iter()
                .map(|c| Arc::clone(&c.shared))
                .collect::<Vec<_>>()
        };
        for shared in &streams {
            shared.queue.restart();
            link_stream(shared, &chain)?;
        }

        lc.chain = Some(chain);
        lc.shutdown = false;
        lc.running = true;
        for shared in streams {
            let id = shared.id;
            let handle = self.spawn_worker(shared)?;
            lc.workers.push((id, handle));
        }
        info!(start_index, "Sink started");
        Ok(())
    }

    fn stop(&self) {
        let (workers, streams) = {
            let mut lc = self.lifecycle.lock();
            if !lc.running {
                return;
            }
            lc.running = false;
            lc.shutdown = true;

            let mut state = self.state.lock();
            state.input_state = InputState::Stopped;
            state.output_state = OutputState::Stopped;
            state.do_split_next_gop = false;
            state.split_requested = false;
            state.times_to_split.clear();
            for ctx in &state.contexts {
                ctx.shared.queue.shutdown();
            }
            self.input_cond.notify_all();
            self.output_cond.notify_all();

            lc.chain = None;
            let streams: Vec<_> = state.contexts.iter().map(|c| Arc::clone(&c.shared)).collect();
            (std::mem::take(&mut lc.workers), streams)
        };

        for (id, worker) in workers {
            if worker.join().is_err() {
                warn!(stream = id, "Output worker panicked");
            }
        }
        self.finalizer.drain(FINALIZE_TIMEOUT);

        let mut destroyed: Vec<u64> = Vec::new();
        for shared in streams {
            if let Some(peer) = shared.set_peer(None)
                && !destroyed.contains(&peer.chain.serial)
            {
                destroyed.push(peer.chain.serial);
                peer.chain.destroy();
            }
        }
        info!("Sink stopped");
    }

    fn request_stream(self: &Arc<Self>, kind: StreamKind) -> Result<StreamHandle, SplitMuxError> {
        let mut lc = self.lifecycle.lock();
        let mut state = self.state.lock();

        if kind == StreamKind::Video && state.contexts.iter().any(|c| c.kind() == StreamKind::Video)
        {
            return Err(SplitMuxError::Request(
                "only one primary video stream is allowed".into(),
            ));
        }

        let name = if kind == StreamKind::Video {
            kind.prefix().to_string()
        } else {
            let counter = state.stream_counters.entry(kind).or_insert(0);
            let name = format!("{}_{}", kind.prefix(), *counter);
            *counter += 1;
            name
        };
        let (mapped_pad, queue_max) = {
            let settings = self.settings.lock();
            (
                settings.config.muxer_pad_map.get(&name).cloned(),
                settings.config.queue_max_buffers,
            )
        };
        let id = state.next_stream_id;
        state.next_stream_id += 1;
        let shared = Arc::new(StreamShared::new(id, name, kind, mapped_pad, queue_max));

        if let Some(chain) = &lc.chain {
            link_stream(&shared, chain)?;
        }

        let mut ctx = StreamCtx::new(Arc::clone(&shared));
        if kind == StreamKind::Video {
            for other in &mut state.contexts {
                other.is_reference = false;
            }
            ctx.is_reference = true;
        } else if state.reference().is_none() {
            ctx.is_reference = true;
        }
        debug!(stream = %shared.name, reference = ctx.is_reference, "Stream requested");
        state.contexts.push(ctx);
        drop(state);

        if lc.running {
            shared.queue.restart();
            let handle = self.spawn_worker(Arc::clone(&shared))?;
            lc.workers.push((id, handle));
        }

        Ok(StreamHandle {
            inner: Arc::clone(self),
            shared,
        })
    }

    fn release_stream(&self, id: StreamId) -> Result<(), SplitMuxError> {
        let (shared, worker) = {
            let mut lc = self.lifecycle.lock();
            let mut state = self.state.lock();
            let idx = state
                .index_of(id)
                .map_err(|_| SplitMuxError::Request(format!("unknown stream {id}")))?;

            let ctx = state.contexts.remove(idx);
            ctx.shared.queue.shutdown();
            if ctx.is_reference {
                let promoted = state
                    .contexts
                    .iter()
                    .position(|c| c.kind().is_video())
                    .or_else(|| (!state.contexts.is_empty()).then_some(0));
                if let Some(p) = promoted {
                    state.contexts[p].is_reference = true;
                    info!(stream = %state.contexts[p].name(), "New reference stream");
                }
            }
            self.input_cond.notify_all();
            self.output_cond.notify_all();

            let worker = lc
                .workers
                .iter()
                .position(|(w, _)| *w == id)
                .map(|pos| lc.workers.remove(pos).1);
            (ctx.shared, worker)
        };

        if let Some(worker) = worker
            && worker.join().is_err()
        {
            warn!(stream = %shared.name, "Output worker panicked");
        }
        // Wait for a producer still inside the stream
        drop(shared.stream_lock.lock());

        if let Some(peer) = shared.set_peer(None) {
            peer.chain.release_pad(&peer.pad);
        }
        debug!(stream = %shared.name, "Stream released");
        self.input_cond.notify_all();
        Ok(())
    }
}

fn link_stream(shared: &StreamShared, chain: &Arc<MuxChain>) -> Result<(), SplitMuxError> {
    let pad = chain
        .request_pad(shared.kind, shared.mapped_pad.as_deref())
        .map_err(|e| SplitMuxError::Link {
            stream: shared.name.clone(),
            element: chain.muxer_name.clone(),
            source: Arc::new(e),
        })?;
    shared.set_peer(Some(PeerLink {
        chain: Arc::clone(chain),
        pad,
    }));
    Ok(())
}

/// Configures reserved header space; returns whether the muxer supports it.
fn apply_robust_muxing(chain: &MuxChain, enabled: bool, max_time: ClockTime) -> bool {
    let supported = chain.supports_reserved_duration();
    if !enabled {
        return supported;
    }
    if !supported {
        warn!(muxer = %chain.muxer_name, "Robust muxing requested but the muxer cannot reserve header space");
        return false;
    }
    if let Err(e) = chain.set_reserved_max_duration(max_time) {
        warn!(muxer = %chain.muxer_name, error = %e, "Could not set reserved duration");
    }
    true
}

/// Splits several synchronized streams into consecutive fragment files.
///
/// Cuts always happen at a keyframe of the reference stream (the primary
/// video stream, or the first stream requested). Every other stream is cut at
/// the same running time, so each fragment starts cleanly decodable.
///
/// ```no_run
/// use splitmux::{Buffer, ClockTime, Segment, SplitMuxConfig, SplitMuxSink, StreamKind};
///
/// let config = SplitMuxConfig {
///     location: Some("video%05d.raw".into()),
///     max_size_time: ClockTime::from_seconds(10),
///     ..Default::default()
/// };
/// let sink = SplitMuxSink::new(config)?;
/// let video = sink.request_stream(StreamKind::Video)?;
/// sink.start()?;
///
/// video.push_segment(Segment::new())?;
/// video.push_buffer(Buffer::new(vec![0u8; 1024]).pts(ClockTime::ZERO))?;
/// video.push_eos()?;
/// sink.wait_for_eos(std::time::Duration::from_secs(5))?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SplitMuxSink {
    inner: Arc<Inner>,
}

/// Builds a [`SplitMuxSink`] with a custom registry or location callback.
pub struct SplitMuxSinkBuilder {
    config: SplitMuxConfig,
    registry: ElementRegistry,
    format_location: Option<FormatLocationFn>,
}

impl SplitMuxSinkBuilder {
    pub fn new(config: SplitMuxConfig) -> Self {
        Self {
            config,
            registry: ElementRegistry::with_defaults(),
            format_location: None,
        }
    }

    pub fn registry(mut self, registry: ElementRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Names fragments from their index and first reference buffer.
    pub fn format_location<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &Sample) -> Option<PathBuf> + Send + Sync + 'static,
    {
        self.format_location = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<SplitMuxSink, SplitMuxError> {
        self.config.validate()?;
        for (kind, factory, present) in [
            (
                "muxer",
                &self.config.muxer.factory,
                self.registry.has_muxer(&self.config.muxer.factory),
            ),
            (
                "writer",
                &self.config.writer.factory,
                self.registry.has_writer(&self.config.writer.factory),
            ),
        ] {
            if !present {
                return Err(SplitMuxError::MissingFactory {
                    kind,
                    factory: factory.clone(),
                });
            }
        }

        let finalizer = Finalizer::new()?;
        let timecode = self.config.timecode_interval();
        let start_index = self.config.start_index;
        let inner = Arc::new_cyclic(|weak| Inner {
            weak_self: weak.clone(),
            settings: Mutex::new(Settings {
                config: self.config,
                timecode,
            }),
            state: Mutex::new(State::new(start_index)),
            input_cond: Condvar::new(),
            output_cond: Condvar::new(),
            lifecycle: Mutex::new(Lifecycle {
                running: false,
                shutdown: false,
                chain: None,
                workers: Vec::new(),
                next_serial: 0,
            }),
            registry: self.registry,
            format_location: self.format_location,
            events: EventBus::default(),
            finalizer,
        });
        Ok(SplitMuxSink { inner })
    }
}

impl SplitMuxSink {
    pub fn new(config: SplitMuxConfig) -> Result<Self, SplitMuxError> {
        Self::builder(config).build()
    }

    pub fn builder(config: SplitMuxConfig) -> SplitMuxSinkBuilder {
        SplitMuxSinkBuilder::new(config)
    }

    /// Receives every event posted from now on.
    pub fn subscribe(&self) -> Receiver<SplitMuxEvent> {
        self.inner.events.subscribe()
    }

    /// Adds an input stream. Works before and after [`start`](Self::start).
    pub fn request_stream(&self, kind: StreamKind) -> Result<StreamHandle, SplitMuxError> {
        self.inner.request_stream(kind)
    }

    /// Removes a stream; its handle fails with [`FlowError::Flushing`] afterwards.
    pub fn release_stream(&self, stream: &StreamHandle) -> Result<(), SplitMuxError> {
        self.inner.release_stream(stream.id())
    }

    /// Name of the stream fragments are cut on.
    pub fn reference_stream(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .reference()
            .map(|c| c.name().to_string())
    }

    pub fn start(&self) -> Result<(), SplitMuxError> {
        self.inner.start()
    }

    /// Stops every worker and closes the open fragment without finishing it.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Cuts before the GOP currently being collected, so it opens the next fragment.
    pub fn split_now(&self) {
        self.inner.state.lock().do_split_next_gop = true;
    }

    /// Cuts after the GOP currently being collected.
    pub fn split_after(&self) {
        self.inner.state.lock().split_requested = true;
    }

    /// Cuts at the first keyframe at or after `running_time`.
    ///
    /// Times must be queued in ascending order; earlier ones are ignored.
    /// Requests made before [`start`](Self::start) apply to the session it
    /// begins; [`stop`](Self::stop) discards whatever is still queued.
    pub fn split_at_running_time(&self, running_time: ClockTime) {
        let t = running_time.as_stime();
        {
            let mut state = self.inner.state.lock();
            if state.times_to_split.back().is_some_and(|&last| t < last) {
                warn!(%running_time, "Ignoring split time earlier than one already queued");
                return;
            }
            state.times_to_split.push_back(t);
        }
        if self.inner.settings.lock().config.send_keyframe_requests {
            self.inner.post(SplitMuxEvent::ForceKeyUnit {
                running_time,
                all_headers: true,
            });
        }
    }

    pub fn set_max_size_bytes(&self, bytes: u64) {
        self.inner.settings.lock().config.max_size_bytes = bytes;
    }

    pub fn set_max_size_time(&self, time: ClockTime) {
        self.inner.settings.lock().config.max_size_time = time;
    }

    /// Sets the timecode threshold (`HH:MM:SS:FF`); malformed values disable it.
    pub fn set_max_size_timecode(&self, timecode: Option<&str>) {
        let interval = parse_timecode_threshold(timecode);
        let mut settings = self.inner.settings.lock();
        settings.config.max_size_timecode = timecode.map(str::to_string);
        settings.timecode = interval;
    }

    pub fn set_muxer_overhead(&self, overhead: f64) {
        if !overhead.is_finite() || overhead < 0.0 {
            warn!(overhead, "Ignoring invalid muxer overhead");
            return;
        }
        self.inner.settings.lock().config.muxer_overhead = overhead;
    }

    pub fn set_alignment_threshold(&self, threshold: ClockTime) {
        self.inner.settings.lock().config.alignment_threshold = threshold;
    }

    pub fn set_max_files(&self, max_files: u32) {
        self.inner.settings.lock().config.max_files = max_files;
    }

    pub fn set_send_keyframe_requests(&self, enabled: bool) {
        self.inner.settings.lock().config.send_keyframe_requests = enabled;
    }

    /// Takes effect on the current muxer and every later one.
    pub fn set_use_robust_muxing(&self, enabled: bool) {
        let max_time = {
            let mut settings = self.inner.settings.lock();
            settings.config.use_robust_muxing = enabled;
            settings.config.max_size_time
        };
        let lc = self.inner.lifecycle.lock();
        if let Some(chain) = &lc.chain {
            let has_reserved = apply_robust_muxing(chain, enabled, max_time);
            self.inner.state.lock().muxer_has_reserved_props = has_reserved;
        }
    }

    /// A snapshot of the current configuration, runtime changes included.
    pub fn config(&self) -> SplitMuxConfig {
        self.inner.settings.lock().config.clone()
    }

    /// The first fatal error, if any.
    pub fn error(&self) -> Option<SplitMuxError> {
        self.inner.state.lock().error.clone()
    }

    /// Blocks until the last fragment is closed or a fatal error occurs.
    pub fn wait_for_eos(&self, timeout: Duration) -> Result<(), SplitMuxError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            if state.eos_posted {
                return Ok(());
            }
            if self
                .inner
                .output_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &state.error {
                    Some(err) => Err(err.clone()),
                    None if state.eos_posted => Ok(()),
                    None => Err(SplitMuxError::Timeout),
                };
            }
        }
    }
}

impl Drop for SplitMuxSink {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

/// The producer side of one input stream.
///
/// Calls block while the sink is collecting other streams or while the
/// stream's queue is full. Data must be pushed from a single thread per
/// stream, in the order it should be muxed.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<Inner>,
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    /// The muxer pad this stream currently feeds.
    pub fn muxer_pad(&self) -> Option<String> {
        self.shared.peer().map(|p| p.pad)
    }

    pub fn push_segment(&self, segment: Segment) -> FlowResult {
        let _stream = self.shared.stream_lock.lock();
        self.inner.input_segment(self.shared.id, &segment)?;
        self.shared.queue.push_event(QueueItem::Segment(segment))
    }

    pub fn push_buffer(&self, buffer: Buffer) -> FlowResult {
        let _stream = self.shared.stream_lock.lock();
        let id = self.shared.id;
        self.inner.input_buffer(id, &buffer)?;
        let inner = &self.inner;
        self.shared
            .queue
            .push_buffer(buffer, || inner.handle_queue_overrun(id))
    }

    pub fn push_gap(&self, gap: Gap) -> FlowResult {
        let _stream = self.shared.stream_lock.lock();
        self.inner.input_gap(self.shared.id, &gap)?;
        self.shared.queue.push_event(QueueItem::Gap(gap))
    }

    pub fn push_eos(&self) -> FlowResult {
        let _stream = self.shared.stream_lock.lock();
        self.inner.input_eos(self.shared.id)?;
        self.shared.queue.push_event(QueueItem::Eos)
    }

    /// Discards queued data and wakes a producer blocked in this stream.
    ///
    /// May be called from any thread.
    pub fn flush_start(&self) {
        self.inner.flush_start(self.shared.id);
        self.shared.queue.set_flushing(true);
    }

    pub fn flush_stop(&self) {
        let _stream = self.shared.stream_lock.lock();
        self.shared.queue.set_flushing(false);
        self.inner.flush_stop(self.shared.id);
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .finish()
    }
}

#[cfg(test)]
mod scenarios;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::memory_sink;

    #[test]
    fn video_always_becomes_the_reference() {
        let (sink, _) = memory_sink(SplitMuxConfig::default());
        let audio = sink.request_stream(StreamKind::Audio).unwrap();
        assert_eq!(audio.name(), "audio_0");
        assert_eq!(sink.reference_stream().as_deref(), Some("audio_0"));

        let video = sink.request_stream(StreamKind::Video).unwrap();
        assert_eq!(video.name(), "video");
        assert_eq!(sink.reference_stream().as_deref(), Some("video"));

        let err = sink.request_stream(StreamKind::Video).unwrap_err();
        assert!(matches!(err, SplitMuxError::Request(_)));
    }

    #[test]
    fn releasing_the_reference_promotes_video_first() {
        let (sink, _) = memory_sink(SplitMuxConfig::default());
        let video = sink.request_stream(StreamKind::Video).unwrap();
        let _audio = sink.request_stream(StreamKind::Audio).unwrap();
        let aux = sink.request_stream(StreamKind::VideoAux).unwrap();
        assert_eq!(aux.name(), "video_aux_0");

        sink.release_stream(&video).unwrap();
        assert_eq!(sink.reference_stream().as_deref(), Some("video_aux_0"));
        assert!(matches!(
            video.push_buffer(Buffer::with_size(1)),
            Err(FlowError::Flushing)
        ));
    }

    #[test]
    fn pad_map_names_muxer_pads() {
        let mut config = SplitMuxConfig::default();
        config
            .muxer_pad_map
            .insert("audio_0".into(), "english".into());
        let (sink, _) = memory_sink(config);
        let audio = sink.request_stream(StreamKind::Audio).unwrap();
        sink.start().unwrap();
        assert_eq!(audio.muxer_pad().as_deref(), Some("english"));
        sink.stop();
    }

    #[test]
    fn missing_factories_fail_the_build() {
        let config = SplitMuxConfig {
            writer: crate::config::ElementConfig::new("nowhere"),
            ..Default::default()
        };
        let err = SplitMuxSink::new(config).err().unwrap();
        assert!(matches!(
            err,
            SplitMuxError::MissingFactory { kind: "writer", .. }
        ));
    }

    #[test]
    fn split_requests_survive_start_and_are_dropped_by_stop() {
        let (sink, _) = memory_sink(SplitMuxConfig::default());
        let _video = sink.request_stream(StreamKind::Video).unwrap();
        sink.split_at_running_time(ClockTime::from_seconds(3));
        sink.split_after();
        sink.start().unwrap();
        {
            let state = sink.inner.state.lock();
            assert_eq!(
                state.times_to_split.iter().copied().collect::<Vec<_>>(),
                vec![ClockTime::from_seconds(3).as_stime()]
            );
            assert!(state.split_requested);
        }

        sink.split_now();
        sink.stop();
        let state = sink.inner.state.lock();
        assert!(state.times_to_split.is_empty());
        assert!(!state.split_requested);
        assert!(!state.do_split_next_gop);
    }

    #[test]
    fn data_before_start_is_refused() {
        let (sink, _) = memory_sink(SplitMuxConfig::default());
        let video = sink.request_stream(StreamKind::Video).unwrap();
        assert!(matches!(
            video.push_buffer(Buffer::with_size(1)),
            Err(FlowError::Flushing)
        ));
    }
}
