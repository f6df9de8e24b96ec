//! Per-stream state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{Buffer, Gap, StreamKind};
use crate::queue::DataQueue;
use crate::segment::Segment;
use crate::sink::fragment::MuxChain;

/// Identifier of a stream within one sink.
pub type StreamId = u32;

/// What the input side recorded about a queued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferRecord {
    pub size: usize,
    pub run_ts: Option<i64>,
    pub duration: Option<u64>,
    pub keyframe: bool,
}

/// The muxer pad a stream currently feeds.
#[derive(Clone)]
pub(crate) struct PeerLink {
    pub chain: Arc<MuxChain>,
    pub pad: String,
}

/// State shared with the stream's worker threads outside the primary lock.
pub(crate) struct StreamShared {
    pub id: StreamId,
    pub name: String,
    pub kind: StreamKind,
    /// Requested muxer pad name from the pad map
    pub mapped_pad: Option<String>,
    pub queue: DataQueue,
    pub peer: Mutex<Option<PeerLink>>,
    /// Serializes data and serialized events coming from the producer
    pub stream_lock: Mutex<()>,
}

impl StreamShared {
    pub(crate) fn new(
        id: StreamId,
        name: String,
        kind: StreamKind,
        mapped_pad: Option<String>,
        queue_max_buffers: usize,
    ) -> Self {
        Self {
            id,
            queue: DataQueue::new(name.clone(), queue_max_buffers),
            name,
            kind,
            mapped_pad,
            peer: Mutex::new(None),
            stream_lock: Mutex::new(()),
        }
    }

    pub(crate) fn peer(&self) -> Option<PeerLink> {
        self.peer.lock().clone()
    }

    pub(crate) fn set_peer(&self, peer: Option<PeerLink>) -> Option<PeerLink> {
        std::mem::replace(&mut *self.peer.lock(), peer)
    }
}

impl fmt::Debug for StreamShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamShared")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mapped_pad", &self.mapped_pad)
            .finish_non_exhaustive()
    }
}

/// Stream state guarded by the primary lock.
#[derive(Debug)]
pub(crate) struct StreamCtx {
    pub id: StreamId,
    pub shared: Arc<StreamShared>,
    pub is_reference: bool,

    pub in_segment: Option<Segment>,
    pub out_segment: Option<Segment>,

    pub in_running_time: Option<i64>,
    pub out_running_time: Option<i64>,
    /// End of the last released buffer, for fragment duration
    pub out_running_time_end: Option<i64>,
    pub out_fragment_start_runts: Option<i64>,

    pub queued_bufs: VecDeque<BufferRecord>,

    pub flushing: bool,
    pub in_eos: bool,
    /// EOS was sent to the current muxer pad
    pub out_eos: bool,
    /// The stream's own end of stream went out, as opposed to a fragment end
    pub src_eos: bool,
    pub out_eos_async_done: bool,
    /// An unblock event must be queued before the stream waits again
    pub need_unblock: bool,
    pub pending_gap: Option<Gap>,

    /// Buffer being dispatched, kept for the location callback
    pub cur_out_buffer: Option<Buffer>,
}

impl StreamCtx {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self {
            id: shared.id,
            shared,
            is_reference: false,
            in_segment: None,
            out_segment: None,
            in_running_time: None,
            out_running_time: None,
            out_running_time_end: None,
            out_fragment_start_runts: None,
            queued_bufs: VecDeque::new(),
            flushing: false,
            in_eos: false,
            out_eos: false,
            src_eos: false,
            out_eos_async_done: false,
            need_unblock: false,
            pending_gap: None,
            cur_out_buffer: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    /// Clears everything learned from the stream, keeping its identity.
    pub(crate) fn reset(&mut self) {
        self.in_segment = None;
        self.out_segment = None;
        self.in_running_time = None;
        self.out_running_time = None;
        self.out_running_time_end = None;
        self.out_fragment_start_runts = None;
        self.queued_bufs.clear();
        self.flushing = false;
        self.in_eos = false;
        self.out_eos = false;
        self.src_eos = false;
        self.out_eos_async_done = false;
        self.need_unblock = false;
        self.pending_gap = None;
        self.cur_out_buffer = None;
    }

    /// Re-arms the output side for a fresh fragment.
    pub(crate) fn restart(&mut self) {
        self.out_eos = self.src_eos;
        self.out_eos_async_done = self.out_eos;
        self.out_fragment_start_runts = None;
    }
}
