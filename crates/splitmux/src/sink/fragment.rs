//! Muxer/writer pairs and their teardown.
//!
//! Every fragment is produced by a [`MuxChain`]. In synchronous mode one chain
//! is reused for the whole session. With asynchronous finalization a fresh
//! chain is built for every fragment and the previous one finishes on the
//! [`Finalizer`] while new data already flows into its successor.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, Gap, StreamKind};
use crate::element::{Muxer, Writer};
use crate::error::{ElementError, SplitMuxError};
use crate::events::FragmentInfo;
use crate::segment::Segment;
use crate::time::ClockTime;

/// Where a retired chain is in its shutdown.
///
/// A chain is destroyed only after both its writer has seen end of stream and
/// every stream has been moved to the next chain. Whichever happens second
/// performs the teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TeardownState {
    Active,
    /// End of stream was scheduled on the chain's pads
    Draining,
    /// One of the two conditions has been met
    PendingDestroy,
    Destroyed,
}

struct PadState {
    name: String,
    eos: bool,
}

struct ChainElements {
    muxer: Box<dyn Muxer>,
    writer: Box<dyn Writer>,
    pads: Vec<PadState>,
    running: bool,
    finished: bool,
}

impl ChainElements {
    fn pad_mut(&mut self, pad: &str) -> Option<&mut PadState> {
        self.pads.iter_mut().find(|p| p.name == pad)
    }
}

/// One muxer feeding one writer.
pub(crate) struct MuxChain {
    pub serial: u64,
    pub muxer_name: String,
    pub writer_name: String,
    elements: Mutex<ChainElements>,
    teardown: Mutex<TeardownState>,
    closing_info: Mutex<Option<FragmentInfo>>,
}

impl MuxChain {
    pub(crate) fn new(
        serial: u64,
        muxer_name: String,
        writer_name: String,
        muxer: Box<dyn Muxer>,
        writer: Box<dyn Writer>,
    ) -> Self {
        Self {
            serial,
            muxer_name,
            writer_name,
            elements: Mutex::new(ChainElements {
                muxer,
                writer,
                pads: Vec::new(),
                running: false,
                finished: false,
            }),
            teardown: Mutex::new(TeardownState::Active),
            closing_info: Mutex::new(None),
        }
    }

    pub(crate) fn request_pad(
        &self,
        kind: StreamKind,
        name: Option<&str>,
    ) -> Result<String, ElementError> {
        let mut els = self.elements.lock();
        let pad = els.muxer.request_pad(kind, name)?;
        els.pads.push(PadState {
            name: pad.clone(),
            eos: false,
        });
        trace!(muxer = %self.muxer_name, pad, "Requested muxer pad");
        Ok(pad)
    }

    pub(crate) fn release_pad(&self, pad: &str) {
        let mut els = self.elements.lock();
        els.muxer.release_pad(pad);
        els.pads.retain(|p| p.name != pad);
    }

    pub(crate) fn set_location(&self, location: &Path) -> Result<(), SplitMuxError> {
        self.elements
            .lock()
            .writer
            .set_location(location)
            .map_err(|e| SplitMuxError::state_change(&self.writer_name, e))
    }

    pub(crate) fn location(&self) -> Option<PathBuf> {
        self.elements.lock().writer.location().map(Path::to_path_buf)
    }

    /// Opens the writer, then the muxer.
    pub(crate) fn start(&self) -> Result<(), SplitMuxError> {
        let mut els = self.elements.lock();
        els.writer
            .start()
            .map_err(|e| SplitMuxError::state_change(&self.writer_name, e))?;
        if let Err(e) = els.muxer.start() {
            els.writer.stop();
            return Err(SplitMuxError::state_change(&self.muxer_name, e));
        }
        for pad in &mut els.pads {
            pad.eos = false;
        }
        els.running = true;
        els.finished = false;
        debug!(muxer = %self.muxer_name, writer = %self.writer_name, "Fragment chain started");
        Ok(())
    }

    /// Returns a used chain to a startable state for the next fragment.
    pub(crate) fn prepare_next(&self, reset_muxer: bool) {
        let mut els = self.elements.lock();
        if !els.running {
            return;
        }
        if reset_muxer {
            els.muxer.reset();
        } else {
            els.muxer.flush();
        }
        els.writer.stop();
        els.running = false;
        els.finished = false;
        for pad in &mut els.pads {
            pad.eos = false;
        }
    }

    pub(crate) fn segment(&self, pad: &str, segment: &Segment) -> Result<(), SplitMuxError> {
        self.elements
            .lock()
            .muxer
            .segment(pad, segment)
            .map_err(|e| SplitMuxError::downstream(&self.muxer_name, e))
    }

    pub(crate) fn gap(&self, pad: &str, gap: &Gap) -> Result<(), SplitMuxError> {
        let mut els = self.elements.lock();
        if !els.running || els.pad_mut(pad).is_some_and(|p| p.eos) {
            return Ok(());
        }
        els.muxer
            .gap(pad, gap)
            .map_err(|e| SplitMuxError::downstream(&self.muxer_name, e))
    }

    pub(crate) fn push_buffer(&self, pad: &str, buffer: &Buffer) -> Result<(), SplitMuxError> {
        let mut guard = self.elements.lock();
        let els = &mut *guard;
        if !els.running {
            return Err(SplitMuxError::downstream(
                &self.muxer_name,
                ElementError::NotRunning,
            ));
        }
        if els.pad_mut(pad).is_some_and(|p| p.eos) {
            debug!(muxer = %self.muxer_name, pad, "Dropping buffer after end of stream");
            return Ok(());
        }
        els.muxer
            .push_buffer(pad, buffer, els.writer.as_mut())
            .map_err(|e| SplitMuxError::downstream(&self.muxer_name, e))
    }

    /// Marks `pad` as ended. Once every pad has ended the muxer writes its
    /// trailer and the writer is finished, and `true` is returned exactly once.
    pub(crate) fn send_eos(&self, pad: &str) -> Result<bool, SplitMuxError> {
        let mut guard = self.elements.lock();
        let els = &mut *guard;
        match els.pad_mut(pad) {
            Some(p) if !p.eos => p.eos = true,
            _ => return Ok(false),
        }
        if !els.running || els.finished || els.pads.iter().any(|p| !p.eos) {
            return Ok(false);
        }

        els.muxer
            .finish(els.writer.as_mut())
            .map_err(|e| SplitMuxError::downstream(&self.muxer_name, e))?;
        els.writer
            .finish()
            .map_err(|e| SplitMuxError::downstream(&self.writer_name, e))?;
        els.finished = true;
        debug!(writer = %self.writer_name, "Writer reached end of stream");
        Ok(true)
    }

    pub(crate) fn supports_reserved_duration(&self) -> bool {
        self.elements.lock().muxer.supports_reserved_duration()
    }

    pub(crate) fn set_reserved_max_duration(&self, duration: ClockTime) -> Result<(), ElementError> {
        self.elements.lock().muxer.set_reserved_max_duration(duration)
    }

    pub(crate) fn reserved_duration_remaining(&self) -> Option<ClockTime> {
        self.elements.lock().muxer.reserved_duration_remaining()
    }

    pub(crate) fn set_closing_info(&self, info: FragmentInfo) {
        *self.closing_info.lock() = Some(info);
    }

    pub(crate) fn take_closing_info(&self) -> Option<FragmentInfo> {
        self.closing_info.lock().take()
    }

    pub(crate) fn mark_draining(&self) {
        let mut teardown = self.teardown.lock();
        if *teardown == TeardownState::Active {
            *teardown = TeardownState::Draining;
        }
    }

    /// Records one of the two teardown conditions. Returns `true` when the
    /// caller must destroy the chain.
    pub(crate) fn advance_teardown(&self) -> bool {
        let mut teardown = self.teardown.lock();
        match *teardown {
            TeardownState::Draining => {
                *teardown = TeardownState::PendingDestroy;
                false
            }
            TeardownState::PendingDestroy => {
                *teardown = TeardownState::Destroyed;
                true
            }
            TeardownState::Active | TeardownState::Destroyed => false,
        }
    }

    pub(crate) fn teardown_state(&self) -> TeardownState {
        *self.teardown.lock()
    }

    /// Stops both elements. Safe to call more than once.
    pub(crate) fn destroy(&self) {
        *self.teardown.lock() = TeardownState::Destroyed;
        let mut els = self.elements.lock();
        if !els.running {
            return;
        }
        els.muxer.stop();
        els.writer.stop();
        els.running = false;
        debug!(muxer = %self.muxer_name, writer = %self.writer_name, "Fragment chain destroyed");
    }
}

/// Runs fragment finalization off the streaming threads.
///
/// Work is executed on a dedicated single-threaded pool so finalizations of
/// consecutive fragments never overlap in an unpredictable order.
pub(crate) struct Finalizer {
    runtime: Option<Runtime>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Finalizer {
    pub(crate) fn new() -> Result<Self, SplitMuxError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("splitmux-finalize")
            .enable_time()
            .build()
            .map_err(|e| SplitMuxError::creation("finalizer", ElementError::Io(e)))?;
        Ok(Self {
            runtime: Some(runtime),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn spawn(&self, work: impl FnOnce() + Send + 'static) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let handle = runtime.spawn_blocking(work);
        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Waits for every scheduled finalization, giving up after `timeout`.
    pub(crate) fn drain(&self, timeout: Duration) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let handles = std::mem::take(&mut *self.pending.lock());
        if handles.is_empty() {
            return;
        }
        let _enter = runtime.enter();
        let all = futures::future::join_all(handles);
        match block_on_timeout(timeout, all) {
            Some(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Fragment finalization task failed");
                    }
                }
            }
            None => warn!(?timeout, "Timed out waiting for fragment finalization"),
        }
    }
}

fn block_on_timeout<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    futures::executor::block_on(tokio::time::timeout(timeout, fut)).ok()
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
