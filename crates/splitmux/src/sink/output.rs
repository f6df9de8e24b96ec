//! Output side: one worker thread per stream.
//!
//! A worker pops its stream's queue and releases each item to the current
//! fragment's muxer once the input side allowed it, taking part in closing
//! the fragment and opening the next one.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, info, trace, warn};

use super::fragment::MuxChain;
use super::input::stream_running_time;
use super::{Inner, OutputState, State};
use crate::buffer::{Buffer, Gap, Sample};
use crate::context::{PeerLink, StreamId, StreamShared};
use crate::error::{FlowError, FlowResult};
use crate::events::{FragmentInfo, SplitMuxEvent};
use crate::gop::OutputCommand;
use crate::location::format_location;
use crate::queue::QueueItem;
use crate::segment::Segment;
use crate::time::{ClockTime, DisplayStime};

impl Inner {
    pub(super) fn output_loop(self: Arc<Self>, shared: Arc<StreamShared>) {
        debug!(stream = %shared.name, "Output worker started");
        loop {
            let item = match shared.queue.pop(|| self.handle_queue_underrun()) {
                Ok(item) => item,
                Err(_) => break,
            };
            let res = match item {
                QueueItem::Buffer(buffer) => self.output_buffer(&shared, buffer),
                QueueItem::Segment(segment) => self.output_segment(&shared, segment),
                QueueItem::Gap(gap) => self.output_gap(&shared, gap),
                QueueItem::Unblock(ts) => self.output_unblock(&shared, ts),
                QueueItem::Eos => self.output_eos(&shared),
            };
            match res {
                Ok(()) | Err(FlowError::Flushing) | Err(FlowError::Eos) => {}
                Err(FlowError::Error(err)) => self.post_error(err),
            }
        }
        debug!(stream = %shared.name, "Output worker exiting");
    }

    fn handle_queue_underrun(&self) {
        let state = self.state.lock();
        grow_blocked_queues(&state);
    }

    fn output_segment(&self, shared: &StreamShared, segment: Segment) -> FlowResult {
        let mut state = self.state.lock();
        let idx = state.index_of(shared.id)?;
        state.contexts[idx].out_segment = Some(segment.clone());
        if !state.contexts[idx].is_reference {
            self.complete_or_wait(&mut state, shared.id)?;
        }
        drop(state);

        if let Some(peer) = shared.peer() {
            peer.chain.segment(&peer.pad, &segment)?;
        }
        Ok(())
    }

    fn output_gap(&self, shared: &StreamShared, gap: Gap) -> FlowResult {
        let mut state = self.state.lock();
        if state.output_state == OutputState::Stopped {
            return Err(FlowError::Flushing);
        }
        let idx = state.index_of(shared.id)?;
        let is_reference = state.contexts[idx].is_reference;
        if is_reference && state.output_state != OutputState::OutputGop {
            // Sent along with the next reference buffer
            state.contexts[idx].pending_gap = Some(gap);
            return Ok(());
        }

        let rt = stream_running_time(state.contexts[idx].out_segment.as_ref(), gap.timestamp);
        if rt.is_some() {
            state.contexts[idx].out_running_time = rt;
            self.complete_or_wait(&mut state, shared.id)?;
        } else if !is_reference {
            self.complete_or_wait(&mut state, shared.id)?;
        }
        drop(state);

        if let Some(peer) = shared.peer() {
            peer.chain.gap(&peer.pad, &gap)?;
        }
        Ok(())
    }

    fn output_unblock(&self, shared: &StreamShared, ts: i64) -> FlowResult {
        let mut state = self.state.lock();
        if state.output_state == OutputState::Stopped {
            return Err(FlowError::Flushing);
        }
        let idx = state.index_of(shared.id)?;
        trace!(stream = %shared.name, ts = %DisplayStime(Some(ts)), "Unblock");
        state.contexts[idx].out_running_time = Some(ts);
        if !state.contexts[idx].is_reference {
            self.complete_or_wait(&mut state, shared.id)?;
        }
        Ok(())
    }

    fn output_eos(&self, shared: &StreamShared) -> FlowResult {
        let mut state = self.state.lock();
        if state.output_state == OutputState::Stopped {
            return Err(FlowError::Flushing);
        }
        let idx = state.index_of(shared.id)?;
        state.contexts[idx].src_eos = true;
        info!(stream = %shared.name, "Stream reached end of stream");

        if state.contexts[idx].is_reference {
            state.output_state = OutputState::EndingStream;
            self.update_output_fragment_info(&mut state);
            self.output_cond.notify_all();
        }
        self.complete_or_wait(&mut state, shared.id)?;

        // Ending the fragment may already have sent end of stream
        let idx = state.index_of(shared.id)?;
        let ctx = &mut state.contexts[idx];
        if ctx.out_eos {
            return Ok(());
        }
        ctx.out_eos = true;
        ctx.out_eos_async_done = true;
        let Some(peer) = shared.peer() else {
            return Ok(());
        };
        drop(state);

        if peer.chain.send_eos(&peer.pad)? {
            let mut state = self.state.lock();
            self.handle_writer_eos(&mut state, &peer.chain);
        }
        Ok(())
    }

    fn output_buffer(&self, shared: &StreamShared, buffer: Buffer) -> FlowResult {
        let mut state = self.state.lock();
        let idx = state.index_of(shared.id)?;
        let Some(record) = state.contexts[idx].queued_bufs.pop_front() else {
            // Flushed after the buffer was queued
            return Err(FlowError::Flushing);
        };
        if record.keyframe && state.contexts[idx].is_reference && state.queued_keyframes > 0 {
            state.queued_keyframes -= 1;
        }
        let ctx = &mut state.contexts[idx];
        ctx.out_running_time = record.run_ts;
        ctx.cur_out_buffer = Some(buffer.clone());

        trace!(
            stream = %shared.name,
            running_time = %DisplayStime(record.run_ts),
            size = record.size,
            "Releasing buffer"
        );
        let res = self.complete_or_wait(&mut state, shared.id);

        let idx = state.index_of(shared.id)?;
        let st = &mut *state;
        st.contexts[idx].cur_out_buffer = None;
        res?;

        st.muxed_out_bytes += record.size as u64;
        if let Some(run_ts) = record.run_ts {
            let ctx = &mut st.contexts[idx];
            if ctx.out_fragment_start_runts.is_none() {
                ctx.out_fragment_start_runts = Some(run_ts);
                if st.cur_fragment_id == st.start_index
                    && (st.out_start_runts.is_none() || Some(run_ts) < st.out_start_runts)
                {
                    st.out_start_runts = Some(run_ts);
                }
                if st.out_fragment_start_runts.is_none()
                    || Some(run_ts) < st.out_fragment_start_runts
                {
                    st.out_fragment_start_runts = Some(run_ts);
                }
            }
            let end = run_ts.saturating_add(record.duration.map_or(0, |d| d as i64));
            if ctx.out_running_time_end < Some(end) {
                ctx.out_running_time_end = Some(end);
            }
        }
        let pending_gap = st.contexts[idx].pending_gap.take();
        drop(state);

        let Some(peer) = shared.peer() else {
            return Err(FlowError::Flushing);
        };
        if let Some(gap) = pending_gap {
            peer.chain.gap(&peer.pad, &gap)?;
        }
        peer.chain.push_buffer(&peer.pad, &buffer)?;
        Ok(())
    }

    /// Blocks until the stream's current output running time may be released,
    /// doing whatever fragment transition is due on the way.
    fn complete_or_wait(&self, state: &mut MutexGuard<'_, State>, id: StreamId) -> FlowResult {
        let (alignment, async_finalize) = {
            let settings = self.settings.lock();
            (
                settings.config.alignment_threshold.as_stime(),
                settings.config.async_finalize,
            )
        };

        loop {
            let idx = state.index_of(id)?;
            let ctx = &state.contexts[idx];
            if ctx.flushing || state.output_state == OutputState::Stopped || state.error.is_some()
            {
                return Err(FlowError::Flushing);
            }

            let can_output = ctx.is_reference || state.ready_for_output;
            if can_output {
                let my_max_out = match state.max_out_running_time {
                    Some(max) if max != i64::MAX => Some(max.saturating_sub(alignment)),
                    other => other,
                };
                if state.max_out_running_time.is_some() && ctx.out_running_time < my_max_out {
                    return Ok(());
                }

                match state.output_state {
                    OutputState::OutputGop => {
                        // The bound was reached, ask for the next command
                        state.output_state = OutputState::AwaitingCommand;
                        self.output_cond.notify_all();
                        continue;
                    }
                    OutputState::EndingFile | OutputState::EndingStream => {
                        if async_finalize {
                            if !ctx.out_eos && !ctx.out_eos_async_done {
                                self.update_output_fragment_info(state);
                                self.eos_context_async(state, idx);
                            }
                            if state.output_state == OutputState::EndingFile
                                && state.contexts.iter().all(|c| c.out_eos_async_done)
                            {
                                debug!("Every stream ended the fragment, starting the next one");
                                state.output_state = OutputState::StartNextFile;
                                self.output_cond.notify_all();
                                continue;
                            }
                            if state.output_state == OutputState::EndingStream
                                && state.contexts[idx].out_eos
                            {
                                return Ok(());
                            }
                        } else if !ctx.out_eos {
                            self.update_output_fragment_info(state);
                            self.send_eos(state, id)?;
                            continue;
                        } else if state.output_state == OutputState::EndingStream {
                            return Ok(());
                        }
                    }
                    OutputState::StartNextFile => {
                        if ctx.is_reference {
                            self.start_next_fragment(state, id)?;
                            continue;
                        }
                    }
                    OutputState::AwaitingCommand => {
                        self.process_commands(state, id)?;
                        continue;
                    }
                    OutputState::Stopped => return Err(FlowError::Flushing),
                }
            } else {
                trace!(stream = %ctx.name(), "Not ready for output yet");
            }

            self.output_cond.wait(state);
        }
    }

    /// Pops output commands until the state leaves `AwaitingCommand`.
    fn process_commands(&self, state: &mut MutexGuard<'_, State>, id: StreamId) -> FlowResult {
        loop {
            match state.out_cmd_q.pop() {
                Some(cmd) => {
                    if state.out_cmd_q.is_empty() {
                        grow_blocked_queues(state);
                    }
                    match cmd {
                        OutputCommand::FinishFragment => {
                            if state.muxed_out_bytes > 0 {
                                debug!("Ending the current fragment");
                                state.output_state = OutputState::EndingFile;
                            } else {
                                debug!("Ignoring fragment end, nothing was muxed yet");
                            }
                        }
                        OutputCommand::ReleaseGop {
                            max_output_running_time,
                        } => {
                            if state.max_out_running_time < Some(max_output_running_time) {
                                state.max_out_running_time = Some(max_output_running_time);
                            }
                            trace!(
                                max_out = %DisplayStime(state.max_out_running_time),
                                "Releasing data"
                            );
                            state.output_state = OutputState::OutputGop;
                        }
                    }
                    self.output_cond.notify_all();
                }
                None => self.output_cond.wait(state),
            }

            let idx = state.index_of(id)?;
            if state.contexts[idx].flushing
                || state.output_state != OutputState::AwaitingCommand
            {
                return Ok(());
            }
        }
    }

    fn update_output_fragment_info(&self, state: &mut State) {
        let offset = match (state.out_fragment_start_runts, state.out_start_runts) {
            (Some(start), Some(first)) => ClockTime::from_stime(start - first),
            _ => None,
        };
        let duration = state.out_fragment_start_runts.and_then(|start| {
            state
                .contexts
                .iter()
                .filter_map(|c| c.out_running_time_end)
                .filter(|&end| end > start)
                .max()
                .and_then(|end| ClockTime::from_stime(end - start))
        });
        state.out_fragment_info = FragmentInfo {
            fragment_id: state.cur_fragment_id,
            location: None,
            running_time: state.reference().and_then(|r| r.out_running_time),
            offset,
            duration,
        };
    }

    /// Schedules end of stream for the stream's pad on the finalizer.
    fn eos_context_async(&self, state: &mut State, idx: usize) {
        let ctx = &mut state.contexts[idx];
        ctx.out_eos_async_done = true;
        let Some(peer) = ctx.shared.peer() else {
            return;
        };
        debug!(stream = %ctx.name(), muxer = %peer.chain.muxer_name, "Scheduling end of stream");
        peer.chain.set_closing_info(state.out_fragment_info.clone());
        peer.chain.mark_draining();

        let weak = self.weak_self.clone();
        self.finalizer.spawn(move || {
            if let Some(inner) = weak.upgrade() {
                inner.finish_pad_async(peer);
            }
        });
    }

    fn finish_pad_async(&self, peer: PeerLink) {
        match peer.chain.send_eos(&peer.pad) {
            Ok(true) => {
                let mut state = self.state.lock();
                self.handle_writer_eos(&mut state, &peer.chain);
            }
            Ok(false) => {}
            Err(err) => self.post_error(err),
        }
    }

    /// Sends end of stream for one stream synchronously, with the state
    /// lock released.
    fn send_eos(&self, state: &mut MutexGuard<'_, State>, id: StreamId) -> FlowResult {
        let idx = state.index_of(id)?;
        let ctx = &mut state.contexts[idx];
        ctx.out_eos = true;
        let Some(peer) = ctx.shared.peer() else {
            return Ok(());
        };
        debug!(stream = %ctx.name(), "Sending end of stream to end the fragment");

        let finished = MutexGuard::unlocked(state, || peer.chain.send_eos(&peer.pad))?;
        if finished {
            self.handle_writer_eos(state, &peer.chain);
        }
        Ok(())
    }

    /// Reacts to a writer having finished its fragment.
    pub(super) fn handle_writer_eos(&self, state: &mut State, chain: &Arc<MuxChain>) {
        let mut info = chain
            .take_closing_info()
            .unwrap_or_else(|| state.out_fragment_info.clone());
        info.location = chain.location();
        info!(
            fragment = info.fragment_id,
            location = ?info.location,
            duration = ?info.duration,
            "Fragment closed"
        );
        self.post(SplitMuxEvent::FragmentClosed(info));

        let async_finalize = self.settings.lock().config.async_finalize;
        if async_finalize {
            if chain.serial == state.active_chain
                && state.output_state == OutputState::EndingStream
            {
                chain.destroy();
                self.post_eos(state);
            } else if chain.advance_teardown() {
                chain.destroy();
            }
        } else if state.output_state == OutputState::EndingStream {
            self.post_eos(state);
        } else {
            state.output_state = OutputState::StartNextFile;
            self.output_cond.notify_all();
        }
    }

    /// Opens the next fragment. Runs on the reference stream's worker.
    fn start_next_fragment(&self, state: &mut MutexGuard<'_, State>, id: StreamId) -> FlowResult {
        let idx = state.index_of(id)?;
        let sample = Sample {
            buffer: state.contexts[idx].cur_out_buffer.clone(),
            segment: state.contexts[idx].out_segment.clone(),
        };
        state.switching_fragment = true;
        let switched = MutexGuard::unlocked(state, || self.switch_fragment(sample));
        state.switching_fragment = false;
        let chain = switched?;

        state.ready_for_output = true;
        self.restart_contexts(state);
        self.update_output_fragment_info(state);

        let mut info = state.out_fragment_info.clone();
        info.location = chain.location();
        info.offset = None;
        info.duration = None;
        info!(fragment = info.fragment_id, location = ?info.location, "Fragment opened");
        self.post(SplitMuxEvent::FragmentOpened(info));

        state.output_state = OutputState::AwaitingCommand;
        self.output_cond.notify_all();
        Ok(())
    }

    /// Prepares the chain for the next fragment, names it and starts it.
    /// Called without the state lock.
    fn switch_fragment(&self, sample: Sample) -> Result<Arc<MuxChain>, FlowError> {
        let mut lc = self.lifecycle.lock();
        if lc.shutdown {
            return Err(FlowError::Flushing);
        }
        let Some(old) = lc.chain.clone() else {
            return Err(FlowError::Flushing);
        };
        let (async_finalize, reset_muxer, max_files, pattern) = {
            let settings = self.settings.lock();
            let config = &settings.config;
            (
                config.async_finalize,
                config.reset_muxer,
                config.max_files,
                config.location.clone(),
            )
        };
        let (muxed, cur_id, start_index, next_id) = {
            let state = self.state.lock();
            (
                state.muxed_out_bytes,
                state.cur_fragment_id,
                state.start_index,
                state.next_fragment_id,
            )
        };

        let chain = if async_finalize && (muxed > 0 || cur_id != start_index) {
            let chain = self.create_chain(&mut lc, next_id, false)?;
            self.relink_streams(&chain)?;
            lc.chain = Some(Arc::clone(&chain));
            self.state.lock().active_chain = chain.serial;
            chain
        } else {
            if !async_finalize {
                old.prepare_next(reset_muxer);
            }
            old.clone()
        };

        let fragment_id = if max_files > 0 && next_id >= max_files {
            debug!(max_files, "Wrapping fragment index");
            0
        } else {
            next_id
        };
        let location = match &self.format_location {
            Some(f) => f(fragment_id, &sample),
            None => None,
        }
        .or_else(|| pattern.map(|p| PathBuf::from(format_location(&p, fragment_id))));
        if let Some(location) = &location {
            chain.set_location(location)?;
        }
        debug!(fragment = fragment_id, location = ?location, "Next fragment");

        {
            let mut state = self.state.lock();
            state.cur_fragment_id = fragment_id;
            state.next_fragment_id = fragment_id + 1;
            state.muxed_out_bytes = 0;
            state.out_fragment_start_runts = None;
        }

        chain.start()?;

        if old.serial != chain.serial && old.advance_teardown() {
            old.destroy();
        }
        Ok(chain)
    }

    /// Re-arms every stream for the new fragment and replays its sticky data.
    fn restart_contexts(&self, state: &mut State) {
        let mut finished: Option<Arc<MuxChain>> = None;
        for ctx in &mut state.contexts {
            ctx.restart();
            let Some(peer) = ctx.shared.peer() else {
                continue;
            };
            if let Some(segment) = &ctx.out_segment
                && let Err(err) = peer.chain.segment(&peer.pad, segment)
            {
                warn!(stream = %ctx.name(), error = %err, "Could not replay segment");
            }
            if ctx.out_eos {
                match peer.chain.send_eos(&peer.pad) {
                    Ok(true) => finished = Some(peer.chain),
                    Ok(false) => {}
                    Err(err) => warn!(stream = %ctx.name(), error = %err, "Could not replay end of stream"),
                }
            }
        }
        if let Some(chain) = finished {
            self.handle_writer_eos(state, &chain);
        }
    }
}

/// Raises the limit of every queue whose stream already has as many buffers
/// waiting as its queue can hold, so that no stream blocks the others.
fn grow_blocked_queues(state: &State) {
    for ctx in &state.contexts {
        let queue = &ctx.shared.queue;
        let limit = queue.max_buffers();
        let waiting = ctx.queued_bufs.len();
        if waiting >= limit {
            debug!(stream = %ctx.name(), limit = waiting + 1, "Growing blocked queue");
            queue.set_max_buffers(waiting + 1);
        }
    }
}
