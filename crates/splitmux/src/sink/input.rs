//! Input side: GOP collection on the producer threads.
//!
//! Every stream entering the sink is held back until the reference stream has
//! started the GOP that follows the data, so a complete GOP (from every
//! stream) is known before deciding whether it still fits the current
//! fragment. Producers block on `input_cond` while they are ahead.

use parking_lot::MutexGuard;
use tracing::{debug, info, trace, warn};

use super::{InputState, Inner, State};
use crate::buffer::{Buffer, Gap};
use crate::context::{BufferRecord, StreamCtx, StreamId};
use crate::error::{FlowError, FlowResult, SplitMuxError};
use crate::events::SplitMuxEvent;
use crate::gop::{InputGop, OutputCommand};
use crate::policy::{GopTotals, SplitPolicy, TIMECODE_TOLERANCE_NS, Thresholds};
use crate::queue::QueueItem;
use crate::segment::Segment;
use crate::time::{ClockTime, DisplayStime};
use crate::timecode::next_max_timecode;

/// Lets the stream's output side release data queued up to `max_in`.
fn queue_unblock(ctx: &StreamCtx, max_in: Option<i64>) {
    let Some(max_in) = max_in else {
        return;
    };
    if let Err(e) = ctx.shared.queue.push_event(QueueItem::Unblock(max_in)) {
        trace!(stream = %ctx.name(), error = %e, "Unblock not queued");
    }
}

/// Maps a stream timestamp to running time, assuming a default segment when
/// the producer never sent one.
pub(super) fn stream_running_time(segment: Option<&Segment>, ts: ClockTime) -> Option<i64> {
    match segment {
        Some(segment) => segment.to_running_time_full(ts),
        None => Segment::new().to_running_time_full(ts),
    }
}

impl Inner {
    pub(super) fn input_segment(&self, id: StreamId, segment: &Segment) -> FlowResult {
        let mut state = self.state.lock();
        if state.input_state == InputState::Stopped {
            return Err(FlowError::Flushing);
        }
        let idx = state.index_of(id)?;
        state.contexts[idx].in_segment = Some(segment.clone());
        Ok(())
    }

    /// Accounts a buffer and blocks until the stream may queue it.
    pub(super) fn input_buffer(&self, id: StreamId, buffer: &Buffer) -> FlowResult {
        let mut state = self.state.lock();
        if state.input_state == InputState::Stopped {
            return Err(FlowError::Flushing);
        }
        let idx = state.index_of(id)?;

        let (running_time, rt_pts, rt_dts, mut record, is_reference) = {
            let ctx = &mut state.contexts[idx];
            let segment = ctx.in_segment.as_ref();
            let running_time = match buffer.pts.or(buffer.dts) {
                Some(ts) => {
                    let rt = stream_running_time(segment, ts);
                    if rt.is_some() && rt > ctx.in_running_time {
                        ctx.in_running_time = rt;
                    }
                    rt
                }
                None => ctx.in_running_time,
            };
            let rt_pts = buffer.pts.and_then(|pts| stream_running_time(segment, pts));
            let rt_dts = match buffer.dts {
                Some(dts) => stream_running_time(segment, dts).min(rt_pts),
                None => rt_pts,
            };
            if ctx.in_running_time.is_none() {
                let start = segment.map(|s| s.start).unwrap_or(ClockTime::ZERO);
                ctx.in_running_time = stream_running_time(segment, start);
            }

            let record = BufferRecord {
                size: buffer.size(),
                run_ts: ctx.in_running_time,
                duration: buffer.duration.map(ClockTime::nseconds),
                keyframe: false,
            };
            (running_time, rt_pts, rt_dts, record, ctx.is_reference)
        };

        trace!(
            stream = %state.contexts[idx].name(),
            running_time = %DisplayStime(running_time),
            size = buffer.size(),
            "Incoming buffer"
        );

        if is_reference {
            self.track_reference_buffer(&mut state, buffer, running_time, rt_pts, rt_dts);
        }

        let mut keyframe = false;
        loop {
            let idx = state.index_of(id)?;
            if state.contexts[idx].flushing {
                return Err(FlowError::Flushing);
            }
            match state.input_state {
                InputState::CollectingGopStart if state.contexts[idx].is_reference => {
                    let in_rt = state.contexts[idx].in_running_time;
                    if in_rt > state.max_in_running_time {
                        state.max_in_running_time = in_rt;
                    }
                    if rt_dts > state.max_in_running_time_dts {
                        state.max_in_running_time_dts = rt_dts;
                    }

                    let Some(next_start_pts) =
                        state.pending_input_gops.next().map(|g| g.start_time_pts)
                    else {
                        self.input_cond.notify_all();
                        break;
                    };
                    keyframe = buffer.is_keyframe();

                    // The next GOP is not complete until its DTS reached its PTS
                    if rt_dts.is_some() && rt_dts < next_start_pts {
                        self.input_cond.notify_all();
                        break;
                    }

                    debug!(
                        max_in = %DisplayStime(state.max_in_running_time),
                        "Reference stream started a new GOP, collecting the previous one"
                    );
                    state.input_state = InputState::WaitingGopCollect;
                    self.input_cond.notify_all();
                    self.check_completed_gop(&mut state, id)?;
                    break;
                }
                InputState::CollectingGopStart => {
                    if state.contexts[idx].in_running_time < state.max_in_running_time {
                        break;
                    }
                    // Let the output side of a stream far ahead release what it already has
                    if state.contexts[idx].need_unblock {
                        state.contexts[idx].need_unblock = false;
                        queue_unblock(&state.contexts[idx], state.max_in_running_time);
                    }
                    trace!(stream = %state.contexts[idx].name(), "Ahead of the reference stream, waiting");
                    self.input_cond.wait(&mut state);
                }
                InputState::WaitingGopCollect => {
                    if state.contexts[idx].in_running_time < state.max_in_running_time {
                        break;
                    }
                    if state.pending_input_gops.is_empty() {
                        warn!(
                            stream = %state.contexts[idx].name(),
                            "Reference stream ended, dropping data after its end"
                        );
                        return Err(FlowError::Eos);
                    }
                    self.check_completed_gop(&mut state, id)?;

                    let idx = state.index_of(id)?;
                    let ctx = &state.contexts[idx];
                    if state.input_state == InputState::WaitingGopCollect
                        && !ctx.in_eos
                        && !ctx.flushing
                    {
                        self.input_cond.wait(&mut state);
                    }
                }
                InputState::FinishingUp => break,
                InputState::Stopped => return Err(FlowError::Flushing),
            }
        }

        let idx = state.index_of(id)?;
        let is_reference = state.contexts[idx].is_reference;
        if keyframe && is_reference {
            state.queued_keyframes += 1;
        }
        record.keyframe = keyframe;

        if !matches!(
            state.input_state,
            InputState::FinishingUp | InputState::Stopped
        ) && let Some(gop) = state.pending_input_gops.tail_mut()
        {
            gop.total_bytes += record.size as u64;
            if is_reference {
                gop.reference_bytes += record.size as u64;
            }
        }

        state.contexts[idx].queued_bufs.push_back(record);
        Ok(())
    }

    /// Fragment and GOP start bookkeeping for a reference buffer.
    fn track_reference_buffer(
        &self,
        state: &mut State,
        buffer: &Buffer,
        running_time: Option<i64>,
        rt_pts: Option<i64>,
        rt_dts: Option<i64>,
    ) {
        let tc = buffer.timecode;

        if running_time.is_some()
            && (state.fragment_start_time.is_none() || state.fragment_start_time > running_time)
        {
            if state.fragment_start_time.is_none() {
                state.fragment_start_time_pts = rt_pts;
            }
            state.fragment_start_time = running_time;
            debug!(start = %DisplayStime(running_time), "Fragment start time");

            if state.max_in_running_time.is_none()
                || state.max_in_running_time < state.fragment_start_time
            {
                state.max_in_running_time = state.fragment_start_time;
            }
            if state.max_in_running_time_dts.is_none() {
                state.max_in_running_time_dts = rt_dts;
            }

            if let Some(tc) = tc {
                state.fragment_start_tc = Some(tc);
                let interval = self.settings.lock().timecode;
                state.next_fragment_start_tc_time =
                    interval.and_then(|iv| next_max_timecode(&tc, &iv, running_time).1);
            }
        }

        let opens_gop = match state.pending_input_gops.tail() {
            None => true,
            Some(tail) => !tail.from_gap && buffer.is_keyframe(),
        };
        if opens_gop {
            let mut gop = InputGop::new(running_time, rt_pts);
            gop.start_tc = tc;
            trace!(start = %DisplayStime(running_time), "New GOP");
            state.pending_input_gops.push(gop);
        } else if let Some(tail) = state.pending_input_gops.tail_mut() {
            tail.from_gap = false;
            if running_time.is_some()
                && (tail.start_time.is_none() || tail.start_time > running_time)
            {
                tail.start_time = running_time;
                if tc.is_some() {
                    tail.start_tc = tc;
                }
            }
        }

        if let Some(target) = self.request_next_keyframe(state, rt_dts) {
            self.post(SplitMuxEvent::ForceKeyUnit {
                running_time: target,
                all_headers: true,
            });
        }
    }

    /// Picks the running time at which the reference producer should emit its
    /// next keyframe, if a request is due.
    fn request_next_keyframe(&self, state: &mut State, rt_dts: Option<i64>) -> Option<ClockTime> {
        let (enabled, threshold_time, threshold_bytes, interval) = {
            let settings = self.settings.lock();
            (
                settings.config.send_keyframe_requests,
                settings.config.max_size_time,
                settings.config.max_size_bytes,
                settings.timecode,
            )
        };
        if !enabled {
            return None;
        }

        // Newest GOP whose start the reference DTS already reached
        let mut newest = None;
        for i in (0..state.pending_input_gops.len()).rev() {
            let gop = state.pending_input_gops.get_mut(i)?;
            if gop.sent_fku {
                return None;
            }
            if rt_dts.is_none() || gop.start_time_pts.is_none() || rt_dts >= gop.start_time_pts {
                newest = Some(i);
                break;
            }
        }
        let gop = state.pending_input_gops.get_mut(newest?)?;

        let mut max_tc_time = None;
        let mut next_max_tc_time = None;
        if let Some(iv) = &interval {
            match gop.start_tc {
                Some(tc) => {
                    max_tc_time = next_max_timecode(&tc, iv, gop.start_time).1;
                    let next_tc = tc.add_interval(iv);
                    next_max_tc_time = max_tc_time.and_then(|m| next_max_timecode(&next_tc, iv, Some(m)).1);
                }
                None => warn!("No timecode on the GOP start, cannot target the next keyframe by timecode"),
            }
        }
        let timecode_based = max_tc_time.is_some() && next_max_tc_time.is_some();

        if (threshold_time.is_zero() && !timecode_based) || threshold_bytes != 0 {
            return None;
        }

        let (target, mut next_fku) = match (max_tc_time, next_max_tc_time) {
            (Some(max), Some(next)) if timecode_based => (
                (max - TIMECODE_TOLERANCE_NS).max(0),
                Some((next - TIMECODE_TOLERANCE_NS).max(0)),
            ),
            _ => (gop.start_time?.saturating_add(threshold_time.as_stime()), None),
        };

        if let Some(allowed) = state.next_fku_time {
            let allowed = if timecode_based {
                (allowed - TIMECODE_TOLERANCE_NS).max(0)
            } else {
                allowed
            };
            if target < allowed {
                trace!(
                    target = %DisplayStime(Some(target)),
                    allowed = %DisplayStime(Some(allowed)),
                    "Keyframe request not due yet"
                );
                return None;
            }
        }
        if !timecode_based {
            next_fku = Some(target.saturating_add(threshold_time.as_stime()));
        }

        gop.sent_fku = true;
        state.next_fku_time = next_fku;
        debug!(target = %DisplayStime(Some(target)), "Requesting keyframe");
        ClockTime::from_stime(target)
    }

    /// Completes the head GOP once every stream has passed its end.
    ///
    /// Called with the stream's own context in `WaitingGopCollect`; may wait on
    /// `input_cond` until the other streams catch up.
    pub(super) fn check_completed_gop(
        &self,
        state: &mut MutexGuard<'_, State>,
        id: StreamId,
    ) -> FlowResult {
        let idx = state.index_of(id)?;
        if state.contexts[idx].need_unblock {
            state.contexts[idx].need_unblock = false;
            queue_unblock(&state.contexts[idx], state.max_in_running_time);
            self.input_cond.notify_all();
            if state.input_state != InputState::WaitingGopCollect {
                return Ok(());
            }
        }

        loop {
            let mut next_gop_start = None;

            if state.input_state == InputState::WaitingGopCollect {
                let ref_in_eos = state.reference().is_none_or(|r| r.in_eos);
                let head = state.pending_input_gops.head().is_some();
                let next = state
                    .pending_input_gops
                    .next()
                    .map(|g| (g.start_time, g.start_time_pts));

                let max_out = match (head, next) {
                    (true, Some((next_start, next_start_pts))) => {
                        if !ref_in_eos
                            && state.max_in_running_time_dts.is_some()
                            && state.max_in_running_time_dts < next_start_pts
                        {
                            trace!("Reference DTS has not reached the next GOP yet");
                            break;
                        }
                        next_gop_start = next_start;
                        if ref_in_eos {
                            i64::MAX
                        } else {
                            next_start.unwrap_or(i64::MIN)
                        }
                    }
                    (true, None) => {
                        next_gop_start = state.max_in_running_time;
                        i64::MAX
                    }
                    (false, _) => break,
                };

                let ready = state.contexts.iter().all(|c| {
                    c.in_eos || next_gop_start.is_none() || c.in_running_time >= next_gop_start
                });
                if ready {
                    trace!(next_start = %DisplayStime(next_gop_start), "GOP complete on every stream");
                    if let Some(gop) = state.pending_input_gops.pop_head()
                        && let Err(err) = self.handle_gathered_gop(state, &gop, next_gop_start, max_out)
                    {
                        self.post_error_locked(state, err.clone());
                        return Err(err.into());
                    }
                    if state.split_requested {
                        state.split_requested = false;
                        state.do_split_next_gop = true;
                    }
                }
            }

            let idx = state.index_of(id)?;
            let ctx = &state.contexts[idx];
            if ctx.in_eos {
                return Ok(());
            }
            if state.input_state == InputState::WaitingGopCollect
                && !ctx.flushing
                && next_gop_start.is_some()
                && ctx.in_running_time >= next_gop_start
            {
                trace!(stream = %ctx.name(), "Waiting for the other streams to complete the GOP");
                self.input_cond.wait(state);
            } else {
                break;
            }

            if state.input_state != InputState::WaitingGopCollect {
                break;
            }
        }
        Ok(())
    }

    /// Decides whether `gop` still fits the fragment and queues the
    /// matching output commands.
    fn handle_gathered_gop(
        &self,
        state: &mut State,
        gop: &InputGop,
        next_gop_start: Option<i64>,
        max_out_running_time: i64,
    ) -> Result<(), SplitMuxError> {
        let Some(next_start) = next_gop_start else {
            return Err(SplitMuxError::Timestamp(
                "end of the GOP has no running time".into(),
            ));
        };
        let Some(gop_start) = gop.start_time else {
            return Err(SplitMuxError::Timestamp(
                "GOP start has no running time".into(),
            ));
        };

        let mut queued_time = next_start;
        let out_rt = state.reference().and_then(|r| r.out_running_time);
        let mut queued_gop_time = queued_time - out_rt.unwrap_or(gop_start);
        if queued_gop_time < 0 {
            return Err(SplitMuxError::Timestamp(format!(
                "queued GOP time is negative ({})",
                DisplayStime(Some(queued_gop_time))
            )));
        }

        let fragment_start = state.fragment_start_time.unwrap_or(gop_start);
        if queued_time < fragment_start {
            return Err(SplitMuxError::Timestamp(format!(
                "queued time {} is before the fragment start {}, input went backwards",
                DisplayStime(Some(queued_time)),
                DisplayStime(Some(fragment_start))
            )));
        }
        queued_time -= fragment_start;
        queued_gop_time = queued_gop_time.min(queued_time);

        let (thresholds, overhead, robust) = {
            let settings = self.settings.lock();
            let config = &settings.config;
            (
                Thresholds {
                    max_size_bytes: config.max_size_bytes,
                    max_size_time: config.max_size_time,
                    timecode: settings.timecode,
                },
                config.muxer_overhead,
                config.use_robust_muxing,
            )
        };
        let queued_bytes = state.fragment_total_bytes + gop.total_bytes;
        let queued_bytes = queued_bytes + (queued_bytes as f64 * overhead) as u64;

        let reserved_remaining = if robust && state.muxer_has_reserved_props {
            state
                .reference()
                .and_then(|r| r.shared.peer())
                .and_then(|peer| peer.chain.reserved_duration_remaining())
        } else {
            None
        };

        let totals = GopTotals {
            fragment_reference_bytes: state.fragment_reference_bytes,
            queued_bytes,
            queued_time,
            queued_gop_time,
            next_gop_start: Some(next_start),
        };
        let mut policy = SplitPolicy {
            thresholds: &thresholds,
            split_requested: state.do_split_next_gop,
            times_to_split: &mut state.times_to_split,
            next_fragment_start_tc_time: state.next_fragment_start_tc_time,
            reserved_remaining,
        };

        if let Some(reason) = policy.evaluate(&totals) {
            info!(
                %reason,
                fragment_bytes = state.fragment_total_bytes,
                fragment_duration = %DisplayStime(Some(queued_time - (next_start - gop_start))),
                "Starting a new fragment"
            );
            state.do_split_next_gop = false;
            state.out_cmd_q.push(OutputCommand::FinishFragment);
            self.output_cond.notify_all();

            state.fragment_start_time = gop.start_time;
            state.fragment_start_time_pts = gop.start_time_pts;
            state.fragment_total_bytes = 0;
            state.fragment_reference_bytes = 0;
            state.fragment_start_tc = gop.start_tc;
            state.next_fragment_start_tc_time = match (gop.start_tc, thresholds.timecode) {
                (Some(tc), Some(iv)) => next_max_timecode(&tc, &iv, gop.start_time).1,
                _ => None,
            };
        }

        state.input_state = if max_out_running_time != i64::MAX {
            InputState::CollectingGopStart
        } else {
            InputState::FinishingUp
        };
        for ctx in &mut state.contexts {
            ctx.need_unblock = true;
        }
        self.input_cond.notify_all();

        state.fragment_total_bytes += gop.total_bytes;
        state.fragment_reference_bytes += gop.reference_bytes;
        if gop.total_bytes > 0 {
            trace!(
                max_out = %DisplayStime(Some(max_out_running_time)),
                bytes = gop.total_bytes,
                "Releasing GOP"
            );
            state.out_cmd_q.push(OutputCommand::ReleaseGop {
                max_output_running_time: max_out_running_time,
            });
            self.output_cond.notify_all();
        }
        Ok(())
    }

    pub(super) fn input_gap(&self, id: StreamId, gap: &Gap) -> FlowResult {
        let mut state = self.state.lock();
        if state.input_state == InputState::Stopped {
            return Err(FlowError::Flushing);
        }
        let idx = state.index_of(id)?;
        let ctx = &state.contexts[idx];
        if !ctx.is_reference {
            return Ok(());
        }
        let Some(rt) = stream_running_time(ctx.in_segment.as_ref(), gap.timestamp) else {
            return Ok(());
        };

        if state.fragment_start_time.is_none() {
            state.fragment_start_time = Some(rt);
            if state.max_in_running_time.is_none() {
                state.max_in_running_time = Some(rt);
            }
            if state.max_in_running_time_dts.is_none() {
                state.max_in_running_time_dts = Some(rt);
            }
        }
        if state.fragment_start_time_pts.is_none() {
            state.fragment_start_time_pts = Some(rt);
        }
        if state.pending_input_gops.is_empty() {
            debug!(start = %DisplayStime(Some(rt)), "Reference gap opens a GOP");
            let mut gop = InputGop::new(Some(rt), Some(rt));
            gop.from_gap = true;
            state.pending_input_gops.push(gop);
        }
        Ok(())
    }

    pub(super) fn input_eos(&self, id: StreamId) -> FlowResult {
        let mut state = self.state.lock();
        let idx = state.index_of(id)?;
        state.contexts[idx].in_eos = true;
        if state.input_state == InputState::Stopped {
            return Err(FlowError::Flushing);
        }
        debug!(stream = %state.contexts[idx].name(), "Input reached end of stream");

        if state.contexts[idx].is_reference {
            state.input_state = InputState::WaitingGopCollect;
            self.input_cond.notify_all();
            if state.pending_input_gops.is_empty() {
                warn!("Reference stream ended without any data");
                let err = SplitMuxError::NoData;
                self.post_error_locked(&mut state, err.clone());
                return Err(err.into());
            }
            self.check_completed_gop(&mut state, id)?;
        } else if state.input_state == InputState::WaitingGopCollect
            && !state.pending_input_gops.is_empty()
        {
            self.check_completed_gop(&mut state, id)?;
        }
        Ok(())
    }

    pub(super) fn flush_start(&self, id: StreamId) {
        let mut state = self.state.lock();
        if let Ok(idx) = state.index_of(id) {
            debug!(stream = %state.contexts[idx].name(), "Flush start");
            state.contexts[idx].flushing = true;
        }
        self.input_cond.notify_all();
        self.output_cond.notify_all();
    }

    pub(super) fn flush_stop(&self, id: StreamId) {
        let mut state = self.state.lock();
        let Ok(idx) = state.index_of(id) else {
            return;
        };
        let ctx = &mut state.contexts[idx];
        debug!(stream = %ctx.name(), "Flush stop");
        ctx.in_segment = None;
        ctx.out_segment = None;
        ctx.in_eos = false;
        ctx.in_running_time = None;
        ctx.out_running_time = None;
        ctx.queued_bufs.clear();
        ctx.pending_gap = None;
        ctx.flushing = false;
        if ctx.is_reference {
            state.queued_keyframes = 0;
        }
    }

    /// Grows a full queue when waiting on it could stall the other streams.
    pub(super) fn handle_queue_overrun(&self, id: StreamId) {
        let state = self.state.lock();
        let allow_grow = state.queued_keyframes < 2
            || state.out_cmd_q.is_empty()
            || state
                .contexts
                .iter()
                .any(|c| c.id != id && c.queued_bufs.is_empty());
        if !allow_grow {
            return;
        }
        if let Ok(idx) = state.index_of(id) {
            let queue = &state.contexts[idx].shared.queue;
            let (level, max) = queue.level();
            debug!(stream = %state.contexts[idx].name(), level, max = max + 1, "Growing queue");
            queue.set_max_buffers(max + 1);
        }
    }
}
