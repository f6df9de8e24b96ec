//! GOP bookkeeping and the command queue feeding the output side.

use std::collections::VecDeque;

use crate::timecode::VideoTimeCode;

/// A group of pictures being collected on the input side.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct InputGop {
    /// Minimum running time (PTS or DTS) seen for this GOP on the reference stream
    pub start_time: Option<i64>,
    /// Running time of the first reference buffer, by PTS
    pub start_time_pts: Option<i64>,
    pub start_tc: Option<VideoTimeCode>,
    /// Bytes contributed by every stream
    pub total_bytes: u64,
    /// Bytes contributed by the reference stream
    pub reference_bytes: u64,
    /// Opened by a gap on the reference stream rather than a keyframe
    pub from_gap: bool,
    /// A keyframe request was already sent for this GOP
    pub sent_fku: bool,
}

impl InputGop {
    pub(crate) fn new(start_time: Option<i64>, start_time_pts: Option<i64>) -> Self {
        Self {
            start_time,
            start_time_pts,
            ..Default::default()
        }
    }
}

/// Pending GOPs, oldest first.
#[derive(Debug, Default)]
pub(crate) struct GopQueue {
    gops: VecDeque<InputGop>,
}

impl GopQueue {
    pub(crate) fn push(&mut self, gop: InputGop) {
        self.gops.push_back(gop);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.gops.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.gops.len()
    }

    /// The GOP currently being completed.
    pub(crate) fn head(&self) -> Option<&InputGop> {
        self.gops.front()
    }

    /// The GOP after the head, whose start bounds the head.
    pub(crate) fn next(&self) -> Option<&InputGop> {
        self.gops.get(1)
    }

    /// The GOP receiving new data.
    pub(crate) fn tail(&self) -> Option<&InputGop> {
        self.gops.back()
    }

    pub(crate) fn tail_mut(&mut self) -> Option<&mut InputGop> {
        self.gops.back_mut()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut InputGop> {
        self.gops.get_mut(index)
    }

    pub(crate) fn pop_head(&mut self) -> Option<InputGop> {
        self.gops.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.gops.clear();
    }
}

/// Instruction from the input side to the output side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputCommand {
    /// Close the current fragment before releasing more data.
    FinishFragment,
    /// Release data up to this running time; `i64::MAX` releases everything.
    ReleaseGop { max_output_running_time: i64 },
}

/// FIFO of output commands.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: VecDeque<OutputCommand>,
}

impl CommandQueue {
    pub(crate) fn push(&mut self, cmd: OutputCommand) {
        self.commands.push_back(cmd);
    }

    pub(crate) fn pop(&mut self) -> Option<OutputCommand> {
        self.commands.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.commands.clear();
    }
}
