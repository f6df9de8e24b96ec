//! Notifications emitted by the sink.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, channel};

use parking_lot::Mutex;

use crate::error::SplitMuxError;
use crate::time::ClockTime;

/// Timing of a fragment on the output side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FragmentInfo {
    pub fragment_id: u32,
    pub location: Option<PathBuf>,
    /// Output running time of the reference stream when the info was taken
    pub running_time: Option<i64>,
    /// Start of the fragment relative to the start of the first fragment
    pub offset: Option<ClockTime>,
    pub duration: Option<ClockTime>,
}

#[derive(Debug, Clone)]
pub enum SplitMuxEvent {
    MuxerAdded { name: String },
    WriterAdded { name: String },
    FragmentOpened(FragmentInfo),
    FragmentClosed(FragmentInfo),
    /// The reference producer should emit a keyframe at this running time.
    ForceKeyUnit {
        running_time: ClockTime,
        all_headers: bool,
    },
    /// The last fragment was closed after every stream ended.
    Eos,
    Error(SplitMuxError),
}

/// Fan-out of events to every live subscriber.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<Sender<SplitMuxEvent>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> Receiver<SplitMuxEvent> {
        let (tx, rx) = channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn post(&self, event: SplitMuxEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
