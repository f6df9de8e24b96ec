//! Per-stream data queue between the input collector and the output dispatcher.
//!
//! The queue is bounded by a buffer count that is only ever raised. When a
//! producer finds it full, or the consumer finds it empty, the supplied
//! callback runs with the queue lock released so the sink can decide whether
//! to grow the limit. The sink's primary lock may be held while calling into a
//! queue, but a queue never takes the primary lock while holding its own.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::buffer::{Buffer, Gap};
use crate::error::{FlowError, FlowResult};
use crate::segment::Segment;

#[derive(Debug, Clone)]
pub(crate) enum QueueItem {
    Buffer(Buffer),
    Segment(Segment),
    Gap(Gap),
    /// Lets a starved stream release data up to the given running time.
    Unblock(i64),
    Eos,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<QueueItem>,
    buffers: usize,
    max_buffers: usize,
    flushing: bool,
    shutdown: bool,
    error: Option<FlowError>,
}

impl QueueState {
    fn check(&self) -> FlowResult {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.flushing || self.shutdown {
            return Err(FlowError::Flushing);
        }
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.buffers >= self.max_buffers
    }
}

#[derive(Debug)]
pub(crate) struct DataQueue {
    name: String,
    state: Mutex<QueueState>,
    item_added: Condvar,
    item_removed: Condvar,
}

impl DataQueue {
    pub(crate) fn new(name: impl Into<String>, max_buffers: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                buffers: 0,
                max_buffers: max_buffers.max(1),
                flushing: false,
                shutdown: false,
                error: None,
            }),
            item_added: Condvar::new(),
            item_removed: Condvar::new(),
        }
    }

    /// Enqueues a buffer, waiting while the queue is full.
    ///
    /// `on_overrun` runs each time the queue is found full, before waiting.
    pub(crate) fn push_buffer(&self, buffer: Buffer, mut on_overrun: impl FnMut()) -> FlowResult {
        let mut state = self.state.lock();
        loop {
            state.check()?;
            if !state.is_full() {
                break;
            }
            trace!(queue = %self.name, level = state.buffers, "Queue overrun");
            MutexGuard::unlocked(&mut state, &mut on_overrun);
            state.check()?;
            if !state.is_full() {
                break;
            }
            self.item_removed.wait(&mut state);
        }
        state.items.push_back(QueueItem::Buffer(buffer));
        state.buffers += 1;
        self.item_added.notify_all();
        Ok(())
    }

    /// Enqueues a serialized event. Events never wait for space.
    pub(crate) fn push_event(&self, item: QueueItem) -> FlowResult {
        debug_assert!(!matches!(item, QueueItem::Buffer(_)));
        let mut state = self.state.lock();
        state.check()?;
        state.items.push_back(item);
        self.item_added.notify_all();
        Ok(())
    }

    /// Dequeues the next item, waiting while the queue is empty or flushing.
    ///
    /// `on_underrun` runs each time the queue is found empty, before waiting.
    /// Returns `Flushing` only once the queue is shut down.
    pub(crate) fn pop(&self, mut on_underrun: impl FnMut()) -> Result<QueueItem, FlowError> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Err(FlowError::Flushing);
            }
            if state.flushing {
                self.item_added.wait(&mut state);
                continue;
            }
            if let Some(item) = state.items.pop_front() {
                if matches!(item, QueueItem::Buffer(_)) {
                    state.buffers -= 1;
                    self.item_removed.notify_all();
                }
                return Ok(item);
            }

            trace!(queue = %self.name, "Queue underrun");
            MutexGuard::unlocked(&mut state, &mut on_underrun);
            if state.items.is_empty() && !state.flushing && !state.shutdown {
                self.item_added.wait(&mut state);
            }
        }
    }

    /// Enters or leaves flushing. Entering drops every queued item.
    pub(crate) fn set_flushing(&self, flushing: bool) {
        let mut state = self.state.lock();
        state.flushing = flushing;
        if flushing {
            state.items.clear();
            state.buffers = 0;
        } else {
            state.error = None;
        }
        self.item_added.notify_all();
        self.item_removed.notify_all();
    }

    /// Wakes and fails every waiter until [`DataQueue::restart`] is called.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.items.clear();
        state.buffers = 0;
        self.item_added.notify_all();
        self.item_removed.notify_all();
    }

    pub(crate) fn restart(&self) {
        let mut state = self.state.lock();
        state.shutdown = false;
        state.flushing = false;
        state.error = None;
        state.items.clear();
        state.buffers = 0;
    }

    /// Makes producers fail with `err` from now on.
    pub(crate) fn set_error(&self, err: FlowError) {
        let mut state = self.state.lock();
        state.error = Some(err);
        self.item_removed.notify_all();
    }

    pub(crate) fn max_buffers(&self) -> usize {
        self.state.lock().max_buffers
    }

    pub(crate) fn set_max_buffers(&self, max_buffers: usize) {
        let mut state = self.state.lock();
        if max_buffers > state.max_buffers {
            state.max_buffers = max_buffers;
            self.item_removed.notify_all();
        }
    }

    /// Current fill level in buffers and the limit.
    pub(crate) fn level(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.buffers, state.max_buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn preserves_order_of_buffers_and_events() {
        let q = DataQueue::new("q", 4);
        q.push_event(QueueItem::Segment(Segment::new())).unwrap();
        q.push_buffer(Buffer::with_size(1), || {}).unwrap();
        q.push_buffer(Buffer::with_size(2), || {}).unwrap();
        q.push_event(QueueItem::Eos).unwrap();

        assert!(matches!(q.pop(|| {}).unwrap(), QueueItem::Segment(_)));
        match q.pop(|| {}).unwrap() {
            QueueItem::Buffer(b) => assert_eq!(b.size(), 1),
            other => panic!("unexpected item: {other:?}"),
        }
        match q.pop(|| {}).unwrap() {
            QueueItem::Buffer(b) => assert_eq!(b.size(), 2),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(matches!(q.pop(|| {}).unwrap(), QueueItem::Eos));
    }

    #[test]
    fn overrun_callback_can_grow_the_limit() {
        let q = Arc::new(DataQueue::new("q", 1));
        q.push_buffer(Buffer::with_size(1), || {}).unwrap();

        let mut overruns = 0;
        let grow = Arc::clone(&q);
        q.push_buffer(Buffer::with_size(1), || {
            overruns += 1;
            grow.set_max_buffers(2);
        })
        .unwrap();
        assert_eq!(overruns, 1);
        assert_eq!(q.level(), (2, 2));
    }

    #[test]
    fn full_queue_blocks_until_consumer_pops() {
        let q = Arc::new(DataQueue::new("q", 1));
        q.push_buffer(Buffer::with_size(1), || {}).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push_buffer(Buffer::with_size(2), || {}))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());

        assert!(matches!(q.pop(|| {}).unwrap(), QueueItem::Buffer(_)));
        producer.join().unwrap().unwrap();
        assert_eq!(q.level(), (1, 1));
    }

    #[test]
    fn flushing_wakes_blocked_producer() {
        let q = Arc::new(DataQueue::new("q", 1));
        q.push_buffer(Buffer::with_size(1), || {}).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push_buffer(Buffer::with_size(2), || {}))
        };
        thread::sleep(Duration::from_millis(20));
        q.set_flushing(true);
        assert!(matches!(producer.join().unwrap(), Err(FlowError::Flushing)));
        assert_eq!(q.level(), (0, 1));
    }

    #[test]
    fn underrun_runs_before_waiting_and_shutdown_ends_pop() {
        let q = Arc::new(DataQueue::new("q", 1));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut underruns = 0;
                let res = q.pop(|| underruns += 1);
                (res.is_err(), underruns)
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.shutdown();
        let (failed, underruns) = consumer.join().unwrap();
        assert!(failed);
        assert!(underruns >= 1);
    }
}
