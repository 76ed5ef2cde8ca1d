use super::event_loop::{EventHandler, LoopHandle};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Identifies which of a connection's timers expired.
///
/// A connection may keep several one-shot timers against the same loop
/// (e.g. a send timer and a handshake timer); the id it scheduled with is
/// echoed back in the `timeout_expired` upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub u32);

pub(crate) struct TimerEntry {
    deadline: Instant,
    seq: u64,
    // Set to true either by cancellation or by firing; the heap discards
    // entries whose flag is set.
    cancelled: Rc<Cell<bool>>,
    pub(crate) handler: Weak<RefCell<dyn EventHandler>>,
    pub(crate) id: TimerId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse to pop the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deadline-ordered queue of one-shot timers, owned by the event loop.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn schedule(
        &mut self,
        deadline: Instant,
        cancelled: Rc<Cell<bool>>,
        handler: Weak<RefCell<dyn EventHandler>>,
        id: TimerId,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            cancelled,
            handler,
            id,
        });
    }

    /// The earliest pending deadline, if any.
    ///
    /// Cancelled entries are discarded lazily, so this may report a deadline
    /// for a timer that no longer fires; the resulting wakeup is harmless.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pops the next live expired entry, discarding cancelled ones.
    ///
    /// The returned entry's flag is set before returning, which marks the
    /// owning [`TimerHandle`] as no longer scheduled.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry> {
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry must pop");
            if entry.cancelled.replace(true) {
                continue;
            }
            return Some(entry);
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// A connection's handle to one pending timer slot in the loop's queue.
///
/// Scheduling replaces any previously scheduled timeout; cancellation is a
/// flag flip, the queue entry is discarded lazily.
pub(crate) struct TimerHandle {
    handle: LoopHandle,
    active: Option<Rc<Cell<bool>>>,
}

impl TimerHandle {
    pub(crate) fn new(handle: &LoopHandle) -> Self {
        Self {
            handle: handle.clone(),
            active: None,
        }
    }

    pub(crate) fn schedule(
        &mut self,
        timeout: Duration,
        handler: Weak<RefCell<dyn EventHandler>>,
        id: TimerId,
    ) {
        self.cancel();
        let cancelled = Rc::new(Cell::new(false));
        self.handle
            .schedule_timer(Instant::now() + timeout, cancelled.clone(), handler, id);
        self.active = Some(cancelled);
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(flag) = self.active.take() {
            flag.set(true);
        }
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.active.as_ref().is_some_and(|flag| !flag.get())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
