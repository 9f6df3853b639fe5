//! Priority admission queue for throttled tasks
//!
//! A task that finds every candidate rate limited takes a ticket and waits
//! for its turn. Tickets are ordered by priority, then by arrival. Only the
//! head ticket may retry selection; everyone else waits for the head to
//! change.

use super::task::TaskPriority;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    priority: TaskPriority,
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Bounded wait queue ordered by priority then submission
#[derive(Debug)]
pub struct AdmissionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    changed: Notify,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
        }
    }

    /// Join the queue, `None` when it is full
    pub fn enqueue(&self, priority: TaskPriority) -> Option<QueueTicket<'_>> {
        let mut state = self.state.lock();
        if state.heap.len() >= self.capacity {
            return None;
        }
        let entry = Entry {
            priority,
            seq: state.next_seq,
        };
        state.next_seq += 1;
        state.heap.push(entry);
        Some(QueueTicket { queue: self, entry })
    }

    pub fn depth(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Place in the admission queue, given up on drop
#[derive(Debug)]
pub struct QueueTicket<'a> {
    queue: &'a AdmissionQueue,
    entry: Entry,
}

impl<'a> QueueTicket<'a> {
    pub fn priority(&self) -> TaskPriority {
        self.entry.priority
    }

    pub fn is_head(&self) -> bool {
        self.queue.state.lock().heap.peek() == Some(&self.entry)
    }

    /// Future resolving when the queue changes
    ///
    /// Create it before checking `is_head` so a departure between the check
    /// and the wait is not missed.
    pub fn changed(&self) -> Notified<'a> {
        self.queue.changed.notified()
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        let entry = self.entry;
        self.queue.state.lock().heap.retain(|e| *e != entry);
        self.queue.changed.notify_waiters();
    }
}
