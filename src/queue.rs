//! Priority-ordered work queue.
//!
//! A binary heap of pending work ordered by `(priority, generation)`:
//! higher priority first, and within one priority the lower generation
//! (earlier submission) first. The generation counter is what makes the
//! heap insertion-stable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::cancel::CancelToken;
use crate::context::AmbientContext;
use crate::priority::DispatchPriority;

/// One unit of deferred execution.
///
/// Owned by the queue until popped; runs at most once. `canceled_ack`
/// fires instead of `run` when the token is observed fired at dequeue
/// time, so an attached completion cell transitions to canceled.
pub(crate) struct WorkItem {
    pub(crate) run: Box<dyn FnOnce() + Send>,
    pub(crate) context: Option<AmbientContext>,
    pub(crate) cancel: Option<CancelToken>,
    pub(crate) canceled_ack: Option<Box<dyn FnOnce() + Send>>,
}

impl WorkItem {
    pub(crate) fn new(run: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            run,
            context: None,
            cancel: None,
            canceled_ack: None,
        }
    }
}

struct QueueEntry {
    priority: DispatchPriority,
    /// Submission order for FIFO tie-breaking among equal priorities.
    generation: u64,
    item: WorkItem,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.generation == other.generation
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; for equal priorities the earlier
        // generation comes first (BinaryHeap is a max-heap).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Insertion-stable priority queue of pending work.
pub(crate) struct WorkQueue {
    heap: BinaryHeap<QueueEntry>,
    next_generation: u64,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_generation: 0,
        }
    }

    pub(crate) fn push(&mut self, priority: DispatchPriority, item: WorkItem) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(QueueEntry {
            priority,
            generation,
            item,
        });
    }

    /// Pops the highest-priority, oldest-at-that-priority item.
    pub(crate) fn pop(&mut self) -> Option<(DispatchPriority, WorkItem)> {
        self.heap.pop().map(|entry| (entry.priority, entry.item))
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Empties the queue, returning the items in no particular order.
    pub(crate) fn take_all(&mut self) -> Vec<WorkItem> {
        self.heap.drain().map(|entry| entry.item).collect()
    }
}
