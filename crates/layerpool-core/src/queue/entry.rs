//! Heap entry and its dispatch ordering.

use std::cmp::Ordering;

use crate::domain::{Priority, Task};

/// Which lane of a priority band an entry sits in.
///
/// Retried tasks go ahead of fresh submissions of the same priority, but never
/// ahead of a higher priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Lane {
    Fresh,
    Retry,
}

/// A queued task plus its sort key.
///
/// `BinaryHeap` is a max-heap, so "greater" means "dispatched first":
/// higher priority, then retry lane, then the smaller sequence number.
#[derive(Debug)]
pub(super) struct QueueEntry {
    pub(super) priority: Priority,
    pub(super) lane: Lane,
    pub(super) seq: u64,
    pub(super) task: Task,
}

impl QueueEntry {
    fn key(&self) -> (Priority, Lane, std::cmp::Reverse<u64>) {
        (self.priority, self.lane, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}
