// Copyright 2024-2025 The weft authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The pool-wide queue of tasks with a deadline, and the timer role that
//! polls it.

use crate::task::Task;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// A task keyed by the absolute monotonic-clock deadline at which it becomes
/// runnable.
struct TimedEntry {
    deadline: Instant,
    task: Task,
}

// `BinaryHeap` is a max-heap; reverse the comparison so the earliest deadline
// sits on top. Entries with equal deadlines compare equal and surface in
// unspecified order.
impl Ord for TimedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimedEntry {}

/// Min-heap of timed tasks plus the claim flag for the timer role.
///
/// At most one worker at a time holds the timer role; only the holder
/// computes wait timeouts from the heap and promotes due entries. The role
/// is a soft assignment claimed by whichever idle worker first observes the
/// heap non-empty.
pub(crate) struct TimedQueue {
    heap: Mutex<BinaryHeap<TimedEntry>>,
    /// Set while some worker holds the timer role.
    claimed: AtomicBool,
}

impl TimedQueue {
    /// Creates an empty timed queue with the timer role unclaimed.
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            claimed: AtomicBool::new(false),
        }
    }

    /// Inserts a task with the given absolute deadline.
    ///
    /// Returns `true` if the new entry became the earliest deadline (in
    /// particular when the heap was empty), in which case the caller must
    /// wake the current timer so it can shorten its wait.
    pub(crate) fn push(&self, deadline: Instant, task: Task) -> bool {
        let mut heap = self.heap.lock().unwrap();
        let is_new_minimum = heap.peek().map_or(true, |top| deadline < top.deadline);
        heap.push(TimedEntry { deadline, task });
        is_new_minimum
    }

    /// Returns the earliest deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().unwrap().peek().map(|entry| entry.deadline)
    }

    /// Removes and returns the earliest entry if its deadline has passed.
    pub(crate) fn pop_due(&self, now: Instant) -> Option<Task> {
        let mut heap = self.heap.lock().unwrap();
        if heap.peek()?.deadline <= now {
            Some(heap.pop().expect("peeked entry vanished").task)
        } else {
            None
        }
    }

    /// Whether any timed task is pending, due or not.
    pub(crate) fn has_entries(&self) -> bool {
        !self.heap.lock().unwrap().is_empty()
    }

    /// Attempts to claim the timer role. Returns `true` on success; the
    /// caller then owns the role until it calls [`release()`](Self::release).
    pub(crate) fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the timer role.
    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// Drops all pending timed tasks. Used at teardown.
    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.heap.lock().unwrap());
        drop(drained);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order() {
        let timed = TimedQueue::new();
        let base = Instant::now();
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for (id, offset) in [(0u32, 30u64), (1, 10), (2, 20)] {
            let log = log.clone();
            timed.push(
                base + Duration::from_millis(offset),
                Task::new(move || log.lock().unwrap().push(id)),
            );
        }
        let far_future = base + Duration::from_secs(1);
        while let Some(task) = timed.pop_due(far_future) {
            task.run();
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn pop_due_respects_deadlines() {
        let timed = TimedQueue::new();
        let base = Instant::now();
        timed.push(base + Duration::from_secs(60), Task::new(|| ()));
        assert!(timed.pop_due(base).is_none());
        assert!(timed.has_entries());
        assert!(timed.pop_due(base + Duration::from_secs(61)).is_some());
        assert!(!timed.has_entries());
    }

    #[test]
    fn push_reports_new_minimum() {
        let timed = TimedQueue::new();
        let base = Instant::now();
        assert!(timed.push(base + Duration::from_millis(50), Task::new(|| ())));
        assert!(!timed.push(base + Duration::from_millis(80), Task::new(|| ())));
        assert!(timed.push(base + Duration::from_millis(10), Task::new(|| ())));
    }

    #[test]
    fn next_deadline_tracks_the_minimum() {
        let timed = TimedQueue::new();
        assert!(timed.next_deadline().is_none());
        let base = Instant::now();
        timed.push(base + Duration::from_millis(40), Task::new(|| ()));
        timed.push(base + Duration::from_millis(20), Task::new(|| ()));
        assert_eq!(timed.next_deadline(), Some(base + Duration::from_millis(20)));
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let timed = TimedQueue::new();
        assert!(timed.claim());
        assert!(!timed.claim());
        timed.release();
        assert!(timed.claim());
    }
}
