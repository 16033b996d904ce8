// Copyright 2024-2025 The weft authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bounded per-worker ring queue: owner-LIFO at the tail, thief-FIFO at the
//! head.

use crate::task::Task;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Base-2 logarithm of the per-worker queue capacity.
///
/// Each worker pre-allocates a fixed queue of `2^LOG2_QUEUE_CAPACITY` slots.
/// A larger value lets more tasks be scheduled without taking the slow path,
/// at the cost of memory; a smaller value does the opposite. Edit this
/// constant to resize the queues.
pub(crate) const LOG2_QUEUE_CAPACITY: usize = 7;

/// Number of slots in each worker's local queue.
pub(crate) const QUEUE_CAPACITY: usize = 1 << LOG2_QUEUE_CAPACITY;

/// Bit mask mapping a monotonic index to a slot.
const MASK: usize = QUEUE_CAPACITY - 1;

/// Outcome of a steal attempt.
pub(crate) enum Steal {
    /// The queue was observed empty.
    Empty,
    /// Another consumer won the race for the head slot. The caller must not
    /// retry this queue within the same acquisition round.
    Retry,
    /// A task was stolen.
    Success(Task),
}

/// A fixed-capacity single-producer multi-consumer ring of tasks.
///
/// The owning worker pushes and pops at the `tail` end (LIFO, so freshly
/// spawned subtasks run depth-first while they are still cache-hot). Thieves
/// remove at the `head` end (FIFO, so a thief grabs the oldest task, which
/// tends to sit at the top of a dependency tree and expose the most new
/// parallelism).
///
/// `head` and `tail` are monotonically increasing; a slot index is obtained by
/// masking. The occupied region is `head..tail`, so `tail - head` never
/// exceeds [`QUEUE_CAPACITY`].
pub(crate) struct LocalQueue {
    /// Dequeue end, advanced by thieves (and by the owner when arbitrating for
    /// the last remaining task).
    head: CachePadded<AtomicUsize>,
    /// Enqueue end, written only by the owner.
    tail: CachePadded<AtomicUsize>,
    /// Backing slots. A slot is initialized exactly when its index lies in
    /// `head..tail`.
    slots: Box<[UnsafeCell<MaybeUninit<Task>>]>,
}

/// SAFETY: All concurrent access to the slots is mediated by the `head`/`tail`
/// protocol below; `Task` itself is `Send`.
unsafe impl Send for LocalQueue {}
/// SAFETY: See `Send` above.
unsafe impl Sync for LocalQueue {}

impl LocalQueue {
    /// Creates an empty queue with all slots pre-allocated.
    pub(crate) fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots: (0..QUEUE_CAPACITY)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }

    /// Moves the task out of the slot at the given (unmasked) index.
    ///
    /// # Safety
    ///
    /// The slot must hold an initialized task that no other consumer can
    /// legitimately claim, or whose speculative copy the caller forgets on a
    /// lost arbitration (see [`steal()`](Self::steal)).
    #[inline(always)]
    unsafe fn read_slot(&self, index: usize) -> Task {
        // SAFETY: Guaranteed by the caller.
        unsafe { (*self.slots[index & MASK].get()).assume_init_read() }
    }

    /// Appends a task at the tail end, failing if the queue is full.
    ///
    /// On failure the task is handed back so the caller can route it to the
    /// central queue instead.
    ///
    /// # Safety
    ///
    /// Must only be called from the thread that owns this queue.
    pub(crate) unsafe fn push(&self, task: Task) -> Result<(), Task> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= QUEUE_CAPACITY {
            return Err(task);
        }
        // SAFETY: `tail - head < QUEUE_CAPACITY`, so the slot at `tail` is
        // outside the occupied region and no thief can read it until the
        // store of `tail` below publishes it.
        unsafe {
            (*self.slots[tail & MASK].get()).write(task);
        }
        // Publish the slot. The release store pairs with the acquire load of
        // `tail` in `steal()`, so a thief that observes the new tail also
        // observes the task's bytes.
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Removes the most recently pushed task (LIFO).
    ///
    /// Tentatively decrements `tail`, then inspects `head`: with more than one
    /// task left the pop is uncontended; with exactly one task left the owner
    /// arbitrates against concurrent thieves by compare-and-swap on `head`.
    ///
    /// # Safety
    ///
    /// Must only be called from the thread that owns this queue.
    pub(crate) unsafe fn pop(&self) -> Option<Task> {
        let tail = self.tail.load(Ordering::Relaxed);
        let new_tail = tail.wrapping_sub(1);
        self.tail.store(new_tail, Ordering::Relaxed);
        // Order the tentative decrement before the load of `head`, so that
        // this pop and any concurrent steal agree on who observes whom.
        fence(Ordering::SeqCst);
        let head = self.head.load(Ordering::Relaxed);

        let size = new_tail.wrapping_sub(head) as isize;
        if size > 0 {
            // More than one task remains: thieves at the head cannot reach
            // the slot at `new_tail`.
            // SAFETY: The slot is initialized and unreachable by thieves.
            return Some(unsafe { self.read_slot(new_tail) });
        }
        if size == 0 {
            // Exactly one task remains: race against thieves for it.
            let won = self
                .head
                .compare_exchange(
                    head,
                    head.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok();
            // Whether or not the race was won, the queue is now empty;
            // restore `tail` past the contested slot.
            self.tail.store(tail, Ordering::Relaxed);
            if won {
                // SAFETY: The winning CAS excluded every thief.
                return Some(unsafe { self.read_slot(new_tail) });
            }
            return None;
        }
        // The queue was empty; undo the decrement.
        self.tail.store(tail, Ordering::Relaxed);
        None
    }

    /// Attempts to remove the oldest task (FIFO). Called by non-owner workers.
    ///
    /// Thieves arbitrate among themselves (and against an owner popping the
    /// last task) by compare-and-swap on `head`. On [`Steal::Retry`] the
    /// caller moves on to the next victim rather than spinning here.
    pub(crate) fn steal(&self) -> Steal {
        let head = self.head.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::Acquire);
        if tail.wrapping_sub(head) as isize <= 0 {
            return Steal::Empty;
        }
        // Speculatively copy the task out of the slot. The slot at `head`
        // cannot be overwritten by the owner until `head` itself advances
        // (a push reuses it only once `tail` wraps a full capacity past it,
        // which the capacity check forbids while `head` stands still), so if
        // the copy raced with anything the CAS below is guaranteed to fail
        // and the copy is forgotten.
        // SAFETY: See above; on a lost race the copy is forgotten, so the
        // task is never observed by two consumers.
        let task = unsafe { self.read_slot(head) };
        match self.head.compare_exchange(
            head,
            head.wrapping_add(1),
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => Steal::Success(task),
            Err(_) => {
                std::mem::forget(task);
                Steal::Retry
            }
        }
    }

    /// Returns the number of tasks currently queued. Racy; only used for
    /// logging and tests.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

impl Drop for LocalQueue {
    /// Drops the remaining tasks without invoking them.
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut index = head;
        while index != tail {
            // SAFETY: `&mut self` excludes all other consumers, and the slots
            // in `head..tail` are initialized.
            drop(unsafe { self.read_slot(index) });
            index = index.wrapping_add(1);
        }
    }
}
