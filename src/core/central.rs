// Copyright 2024-2025 The weft authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The pool-wide central queue and the lifecycle state machine that shares
//! its mutex.

use crate::task::Task;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// State machine governing the pool as a whole.
///
/// Transitions: `Initializing → Running` on successful start;
/// `Running → Halting → Halted` on `halt()`; `Halted → Running` on
/// `resume()`; any state `→ ShuttingDown → Dead` on destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// Workers are being spawned; none may have observed the pool yet.
    Initializing,
    /// Workers execute tasks normally.
    Running,
    /// A halt was requested; workers park as they reach a quiescent point.
    Halting,
    /// Every worker is parked, awaiting `resume()` or destruction.
    Halted,
    /// The pool is being destroyed; workers exit their loops.
    ShuttingDown,
    /// All workers have been joined.
    Dead,
}

/// State protected by the central mutex.
pub(crate) struct CentralState {
    /// Tasks submitted from outside the pool or overflowed from a local
    /// queue, in FIFO order.
    pub(crate) tasks: VecDeque<Task>,
    /// Current lifecycle state.
    pub(crate) lifecycle: Lifecycle,
    /// Number of workers currently parked for a halt.
    pub(crate) parked: usize,
    /// Number of workers currently blocked in the idle wait.
    pub(crate) idle: usize,
}

/// The unbounded, lock-protected FIFO shared by all workers, together with
/// the condition variable every worker blocks on.
///
/// The lifecycle state machine deliberately lives under the same mutex: a
/// worker deciding whether to sleep, park, or exit observes the task queue
/// and the lifecycle in one critical section, so a state transition can never
/// slip between the check and the wait.
pub(crate) struct Central {
    state: Mutex<CentralState>,
    condvar: Condvar,
}

impl Central {
    /// Creates an empty queue in the [`Lifecycle::Initializing`] state.
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CentralState {
                tasks: VecDeque::new(),
                lifecycle: Lifecycle::Initializing,
                parked: 0,
                idle: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Locks the central state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CentralState> {
        self.state.lock().unwrap()
    }

    /// Appends a task and wakes one worker.
    ///
    /// Returns the task untouched instead if the pool is shutting down, so
    /// the caller can drop it outside the lock.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        {
            let mut guard = self.lock();
            match guard.lifecycle {
                Lifecycle::ShuttingDown | Lifecycle::Dead => return Err(task),
                _ => guard.tasks.push_back(task),
            }
        }
        self.condvar.notify_one();
        Ok(())
    }

    /// Pops the oldest task, if any, without blocking.
    pub(crate) fn try_pop(&self) -> Option<Task> {
        self.lock().tasks.pop_front()
    }

    /// Blocks on the condition variable until notified (or spuriously woken).
    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, CentralState>,
    ) -> MutexGuard<'a, CentralState> {
        self.condvar.wait(guard).unwrap()
    }

    /// Blocks on the condition variable for at most `timeout`.
    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, CentralState>,
        timeout: Duration,
    ) -> MutexGuard<'a, CentralState> {
        self.condvar.wait_timeout(guard, timeout).unwrap().0
    }

    /// Wakes every worker blocked on the condition variable.
    pub(crate) fn notify_all(&self) {
        self.condvar.notify_all();
    }

    /// Drops all pending tasks. Used at teardown, after the workers have been
    /// joined.
    pub(crate) fn clear(&self) {
        let drained = {
            let mut guard = self.lock();
            std::mem::take(&mut guard.tasks)
        };
        // Dropped outside the lock: a task's captures may run arbitrary drop
        // code.
        drop(drained);
    }
}
