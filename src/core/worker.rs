// Copyright 2024-2025 The weft authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker thread main loop.

use super::central::Lifecycle;
use super::pool::Inner;
use super::ring::Steal;
use super::rng::XorShift64;
use crate::macros::{log_debug, log_error};
use crate::task::Task;
use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

thread_local! {
    /// Identity of the pool worker running on the current thread: the address
    /// of its pool's shared state, and its slot index. `(0, _)` on threads
    /// that aren't pool workers.
    static CURRENT_WORKER: Cell<(usize, usize)> = const { Cell::new((0, usize::MAX)) };
}

/// Returns the calling thread's worker index, if the calling thread is a
/// worker of the given pool.
pub(crate) fn current_worker(inner: &Inner) -> Option<usize> {
    let (pool, index) = CURRENT_WORKER.get();
    (pool == inner as *const Inner as usize).then_some(index)
}

/// Per-worker scheduling statistics, merged into the pool totals when the
/// worker exits.
#[cfg(feature = "log_scheduling")]
#[derive(Default)]
pub(crate) struct SchedStats {
    /// Tasks popped from this worker's own queue.
    pub(crate) local_pops: u64,
    /// Tasks popped from the central queue.
    pub(crate) central_pops: u64,
    /// Tasks stolen from other workers.
    pub(crate) steals: u64,
    /// Steal sweeps that visited every other worker and came back empty.
    pub(crate) failed_sweeps: u64,
    /// Timed tasks promoted to this worker's queue.
    pub(crate) timed_promotions: u64,
}

#[cfg(feature = "log_scheduling")]
impl std::ops::AddAssign<&SchedStats> for SchedStats {
    fn add_assign(&mut self, other: &SchedStats) {
        self.local_pops += other.local_pops;
        self.central_pops += other.central_pops;
        self.steals += other.steals;
        self.failed_sweeps += other.failed_sweeps;
        self.timed_promotions += other.timed_promotions;
    }
}

/// What the acquisition round decided.
enum Directive {
    /// Run this task, then start a new round.
    Run(Task),
    /// The pool is halting: park until resumed or shut down.
    Park,
    /// The pool is shutting down: exit the loop.
    Exit,
}

/// Why the idle wait returned.
enum Wake {
    /// The central queue may have work, or the wait was spurious.
    Work,
    /// This worker holds the timer role and a deadline has passed.
    Timed,
    /// The pool is halting.
    Park,
    /// The pool is shutting down.
    Exit,
}

/// Main function run by a worker thread.
pub(crate) fn worker_main(inner: Arc<Inner>, index: usize) {
    CURRENT_WORKER.set((Arc::as_ptr(&inner) as usize, index));
    let mut rng = XorShift64::new(index as u64 + 1);
    #[cfg(feature = "log_scheduling")]
    let mut stats = SchedStats::default();
    log_debug!("[worker {index}] started");

    loop {
        let directive = next_task(
            &inner,
            index,
            &mut rng,
            #[cfg(feature = "log_scheduling")]
            &mut stats,
        );
        match directive {
            Directive::Run(task) => run_task(task),
            Directive::Park => {
                if !park(&inner) {
                    break;
                }
            }
            Directive::Exit => break,
        }
    }

    #[cfg(feature = "log_scheduling")]
    {
        *inner.stats.lock().unwrap() += &stats;
    }
    inner.live.fetch_sub(1, Ordering::SeqCst);
    log_debug!("[worker {index}] exiting");
}

/// One acquisition round: own queue first (LIFO), then the central queue,
/// then a randomized steal sweep, then timer duty, then the idle wait.
fn next_task(
    inner: &Inner,
    index: usize,
    rng: &mut XorShift64,
    #[cfg(feature = "log_scheduling")] stats: &mut SchedStats,
) -> Directive {
    loop {
        if inner.interrupt.load(Ordering::Acquire) {
            match inner.central.lock().lifecycle {
                Lifecycle::Halting | Lifecycle::Halted => return Directive::Park,
                Lifecycle::ShuttingDown | Lifecycle::Dead => return Directive::Exit,
                // A stale flag from a halt that has already been resumed.
                Lifecycle::Initializing | Lifecycle::Running => {}
            }
        }

        // SAFETY: Ring `index` is owned by this thread.
        if let Some(task) = unsafe { inner.rings[index].pop() } {
            #[cfg(feature = "log_scheduling")]
            {
                stats.local_pops += 1;
            }
            return Directive::Run(task);
        }

        if let Some(task) = inner.central.try_pop() {
            #[cfg(feature = "log_scheduling")]
            {
                stats.central_pops += 1;
            }
            return Directive::Run(task);
        }

        if let Some(task) = steal_sweep(inner, index, rng) {
            #[cfg(feature = "log_scheduling")]
            {
                stats.steals += 1;
            }
            return Directive::Run(task);
        }
        #[cfg(feature = "log_scheduling")]
        {
            stats.failed_sweeps += 1;
        }

        match idle_wait(inner) {
            Wake::Work => continue,
            Wake::Timed => {
                promote_due(
                    inner,
                    index,
                    #[cfg(feature = "log_scheduling")]
                    stats,
                );
                continue;
            }
            Wake::Park => return Directive::Park,
            Wake::Exit => return Directive::Exit,
        }
    }
}

/// Tries to steal from the other workers, visiting each at most once in a
/// round, starting from a random victim.
fn steal_sweep(inner: &Inner, index: usize, rng: &mut XorShift64) -> Option<Task> {
    let num_workers = inner.rings.len();
    if num_workers <= 1 {
        return None;
    }
    let start = rng.next_below(num_workers);
    for offset in 0..num_workers {
        let victim = (start + offset) % num_workers;
        if victim == index {
            continue;
        }
        match inner.rings[victim].steal() {
            Steal::Success(task) => {
                log_debug!("[worker {index}] stole a task from worker {victim}");
                return Some(task);
            }
            // On Retry another consumer won the head slot; move on to the
            // next victim rather than spinning on this one.
            Steal::Empty | Steal::Retry => {}
        }
    }
    None
}

/// Blocks on the central queue's condition variable until there is something
/// to do.
///
/// If timed tasks are pending and the timer role is free, this worker claims
/// the role and bounds its wait by the next deadline; otherwise it waits
/// unbounded. The role is released again on every wake-up, so whichever
/// worker ends up handling the deadline re-claims it explicitly.
fn idle_wait(inner: &Inner) -> Wake {
    let mut guard = inner.central.lock();
    guard.idle += 1;
    let mut released_role = false;
    let wake = loop {
        match guard.lifecycle {
            Lifecycle::ShuttingDown | Lifecycle::Dead => break Wake::Exit,
            Lifecycle::Halting | Lifecycle::Halted => break Wake::Park,
            Lifecycle::Initializing | Lifecycle::Running => {}
        }
        if !guard.tasks.is_empty() {
            break Wake::Work;
        }
        let now = Instant::now();
        match inner.timed.next_deadline() {
            Some(deadline) if deadline <= now => {
                if inner.timed.claim() {
                    break Wake::Timed;
                }
                // The current timer holder will promote it.
                guard = inner.central.wait(guard);
            }
            Some(deadline) => {
                if inner.timed.claim() {
                    guard = inner
                        .central
                        .wait_timeout(guard, deadline.saturating_duration_since(now));
                    inner.timed.release();
                    released_role = true;
                } else {
                    guard = inner.central.wait(guard);
                }
            }
            None => guard = inner.central.wait(guard),
        }
    };
    guard.idle -= 1;
    // This worker was on timer duty but leaves to do something else: hand the
    // role over so the remaining deadlines still have a watcher.
    if matches!(wake, Wake::Work) && released_role && inner.timed.has_entries() {
        inner.central.notify_all();
    }
    wake
}

/// Moves every expired timed task into this worker's queue, then gives up the
/// timer role.
///
/// Promoted tasks land at the owner-LIFO end so that ready timed work runs
/// before freshly scheduled tasks overtake it; if the local queue fills up,
/// the remainder spills to the central queue.
fn promote_due(
    inner: &Inner,
    index: usize,
    #[cfg(feature = "log_scheduling")] stats: &mut SchedStats,
) {
    let now = Instant::now();
    while let Some(task) = inner.timed.pop_due(now) {
        #[cfg(feature = "log_scheduling")]
        {
            stats.timed_promotions += 1;
        }
        // SAFETY: Ring `index` is owned by this thread.
        if let Err(task) = unsafe { inner.rings[index].push(task) } {
            inner.push_central(task);
        }
    }
    inner.timed.release();
    if inner.timed.has_entries() {
        // Let an idle worker claim the role for the remaining deadlines. The
        // notification must hold the central mutex so it cannot fall between
        // another worker's claim attempt and its wait.
        let _guard = inner.central.lock();
        inner.central.notify_all();
    }
}

/// Parks this worker for a halt. Returns `true` to resume the scheduling
/// loop, `false` to exit it.
fn park(inner: &Inner) -> bool {
    let mut guard = inner.central.lock();
    guard.parked += 1;
    if guard.parked == inner.live.load(Ordering::SeqCst) && guard.lifecycle == Lifecycle::Halting {
        // Last one in: the pool is now fully halted.
        guard.lifecycle = Lifecycle::Halted;
        inner.central.notify_all();
    }
    loop {
        match guard.lifecycle {
            Lifecycle::Halting | Lifecycle::Halted => guard = inner.central.wait(guard),
            Lifecycle::ShuttingDown | Lifecycle::Dead => {
                guard.parked -= 1;
                return false;
            }
            Lifecycle::Running | Lifecycle::Initializing => {
                guard.parked -= 1;
                return true;
            }
        }
    }
}

/// Aborts the process if a task unwinds: letting the panic tear the worker
/// down would strand every task in its local queue and leave the pool
/// lifecycle counters wrong.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log_error!("a pool task panicked; aborting the process");
            std::process::abort();
        }
    }
}

fn run_task(task: Task) {
    let guard = AbortOnPanic;
    task.run();
    std::mem::forget(guard);
}
