// Copyright 2024-2025 The weft authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared pool state: queues, counters, lifecycle and worker spawning.

use super::central::{Central, Lifecycle};
use super::ring::{LocalQueue, Steal};
use super::timer::TimedQueue;
use super::worker;
#[cfg(feature = "log_scheduling")]
use super::worker::SchedStats;
use crate::macros::{log_debug, log_warn};
#[cfg(feature = "log_scheduling")]
use crate::macros::log_info;
use crate::task::Task;
use crate::thread_pool::CpuPinningPolicy;
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

/// State shared between the pool handle(s) and the worker threads.
pub(crate) struct Inner {
    /// Central queue plus the lifecycle state machine under its mutex.
    pub(crate) central: Central,
    /// Per-worker bounded queues, indexed by worker slot.
    pub(crate) rings: Box<[LocalQueue]>,
    /// Timed tasks and the timer role.
    pub(crate) timed: TimedQueue,
    /// Worker thread handles by slot; `None` marks a worker that never
    /// started (and that `resume()` may retry).
    threads: Mutex<Vec<Option<JoinHandle<()>>>>,
    /// Number of workers currently running their scheduling loop.
    pub(crate) live: CachePadded<AtomicUsize>,
    /// Tells busy workers to visit the lifecycle before their next round.
    /// Set on halt and shutdown, cleared on resume.
    pub(crate) interrupt: CachePadded<AtomicBool>,
    /// Whether the over-full local queue warning fired already.
    overflow_warned: AtomicBool,
    /// CPU pinning policy, applied when (re)starting workers.
    pinning: CpuPinningPolicy,
    /// Pool-wide scheduling statistics.
    #[cfg(feature = "log_scheduling")]
    pub(crate) stats: Mutex<SchedStats>,
}

impl Inner {
    /// Creates the shared state for a pool of `requested` worker slots. No
    /// threads are started yet.
    pub(crate) fn new(requested: usize, pinning: CpuPinningPolicy) -> Arc<Self> {
        Arc::new(Self {
            central: Central::new(),
            rings: (0..requested).map(|_| LocalQueue::new()).collect(),
            timed: TimedQueue::new(),
            threads: Mutex::new((0..requested).map(|_| None).collect()),
            live: CachePadded::new(AtomicUsize::new(0)),
            interrupt: CachePadded::new(AtomicBool::new(false)),
            overflow_warned: AtomicBool::new(false),
            pinning,
            #[cfg(feature = "log_scheduling")]
            stats: Mutex::new(SchedStats::default()),
        })
    }

    /// Enqueues a task for asynchronous execution.
    ///
    /// From a worker of this pool with spare local capacity, this is the fast
    /// path: a push at the owner-LIFO end of that worker's queue, with no
    /// synchronization beyond the queue's own publication protocol. From any
    /// other thread, or on an over-full local queue, the task goes through
    /// the central queue.
    pub(crate) fn schedule(&self, task: Task) {
        if let Some(index) = worker::current_worker(self) {
            // SAFETY: `current_worker` only reports an index on the thread
            // that owns ring `index`.
            match unsafe { self.rings[index].push(task) } {
                Ok(()) => return,
                Err(task) => {
                    self.warn_overflow(index);
                    self.push_central(task);
                }
            }
        } else {
            self.push_central(task);
        }
    }

    /// Appends a task to the central queue, discarding it if the pool is
    /// already shutting down.
    pub(crate) fn push_central(&self, task: Task) {
        if let Err(task) = self.central.push(task) {
            log_debug!("discarding a task scheduled on a pool that is shutting down");
            drop(task);
        }
    }

    /// Enqueues a task for execution at or after the given deadline.
    ///
    /// A deadline that has already passed dispatches like
    /// [`schedule()`](Self::schedule). Otherwise the task enters the timed
    /// queue, and the current timer (if any) is woken whenever the new entry
    /// shortens the earliest deadline.
    pub(crate) fn schedule_at(&self, deadline: Instant, task: Task) {
        if deadline <= Instant::now() {
            return self.schedule(task);
        }
        let guard = self.central.lock();
        if matches!(guard.lifecycle, Lifecycle::ShuttingDown | Lifecycle::Dead) {
            drop(guard);
            drop(task);
            return;
        }
        // The push and the notification happen under the central mutex:
        // notifying without it could slip between an idle worker's deadline
        // check and its wait, and the shortened deadline would go unnoticed.
        if self.timed.push(deadline, task) {
            self.central.notify_all();
        }
    }

    fn warn_overflow(&self, _index: usize) {
        if !self.overflow_warned.swap(true, Ordering::Relaxed) {
            log_warn!(
                "worker {_index}'s local queue is over-full; tasks are spilling to the central queue"
            );
        }
    }

    /// Suspends task execution, blocking until every worker has parked.
    ///
    /// When called from one of this pool's own workers, the calling worker
    /// parks right here, leaving its in-flight task suspended on the stack
    /// until `resume()` or destruction.
    pub(crate) fn halt(&self) {
        let mut guard = self.central.lock();
        match guard.lifecycle {
            Lifecycle::Initializing | Lifecycle::Running => {
                guard.lifecycle = Lifecycle::Halting;
                self.interrupt.store(true, Ordering::Release);
                self.central.notify_all();
                if guard.parked == self.live.load(Ordering::SeqCst) {
                    // No live workers, or all of them already parked.
                    guard.lifecycle = Lifecycle::Halted;
                    self.central.notify_all();
                }
            }
            Lifecycle::Halting | Lifecycle::Halted => {}
            Lifecycle::ShuttingDown | Lifecycle::Dead => return,
        }
        if worker::current_worker(self).is_some() {
            guard.parked += 1;
            if guard.parked == self.live.load(Ordering::SeqCst)
                && guard.lifecycle == Lifecycle::Halting
            {
                guard.lifecycle = Lifecycle::Halted;
                self.central.notify_all();
            }
            while matches!(guard.lifecycle, Lifecycle::Halting | Lifecycle::Halted) {
                guard = self.central.wait(guard);
            }
            guard.parked -= 1;
        } else {
            while guard.lifecycle == Lifecycle::Halting {
                guard = self.central.wait(guard);
            }
        }
    }

    /// Resumes a halted pool and retries any worker that previously failed to
    /// start. No-op when already running.
    ///
    /// Fails only if, afterwards, not a single worker is live.
    pub(crate) fn resume(self: &Arc<Self>) -> io::Result<()> {
        {
            let mut guard = self.central.lock();
            match guard.lifecycle {
                Lifecycle::Halting | Lifecycle::Halted => {
                    guard.lifecycle = Lifecycle::Running;
                    self.interrupt.store(false, Ordering::Release);
                    self.central.notify_all();
                }
                Lifecycle::Initializing | Lifecycle::Running => {}
                Lifecycle::ShuttingDown | Lifecycle::Dead => return Ok(()),
            }
        }
        self.spawn_missing()
    }

    /// Starts a worker thread for every slot that doesn't have one.
    ///
    /// Succeeds as long as at least one worker is live afterwards; otherwise
    /// reports the last spawn error.
    pub(crate) fn spawn_missing(self: &Arc<Self>) -> io::Result<()> {
        let mut last_error = None;
        {
            let mut threads = self.threads.lock().unwrap();
            for index in 0..threads.len() {
                if threads[index].is_some() {
                    continue;
                }
                // Counted before the spawn so a worker that starts and
                // immediately exits can never drive the counter negative.
                self.live.fetch_add(1, Ordering::SeqCst);
                match self.spawn_worker(index) {
                    Ok(handle) => threads[index] = Some(handle),
                    Err(error) => {
                        self.live.fetch_sub(1, Ordering::SeqCst);
                        log_warn!("failed to start worker {index}: {error}");
                        last_error = Some(error);
                    }
                }
            }
        }
        if self.live.load(Ordering::SeqCst) == 0 {
            if let Some(error) = last_error {
                return Err(error);
            }
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, index: usize) -> io::Result<JoinHandle<()>> {
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match self.pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let inner = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("weft-worker-{index}"))
            .spawn(move || {
                #[cfg(all(
                    not(miri),
                    any(
                        target_os = "android",
                        target_os = "dragonfly",
                        target_os = "freebsd",
                        target_os = "linux"
                    )
                ))]
                match inner.pinning {
                    CpuPinningPolicy::No => (),
                    CpuPinningPolicy::IfSupported => {
                        let mut cpu_set = CpuSet::new();
                        if let Err(_e) = cpu_set.set(index) {
                            log_warn!("Failed to set CPU affinity for worker #{index}: {_e}");
                        } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                            log_warn!("Failed to set CPU affinity for worker #{index}: {_e}");
                        } else {
                            log_debug!("Pinned worker #{index} to CPU #{index}");
                        }
                    }
                    CpuPinningPolicy::Always => {
                        let mut cpu_set = CpuSet::new();
                        if let Err(e) = cpu_set.set(index) {
                            panic!("Failed to set CPU affinity for worker #{index}: {e}");
                        } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                            panic!("Failed to set CPU affinity for worker #{index}: {e}");
                        } else {
                            log_debug!("Pinned worker #{index} to CPU #{index}");
                        }
                    }
                }
                worker::worker_main(inner, index);
            })
    }

    /// Marks the pool running once construction has started its workers.
    pub(crate) fn mark_running(&self) {
        let mut guard = self.central.lock();
        if guard.lifecycle == Lifecycle::Initializing {
            guard.lifecycle = Lifecycle::Running;
        }
        drop(guard);
        self.central.notify_all();
    }

    /// Number of live workers.
    pub(crate) fn concurrency(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// True only if every worker is simultaneously blocked in the idle wait
    /// and neither the central queue nor the timed queue (for deadlines that
    /// have passed) holds anything.
    pub(crate) fn is_idle(&self) -> bool {
        let guard = self.central.lock();
        let live = self.live.load(Ordering::SeqCst);
        live > 0
            && guard.idle == live
            && guard.tasks.is_empty()
            && self
                .timed
                .next_deadline()
                .map_or(true, |deadline| deadline > Instant::now())
    }

    /// True only once every worker has fully parked (or none is live).
    pub(crate) fn is_halted(&self) -> bool {
        let guard = self.central.lock();
        guard.lifecycle == Lifecycle::Halted || self.live.load(Ordering::SeqCst) == 0
    }

    /// Stops the workers, joins them, and discards every task that never
    /// started. Called from the pool's destructor.
    pub(crate) fn shutdown(&self) {
        {
            let mut guard = self.central.lock();
            if guard.lifecycle == Lifecycle::Dead {
                return;
            }
            guard.lifecycle = Lifecycle::ShuttingDown;
            self.interrupt.store(true, Ordering::Release);
        }
        self.central.notify_all();

        let handles: Vec<_> = {
            let mut threads = self.threads.lock().unwrap();
            threads.iter_mut().map(|slot| slot.take()).collect()
        };
        for handle in handles.into_iter().flatten() {
            let _ = handle.join();
        }

        self.central.clear();
        self.timed.clear();
        for ring in self.rings.iter() {
            loop {
                match ring.steal() {
                    Steal::Success(task) => drop(task),
                    Steal::Retry => {}
                    Steal::Empty => break,
                }
            }
        }

        self.central.lock().lifecycle = Lifecycle::Dead;

        #[cfg(feature = "log_scheduling")]
        {
            let stats = self.stats.lock().unwrap();
            log_info!("Scheduling statistics:");
            log_info!("- local pops: {}", stats.local_pops);
            log_info!("- central pops: {}", stats.central_pops);
            log_info!("- steals: {}", stats.steals);
            log_info!("- failed sweeps: {}", stats.failed_sweeps);
            log_info!("- timed promotions: {}", stats.timed_promotions);
        }
    }
}
