// Copyright 2024-2025 The weft authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool for fine-grained multitasking at a lightweight cost.

use crate::core::{Inner, QUEUE_CAPACITY};
use crate::task::Task;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// Error starting a pool's worker threads.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The operating system refused to start every worker thread. As long as
    /// at least one worker starts, construction and
    /// [`resume()`](ThreadPool::resume) succeed and
    /// [`concurrency()`](ThreadPool::concurrency) reports how many made it.
    #[error("failed to start any worker thread")]
    ThreadStart(#[source] std::io::Error),
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for ThreadPoolBuilder {
    /// One worker per available CPU, no pinning.
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// Fails only if not a single worker thread could be started; a pool that
    /// starts some but not all of its requested workers is functional and
    /// reports the shortfall through
    /// [`concurrency()`](ThreadPool::concurrency).
    ///
    /// ```
    /// # use weft::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # use std::sync::atomic::{AtomicUsize, Ordering};
    /// # use std::sync::Arc;
    /// let pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(2).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build()
    /// .expect("failed to start worker threads");
    ///
    /// let counter = Arc::new(AtomicUsize::new(0));
    /// for _ in 0..10 {
    ///     let counter = counter.clone();
    ///     pool.schedule(move || {
    ///         counter.fetch_add(1, Ordering::SeqCst);
    ///     });
    /// }
    /// while !pool.is_idle() {
    ///     std::thread::yield_now();
    /// }
    /// assert_eq!(counter.load(Ordering::SeqCst), 10);
    /// ```
    pub fn build(&self) -> Result<ThreadPool, PoolError> {
        ThreadPool::new(self)
    }
}

/// A work-stealing scheduler for short, independent units of work.
///
/// Each worker thread owns a small fixed-capacity queue it can reach without
/// synchronization, so tasks scheduled from inside the pool are cheap enough
/// that splitting an algorithm into thousands of tiny tasks pays off. Tasks
/// scheduled from outside the pool, or overflowing a worker's queue, go
/// through a shared central queue; idle workers steal from busy ones to even
/// the load out.
///
/// Dropping the pool joins the workers: tasks already started run to
/// completion, tasks never started are discarded without running.
///
/// # Warning
///
/// Workers are ordinary OS threads and tasks are never preempted by the pool.
/// If [`concurrency()`](Self::concurrency) or more tasks block simultaneously,
/// no other task in the pool can make progress. A task that panics aborts the
/// process.
///
/// # Warning
///
/// Dropping a pool from inside one of its own tasks is a usage error (the
/// worker would have to join itself) and leads to a deadlock.
pub struct ThreadPool {
    inner: Arc<Inner>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Result<Self, PoolError> {
        let num_threads: NonZeroUsize = match builder.num_threads {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed"),
            ThreadCount::Count(count) => count,
        };
        let inner = Inner::new(num_threads.into(), builder.cpu_pinning);
        inner.spawn_missing().map_err(PoolError::ThreadStart)?;
        inner.mark_running();
        Ok(Self { inner })
    }

    /// Schedules a task to be performed asynchronously.
    ///
    /// The task is called at most once, on one of the pool's workers. The
    /// return from this call *happens-before* the start of the task's body,
    /// on every scheduling path.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.schedule(Task::new(task));
    }

    /// Schedules a task with the hint that it is a continuation of the
    /// currently running task.
    ///
    /// Called from a worker, the subtask goes to the front of that worker's
    /// own queue, so with nothing else going on it is the very next task that
    /// worker runs. This encourages depth-first execution of branching
    /// workloads and keeps local queues shallow, at the price of relaxed
    /// fairness: an unbounded chain of subtasks can starve everything else
    /// queued on that worker. Called from outside the pool, this is
    /// indistinguishable from [`schedule()`](Self::schedule).
    pub fn schedule_subtask(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.schedule(Task::new(task));
    }

    /// Schedules a task to run once the given duration has elapsed.
    ///
    /// The deadline is `now + delay` on the monotonic clock; the task never
    /// starts before it, but may start arbitrarily late if the workers are
    /// busy. A zero delay dispatches like [`schedule()`](Self::schedule).
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        self.inner
            .schedule_at(Instant::now() + delay, Task::new(task));
    }

    /// Schedules a task to run at or after the given point in time.
    pub fn schedule_at(&self, deadline: Instant, task: impl FnOnce() + Send + 'static) {
        self.inner.schedule_at(deadline, Task::new(task));
    }

    /// Returns a cloneable handle for scheduling onto this pool.
    ///
    /// Tasks that want to schedule follow-up work capture a handle. A handle
    /// kept alive past the pool's destruction stays safe to use, but the
    /// tasks it schedules are silently discarded.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            inner: self.inner.clone(),
        }
    }

    /// Returns the number of live worker threads, that is, the number of
    /// tasks that can truly run concurrently.
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency()
    }

    /// Maximum number of tasks a worker can hold in its own queue before
    /// scheduling from that worker takes the slow path through the central
    /// queue.
    pub const fn worker_capacity() -> usize {
        QUEUE_CAPACITY
    }

    /// Returns whether every worker is simultaneously idle and no queued or
    /// due timed task is pending.
    ///
    /// Called from within one of the pool's own tasks this necessarily
    /// returns `false`. While the pool is halted it returns `false` as well:
    /// parked workers are not idling, they are suspended.
    pub fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    /// Suspends execution of tasks, blocking until every worker has parked.
    ///
    /// Workers finish their in-flight task first; tasks left in any queue
    /// stay queued and run after [`resume()`](Self::resume). Calling this
    /// from within one of the pool's own tasks parks the calling worker in
    /// place, in the middle of the task, until the pool is resumed or
    /// destroyed.
    pub fn halt(&self) {
        self.inner.halt();
    }

    /// Resumes a halted pool and retries starting any worker that previously
    /// failed to start. Idempotent when already running.
    ///
    /// Fails only if afterwards not a single worker is live.
    pub fn resume(&self) -> Result<(), PoolError> {
        self.inner.resume().map_err(PoolError::ThreadStart)
    }

    /// Returns whether the pool is halted, which only begins to hold once
    /// every worker has fully parked.
    pub fn is_halted(&self) -> bool {
        self.inner.is_halted()
    }
}

impl Drop for ThreadPool {
    /// Joins all the threads in the pool, discarding tasks that never
    /// started.
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// A cloneable handle for scheduling tasks onto a [`ThreadPool`].
///
/// Handles are the way tasks schedule further work on their own pool. All
/// scheduling and lifecycle semantics match the methods of the same name on
/// [`ThreadPool`]; after the pool has been destroyed, scheduling through a
/// surviving handle discards the task.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Schedules a task to be performed asynchronously.
    ///
    /// See [`ThreadPool::schedule()`].
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.schedule(Task::new(task));
    }

    /// Schedules a continuation of the currently running task.
    ///
    /// See [`ThreadPool::schedule_subtask()`].
    pub fn schedule_subtask(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.schedule(Task::new(task));
    }

    /// Schedules a task to run once the given duration has elapsed.
    ///
    /// See [`ThreadPool::schedule_after()`].
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        self.inner
            .schedule_at(Instant::now() + delay, Task::new(task));
    }

    /// Schedules a task to run at or after the given point in time.
    ///
    /// See [`ThreadPool::schedule_at()`].
    pub fn schedule_at(&self, deadline: Instant, task: impl FnOnce() + Send + 'static) {
        self.inner.schedule_at(deadline, Task::new(task));
    }

    /// Returns the number of live worker threads.
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency()
    }

    /// Returns whether every worker is simultaneously idle.
    ///
    /// See [`ThreadPool::is_idle()`].
    pub fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    /// Suspends execution of tasks. Called from within a task, parks the
    /// calling worker in place.
    ///
    /// See [`ThreadPool::halt()`].
    pub fn halt(&self) {
        self.inner.halt();
    }

    /// Resumes a halted pool.
    ///
    /// See [`ThreadPool::resume()`].
    pub fn resume(&self) -> Result<(), PoolError> {
        self.inner.resume().map_err(PoolError::ThreadStart)
    }

    /// Returns whether every worker has fully parked.
    ///
    /// See [`ThreadPool::is_halted()`].
    pub fn is_halted(&self) -> bool {
        self.inner.is_halted()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn pool_with(num_threads: usize) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
        .expect("failed to start worker threads")
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(
                start.elapsed() < Duration::from_secs(30),
                "timed out waiting for {what}"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_build_thread_pool_available_parallelism() {
        let pool = ThreadPoolBuilder::default().build().unwrap();
        assert_eq!(
            pool.concurrency(),
            usize::from(std::thread::available_parallelism().unwrap())
        );
    }

    #[test]
    fn test_build_thread_pool_cpu_pinning_if_supported() {
        let pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build()
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        wait_until("all tasks to run", || pool.is_idle());
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    #[test]
    fn test_build_thread_pool_cpu_pinning_always() {
        let pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build()
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        wait_until("all tasks to run", || pool.is_idle());
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn test_build_thread_pool_cpu_pinning_always_not_supported() {
        let _ = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build();
    }

    #[test]
    fn test_concurrency_reports_live_workers() {
        let pool = pool_with(3);
        assert_eq!(pool.concurrency(), 3);
    }

    #[test]
    fn test_worker_capacity_is_the_compiled_constant() {
        assert_eq!(ThreadPool::worker_capacity(), 128);
    }

    #[test]
    fn test_many_external_tasks_all_run() {
        const NUM_TASKS: usize = 1_000_000;

        let pool = pool_with(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..NUM_TASKS {
            let counter = counter.clone();
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        wait_until("all tasks to run", || pool.is_idle());
        assert_eq!(counter.load(Ordering::SeqCst), NUM_TASKS);
    }

    /// Burst of `10 * worker_capacity` tasks from outside the pool: every one
    /// of them takes the central path, and every one of them runs exactly
    /// once.
    #[test]
    fn test_external_burst_goes_through_the_central_queue() {
        let num_tasks = 10 * ThreadPool::worker_capacity();
        let pool = pool_with(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..num_tasks {
            let counter = counter.clone();
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        wait_until("all tasks to run", || pool.is_idle());
        assert_eq!(counter.load(Ordering::SeqCst), num_tasks);
    }

    fn fib_sequential(n: u64) -> u64 {
        if n < 2 {
            n
        } else {
            fib_sequential(n - 1) + fib_sequential(n - 2)
        }
    }

    fn fib_forked(scheduler: &Scheduler, sum: &Arc<AtomicU64>, n: u64) {
        if n <= 10 {
            sum.fetch_add(fib_sequential(n), Ordering::Relaxed);
            return;
        }
        for argument in [n - 1, n - 2] {
            let scheduler_clone = scheduler.clone();
            let sum = sum.clone();
            scheduler.schedule_subtask(move || fib_forked(&scheduler_clone, &sum, argument));
        }
    }

    /// A branching fork-without-join workload driven entirely by subtasks.
    /// The leaf sums telescope to Fibonacci, so a single lost or duplicated
    /// subtask shows up in the total.
    #[test]
    fn test_subtask_fibonacci() {
        let pool = pool_with(2);
        let sum = Arc::new(AtomicU64::new(0));
        let scheduler = pool.scheduler();
        {
            let sum = sum.clone();
            pool.schedule(move || fib_forked(&scheduler, &sum, 25));
        }
        wait_until("the computation to finish", || pool.is_idle());
        assert_eq!(sum.load(Ordering::SeqCst), fib_sequential(25));
    }

    /// With a single worker and nothing else going on, subtasks run newest
    /// first, right after the task that spawned them.
    #[test]
    fn test_subtask_lifo_preference() {
        let pool = pool_with(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = pool.scheduler();
        {
            let log = log.clone();
            pool.schedule(move || {
                log.lock().unwrap().push("parent");
                for name in ["older", "newer"] {
                    let log = log.clone();
                    scheduler.schedule_subtask(move || log.lock().unwrap().push(name));
                }
            });
        }
        wait_until("all tasks to run", || pool.is_idle());
        assert_eq!(*log.lock().unwrap(), vec!["parent", "newer", "older"]);
    }

    /// Scheduling more subtasks than the local queue holds spills the excess
    /// to the central queue instead of dropping it.
    #[test]
    fn test_local_overflow_spills_to_the_central_queue() {
        let num_tasks = ThreadPool::worker_capacity() + 8;
        let pool = pool_with(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = pool.scheduler();
        {
            let counter = counter.clone();
            pool.schedule(move || {
                for _ in 0..num_tasks {
                    let counter = counter.clone();
                    scheduler.schedule_subtask(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }
        wait_until("all tasks to run", || pool.is_idle());
        assert_eq!(counter.load(Ordering::SeqCst), num_tasks);
    }

    /// Timed tasks start no earlier than their deadline, and an earlier
    /// deadline runs first even when scheduled later.
    #[test]
    fn test_deadlines_are_respected_and_ordered() {
        let pool = pool_with(2);
        let submitted = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));
        for (name, delay) in [("slow", 200u64), ("fast", 50)] {
            let starts = starts.clone();
            pool.schedule_after(Duration::from_millis(delay), move || {
                starts.lock().unwrap().push((name, Instant::now()));
            });
        }
        wait_until("both timed tasks to run", || {
            starts.lock().unwrap().len() == 2
        });

        let starts = starts.lock().unwrap();
        let (first_name, first_start) = starts[0];
        let (second_name, second_start) = starts[1];
        assert_eq!(first_name, "fast");
        assert_eq!(second_name, "slow");
        assert!(first_start >= submitted + Duration::from_millis(50));
        assert!(second_start >= submitted + Duration::from_millis(200));
    }

    #[test]
    fn test_expired_deadline_dispatches_immediately() {
        let pool = pool_with(2);
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            pool.schedule_at(Instant::now(), move || done.store(true, Ordering::SeqCst));
        }
        wait_until("the task to run", || done.load(Ordering::SeqCst));
    }

    /// Halting waits out the in-flight task, then freezes the pool; resuming
    /// lets new tasks run again.
    #[test]
    fn test_halt_waits_for_inflight_and_resume_restarts() {
        let pool = pool_with(2);
        let long_done = Arc::new(AtomicBool::new(false));
        {
            let long_done = long_done.clone();
            pool.schedule(move || {
                let start = Instant::now();
                while start.elapsed() < Duration::from_millis(500) {
                    std::hint::spin_loop();
                }
                long_done.store(true, Ordering::SeqCst);
            });
        }
        // Give the task a moment to be picked up.
        std::thread::sleep(Duration::from_millis(50));

        let halt_started = Instant::now();
        pool.halt();
        assert!(long_done.load(Ordering::SeqCst));
        assert!(halt_started.elapsed() >= Duration::from_millis(300));
        assert!(pool.is_halted());
        assert!(!pool.is_idle());

        // Nothing runs while halted.
        let late = Arc::new(AtomicBool::new(false));
        {
            let late = late.clone();
            pool.schedule(move || late.store(true, Ordering::SeqCst));
        }
        std::thread::sleep(Duration::from_millis(100));
        assert!(!late.load(Ordering::SeqCst));

        pool.resume().unwrap();
        wait_until("the queued task to run", || late.load(Ordering::SeqCst));
        assert!(!pool.is_halted());
    }

    #[test]
    fn test_halt_and_resume_are_idempotent() {
        let pool = pool_with(2);
        pool.halt();
        pool.halt();
        assert!(pool.is_halted());
        pool.resume().unwrap();
        pool.resume().unwrap();
        assert!(!pool.is_halted());

        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            pool.schedule(move || done.store(true, Ordering::SeqCst));
        }
        wait_until("the task to run", || done.load(Ordering::SeqCst));
    }

    /// A task halting its own pool parks its worker mid-task; the rest of the
    /// task body runs only after `resume()`.
    #[test]
    fn test_halt_from_within_a_task_parks_the_worker() {
        let pool = pool_with(2);
        let scheduler = pool.scheduler();
        let before = Arc::new(AtomicBool::new(false));
        let after = Arc::new(AtomicBool::new(false));
        {
            let before = before.clone();
            let after = after.clone();
            pool.schedule(move || {
                before.store(true, Ordering::SeqCst);
                scheduler.halt();
                after.store(true, Ordering::SeqCst);
            });
        }
        wait_until("the pool to halt", || pool.is_halted());
        assert!(before.load(Ordering::SeqCst));
        assert!(!after.load(Ordering::SeqCst));

        pool.resume().unwrap();
        wait_until("the suspended task to finish", || {
            after.load(Ordering::SeqCst)
        });
    }

    #[test]
    fn test_is_idle_is_false_from_within_a_task() {
        let pool = pool_with(2);
        let scheduler = pool.scheduler();
        let observed_idle = Arc::new(AtomicBool::new(true));
        {
            let observed_idle = observed_idle.clone();
            pool.schedule(move || {
                observed_idle.store(scheduler.is_idle(), Ordering::SeqCst);
            });
        }
        wait_until("the task to run", || pool.is_idle());
        assert!(!observed_idle.load(Ordering::SeqCst));
    }

    /// Destroying the pool with queued tasks completes the started ones and
    /// silently forgets the rest.
    #[test]
    fn test_drop_discards_unstarted_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = pool_with(2);
            for _ in 0..100 {
                let counter = counter.clone();
                pool.schedule(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        // The destructor has joined the workers; whatever ran, ran to
        // completion, and nothing runs anymore.
        let after_drop = counter.load(Ordering::SeqCst);
        assert!(after_drop <= 100);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_scheduler_outliving_the_pool_discards_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = {
            let pool = pool_with(2);
            pool.scheduler()
        };
        let counter_clone = counter.clone();
        scheduler.schedule(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    /// Independent pools share nothing: a task on one pool can freely
    /// schedule onto another, through that pool's slow path.
    #[test]
    fn test_pools_are_independent() {
        let first = pool_with(2);
        let second = pool_with(2);
        let done = Arc::new(AtomicBool::new(false));
        let second_scheduler = second.scheduler();
        {
            let done = done.clone();
            first.schedule(move || {
                let done = done.clone();
                second_scheduler.schedule(move || done.store(true, Ordering::SeqCst));
            });
        }
        wait_until("the relayed task to run", || done.load(Ordering::SeqCst));
        wait_until("both pools to settle", || {
            first.is_idle() && second.is_idle()
        });
    }

    #[test]
    fn test_schedule_while_halted_runs_after_resume() {
        let pool = pool_with(2);
        pool.halt();
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            pool.schedule(move || done.store(true, Ordering::SeqCst));
        }
        assert!(!done.load(Ordering::SeqCst));
        pool.resume().unwrap();
        wait_until("the task to run", || done.load(Ordering::SeqCst));
    }

    /// Timed tasks scheduled from inside another task still respect their
    /// deadline.
    #[test]
    fn test_timed_task_scheduled_from_a_worker() {
        let pool = pool_with(2);
        let scheduler = pool.scheduler();
        let ran_at = Arc::new(Mutex::new(None));
        let submitted = Instant::now();
        {
            let ran_at = ran_at.clone();
            pool.schedule(move || {
                let ran_at = ran_at.clone();
                scheduler.schedule_after(Duration::from_millis(80), move || {
                    *ran_at.lock().unwrap() = Some(Instant::now());
                });
            });
        }
        wait_until("the timed task to run", || ran_at.lock().unwrap().is_some());
        let ran_at = ran_at.lock().unwrap().unwrap();
        assert!(ran_at >= submitted + Duration::from_millis(80));
    }
}
