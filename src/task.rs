// Copyright 2024-2025 The weft authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The type-erased unit of work executed by the pool.

use std::fmt;

/// A unit of work scheduled on a [`ThreadPool`](crate::ThreadPool).
///
/// A task wraps an arbitrary `FnOnce() + Send` closure. It is exclusively
/// owned by whoever currently holds it (a queue slot, a worker, the timed
/// queue), is invoked at most once by exactly one worker, and is dropped
/// without being invoked if the pool is torn down first.
///
/// Tasks carry no return channel: a task that needs to produce a result must
/// capture its own output channel. Tasks must not panic; a panic escaping a
/// task is a fatal fault for the whole pool (see
/// [`ThreadPool`](crate::ThreadPool)).
pub(crate) struct Task(Box<dyn FnOnce() + Send>);

impl Task {
    /// Wraps the given closure into a task.
    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Invokes the task, consuming it.
    pub(crate) fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_invokes_the_closure_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = Task::new({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        task.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_captures_without_invoking() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = Task::new({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(Arc::strong_count(&count), 2);
        drop(task);
        assert_eq!(Arc::strong_count(&count), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn task_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Task>();
    }
}
