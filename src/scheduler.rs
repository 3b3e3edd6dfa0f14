//! The dispatch seam between futures and execution resources.
//!
//! A [`Scheduler`] accepts no-argument callables for deferred execution and
//! signals nothing back; completion is observed through whatever promise the
//! task fulfills. The [`WorkerPool`](crate::WorkerPool) is the production
//! implementation; [`InlineScheduler`] runs everything on the calling
//! thread.

use std::time::Duration;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Abstract dispatcher with immediate and delayed enqueue.
pub trait Scheduler: Send + Sync {
    /// Enqueues a task for asynchronous execution.
    fn schedule(&self, task: Task);

    /// Enqueues a task to run no earlier than `delay` from now.
    fn schedule_after(&self, delay: Duration, task: Task);
}

/// Trivial scheduler that runs tasks synchronously on the calling thread.
///
/// `schedule_after` blocks the caller for the full delay. Useful for tests
/// and for degenerate single-threaded setups, nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, task: Task) {
        task();
    }

    fn schedule_after(&self, delay: Duration, task: Task) {
        std::thread::sleep(delay);
        task();
    }
}
