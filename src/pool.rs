//! Elastic worker-thread pool with a future interface.
//!
//! Submitted work runs on a dynamically sized set of worker threads and
//! every submission returns a [`Future`] for its result. Two service
//! threads run alongside the workers: a supervisor that audits idle workers
//! on a fixed cadence and retires the surplus with poison pills, and a
//! timer thread that drives [`Scheduler::schedule_after`] through a
//! [`TimerManager`].
//!
//! # Thread lifecycle
//!
//! Workers are spawned lazily: a submission that finds no idle waiter
//! spawns a new worker, up to `max_threads`. Idle workers above
//! `max_idle_threads` are reclaimed by the supervisor. [`WorkerPool::join_all`]
//! (main thread only) stops everything; tasks still queued at that point
//! have their promises failed with [`Exception::ShutdownAborted`].
//!
//! # Example
//!
//! ```ignore
//! use futurekit::WorkerPool;
//!
//! let pool = WorkerPool::new();
//! let total = pool
//!     .execute(|| heavy_sum(0..1_000_000))
//!     .map(|sum| sum + 1)
//!     .wait()
//!     .value()?;
//! pool.join_all();
//! ```

use crate::error::{Exception, PanicPayload};
use crate::future::{make_exception_future, pair, Future};
use crate::scheduler::{Scheduler, Task};
use crate::timer::TimerManager;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, trace};

/// Hard ceiling on the worker count; limits clamp to (0, this].
const MAX_POOL_THREADS: usize = 1024;

thread_local! {
    // Worker identity and recycle signal: a poison pill clears the flag and
    // the consuming worker leaves its loop.
    static WORKING: Cell<bool> = const { Cell::new(true) };
}

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Ceiling on concurrently live workers. Clamped to (0, 1024].
    pub max_threads: usize,
    /// Idle workers beyond this count are reclaimed. Clamped to (0, 1024].
    pub max_idle_threads: usize,
    /// Name prefix for worker and service threads.
    pub thread_name_prefix: String,
    /// Cadence of the supervisor's idle audit.
    pub supervisor_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_threads: MAX_POOL_THREADS,
            max_idle_threads: default_idle_threads(),
            thread_name_prefix: "futurekit".to_string(),
            supervisor_interval: Duration::from_millis(300),
        }
    }
}

impl PoolOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker ceiling.
    #[must_use]
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Sets the idle-worker target.
    #[must_use]
    pub fn max_idle_threads(mut self, n: usize) -> Self {
        self.max_idle_threads = n;
        self
    }

    /// Sets the thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the supervisor audit cadence.
    #[must_use]
    pub fn supervisor_interval(mut self, interval: Duration) -> Self {
        self.supervisor_interval = interval;
        self
    }
}

/// Hardware concurrency, or 1 when the query reports nothing.
fn default_idle_threads() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

fn clamp_limit(n: usize) -> Option<usize> {
    (n > 0 && n <= MAX_POOL_THREADS).then_some(n)
}

/// A queued unit of work.
///
/// `run` executes the task; `abort` fails its promise when the pool shuts
/// down before the task was picked up. Poison pills and plain scheduled
/// tasks carry no abort path here: pills have no promise at all, and
/// continuation deliveries arriving through the scheduler seam carry their
/// own abort-on-drop guard inside `run`.
struct PoolTask {
    run: Box<dyn FnOnce() + Send + 'static>,
    abort: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl PoolTask {
    fn plain(run: Box<dyn FnOnce() + Send + 'static>) -> Self {
        Self { run, abort: None }
    }

    fn poison() -> Self {
        Self::plain(Box::new(|| WORKING.with(|w| w.set(false))))
    }
}

struct PoolState {
    queue: VecDeque<PoolTask>,
    workers: Vec<JoinHandle<()>>,
    waiters: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    current_threads: AtomicUsize,
    pending_stop: AtomicUsize,
    max_threads: AtomicUsize,
    max_idle_threads: AtomicUsize,
    // Mirrors `state.shutdown` for lock-free reads by the service threads.
    shutdown: AtomicBool,
    timers: Mutex<TimerManager>,
    timer_ready: Condvar,
    thread_name_prefix: String,
    supervisor_interval: Duration,
}

/// Elastic thread pool returning a future for every submission.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    main_thread: ThreadId,
}

impl WorkerPool {
    /// Creates a pool with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(PoolOptions::default())
    }

    /// Creates a pool with the given options.
    ///
    /// The calling thread is recorded as the pool's main thread; only it may
    /// later invoke [`WorkerPool::join_all`].
    #[must_use]
    pub fn with_options(options: PoolOptions) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: Vec::new(),
                waiters: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            current_threads: AtomicUsize::new(0),
            pending_stop: AtomicUsize::new(0),
            max_threads: AtomicUsize::new(
                clamp_limit(options.max_threads).unwrap_or(MAX_POOL_THREADS),
            ),
            max_idle_threads: AtomicUsize::new(
                clamp_limit(options.max_idle_threads).unwrap_or_else(default_idle_threads),
            ),
            shutdown: AtomicBool::new(false),
            timers: Mutex::new(TimerManager::new()),
            timer_ready: Condvar::new(),
            thread_name_prefix: options.thread_name_prefix,
            supervisor_interval: options.supervisor_interval,
        });

        let supervisor_shared = Arc::clone(&shared);
        let supervisor = thread::Builder::new()
            .name(format!("{}-supervisor", shared.thread_name_prefix))
            .spawn(move || supervisor_routine(&supervisor_shared))
            .expect("failed to spawn supervisor thread");

        let timer_shared = Arc::clone(&shared);
        let timer_thread = thread::Builder::new()
            .name(format!("{}-timer", shared.thread_name_prefix))
            .spawn(move || timer_routine(&timer_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
            timer_thread: Mutex::new(Some(timer_thread)),
            main_thread: thread::current().id(),
        }
    }

    /// Submits work and returns a future for its result.
    ///
    /// The task runs on a worker thread; a panic inside it is captured as
    /// [`Exception::Panicked`] in the returned future's outcome. After
    /// shutdown the returned future is already failed with
    /// [`Exception::ShutdownAborted`].
    pub fn execute<F, R>(&self, f: F) -> Future<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return make_exception_future(Exception::ShutdownAborted);
        }

        let (promise, future) = pair::<R>();
        let run_promise = promise.clone();
        let run = Box::new(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => run_promise.set_value(value),
            Err(payload) => run_promise.set_exception(Exception::Panicked(
                PanicPayload::from_panic(payload.as_ref()),
            )),
        });
        let abort = Box::new(move || promise.set_exception(Exception::ShutdownAborted));

        enqueue(
            &self.shared,
            &mut state,
            PoolTask {
                run,
                abort: Some(abort),
            },
        );
        future
    }

    /// Stops the pool and waits for every pool thread to terminate.
    ///
    /// Main thread only; calls from other threads return without effect.
    /// Tasks still queued are not run; their promises fail with
    /// [`Exception::ShutdownAborted`]. In-flight tasks run to completion.
    /// Idempotent.
    pub fn join_all(&self) {
        if thread::current().id() != self.main_thread {
            return;
        }

        let (workers, aborted) = {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                state.shutdown = true;
                self.shared.shutdown.store(true, Ordering::Release);
            }
            let aborted: Vec<PoolTask> = state.queue.drain(..).collect();
            self.shared.work_ready.notify_all();
            (std::mem::take(&mut state.workers), aborted)
        };
        // The timer thread checks the shutdown flag under the timer lock;
        // passing through that lock before notifying means it is either
        // already exiting or parked where the notify reaches it.
        drop(self.shared.timers.lock());
        self.shared.timer_ready.notify_all();

        if !aborted.is_empty() {
            debug!(count = aborted.len(), "aborting tasks pending at shutdown");
        }
        for task in aborted {
            if let Some(abort) = task.abort {
                abort();
            }
        }

        for worker in workers {
            let _ = worker.join();
        }
        if let Some(handle) = self.supervisor.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.timer_thread.lock().take() {
            let _ = handle.join();
        }
        // Timers that never fired still hold their tasks; dropping them now
        // lets any delivery guards inside complete their promises instead of
        // lingering until the pool itself is dropped.
        *self.shared.timers.lock() = TimerManager::new();
    }

    /// Sets the worker ceiling; values outside (0, 1024] are ignored.
    pub fn set_max_threads(&self, n: usize) {
        if let Some(n) = clamp_limit(n) {
            self.shared.max_threads.store(n, Ordering::Relaxed);
        }
    }

    /// Sets the idle-worker target; values outside (0, 1024] are ignored.
    pub fn set_max_idle_threads(&self, n: usize) {
        if let Some(n) = clamp_limit(n) {
            self.shared.max_idle_threads.store(n, Ordering::Relaxed);
        }
    }

    /// Number of live worker threads (service threads excluded).
    #[must_use]
    pub fn current_threads(&self) -> usize {
        self.shared.current_threads.load(Ordering::Relaxed)
    }

    /// Number of tasks waiting in the queue.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Returns true once the pool has shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Scheduler for WorkerPool {
    fn schedule(&self, task: Task) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        enqueue(&self.shared, &mut state, PoolTask::plain(task));
    }

    fn schedule_after(&self, delay: Duration, task: Task) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        // The timer callback holds only a weak reference; the shared block
        // owns the timer store, and a strong capture would cycle.
        let weak: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let mut slot = Some(task);
        {
            let mut timers = self.shared.timers.lock();
            timers.schedule_after(delay, move || {
                let (Some(shared), Some(task)) = (weak.upgrade(), slot.take()) else {
                    return;
                };
                let mut state = shared.state.lock();
                if state.shutdown {
                    return;
                }
                enqueue(&shared, &mut state, PoolTask::plain(task));
            });
        }
        self.shared.timer_ready.notify_one();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field(
                "current_threads",
                &self.shared.current_threads.load(Ordering::Relaxed),
            )
            .field("max_threads", &self.shared.max_threads.load(Ordering::Relaxed))
            .field(
                "max_idle_threads",
                &self.shared.max_idle_threads.load(Ordering::Relaxed),
            )
            .field("shutdown", &self.shared.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

/// Queues a task under the pool lock, spawning a worker when nobody idles
/// and the ceiling allows, then wakes one waiter.
fn enqueue(shared: &Arc<PoolShared>, state: &mut PoolState, task: PoolTask) {
    state.queue.push_back(task);
    if state.waiters == 0
        && shared.current_threads.load(Ordering::Relaxed) < shared.max_threads.load(Ordering::Relaxed)
    {
        spawn_worker(shared, state);
    }
    shared.work_ready.notify_one();
}

fn spawn_worker(shared: &Arc<PoolShared>, state: &mut PoolState) {
    let ordinal = shared.current_threads.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", shared.thread_name_prefix, ordinal);
    trace!(worker = %name, "spawning worker");

    let worker_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || worker_routine(&worker_shared))
        .expect("failed to spawn worker thread");
    state.workers.push(handle);
}

fn worker_routine(shared: &Arc<PoolShared>) {
    WORKING.with(|w| w.set(true));

    while WORKING.with(Cell::get) {
        let task = {
            let mut state = shared.state.lock();
            state.waiters += 1;
            while !state.shutdown && state.queue.is_empty() {
                shared.work_ready.wait(&mut state);
            }
            state.waiters -= 1;

            if state.shutdown && state.queue.is_empty() {
                shared.current_threads.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            let Some(task) = state.queue.pop_front() else {
                continue;
            };
            task
        };
        (task.run)();
    }

    // Recycled by the supervisor. Both counters move under the pool lock so
    // a concurrent audit never observes one without the other.
    let _state = shared.state.lock();
    shared.current_threads.fetch_sub(1, Ordering::Relaxed);
    shared.pending_stop.fetch_sub(1, Ordering::Relaxed);
    trace!("worker retired");
}

fn supervisor_routine(shared: &Arc<PoolShared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        thread::sleep(shared.supervisor_interval);

        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }
        // Idle workers net of pills already in flight; never issue more
        // pills than that surplus, or a burst of submissions right after
        // the audit would find the pool understaffed.
        let idle = state
            .waiters
            .saturating_sub(shared.pending_stop.load(Ordering::Relaxed));
        let surplus = idle.saturating_sub(shared.max_idle_threads.load(Ordering::Relaxed));
        if surplus > 0 {
            debug!(surplus, idle, "retiring surplus idle workers");
        }
        for _ in 0..surplus {
            state.queue.push_back(PoolTask::poison());
            shared.pending_stop.fetch_add(1, Ordering::Relaxed);
            shared.work_ready.notify_one();
        }
    }
}

fn timer_routine(shared: &Arc<PoolShared>) {
    let mut timers = shared.timers.lock();
    while !shared.shutdown.load(Ordering::Acquire) {
        timers.update();
        let gap = timers.nearest_timer();
        if gap == Duration::ZERO {
            continue;
        }
        if gap == Duration::MAX {
            shared.timer_ready.wait(&mut timers);
        } else {
            let _ = shared.timer_ready.wait_for(&mut timers, gap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;
    use std::sync::atomic::AtomicI32;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn execute_returns_result() {
        let pool = WorkerPool::new();
        let future = pool.execute(|| 6 * 7);
        assert_eq!(future.wait().value(), Ok(42));
        pool.join_all();
    }

    #[test]
    fn many_submissions_all_complete() {
        let pool = WorkerPool::new();
        let counter = Arc::new(AtomicI32::new(0));

        let futures: Vec<_> = (0..100)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        for future in futures {
            assert!(future.wait().has_value());
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        pool.join_all();
    }

    #[test]
    fn task_panic_becomes_exception() {
        let pool = WorkerPool::new();
        let future: Future<i32> = pool.execute(|| panic!("intentional"));
        match future.wait() {
            Outcome::Exception(Exception::Panicked(payload)) => {
                assert_eq!(payload.message(), "intentional");
            }
            other => panic!("expected panicked exception, got {other:?}"),
        }

        // The worker survives the panic and keeps serving.
        assert_eq!(pool.execute(|| 5).wait().value(), Ok(5));
        pool.join_all();
    }

    #[test]
    fn execute_after_shutdown_fails_fast() {
        let pool = WorkerPool::new();
        pool.execute(|| ()).wait().value().expect("warmup task");
        pool.join_all();
        assert!(pool.is_shutdown());

        let future = pool.execute(|| 1);
        assert_eq!(future.wait().exception(), Ok(Exception::ShutdownAborted));
    }

    #[test]
    fn queued_tasks_aborted_at_shutdown() {
        let pool = WorkerPool::with_options(PoolOptions::new().max_threads(1));
        let (release, gate) = mpsc::channel::<()>();

        let blocker = pool.execute(move || {
            gate.recv().ok();
        });
        // Give the single worker time to pick up the blocker.
        thread::sleep(Duration::from_millis(30));
        let victim = pool.execute(|| 7);

        let unblock = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            release.send(()).ok();
        });

        pool.join_all();
        unblock.join().expect("unblock thread");

        assert!(blocker.wait().has_value());
        assert_eq!(victim.wait().exception(), Ok(Exception::ShutdownAborted));
    }

    #[test]
    fn join_all_ignored_off_main_thread() {
        let pool = Arc::new(WorkerPool::new());
        let remote = Arc::clone(&pool);
        thread::spawn(move || remote.join_all())
            .join()
            .expect("remote join");
        assert!(!pool.is_shutdown());

        assert_eq!(pool.execute(|| 3).wait().value(), Ok(3));
        pool.join_all();
    }

    #[test]
    fn schedule_after_respects_delay() {
        let pool = WorkerPool::new();
        let (sender, receiver) = mpsc::channel();
        let start = Instant::now();

        pool.schedule_after(
            Duration::from_millis(50),
            Box::new(move || {
                sender.send(Instant::now()).ok();
            }),
        );

        let fired = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("timer fired");
        assert!(fired.duration_since(start) >= Duration::from_millis(50));
        pool.join_all();
    }

    #[test]
    fn limit_setters_ignore_out_of_range() {
        let pool = WorkerPool::new();
        pool.set_max_threads(0);
        pool.set_max_threads(4096);
        pool.set_max_idle_threads(0);
        assert_eq!(pool.shared.max_threads.load(Ordering::Relaxed), 1024);
        pool.join_all();
    }

    #[test]
    fn workers_spawn_on_demand() {
        let pool = WorkerPool::with_options(PoolOptions::new().max_threads(4));
        assert_eq!(pool.current_threads(), 0);
        pool.execute(|| ()).wait().value().expect("task");
        assert!(pool.current_threads() >= 1);
        pool.join_all();
        assert_eq!(pool.current_threads(), 0);
    }
}
