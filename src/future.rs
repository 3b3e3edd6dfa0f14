//! Shared completion state, promises, futures, and continuation chaining.
//!
//! A [`Promise`] and its [`Future`] jointly own one heap-allocated shared
//! state. The producer writes an [`Outcome`] exactly once; the single
//! consumer either waits synchronously or registers one continuation that
//! receives the outcome by move. Continuations may run inline, on the
//! completing thread, or on a [`Scheduler`], and may themselves return
//! futures, which [`Future::and_then`] and [`Future::unwrap`] flatten.
//!
//! # Continuation classification
//!
//! Three continuation shapes cover the stage algebra:
//!
//! - [`Future::map`]: takes the value, returns a value; skipped on upstream
//!   failure, which is forwarded untouched
//! - [`Future::then`]: takes the whole [`Outcome`], returns a value; always
//!   runs and may recover from upstream failure
//! - [`Future::and_then`]: takes the value, returns another future; the
//!   inner future's outcome fulfills the downstream promise
//!
//! Every shape has a `_via` variant that dispatches the continuation through
//! a scheduler. All user callables run inside outcome-catching glue: a panic
//! is captured as [`Exception::Panicked`] and never unwinds into whichever
//! thread happens to deliver the outcome.

use crate::error::{Exception, PanicPayload};
use crate::outcome::Outcome;
use crate::scheduler::Scheduler;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Default deadline for [`Future::wait`].
const DEFAULT_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Phase of a shared completion state.
///
/// Leaving `Pending` is irreversible. `Done` becomes `Retrieved` only inside
/// a synchronous wait; continuation delivery moves the outcome away but the
/// phase stays `Done` for the producer's observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Pending,
    Timeout,
    Done,
    Retrieved,
}

type ThenCallback<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

struct StateCore<T> {
    progress: Progress,
    value: Outcome<T>,
    then: Option<ThenCallback<T>>,
}

/// Completion state jointly owned by one promise and one future.
pub(crate) struct SharedState<T> {
    core: Mutex<StateCore<T>>,
    retrieved: AtomicBool,
}

impl<T> SharedState<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(StateCore {
                progress: Progress::Pending,
                value: Outcome::Uninitialized,
                then: None,
            }),
            retrieved: AtomicBool::new(false),
        })
    }
}

/// Creates a promise/future pair with the future already extracted.
///
/// Internal shortcut for call sites that hand the future straight to the
/// caller; the atomic extraction guard is pre-claimed so a leaked promise
/// clone cannot mint a second consumer.
pub(crate) fn pair<T: Send + 'static>() -> (Promise<T>, Future<T>) {
    let promise = Promise::new();
    promise.state.retrieved.store(true, Ordering::Release);
    let future = Future {
        state: Arc::clone(&promise.state),
    };
    (promise, future)
}

/// Producer handle; writes an outcome into the shared state exactly once.
///
/// Cloning is permitted for storage convenience (a promise is often moved
/// through boxed callables), but the state still completes at most once:
/// every completion attempt after the first is silently ignored.
pub struct Promise<T> {
    state: Arc<SharedState<T>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Creates a promise with a fresh pending state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SharedState::new(),
        }
    }

    /// Completes the state with a value.
    ///
    /// Transitions `Pending → Done` and hands the outcome to a registered
    /// continuation, if any. Silent when the state already left `Pending`.
    pub fn set_value(&self, value: T) {
        self.complete(Outcome::Value(value));
    }

    /// Completes the state with a captured failure.
    pub fn set_exception(&self, exception: impl Into<Exception>) {
        self.complete(Outcome::Exception(exception.into()));
    }

    /// Completes the state with a pre-built outcome.
    pub fn set_outcome(&self, outcome: Outcome<T>) {
        self.complete(outcome);
    }

    fn complete(&self, outcome: Outcome<T>) {
        let mut core = self.state.core.lock();
        if core.progress != Progress::Pending {
            return;
        }
        core.progress = Progress::Done;
        core.value = outcome;
        if let Some(callback) = core.then.take() {
            let delivered = core.value.take();
            drop(core);
            callback(delivered);
        }
    }

    /// Extracts the consumer handle.
    ///
    /// # Errors
    ///
    /// [`Exception::AlreadyRetrieved`] on every call after the first,
    /// including calls through clones of this promise.
    pub fn get_future(&self) -> Result<Future<T>, Exception> {
        if self.state.retrieved.swap(true, Ordering::AcqRel) {
            return Err(Exception::AlreadyRetrieved);
        }
        Ok(Future {
            state: Arc::clone(&self.state),
        })
    }

    /// Returns true once the state has left its pending phase.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.core.lock().progress != Progress::Pending
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("progress", &self.state.core.lock().progress)
            .field("retrieved", &self.state.retrieved.load(Ordering::Relaxed))
            .finish()
    }
}

/// Rendezvous cell for synchronous waiting.
///
/// The stashing continuation holds only a [`Weak`] reference: when the
/// waiter gives up and its stack frame unwinds, the callback upgrades to
/// nothing and delivery becomes a no-op instead of touching dead state.
struct WaitCell<T> {
    slot: Mutex<Option<Outcome<T>>>,
    ready: Condvar,
}

/// Consumer handle; reads the outcome exactly once.
///
/// Not cloneable: the shared state supports a single consumer, and move
/// semantics make a consumed future inaccessible, so there is no "invalid
/// future" observer.
pub struct Future<T> {
    state: Arc<SharedState<T>>,
}

impl<T: Send + 'static> Future<T> {
    /// Blocks until the outcome arrives, with a 24-hour default deadline.
    ///
    /// See [`Future::wait_timeout`] for the full phase contract.
    #[must_use]
    pub fn wait(self) -> Outcome<T> {
        self.wait_timeout(DEFAULT_WAIT)
    }

    /// Blocks until the outcome arrives or the deadline elapses.
    ///
    /// - already `Done`: transitions to `Retrieved` and returns the outcome
    /// - timed out upstream: [`Exception::TimedOut`]
    /// - already retrieved: [`Exception::AlreadyRetrieved`]
    /// - still pending: parks on an internal rendezvous until delivery or
    ///   the deadline, which yields [`Exception::WaitTimeout`]
    #[must_use]
    pub fn wait_timeout(self, timeout: Duration) -> Outcome<T> {
        let rendezvous = {
            let mut core = self.state.core.lock();
            match core.progress {
                Progress::Done => {
                    core.progress = Progress::Retrieved;
                    return core.value.take();
                }
                Progress::Timeout => return Outcome::Exception(Exception::TimedOut),
                Progress::Retrieved => return Outcome::Exception(Exception::AlreadyRetrieved),
                Progress::Pending => {
                    let cell = Arc::new(WaitCell {
                        slot: Mutex::new(None),
                        ready: Condvar::new(),
                    });
                    let stash: Weak<WaitCell<T>> = Arc::downgrade(&cell);
                    core.then = Some(Box::new(move |outcome| {
                        if let Some(cell) = stash.upgrade() {
                            *cell.slot.lock() = Some(outcome);
                            cell.ready.notify_one();
                        }
                    }));
                    cell
                }
            }
        };

        let deadline = Instant::now().checked_add(timeout);
        let mut slot = rendezvous.slot.lock();
        while slot.is_none() {
            match deadline {
                Some(deadline) => {
                    if rendezvous.ready.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => rendezvous.ready.wait(&mut slot),
            }
        }
        match slot.take() {
            Some(outcome) => {
                drop(slot);
                self.state.core.lock().progress = Progress::Retrieved;
                outcome
            }
            None => Outcome::Exception(Exception::WaitTimeout),
        }
    }

    /// Attaches a value continuation; the result future carries `f`'s
    /// return.
    ///
    /// On an upstream exception `f` is not called and the exception is
    /// forwarded to the result future.
    pub fn map<R, F>(self, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.chain(None, map_glue(f))
    }

    /// Like [`Future::map`], dispatching the continuation on `scheduler`.
    pub fn map_via<R, F>(self, scheduler: Arc<dyn Scheduler>, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.chain(Some(scheduler), map_glue(f))
    }

    /// Attaches an outcome continuation.
    ///
    /// `f` always runs, receiving the upstream outcome by move; it may
    /// inspect a failure and recover by returning a value.
    pub fn then<R, F>(self, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(Outcome<T>) -> R + Send + 'static,
    {
        self.chain(None, then_glue(f))
    }

    /// Like [`Future::then`], dispatching the continuation on `scheduler`.
    pub fn then_via<R, F>(self, scheduler: Arc<dyn Scheduler>, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(Outcome<T>) -> R + Send + 'static,
    {
        self.chain(Some(scheduler), then_glue(f))
    }

    /// Attaches a future-returning continuation and flattens the result.
    ///
    /// After `f` produces an inner future, the downstream promise is bound
    /// to it in a second stage: an already-completed inner future transfers
    /// its outcome immediately, a pending one fulfills the promise upon
    /// completion, and a timed-out one fails it with
    /// [`Exception::TimedOut`].
    pub fn and_then<R, F>(self, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Future<R> + Send + 'static,
    {
        self.chain(None, and_then_glue(f))
    }

    /// Like [`Future::and_then`], dispatching the continuation on
    /// `scheduler`.
    pub fn and_then_via<R, F>(self, scheduler: Arc<dyn Scheduler>, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(T) -> Future<R> + Send + 'static,
    {
        self.chain(Some(scheduler), and_then_glue(f))
    }

    /// Binds a timeout to this future's state.
    ///
    /// Schedules a task on `scheduler` after `after`. When it runs, a state
    /// still pending transitions to its timed-out phase and `on_timeout` is
    /// invoked; a state that already completed (or already timed out) makes
    /// the task a no-op. The timeout does not cancel upstream work.
    ///
    /// Attach the timeout to the root future of a chain: a timeout bound to
    /// a downstream stage observes only that stage's state, and upstream
    /// stages may have completed long before.
    pub fn on_timeout<F>(&self, after: Duration, on_timeout: F, scheduler: &dyn Scheduler)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        scheduler.schedule_after(
            after,
            Box::new(move || {
                {
                    let mut core = state.core.lock();
                    if core.progress != Progress::Pending {
                        return;
                    }
                    core.progress = Progress::Timeout;
                }
                on_timeout();
            }),
        );
    }

    /// Core of every continuation: create the downstream pair, then deliver
    /// the upstream outcome to `glue` now or upon completion.
    fn chain<R, G>(self, scheduler: Option<Arc<dyn Scheduler>>, glue: G) -> Future<R>
    where
        R: Send + 'static,
        G: FnOnce(Outcome<T>, Promise<R>) + Send + 'static,
    {
        let (promise, next) = pair::<R>();
        let mut core = self.state.core.lock();
        match core.progress {
            Progress::Pending => {
                core.then = Some(Box::new(move |outcome| {
                    dispatch(scheduler, outcome, promise, glue);
                }));
            }
            Progress::Done => {
                let outcome = core.value.take();
                drop(core);
                dispatch(scheduler, outcome, promise, glue);
            }
            Progress::Timeout => {
                drop(core);
                promise.set_exception(Exception::TimedOut);
            }
            Progress::Retrieved => {
                drop(core);
                promise.set_exception(Exception::AlreadyRetrieved);
            }
        }
        next
    }
}

impl<U: Send + 'static> Future<Future<U>> {
    /// Flattens one level of nesting.
    ///
    /// The returned future completes when the inner future completes; an
    /// exception in the outer outcome short-circuits into the result.
    #[must_use]
    pub fn unwrap(self) -> Future<U> {
        let (promise, next) = pair::<U>();
        let mut core = self.state.core.lock();
        match core.progress {
            Progress::Pending => {
                core.then = Some(Box::new(move |outcome| flatten(outcome, promise)));
            }
            Progress::Done => {
                let outcome = core.value.take();
                drop(core);
                flatten(outcome, promise);
            }
            Progress::Timeout => {
                drop(core);
                promise.set_exception(Exception::TimedOut);
            }
            Progress::Retrieved => {
                drop(core);
                promise.set_exception(Exception::AlreadyRetrieved);
            }
        }
        next
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("progress", &self.state.core.lock().progress)
            .finish()
    }
}

/// Returns a future already completed with `value`.
#[must_use]
pub fn make_ready_future<T: Send + 'static>(value: T) -> Future<T> {
    let (promise, future) = pair();
    promise.set_value(value);
    future
}

/// Returns a future already completed with an exception.
#[must_use]
pub fn make_exception_future<T: Send + 'static>(exception: impl Into<Exception>) -> Future<T> {
    let (promise, future) = pair();
    promise.set_exception(exception);
    future
}

/// Runs `glue` inline or enqueues it on the chosen scheduler.
///
/// Scheduler-bound deliveries travel inside a [`ScheduledDelivery`] guard,
/// so a scheduler that discards the task instead of running it still
/// completes the downstream promise.
fn dispatch<T, R, G>(
    scheduler: Option<Arc<dyn Scheduler>>,
    outcome: Outcome<T>,
    promise: Promise<R>,
    glue: G,
) where
    T: Send + 'static,
    R: Send + 'static,
    G: FnOnce(Outcome<T>, Promise<R>) + Send + 'static,
{
    match scheduler {
        Some(scheduler) => {
            let delivery = ScheduledDelivery {
                payload: Some((outcome, glue)),
                promise,
            };
            scheduler.schedule(Box::new(move || delivery.run()));
        }
        None => glue(outcome, promise),
    }
}

/// A continuation delivery handed to a scheduler, with an abort-on-drop
/// guarantee.
///
/// A scheduler may drop a queued task without running it (the worker pool
/// does exactly that for tasks still queued at shutdown). Dropping the
/// guard with the payload intact fails the downstream promise with
/// [`Exception::ShutdownAborted`] instead of leaving its consumer parked
/// forever. Completion is idempotent, so the late failure is silent when
/// the delivery already ran.
struct ScheduledDelivery<T, R, G>
where
    T: Send + 'static,
    R: Send + 'static,
    G: FnOnce(Outcome<T>, Promise<R>) + Send + 'static,
{
    payload: Option<(Outcome<T>, G)>,
    promise: Promise<R>,
}

impl<T, R, G> ScheduledDelivery<T, R, G>
where
    T: Send + 'static,
    R: Send + 'static,
    G: FnOnce(Outcome<T>, Promise<R>) + Send + 'static,
{
    fn run(mut self) {
        if let Some((outcome, glue)) = self.payload.take() {
            glue(outcome, self.promise.clone());
        }
    }
}

impl<T, R, G> Drop for ScheduledDelivery<T, R, G>
where
    T: Send + 'static,
    R: Send + 'static,
    G: FnOnce(Outcome<T>, Promise<R>) + Send + 'static,
{
    fn drop(&mut self) {
        if self.payload.is_some() {
            self.promise.set_exception(Exception::ShutdownAborted);
        }
    }
}

/// Outcome-catching invocation: a panic inside `f` becomes an exception
/// outcome instead of unwinding into the delivering thread.
fn catch_outcome<R>(f: impl FnOnce() -> R) -> Outcome<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Outcome::Value(value),
        Err(payload) => Outcome::Exception(Exception::Panicked(PanicPayload::from_panic(
            payload.as_ref(),
        ))),
    }
}

fn map_glue<T, R, F>(f: F) -> impl FnOnce(Outcome<T>, Promise<R>) + Send + 'static
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(T) -> R + Send + 'static,
{
    move |outcome, promise| match outcome {
        Outcome::Value(value) => promise.set_outcome(catch_outcome(move || f(value))),
        Outcome::Exception(exception) => promise.set_exception(exception),
        Outcome::Uninitialized => promise.set_exception(Exception::Uninitialized),
    }
}

fn then_glue<T, R, F>(f: F) -> impl FnOnce(Outcome<T>, Promise<R>) + Send + 'static
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(Outcome<T>) -> R + Send + 'static,
{
    move |outcome, promise| promise.set_outcome(catch_outcome(move || f(outcome)))
}

fn and_then_glue<T, R, F>(f: F) -> impl FnOnce(Outcome<T>, Promise<R>) + Send + 'static
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(T) -> Future<R> + Send + 'static,
{
    move |outcome, promise| match outcome {
        Outcome::Value(value) => match panic::catch_unwind(AssertUnwindSafe(move || f(value))) {
            Ok(inner) => bind_into(inner, promise),
            Err(payload) => promise.set_exception(Exception::Panicked(PanicPayload::from_panic(
                payload.as_ref(),
            ))),
        },
        Outcome::Exception(exception) => promise.set_exception(exception),
        Outcome::Uninitialized => promise.set_exception(Exception::Uninitialized),
    }
}

/// Second stage of future-returning continuations: transfer the inner
/// future's outcome into `promise` now or upon completion.
fn bind_into<R: Send + 'static>(inner: Future<R>, promise: Promise<R>) {
    let mut core = inner.state.core.lock();
    match core.progress {
        Progress::Pending => {
            core.then = Some(Box::new(move |outcome| promise.set_outcome(outcome)));
        }
        Progress::Done => {
            let outcome = core.value.take();
            drop(core);
            promise.set_outcome(outcome);
        }
        Progress::Timeout => {
            drop(core);
            promise.set_exception(Exception::TimedOut);
        }
        Progress::Retrieved => {
            drop(core);
            promise.set_exception(Exception::AlreadyRetrieved);
        }
    }
}

fn flatten<U: Send + 'static>(outcome: Outcome<Future<U>>, promise: Promise<U>) {
    match outcome {
        Outcome::Value(inner) => bind_into(inner, promise),
        Outcome::Exception(exception) => promise.set_exception(exception),
        Outcome::Uninitialized => promise.set_exception(Exception::Uninitialized),
    }
}
