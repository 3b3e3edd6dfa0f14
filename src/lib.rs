//! Futurekit: composable futures and promises over an elastic worker pool.
//!
//! # Overview
//!
//! Futurekit is a small concurrency toolkit for thread-based programs. A
//! [`Promise`] is the producer half of a one-shot rendezvous; its [`Future`]
//! is the single consumer. Work submitted to the [`WorkerPool`] returns a
//! future immediately, and continuations attached to that future transform
//! the eventual outcome on the completing thread, on the caller thread, or
//! on any [`Scheduler`]. A timeout can be bound to any pending future.
//!
//! # Core Guarantees
//!
//! - **One transition**: a shared state leaves its pending phase exactly once
//! - **One consumer**: a future can be extracted once and is not cloneable
//! - **No escaping panics**: user callables run inside outcome-catching glue;
//!   a panic becomes [`Exception::Panicked`] in the downstream outcome and
//!   never unwinds into a worker thread
//! - **Failures as data**: upstream errors travel through [`Outcome`] values,
//!   not through unwinding across scheduling boundaries
//!
//! # Module Structure
//!
//! - [`outcome`]: three-state tagged value carried across stage boundaries
//! - [`future`]: shared completion state, promises, futures, continuations
//! - [`scheduler`]: the two-operation dispatch seam
//! - [`timer`]: ordered store of one-shot and repeating timers
//! - [`pool`]: elastic worker pool with idle-thread reclamation
//! - [`error`]: the exception taxonomy carried inside outcomes
//! - [`util`]: byte buffer and wall-clock helpers for callers
//!
//! # Example
//!
//! ```ignore
//! use futurekit::WorkerPool;
//!
//! let pool = WorkerPool::new();
//! let doubled = pool
//!     .execute(|| expensive_parse("input"))
//!     .map(|n| n * 2)
//!     .wait()
//!     .value()?;
//! pool.join_all();
//! ```
//!
//! A continuation must never synchronously wait on a future whose completion
//! depends on the same worker thread; the library does not detect this.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod future;
pub mod outcome;
pub mod pool;
pub mod scheduler;
pub mod timer;
pub mod util;

pub use error::{Exception, PanicPayload};
pub use future::{make_exception_future, make_ready_future, Future, Promise};
pub use outcome::Outcome;
pub use pool::{PoolOptions, WorkerPool};
pub use scheduler::{InlineScheduler, Scheduler, Task};
pub use timer::{Repeat, TimerId, TimerManager};
