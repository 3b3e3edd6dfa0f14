//! Ordered store of pending timers keyed by trigger time.
//!
//! The manager keeps every pending timer in a [`BTreeMap`] keyed by
//! `(trigger instant, id)`. Ids increase strictly across the manager, so
//! timers sharing a trigger instant fire in insertion order, and the map's
//! first entry is always the next timer due. Repeating timers are
//! re-inserted with an advanced key rather than mutated in place.
//!
//! The manager itself is single-threaded; callers that share one across
//! threads wrap it in a mutex, which is exactly what the
//! [`WorkerPool`](crate::WorkerPool) timer thread does.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::trace;

/// Repeat intervals are clamped to this floor to prevent tight loops.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Opaque handle permitting cancellation of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// How many times a repeating timer fires in total.
///
/// A zero count is unrepresentable: a timer always fires at least once
/// unless cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Fire exactly `n` times.
    Times(NonZeroU32),
    /// Fire until cancelled.
    Forever,
}

impl Repeat {
    /// A single fire.
    #[must_use]
    pub fn once() -> Self {
        Self::Times(NonZeroU32::MIN)
    }

    /// `n` fires; `None` when `n` is zero.
    #[must_use]
    pub fn times(n: u32) -> Option<Self> {
        NonZeroU32::new(n).map(Self::Times)
    }
}

/// Remaining fires of a stored timer. Zero means cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemainingFires {
    Forever,
    Count(u32),
}

impl RemainingFires {
    fn exhausted(self) -> bool {
        matches!(self, Self::Count(0))
    }

    fn consume(&mut self) {
        if let Self::Count(n) = self {
            *n = n.saturating_sub(1);
        }
    }
}

/// Map key: trigger instant first, then the strictly increasing id as a
/// stable tiebreak for equal instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    when: Instant,
    id: u64,
}

struct TimerEntry {
    remaining: RemainingFires,
    period: Duration,
    callback: Box<dyn FnMut() + Send + 'static>,
}

/// Ordered multimap of pending timers with one-shot, periodic, and
/// bounded-repeat scheduling.
#[derive(Default)]
pub struct TimerManager {
    timers: BTreeMap<TimerKey, TimerEntry>,
    // id -> current trigger instant, for cancellation lookup; kept in sync
    // with the map across re-insertions.
    index: HashMap<u64, Instant>,
    next_id: u64,
}

impl TimerManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a one-shot timer at an absolute monotonic instant.
    pub fn schedule_at<F>(&mut self, when: Instant, f: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut f = Some(f);
        self.schedule_at_with_repeat(when, Duration::ZERO, Repeat::once(), move || {
            if let Some(f) = f.take() {
                f();
            }
        })
    }

    /// Schedules a one-shot timer after a relative delay.
    pub fn schedule_after<F>(&mut self, delay: Duration, f: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, f)
    }

    /// Schedules a timer that first fires at `when`, then repeats with
    /// `period` until `repeat` fires have happened.
    ///
    /// The period is clamped to a 1 ms minimum.
    pub fn schedule_at_with_repeat<F>(
        &mut self,
        when: Instant,
        period: Duration,
        repeat: Repeat,
        f: F,
    ) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        let remaining = match repeat {
            Repeat::Forever => RemainingFires::Forever,
            Repeat::Times(n) => RemainingFires::Count(n.get()),
        };
        self.timers.insert(
            TimerKey { when, id },
            TimerEntry {
                remaining,
                period: period.max(MIN_PERIOD),
                callback: Box::new(f),
            },
        );
        self.index.insert(id, when);
        trace!(id, ?period, ?repeat, "timer scheduled");
        TimerId(id)
    }

    /// Schedules a repeating timer whose first fire is `now + period`.
    pub fn schedule_after_with_repeat<F>(&mut self, period: Duration, repeat: Repeat, f: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_at_with_repeat(Instant::now() + period, period, repeat, f)
    }

    /// Cancels a pending timer.
    ///
    /// Returns `false` when the timer already fired out, was cancelled, or
    /// never existed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(when) = self.index.remove(&id.0) else {
            return false;
        };
        match self.timers.get_mut(&TimerKey { when, id: id.0 }) {
            Some(timer) => {
                timer.remaining = RemainingFires::Count(0);
                trace!(id = id.0, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Drives expirations: fires every timer whose trigger is due, in key
    /// order, re-inserting those with remaining fires at `trigger + period`.
    ///
    /// A panicking callback propagates to the caller after its own entry
    /// has been removed; the remaining timers stay scheduled.
    pub fn update(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().when > now {
                return;
            }
            let (key, mut timer) = entry.remove_entry();
            self.index.remove(&key.id);
            if timer.remaining.exhausted() {
                // Cancelled while pending; dropped silently at expiry.
                continue;
            }
            timer.remaining.consume();
            (timer.callback)();
            if !timer.remaining.exhausted() {
                let next = TimerKey {
                    when: key.when + timer.period,
                    id: key.id,
                };
                self.index.insert(key.id, next.when);
                self.timers.insert(next, timer);
            }
        }
    }

    /// Time until the next fire: `Duration::MAX` when no timer is pending,
    /// zero when one is already due.
    #[must_use]
    pub fn nearest_timer(&self) -> Duration {
        match self.timers.keys().next() {
            None => Duration::MAX,
            Some(key) => key.when.saturating_duration_since(Instant::now()),
        }
    }

    /// Number of pending timers, cancelled-but-unexpired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Returns true when no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.timers.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn due_timer_fires_on_update() {
        let mut manager = TimerManager::new();
        let (count, cb) = counter();
        manager.schedule_at(Instant::now(), cb);
        manager.update();
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn future_timer_does_not_fire_early() {
        let mut manager = TimerManager::new();
        let (count, cb) = counter();
        manager.schedule_after(Duration::from_secs(60), cb);
        manager.update();
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn earlier_trigger_fires_first() {
        let mut manager = TimerManager::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let now = Instant::now();

        let later = Arc::clone(&order);
        manager.schedule_at(now + Duration::from_millis(2), move || {
            later.lock().push("late");
        });
        let sooner = Arc::clone(&order);
        manager.schedule_at(now, move || sooner.lock().push("early"));

        thread::sleep(Duration::from_millis(5));
        manager.update();
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }

    #[test]
    fn equal_triggers_fire_in_insertion_order() {
        let mut manager = TimerManager::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let when = Instant::now();

        for label in ["first", "second", "third"] {
            let sink = Arc::clone(&order);
            manager.schedule_at(when, move || sink.lock().push(label));
        }

        manager.update();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn bounded_repeat_fires_exact_count() {
        let mut manager = TimerManager::new();
        let (count, cb) = counter();
        manager.schedule_at_with_repeat(
            Instant::now(),
            Duration::from_millis(1),
            Repeat::times(3).expect("non-zero"),
            cb,
        );

        for _ in 0..6 {
            thread::sleep(Duration::from_millis(2));
            manager.update();
        }
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert!(manager.is_empty());
    }

    #[test]
    fn forever_timer_keeps_firing_until_cancelled() {
        let mut manager = TimerManager::new();
        let (count, cb) = counter();
        let id = manager.schedule_at_with_repeat(
            Instant::now(),
            Duration::from_millis(1),
            Repeat::Forever,
            cb,
        );

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(2));
            manager.update();
        }
        let fired = count.load(Ordering::Relaxed);
        assert!(fired >= 3, "expected at least 3 fires, got {fired}");

        assert!(manager.cancel(id));
        thread::sleep(Duration::from_millis(2));
        manager.update();
        assert_eq!(count.load(Ordering::Relaxed), fired);
        assert!(manager.is_empty());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut manager = TimerManager::new();
        let (count, cb) = counter();
        let id = manager.schedule_at(Instant::now(), cb);

        assert!(manager.cancel(id));
        assert!(!manager.cancel(id));
        manager.update();
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cancel_after_fire_returns_false() {
        let mut manager = TimerManager::new();
        let id = manager.schedule_at(Instant::now(), || {});
        manager.update();
        assert!(!manager.cancel(id));
    }

    #[test]
    fn nearest_timer_reports_gap() {
        let mut manager = TimerManager::new();
        assert_eq!(manager.nearest_timer(), Duration::MAX);

        manager.schedule_after(Duration::from_secs(60), || {});
        let gap = manager.nearest_timer();
        assert!(gap > Duration::from_secs(59) && gap <= Duration::from_secs(60));

        manager.schedule_at(Instant::now(), || {});
        assert_eq!(manager.nearest_timer(), Duration::ZERO);
    }

    #[test]
    fn zero_period_is_clamped() {
        let mut manager = TimerManager::new();
        let (count, cb) = counter();
        manager.schedule_at_with_repeat(
            Instant::now(),
            Duration::ZERO,
            Repeat::times(2).expect("non-zero"),
            cb,
        );

        manager.update();
        // The second fire is a clamped 1 ms away, not immediate.
        assert_eq!(count.load(Ordering::Relaxed), 1);
        thread::sleep(Duration::from_millis(3));
        manager.update();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn ids_strictly_increase() {
        let mut manager = TimerManager::new();
        let a = manager.schedule_after(Duration::from_secs(1), || {});
        let b = manager.schedule_after(Duration::from_secs(1), || {});
        assert_ne!(a, b);
    }
}
