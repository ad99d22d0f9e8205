//! Deadline timers.
//!
//! Timers are kept in a `BTreeMap` ordered by `(deadline, id)`, so the first
//! entry is always the earliest deadline and equal deadlines keep insertion
//! order. Deadlines are absolute milliseconds read from a [`Clock`].
//!
//! The manager does not run anything itself: the owner asks how long it may
//! sleep ([`TimerManager::next_timer`]) and then drains the due callbacks
//! ([`TimerManager::list_expired`]).

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

/// A clock moving backwards by more than this is treated as a rollback.
pub const ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Callback run when a timer expires. Recurring timers run it repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Source of "now" in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock, milliseconds since the UNIX epoch. It can jump backwards when
/// the system time is adjusted, which is what rollback detection is for.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

struct TimerState {
    ms: u64,
    next: u64,
    recurring: bool,
    // None once the timer fired (one-shot) or was cancelled.
    callback: Option<TimerCallback>,
}

/// A registered timer. Dropping the handle does not cancel it.
pub struct Timer {
    id: u64,
    state: Mutex<TimerState>,
    manager: Weak<Shared>,
}

type Key = (u64, u64);

struct Heap {
    timers: BTreeMap<Key, Arc<Timer>>,
    // Set once the front listener fired; cleared by next_timer.
    tickled: bool,
    previous_ms: u64,
    rolled_back: bool,
}

type FrontListener = Box<dyn Fn() + Send + Sync>;

struct Shared {
    heap: RwLock<Heap>,
    clock: Arc<dyn Clock>,
    on_front: OnceLock<FrontListener>,
}

/// Ordered set of timers sharing one clock.
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new(Arc::new(SystemClock))
    }
}

impl TimerManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let previous_ms = clock.now_ms();
        TimerManager {
            shared: Arc::new(Shared {
                heap: RwLock::new(Heap {
                    timers: BTreeMap::new(),
                    tickled: false,
                    previous_ms,
                    rolled_back: false,
                }),
                clock,
                on_front: OnceLock::new(),
            }),
        }
    }

    /// Install the hook run when a newly inserted timer becomes the earliest.
    /// Only one listener can be installed; returns `false` if one already was.
    pub fn set_front_listener<F>(&self, listener: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.on_front.set(Box::new(listener)).is_ok()
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Arm a timer firing `ms` milliseconds from now.
    #[tracing::instrument(level = "trace", skip(self, callback))]
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_arc(ms, Arc::new(callback), recurring)
    }

    fn add_timer_arc(&self, ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let now = self.shared.clock.now_ms();
        let timer = Arc::new(Timer {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                ms,
                next: now.saturating_add(ms),
                recurring,
                callback: Some(callback),
            }),
            manager: Arc::downgrade(&self.shared),
        });
        self.shared.insert(timer.clone());
        timer
    }

    /// Like [`Self::add_timer`], but the callback only runs while `guard` is
    /// still alive when the timer fires.
    pub fn add_condition_timer<F, G>(
        &self,
        ms: u64,
        callback: F,
        guard: Weak<G>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        G: Any + Send + Sync,
    {
        self.add_timer(
            ms,
            move || {
                if guard.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline, `None` when no timer is
    /// pending. After a clock rollback this is `Some(0)` until the timers are
    /// drained.
    pub fn next_timer(&self) -> Option<u64> {
        let now = self.shared.clock.now_ms();
        let mut heap = self.shared.heap.write();
        heap.tickled = false;
        let rolled_back = heap.detect_rollback(now);
        let Some((&(next, _), _)) = heap.timers.first_key_value() else {
            // Nothing to expire; a rollback must not leak onto later timers.
            heap.rolled_back = false;
            return None;
        };
        if rolled_back {
            return Some(0);
        }
        Some(next.saturating_sub(now))
    }

    /// Remove every due timer and return their callbacks in deadline order.
    /// Recurring timers are put back with a fresh deadline.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = self.shared.clock.now_ms();
        let mut heap = self.shared.heap.write();
        let rolled_back = heap.detect_rollback(now);
        heap.rolled_back = false;
        if heap.timers.is_empty() {
            return Vec::new();
        }

        let expired = if rolled_back {
            std::mem::take(&mut heap.timers)
        } else {
            let later = heap.timers.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut heap.timers, later)
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for (_, timer) in expired {
            let mut state = timer.state.lock();
            if state.recurring {
                if let Some(callback) = state.callback.clone() {
                    callbacks.push(callback);
                    state.next = now.saturating_add(state.ms);
                    let key = (state.next, timer.id);
                    drop(state);
                    heap.timers.insert(key, timer);
                }
            } else if let Some(callback) = state.callback.take() {
                callbacks.push(callback);
            }
        }
        tracing::trace!(
            "TimerManager::list_expired expired: {} remaining: {}",
            callbacks.len(),
            heap.timers.len()
        );
        callbacks
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.heap.read().timers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.heap.read().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Heap {
    fn detect_rollback(&mut self, now: u64) -> bool {
        if now < self.previous_ms.saturating_sub(ROLLBACK_THRESHOLD_MS) {
            tracing::warn!(
                "clock rollback detected previous: {} now: {}",
                self.previous_ms,
                now
            );
            self.rolled_back = true;
        }
        self.previous_ms = now;
        self.rolled_back
    }
}

impl Shared {
    fn insert(&self, timer: Arc<Timer>) {
        let at_front = {
            let mut heap = self.heap.write();
            let key = {
                let state = timer.state.lock();
                (state.next, timer.id)
            };
            heap.timers.insert(key, timer);
            let at_front = heap.timers.first_key_value().map(|(k, _)| *k) == Some(key);
            let notify = at_front && !heap.tickled;
            if notify {
                heap.tickled = true;
            }
            notify
        };
        if at_front {
            if let Some(listener) = self.on_front.get() {
                listener();
            }
        }
    }
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Absolute deadline in clock milliseconds.
    pub fn deadline(&self) -> u64 {
        self.state.lock().next
    }

    pub fn interval(&self) -> u64 {
        self.state.lock().ms
    }

    pub fn is_recurring(&self) -> bool {
        self.state.lock().recurring
    }

    /// Remove the timer. `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut heap = shared.heap.write();
        let mut state = self.state.lock();
        if state.callback.take().is_none() {
            return false;
        }
        heap.timers.remove(&(state.next, self.id));
        true
    }

    /// Push the deadline to now + interval.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let now = shared.clock.now_ms();
        let mut heap = shared.heap.write();
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return false;
        }
        let Some(timer) = heap.timers.remove(&(state.next, self.id)) else {
            return false;
        };
        state.next = now.saturating_add(state.ms);
        heap.timers.insert((state.next, self.id), timer);
        true
    }

    /// Change the interval. The new deadline counts from now when `from_now`,
    /// otherwise from the timer's original start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let timer = {
            let mut heap = shared.heap.write();
            let mut state = self.state.lock();
            if state.callback.is_none() {
                return false;
            }
            if ms == state.ms && !from_now {
                return true;
            }
            let Some(timer) = heap.timers.remove(&(state.next, self.id)) else {
                return false;
            };
            let start = if from_now {
                shared.clock.now_ms()
            } else {
                state.next.saturating_sub(state.ms)
            };
            state.ms = ms;
            state.next = start.saturating_add(ms);
            timer
        };
        shared.insert(timer);
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("ms", &state.ms)
            .field("next", &state.next)
            .field("recurring", &state.recurring)
            .field("armed", &state.callback.is_some())
            .finish()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manual(start: u64) -> (Arc<ManualClock>, TimerManager) {
        let clock = Arc::new(ManualClock::new(start));
        let manager = TimerManager::new(clock.clone());
        (clock, manager)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn next_timer_tracks_earliest_deadline() {
        let (_clock, timers) = manual(10_000);
        assert_eq!(timers.next_timer(), None);

        let a = timers.add_timer(500, || {}, false);
        let b = timers.add_timer(100, || {}, false);
        let _c = timers.add_timer(300, || {}, false);
        assert_eq!(timers.next_timer(), Some(100));

        assert!(b.cancel());
        assert!(!b.cancel());
        assert_eq!(timers.next_timer(), Some(300));

        assert!(a.reset(50, true));
        assert_eq!(timers.next_timer(), Some(50));
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn list_expired_runs_due_timers_in_order() {
        let (clock, timers) = manual(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(30, 'c'), (10, 'a'), (20, 'b'), (40, 'd')] {
            let order = order.clone();
            timers.add_timer(ms, move || order.lock().push(tag), false);
        }

        clock.set(30);
        for cb in timers.list_expired() {
            cb();
        }
        assert_eq!(*order.lock(), vec!['a', 'b', 'c']);
        assert_eq!(timers.next_timer(), Some(10));
    }

    #[test]
    fn recurring_timer_is_rearmed() {
        let (clock, timers) = manual(0);
        let (hits, cb) = counter();
        let timer = timers.add_timer(100, cb, true);

        for round in 1..=3 {
            clock.advance(100);
            for cb in timers.list_expired() {
                cb();
            }
            assert_eq!(hits.load(Ordering::SeqCst), round);
            assert_eq!(timer.deadline(), 100 * (round as u64 + 1));
        }
        assert!(timer.cancel());
        assert!(!timers.has_timer());
    }

    #[test]
    fn fired_one_shot_cannot_be_cancelled() {
        let (clock, timers) = manual(0);
        let timer = timers.add_timer(5, || {}, false);
        clock.advance(5);
        assert_eq!(timers.list_expired().len(), 1);
        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(10, true));
    }

    #[test]
    fn refresh_and_reset_move_deadline() {
        let (clock, timers) = manual(1_000);
        let timer = timers.add_timer(100, || {}, false);
        clock.advance(60);
        assert!(timer.refresh());
        assert_eq!(timer.deadline(), 1_160);

        // Same interval, not from now: nothing to do.
        assert!(timer.reset(100, false));
        assert_eq!(timer.deadline(), 1_160);

        // Keeps the original start (1_060).
        assert!(timer.reset(40, false));
        assert_eq!(timer.deadline(), 1_100);
    }

    #[test]
    fn condition_timer_needs_live_guard() {
        let (clock, timers) = manual(0);
        let (hits, cb) = counter();
        let guard = Arc::new(());
        timers.add_condition_timer(10, cb.clone(), Arc::downgrade(&guard), false);
        let dropped = Arc::new(());
        timers.add_condition_timer(10, cb, Arc::downgrade(&dropped), false);
        drop(dropped);

        clock.advance(10);
        for cb in timers.list_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn front_listener_fires_once_per_wait() {
        let (_clock, timers) = manual(0);
        let (hits, cb) = counter();
        assert!(timers.set_front_listener(cb.clone()));
        assert!(!timers.set_front_listener(cb));

        timers.add_timer(100, || {}, false);
        timers.add_timer(50, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        timers.next_timer();
        timers.add_timer(200, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        timers.add_timer(10, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clock_rollback_expires_everything() {
        let start = 10 * ROLLBACK_THRESHOLD_MS;
        let (clock, timers) = manual(start);
        let (hits, cb) = counter();
        timers.add_timer(60_000, cb.clone(), false);
        timers.add_timer(120_000, cb, false);

        assert_eq!(timers.next_timer(), Some(60_000));
        clock.set(start - ROLLBACK_THRESHOLD_MS - 1);
        assert_eq!(timers.next_timer(), Some(0));

        let expired = timers.list_expired();
        assert_eq!(expired.len(), 2);
        for cb in expired {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!timers.has_timer());
    }

    #[test]
    fn rollback_with_no_timers_does_not_fire_later_ones() {
        let start = 10 * ROLLBACK_THRESHOLD_MS;
        let (clock, timers) = manual(start);
        clock.set(start - ROLLBACK_THRESHOLD_MS - 1);
        assert_eq!(timers.next_timer(), None);
        assert!(timers.list_expired().is_empty());

        let (hits, cb) = counter();
        timers.add_timer(60_000, cb, false);
        assert_eq!(timers.next_timer(), Some(60_000));
        assert!(timers.list_expired().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn rollback_seen_only_by_list_expired_is_cleared() {
        let start = 10 * ROLLBACK_THRESHOLD_MS;
        let (clock, timers) = manual(start);
        clock.set(start - ROLLBACK_THRESHOLD_MS - 1);
        assert!(timers.list_expired().is_empty());

        timers.add_timer(1_000, || {}, false);
        assert_eq!(timers.next_timer(), Some(1_000));
    }

    #[test]
    fn small_backward_step_is_not_rollback() {
        let (clock, timers) = manual(ROLLBACK_THRESHOLD_MS * 2);
        timers.add_timer(1_000, || {}, false);
        clock.set(ROLLBACK_THRESHOLD_MS * 2 - 5_000);
        assert!(timers.list_expired().is_empty());
        assert_eq!(timers.len(), 1);
    }
}
