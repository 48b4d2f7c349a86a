//! Deadline-ordered timers with cancellation and clock-rollback handling.
//!
//! Timers are kept in a `BTreeMap` keyed by (deadline, insertion sequence),
//! so equal deadlines fire in insertion order. Expired-timer extraction
//! happens under the manager's lock, but the returned callbacks are run by
//! the caller outside it, so a callback is free to add or cancel timers.
//!
//! Deadlines are milliseconds on a process-local monotonic clock. The
//! expiry path still watches for the observed time jumping backwards by
//! more than an hour (a host clock adjustment when the caller supplies its
//! own `now`); when that happens every pending timer is treated as expired,
//! favoring forward progress over precise deadlines.

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

static CLOCK_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed on the process-local monotonic clock.
pub fn now_ms() -> u64 {
    CLOCK_ORIGIN.elapsed().as_millis() as u64
}

/// A backward jump larger than this expires every pending timer.
const ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Shared timer callback; recurring timers invoke it once per period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Cancellable handle returned by timer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: u64,
    seq: u64,
}

struct TimerEntry {
    handle: TimerHandle,
    interval: Option<u64>,
    cb: TimerCallback,
    /// If present and dead at fire time, the timer is dropped unfired.
    condition: Option<Weak<()>>,
}

struct TimerInner {
    timers: BTreeMap<TimerKey, TimerEntry>,
    handles: FxHashMap<TimerHandle, TimerKey>,
    next_seq: u64,
    last_observed: u64,
}

/// Deadline-ordered collection of scheduled callbacks.
pub struct TimerManager {
    inner: Mutex<TimerInner>,
    /// Invoked when an insertion produces a new earliest deadline, so an
    /// owning event loop can shorten a wait already in flight.
    front_notify: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimerInner {
                timers: BTreeMap::new(),
                handles: FxHashMap::default(),
                next_seq: 0,
                last_observed: 0,
            }),
            front_notify: OnceCell::new(),
        }
    }

    /// Install the front-insert notifier. Only the first call takes effect.
    pub fn set_front_notifier(&self, notify: Box<dyn Fn() + Send + Sync>) {
        let _ = self.front_notify.set(notify);
    }

    /// Schedule `cb` to fire after `delay_ms`. A recurring timer rearms
    /// itself at fire time + `delay_ms` after each firing.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> TimerHandle {
        self.insert_at(now_ms() + delay_ms, delay_ms, Arc::new(cb), None, recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but bound to a liveness
    /// condition: if `condition` cannot be upgraded when the deadline
    /// arrives, the callback is skipped and the timer is dropped.
    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        condition: Weak<()>,
        recurring: bool,
    ) -> TimerHandle {
        self.insert_at(
            now_ms() + delay_ms,
            delay_ms,
            Arc::new(cb),
            Some(condition),
            recurring,
        )
    }

    /// Cancel a pending timer. Idempotent: cancelling twice, or cancelling
    /// a timer that already fired, is a no-op returning false.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.handles.remove(&handle) {
            Some(key) => inner.timers.remove(&key).is_some(),
            None => false,
        }
    }

    /// Milliseconds until the earliest pending deadline; `None` when no
    /// timer is pending.
    pub fn next_timeout(&self) -> Option<u64> {
        self.next_timeout_at(now_ms())
    }

    fn next_timeout_at(&self, now: u64) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .timers
            .keys()
            .next()
            .map(|key| key.deadline.saturating_sub(now))
    }

    /// Pop every timer whose deadline has passed, rearm the recurring ones,
    /// and return the callbacks for the caller to run outside the lock.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        self.list_expired_at(now_ms())
    }

    fn list_expired_at(&self, now: u64) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock();
        let rolled_back = now < inner.last_observed
            && inner.last_observed - now > ROLLBACK_THRESHOLD_MS;
        inner.last_observed = now;
        if inner.timers.is_empty() {
            return Vec::new();
        }

        let expired: Vec<(TimerKey, TimerEntry)> = if rolled_back {
            log::warn!(
                "clock rolled back past threshold; expiring all {} pending timers",
                inner.timers.len()
            );
            std::mem::take(&mut inner.timers).into_iter().collect()
        } else {
            let boundary = TimerKey {
                deadline: now + 1,
                seq: 0,
            };
            let pending = inner.timers.split_off(&boundary);
            std::mem::replace(&mut inner.timers, pending)
                .into_iter()
                .collect()
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for (_key, entry) in expired {
            inner.handles.remove(&entry.handle);
            if let Some(condition) = &entry.condition {
                if condition.upgrade().is_none() {
                    continue;
                }
            }
            callbacks.push(entry.cb.clone());
            if let Some(interval) = entry.interval {
                // Rearm relative to fire time, not the original deadline:
                // a long stall must not produce a burst of catch-up firings.
                let key = TimerKey {
                    deadline: now + interval,
                    seq: inner.next_seq,
                };
                inner.next_seq += 1;
                inner.handles.insert(entry.handle, key);
                inner.timers.insert(key, entry);
            }
        }
        callbacks
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().timers.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().timers.len()
    }

    fn insert_at(
        &self,
        deadline: u64,
        interval_ms: u64,
        cb: TimerCallback,
        condition: Option<Weak<()>>,
        recurring: bool,
    ) -> TimerHandle {
        let handle = TimerHandle(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
        let at_front;
        {
            let mut inner = self.inner.lock();
            let key = TimerKey {
                deadline,
                seq: inner.next_seq,
            };
            inner.next_seq += 1;
            at_front = inner
                .timers
                .keys()
                .next()
                .map_or(true, |first| key < *first);
            inner.timers.insert(
                key,
                TimerEntry {
                    handle,
                    interval: recurring.then_some(interval_ms),
                    cb,
                    condition,
                },
            );
            inner.handles.insert(handle, key);
        }
        if at_front {
            if let Some(notify) = self.front_notify.get() {
                notify();
            }
        }
        handle
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}
