// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline queue driven by the reactor thread.
//!
//! Ordered by (deadline, id) so equal deadlines fire in registration
//! order. The reactor sizes its epoll timeout from `next_deadline` and
//! calls `fire_expired` after each poll.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    at: Instant,
    id: u64,
}

pub(crate) struct Timers {
    entries: Mutex<BTreeMap<TimerKey, Waker>>,
    next_id: AtomicU64,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `waker` to fire at `at`. The flag reports whether this is
    /// now the earliest deadline, i.e. the reactor must recompute its sleep.
    pub fn insert(&self, at: Instant, waker: Waker) -> (TimerKey, bool) {
        let key = TimerKey {
            at,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let mut entries = self.entries.lock();
        entries.insert(key, waker);
        let earliest = entries.keys().next() == Some(&key);
        (key, earliest)
    }

    /// Swap in a fresher waker. No-op if the timer already fired.
    pub fn update(&self, key: TimerKey, waker: &Waker) {
        if let Some(slot) = self.entries.lock().get_mut(&key) {
            if !slot.will_wake(waker) {
                *slot = waker.clone();
            }
        }
    }

    pub fn remove(&self, key: TimerKey) {
        self.entries.lock().remove(&key);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.lock().keys().next().map(|k| k.at)
    }

    /// Wake every timer due at or before `now`. Returns how many fired.
    pub fn fire_expired(&self, now: Instant) -> usize {
        let due: Vec<Waker> = {
            let mut entries = self.entries.lock();
            let mut due = Vec::new();
            while let Some(entry) = entries.first_entry() {
                if entry.key().at > now {
                    break;
                }
                due.push(entry.remove());
            }
            due
        };
        let fired = due.len();
        for waker in due {
            waker.wake();
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::task::Wake;
    use std::time::Duration;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let inner = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (inner.clone(), Waker::from(inner))
    }

    #[test]
    fn fires_only_due_timers() {
        let timers = Timers::new();
        let base = Instant::now();
        let (early, early_waker) = counting();
        let (late, late_waker) = counting();

        let (_, first) = timers.insert(base + Duration::from_millis(10), early_waker);
        let (_, second) = timers.insert(base + Duration::from_secs(60), late_waker);
        assert!(first);
        assert!(!second);
        assert_eq!(timers.next_deadline(), Some(base + Duration::from_millis(10)));

        assert_eq!(timers.fire_expired(base + Duration::from_millis(20)), 1);
        assert_eq!(early.0.load(Ordering::SeqCst), 1);
        assert_eq!(late.0.load(Ordering::SeqCst), 0);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn removed_timer_never_fires() {
        let timers = Timers::new();
        let base = Instant::now();
        let (count, waker) = counting();
        let (key, _) = timers.insert(base, waker);
        timers.remove(key);
        assert_eq!(timers.fire_expired(base + Duration::from_secs(1)), 0);
        assert_eq!(count.0.load(Ordering::SeqCst), 0);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn update_after_fire_is_ignored() {
        let timers = Timers::new();
        let base = Instant::now();
        let (_, waker) = counting();
        let (key, _) = timers.insert(base, waker.clone());
        timers.fire_expired(base);
        timers.update(key, &waker);
        assert_eq!(timers.len(), 0);
    }
}
