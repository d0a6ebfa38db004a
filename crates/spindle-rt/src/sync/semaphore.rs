// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Counting semaphore and lock.
//!
//! Waiters queue FIFO. A release hands its permit straight to the oldest
//! waiter by setting that waiter's event, so a permit is never observable
//! as free while someone is queued.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::context::Cx;
use crate::error::{Cancelled, Error, Result};
use crate::event::Event;

pub struct Semaphore {
    state: Mutex<SemState>,
}

struct SemState {
    permits: usize,
    waiters: VecDeque<Event>,
}

impl SemState {
    fn release(&mut self) {
        // Set under the semaphore lock so an abandoning waiter sees a
        // consistent picture.
        match self.waiters.pop_front() {
            Some(next) => next.set(),
            None => self.permits += 1,
        }
    }
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SemState {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn available(&self) -> usize {
        self.state.lock().permits
    }

    /// Take a permit now, or queue for one and get the event to wait on.
    fn acquire_or_enqueue(&self) -> Option<Event> {
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            return None;
        }
        let event = Event::new();
        state.waiters.push_back(event.clone());
        Some(event)
    }

    pub async fn acquire(&self, cx: &Cx) -> Result<SemaphoreGuard<'_>, Cancelled> {
        if let Some(event) = self.acquire_or_enqueue() {
            if let Err(cancelled) = event.wait(cx, None).await {
                self.abandon(&event);
                return Err(cancelled);
            }
        }
        Ok(SemaphoreGuard { semaphore: self })
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Result<SemaphoreGuard<'_>> {
        let mut state = self.state.lock();
        if state.permits == 0 {
            return Err(Error::WouldBlock);
        }
        state.permits -= 1;
        Ok(SemaphoreGuard { semaphore: self })
    }

    /// Return a permit. Prefer dropping the guard.
    pub fn release(&self) {
        self.state.lock().release();
    }

    /// A cancelled waiter either leaves the queue or, if it was already
    /// handed a permit, passes the permit on.
    fn abandon(&self, event: &Event) {
        let mut state = self.state.lock();
        if event.is_set() {
            state.release();
        } else {
            state.waiters.retain(|queued| !queued.same(event));
        }
    }
}

/// Holds one permit; releases it on drop.
#[must_use = "the permit is released as soon as the guard is dropped"]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl SemaphoreGuard<'_> {
    /// Keep the permit past the guard's lifetime.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Binary semaphore.
pub struct Lock {
    semaphore: Semaphore,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.available() == 0
    }

    pub async fn acquire(&self, cx: &Cx) -> Result<LockGuard<'_>, Cancelled> {
        Ok(LockGuard {
            _permit: self.semaphore.acquire(cx).await?,
        })
    }

    pub fn try_acquire(&self) -> Result<LockGuard<'_>> {
        Ok(LockGuard {
            _permit: self.semaphore.try_acquire()?,
        })
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    _permit: SemaphoreGuard<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_exhausts() {
        let sem = Semaphore::new(2);
        let a = sem.try_acquire().unwrap();
        let _b = sem.try_acquire().unwrap();
        assert!(matches!(sem.try_acquire(), Err(Error::WouldBlock)));
        drop(a);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn release_hands_off_fifo() {
        let sem = Semaphore::new(0);
        let first = sem.acquire_or_enqueue().unwrap();
        let second = sem.acquire_or_enqueue().unwrap();
        sem.release();
        assert!(first.is_set());
        assert!(!second.is_set());
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn abandoned_permit_is_passed_on() {
        let sem = Semaphore::new(0);
        let first = sem.acquire_or_enqueue().unwrap();
        let second = sem.acquire_or_enqueue().unwrap();
        sem.release();
        sem.abandon(&first);
        assert!(second.is_set());
    }

    #[test]
    fn abandoned_waiter_leaves_queue() {
        let sem = Semaphore::new(0);
        let first = sem.acquire_or_enqueue().unwrap();
        sem.abandon(&first);
        sem.release();
        assert!(!first.is_set());
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn lock_guard_releases() {
        let lock = Lock::new();
        {
            let _guard = lock.try_acquire().unwrap();
            assert!(lock.is_locked());
            assert!(lock.try_acquire().is_err());
        }
        assert!(!lock.is_locked());
    }
}
