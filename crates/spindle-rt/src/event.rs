// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Completion flags, composite waits and the runtime clock.
//!
//! `Event` is the suspension primitive everything else is built on. A
//! computation parks on one or more events, optionally with a deadline;
//! `set()` wakes every parked waiter. Timing out is not an error: the
//! wait simply resolves and the caller inspects `is_set()`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::context::Cx;
use crate::error::Cancelled;
use crate::green::timer::TimerKey;
use crate::runtime::Handle;

/// Monotonic clock in integer microseconds since runtime start.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> u64 {
        micros(self.origin.elapsed())
    }

    pub(crate) fn instant_at(&self, at: u64) -> Instant {
        self.origin + Duration::from_micros(at)
    }

    /// Deadline `timeout` from now, normalized to whole microseconds.
    pub(crate) fn deadline_after(&self, timeout: Duration) -> Instant {
        self.instant_at(self.now().saturating_add(micros(timeout)))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

static NEXT_WAITER: AtomicU64 = AtomicU64::new(1);

/// Settable completion flag. Clones share state.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Default)]
struct EventInner {
    set: AtomicBool,
    waiters: Mutex<Vec<(u64, Waker)>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake everything parked on it.
    pub fn set(&self) {
        let waiters = {
            let mut waiters = self.inner.waiters.lock();
            self.inner.set.store(true, Ordering::Release);
            std::mem::take(&mut *waiters)
        };
        for (_, waker) in waiters {
            waker.wake();
        }
    }

    pub fn clear(&self) {
        self.inner.set.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same event.
    pub fn same(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Park until set, the timeout elapses, or an abort is delivered.
    pub fn wait<'a>(&'a self, cx: &'a Cx, timeout: Option<Duration>) -> Wait<'a> {
        Wait::new(std::slice::from_ref(self), cx, timeout)
    }

    /// Park until set. Aborts stay pending for the next interruptible wait.
    pub fn wait_uninterruptible(&self) -> Settle<'_> {
        Settle::new(std::slice::from_ref(self))
    }

    /// Returns the registration key, or `None` if the event is already set.
    fn register(&self, key: Option<u64>, waker: &Waker) -> Option<u64> {
        let mut waiters = self.inner.waiters.lock();
        if self.is_set() {
            return None;
        }
        if let Some(key) = key {
            if let Some(entry) = waiters.iter_mut().find(|(id, _)| *id == key) {
                if !entry.1.will_wake(waker) {
                    entry.1 = waker.clone();
                }
                return Some(key);
            }
        }
        let key = key.unwrap_or_else(|| NEXT_WAITER.fetch_add(1, Ordering::Relaxed));
        waiters.push((key, waker.clone()));
        Some(key)
    }

    fn unregister(&self, key: u64) {
        self.inner.waiters.lock().retain(|(id, _)| *id != key);
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.inner.waiters.lock().len()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}

/// Resolves once every one of its events is set.
#[derive(Clone, Debug, Default)]
pub struct Waiter {
    events: Vec<Event>,
}

impl Waiter {
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.events.iter().all(Event::is_set)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn wait<'a>(&'a self, cx: &'a Cx, timeout: Option<Duration>) -> Wait<'a> {
        Wait::new(&self.events, cx, timeout)
    }

    pub fn wait_uninterruptible(&self) -> Settle<'_> {
        Settle::new(&self.events)
    }
}

/// Registration bookkeeping for one pending wait over a set of events.
///
/// Only the first unset event carries our waker; when it fires we move on
/// to the next unset one.
pub(crate) struct WaitState {
    deadline: Option<Instant>,
    registration: Option<(usize, u64)>,
    timer: Option<TimerKey>,
}

impl WaitState {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            deadline,
            registration: None,
            timer: None,
        }
    }

    /// `handle` is required whenever a deadline is set.
    pub fn poll(&mut self, events: &[Event], handle: Option<&Handle>, waker: &Waker) -> Poll<()> {
        loop {
            let Some(idx) = events.iter().position(|e| !e.is_set()) else {
                self.release(events, handle);
                return Poll::Ready(());
            };
            let key = match self.registration.take() {
                Some((prev, key)) if prev == idx => Some(key),
                Some((prev, key)) => {
                    events[prev].unregister(key);
                    None
                }
                None => None,
            };
            if let Some(key) = events[idx].register(key, waker) {
                self.registration = Some((idx, key));
                break;
            }
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.release(events, handle);
                return Poll::Ready(());
            }
            if let Some(handle) = handle {
                match self.timer {
                    Some(key) => handle.reactor().update_timer(key, waker),
                    None => self.timer = Some(handle.reactor().add_timer(deadline, waker.clone())),
                }
            }
        }
        Poll::Pending
    }

    pub fn release(&mut self, events: &[Event], handle: Option<&Handle>) {
        if let Some((idx, key)) = self.registration.take() {
            events[idx].unregister(key);
        }
        if let Some(timer) = self.timer.take() {
            if let Some(handle) = handle {
                handle.reactor().cancel_timer(timer);
            }
        }
    }
}

/// Interruptible wait returned by [`Event::wait`] and [`Waiter::wait`].
#[must_use = "waits do nothing unless awaited"]
pub struct Wait<'a> {
    events: &'a [Event],
    cx: &'a Cx,
    state: WaitState,
}

impl<'a> Wait<'a> {
    fn new(events: &'a [Event], cx: &'a Cx, timeout: Option<Duration>) -> Self {
        let deadline = timeout.map(|t| cx.handle().clock().deadline_after(t));
        Self {
            events,
            cx,
            state: WaitState::new(deadline),
        }
    }
}

impl Future for Wait<'_> {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.cx.take_abort() {
            this.state.release(this.events, Some(this.cx.handle()));
            return Poll::Ready(Err(Cancelled));
        }
        this.state
            .poll(this.events, Some(this.cx.handle()), task.waker())
            .map(Ok)
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        self.state.release(self.events, Some(self.cx.handle()));
    }
}

/// Wait that ignores aborts. Used to confirm a cancelled child has exited.
#[must_use = "waits do nothing unless awaited"]
pub struct Settle<'a> {
    events: &'a [Event],
    state: WaitState,
}

impl<'a> Settle<'a> {
    fn new(events: &'a [Event]) -> Self {
        Self {
            events,
            state: WaitState::new(None),
        }
    }
}

impl Future for Settle<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        this.state.poll(this.events, None, task.waker())
    }
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        self.state.release(self.events, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct Flag(AtomicUsize);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flag_waker() -> (Arc<Flag>, Waker) {
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        (flag.clone(), Waker::from(flag))
    }

    #[test]
    fn set_clear_roundtrip() {
        let event = Event::new();
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn set_wakes_registered_waiter() {
        let event = Event::new();
        let (flag, waker) = flag_waker();
        let mut settle = event.wait_uninterruptible();
        let mut task = Context::from_waker(&waker);

        assert!(Pin::new(&mut settle).poll(&mut task).is_pending());
        assert_eq!(event.waiter_count(), 1);

        event.set();
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
        assert!(Pin::new(&mut settle).poll(&mut task).is_ready());
    }

    #[test]
    fn repoll_does_not_duplicate_registration() {
        let event = Event::new();
        let (_, waker) = flag_waker();
        let mut settle = event.wait_uninterruptible();
        let mut task = Context::from_waker(&waker);
        for _ in 0..3 {
            assert!(Pin::new(&mut settle).poll(&mut task).is_pending());
        }
        assert_eq!(event.waiter_count(), 1);
        drop(settle);
        assert_eq!(event.waiter_count(), 0);
    }

    #[test]
    fn composite_waits_for_all() {
        let a = Event::new();
        let b = Event::new();
        let waiter = Waiter::new([a.clone(), b.clone()]);
        let (_, waker) = flag_waker();
        let mut task = Context::from_waker(&waker);
        let mut settle = waiter.wait_uninterruptible();

        assert!(Pin::new(&mut settle).poll(&mut task).is_pending());
        b.set();
        assert!(Pin::new(&mut settle).poll(&mut task).is_pending());
        a.set();
        assert!(waiter.is_set());
        assert!(Pin::new(&mut settle).poll(&mut task).is_ready());
    }

    #[test]
    fn empty_waiter_is_immediately_ready() {
        let waiter = Waiter::new(Vec::new());
        let (_, waker) = flag_waker();
        let mut task = Context::from_waker(&waker);
        assert!(Pin::new(&mut waiter.wait_uninterruptible())
            .poll(&mut task)
            .is_ready());
    }

    #[test]
    fn clock_is_monotonic_micros() {
        let clock = Clock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now();
        assert!(b >= a + 2_000);
        assert_eq!(micros(Duration::from_nanos(1_999)), 1);
    }
}
