// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler-side task representation.
//!
//! A `RawTask` owns a type-erased coroutine producing `()`; the typed
//! outcome is handed to a completion hook inside the coroutine itself.
//! State machine:
//!
//! ```text
//! Ready --run--> Running --pending--> Waiting --wake--> Ready
//!                   |  \--wake---> Notified --pending--> Ready (requeued)
//!                   \--done--> Complete
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Poll, Wake, Waker};

use parking_lot::{Condvar, Mutex};

use crate::coroutine::{Coroutine, Resume};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Queued, waiting to be resumed.
    Ready = 0,
    /// Being resumed by a worker.
    Running = 1,
    /// Parked until a waker fires.
    Waiting = 2,
    /// Woken while Running; must be requeued instead of parked.
    Notified = 3,
    Complete = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            3 => Self::Notified,
            _ => Self::Complete,
        }
    }
}

pub(crate) type BoxCoroutine = Box<dyn Coroutine<Output = ()> + Send>;

/// Re-enqueue callback installed by the scheduler.
pub(crate) type ScheduleFn = Arc<dyn Fn(Arc<RawTask>) + Send + Sync>;

pub(crate) struct TaskHeader {
    pub id: u64,
    pub state: AtomicU8,
    /// Abort requested; consumed by the next resume.
    pub abort: AtomicBool,
    /// Pinned worker, if any.
    pub home: Option<usize>,
    pub complete_notify: (Mutex<bool>, Condvar),
    pub schedule_fn: Mutex<Option<ScheduleFn>>,
}

pub(crate) struct RawTask {
    pub header: TaskHeader,
    coroutine: Mutex<Option<BoxCoroutine>>,
}

impl std::fmt::Debug for RawTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.header.id)
            .field("state", &self.state())
            .field("home", &self.header.home)
            .finish()
    }
}

impl RawTask {
    pub fn new(coroutine: BoxCoroutine, id: u64, home: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            header: TaskHeader {
                id,
                state: AtomicU8::new(TaskState::Ready as u8),
                abort: AtomicBool::new(false),
                home,
                complete_notify: (Mutex::new(false), Condvar::new()),
                schedule_fn: Mutex::new(None),
            },
            coroutine: Mutex::new(Some(coroutine)),
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.header.state.load(Ordering::Acquire))
    }

    pub fn is_complete(&self) -> bool {
        self.state() == TaskState::Complete
    }

    /// Mark complete and release anyone blocked in `wait_complete`.
    pub fn mark_complete(&self) {
        self.header
            .state
            .store(TaskState::Complete as u8, Ordering::Release);
        let (lock, cvar) = &self.header.complete_notify;
        let mut done = lock.lock();
        *done = true;
        cvar.notify_all();
    }

    /// Block the calling OS thread until the task completes.
    pub fn wait_complete(&self) {
        let (lock, cvar) = &self.header.complete_notify;
        let mut done = lock.lock();
        while !*done {
            cvar.wait(&mut done);
        }
    }

    /// Ask the task to abort at its next resume. Wakes it if parked.
    pub fn inject_abort(self: &Arc<Self>) {
        if self.is_complete() {
            return;
        }
        self.header.abort.store(true, Ordering::Release);
        tracing::trace!(task = self.header.id, "abort injected");
        self.wake();
    }

    /// Resume the coroutine once. Returns true if it finished.
    pub fn poll(self: &Arc<Self>) -> bool {
        let waker = task_waker(self.clone());
        let mut slot = self.coroutine.lock();
        let Some(coroutine) = slot.as_mut() else {
            return true;
        };

        let input = if self.header.abort.swap(false, Ordering::AcqRel) {
            Resume::Abort
        } else {
            Resume::Continue
        };

        match coroutine.resume(&waker, input) {
            Poll::Ready(()) => {
                *slot = None;
                true
            }
            Poll::Pending => false,
        }
    }

    /// Waiting -> Ready (and requeue), or Running -> Notified.
    pub fn wake(self: &Arc<Self>) {
        loop {
            let (from, to) = match self.state() {
                TaskState::Waiting => (TaskState::Waiting, TaskState::Ready),
                TaskState::Running => (TaskState::Running, TaskState::Notified),
                TaskState::Ready | TaskState::Notified | TaskState::Complete => return,
            };
            let swapped = self.header.state.compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if swapped.is_ok() {
                if to == TaskState::Ready {
                    self.schedule();
                }
                return;
            }
        }
    }

    pub fn schedule(self: &Arc<Self>) {
        let schedule_fn = self.header.schedule_fn.lock().clone();
        if let Some(f) = schedule_fn {
            f(self.clone());
        }
    }
}

struct TaskWaker {
    task: Arc<RawTask>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.task.wake();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.task.wake();
    }
}

fn task_waker(task: Arc<RawTask>) -> Waker {
    Waker::from(Arc::new(TaskWaker { task }))
}

/// Write-once slot for a typed outcome.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, value: T) {
        *self.inner.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Pends `remaining` times, waking itself each time.
    struct Countdown {
        remaining: usize,
        aborts: Arc<AtomicUsize>,
    }

    impl Coroutine for Countdown {
        type Output = ();

        fn resume(&mut self, waker: &Waker, input: Resume) -> Poll<()> {
            if input == Resume::Abort {
                self.aborts.fetch_add(1, Ordering::SeqCst);
            }
            if self.remaining == 0 {
                return Poll::Ready(());
            }
            self.remaining -= 1;
            waker.wake_by_ref();
            Poll::Pending
        }

        fn is_done(&self) -> bool {
            self.remaining == 0
        }
    }

    fn countdown(remaining: usize) -> (Arc<RawTask>, Arc<AtomicUsize>) {
        let aborts = Arc::new(AtomicUsize::new(0));
        let task = RawTask::new(
            Box::new(Countdown {
                remaining,
                aborts: aborts.clone(),
            }),
            1,
            None,
        );
        (task, aborts)
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn abort_injection_is_traced() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let (task, _) = countdown(1);

        tracing::subscriber::with_default(subscriber, || task.inject_abort());

        let logs = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(logs.contains("abort injected"));
        assert!(logs.contains("task=1"));
        assert!(task.header.abort.load(Ordering::SeqCst));
    }

    #[test]
    fn wake_while_running_marks_notified() {
        let (task, _) = countdown(1);
        task.header
            .state
            .store(TaskState::Running as u8, Ordering::Release);
        assert!(!task.poll());
        assert_eq!(task.state(), TaskState::Notified);
    }

    #[test]
    fn wake_while_waiting_requeues() {
        let (task, _) = countdown(1);
        let scheduled = Arc::new(AtomicUsize::new(0));
        let counter = scheduled.clone();
        *task.header.schedule_fn.lock() = Some(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        task.header
            .state
            .store(TaskState::Waiting as u8, Ordering::Release);

        task.wake();
        task.wake();
        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(scheduled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_is_delivered_once() {
        let (task, aborts) = countdown(3);
        task.inject_abort();
        task.poll();
        task.poll();
        assert_eq!(aborts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_releases_waiters() {
        let (task, _) = countdown(0);
        assert!(task.poll());
        task.mark_complete();
        task.wait_complete();
        assert!(task.is_complete());
        task.inject_abort();
        assert!(!task.header.abort.load(Ordering::Acquire));
    }
}
