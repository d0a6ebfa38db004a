// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime entry points and the explicit runtime handle.
//!
//! A `Runtime` owns the worker threads, the reactor thread and the
//! blocking pool. Code running on it reaches the runtime only through
//! the `Handle` carried in its `Cx`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Poll, Waker};

use crate::blocking::BlockingPool;
use crate::cancel::AbortCell;
use crate::config::RuntimeConfig;
use crate::context::Cx;
use crate::coroutine::{BoxedCoroutine, Coroutine, Resume, Task};
use crate::error::{panic_message, Error, Result};
use crate::event::Clock;
use crate::green::reactor::Reactor;
use crate::green::scheduler::{Scheduler, SharedState};
use crate::green::task::{RawTask, ResultSlot};

#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    scheduler: Arc<SharedState>,
    reactor: Arc<Reactor>,
    blocking: BlockingPool,
    clock: Clock,
    config: RuntimeConfig,
}

impl Handle {
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub(crate) fn blocking(&self) -> &BlockingPool {
        &self.inner.blocking
    }

    /// Spawn a root-level task whose outcome is discarded.
    pub fn spawn<T: Send + 'static>(&self, task: Task<T>) -> TaskRef {
        self.spawn_with(task, None, |outcome| {
            if let Err(err) = outcome {
                tracing::debug!(%err, "detached task failed");
            }
        })
    }

    /// Inject cancellation into a spawned task.
    pub fn cancel(&self, task: &TaskRef) {
        task.cancel();
    }

    /// Spawn `task` and hand its outcome to `on_done` when it finishes.
    /// Children of a pinned task stay on the parent's worker.
    pub(crate) fn spawn_with<T, F>(&self, task: Task<T>, parent_home: Option<usize>, on_done: F) -> TaskRef
    where
        T: Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let scheduler = &self.inner.scheduler;
        let home = scheduler.home_for(parent_home);
        let cx = Cx::new(self.clone(), Arc::new(AbortCell::new()), home);
        let finish = Finish {
            inner: task.start(cx),
            on_done: Some(on_done),
        };
        let id = scheduler.next_task_id();
        let raw = RawTask::new(Box::new(finish), id, home);
        tracing::trace!(task = id, ?home, "spawn");
        scheduler.schedule(raw.clone());
        TaskRef { raw }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("workers", &self.inner.scheduler.worker_count())
            .field("context", &self.inner.config.context)
            .finish()
    }
}

/// Reference to a spawned task, usable for cancellation.
#[derive(Clone, Debug)]
pub struct TaskRef {
    raw: Arc<RawTask>,
}

impl TaskRef {
    pub fn id(&self) -> u64 {
        self.raw.header.id
    }

    /// Deliver an abort at the task's next resume. Ignored once complete.
    pub fn cancel(&self) {
        self.raw.inject_abort();
    }

    pub fn is_complete(&self) -> bool {
        self.raw.is_complete()
    }

    fn wait_complete(&self) {
        self.raw.wait_complete();
    }
}

/// Runs the typed coroutine and reports its outcome exactly once.
/// Panics become `Error::Panicked`.
struct Finish<T, F> {
    inner: BoxedCoroutine<T>,
    on_done: Option<F>,
}

impl<T, F> Coroutine for Finish<T, F>
where
    F: FnOnce(Result<T>) + Send,
{
    type Output = ();

    fn resume(&mut self, waker: &Waker, input: Resume) -> Poll<()> {
        let Some(on_done) = self.on_done.take() else {
            return Poll::Ready(());
        };
        let inner = &mut self.inner;
        let outcome = match catch_unwind(AssertUnwindSafe(|| inner.resume(waker, input))) {
            Ok(Poll::Pending) => {
                self.on_done = Some(on_done);
                return Poll::Pending;
            }
            Ok(Poll::Ready(outcome)) => outcome,
            Err(payload) => {
                let msg = panic_message(payload);
                tracing::warn!(%msg, "task panicked");
                Err(Error::Panicked(msg))
            }
        };
        on_done(outcome);
        Poll::Ready(())
    }

    fn is_done(&self) -> bool {
        self.on_done.is_none()
    }
}

pub struct Runtime {
    handle: Handle,
    scheduler: Scheduler,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let reactor = Arc::new(Reactor::new()?);
        let scheduler = Scheduler::start(config.worker_threads(), config.context, reactor.clone())?;
        let blocking = BlockingPool::new(config.blocking_pool_size, config.blocking_pool_idle_ttl);
        let handle = Handle {
            inner: Arc::new(HandleInner {
                scheduler: scheduler.shared().clone(),
                reactor,
                blocking,
                clock: Clock::new(),
                config,
            }),
        };
        Ok(Self { handle, scheduler })
    }

    /// Runtime configured from `SPINDLE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `task` to completion, blocking the calling thread.
    ///
    /// Must not be called from inside a task.
    pub fn block_on<T: Send + 'static>(&self, task: Task<T>) -> Result<T> {
        let slot = Arc::new(ResultSlot::new());
        let sink = slot.clone();
        let root = self
            .handle
            .spawn_with(task, None, move |outcome| sink.set(outcome));
        root.wait_complete();
        slot.take()
            .unwrap_or_else(|| Err(Error::Panicked("task finished without a result".to_string())))
    }

    /// Wait for every spawned task, then stop all runtime threads.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        self.scheduler.shutdown();
        self.handle.blocking().shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.scheduler.is_shut_down() {
            self.shutdown_inner();
        }
    }
}

/// Build a runtime from `config`, run `task` on it and shut down.
pub fn run<T: Send + 'static>(task: Task<T>, config: RuntimeConfig) -> Result<T> {
    let runtime = Runtime::new(config)?;
    let outcome = runtime.block_on(task);
    runtime.shutdown();
    outcome
}
