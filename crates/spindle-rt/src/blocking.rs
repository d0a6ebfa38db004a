// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking-work offload.
//!
//! Synchronous callables run on a lazily grown pool of OS threads. The
//! calling task parks on a completion event. If the caller is cancelled
//! while parked, the callable is asked to abort (skipped if it has not
//! started, flagged via [`cancelled`] if it has) and the caller then waits
//! uninterruptibly until the worker has truly finished with it.

use std::cell::RefCell;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::context::Cx;
use crate::error::{panic_message, Cancelled, Error, Result};
use crate::event::Event;
use crate::green::task::ResultSlot;

thread_local! {
    static CURRENT: RefCell<Option<Arc<AbortFlag>>> = const { RefCell::new(None) };
}

/// True when the blocking callable running on this thread has been asked
/// to abort. Always false outside the blocking pool.
pub fn cancelled() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|flag| flag.is_set())
    })
}

#[derive(Debug, Default)]
struct AbortFlag(AtomicBool);

impl AbortFlag {
    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum Outcome<R> {
    Value(R),
    Failed(String),
    /// Aborted before it started.
    Skipped,
}

struct Job {
    abort: Arc<AbortFlag>,
    /// Runs the callable, or with `true` reports it as skipped.
    body: Box<dyn FnOnce(bool) + Send>,
}

impl Job {
    fn run(self) {
        if self.abort.is_set() {
            (self.body)(true);
            return;
        }
        CURRENT.with(|current| *current.borrow_mut() = Some(self.abort.clone()));
        (self.body)(false);
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

/// One submitted callable, seen from the submitting side.
struct Submitted<R> {
    abort: Arc<AbortFlag>,
    done: Event,
    outcome: Arc<ResultSlot<Outcome<R>>>,
}

pub(crate) struct BlockingPool {
    sender: Mutex<Option<Sender<Job>>>,
    jobs: Receiver<Job>,
    threads: Arc<AtomicUsize>,
    max_threads: usize,
    idle_ttl: Duration,
    /// Held while a spawn decision is in progress.
    spawning: AtomicBool,
}

impl BlockingPool {
    pub fn new(max_threads: usize, idle_ttl: Duration) -> Self {
        let (sender, jobs) = crossbeam_channel::unbounded();
        Self {
            sender: Mutex::new(Some(sender)),
            jobs,
            threads: Arc::new(AtomicUsize::new(0)),
            max_threads: max_threads.max(1),
            idle_ttl,
            spawning: AtomicBool::new(false),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads.load(Ordering::Acquire)
    }

    fn submit<F, R>(&self, f: F) -> io::Result<Submitted<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let abort = Arc::new(AbortFlag::default());
        let done = Event::new();
        let outcome = Arc::new(ResultSlot::new());

        let job = {
            let done = done.clone();
            let outcome = outcome.clone();
            Job {
                abort: abort.clone(),
                body: Box::new(move |skip| {
                    let result = if skip {
                        Outcome::Skipped
                    } else {
                        match catch_unwind(AssertUnwindSafe(f)) {
                            Ok(value) => Outcome::Value(value),
                            Err(payload) => Outcome::Failed(panic_message(payload)),
                        }
                    };
                    outcome.set(result);
                    done.set();
                }),
            }
        };

        {
            let sender = self.sender.lock();
            let Some(sender) = sender.as_ref() else {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "blocking pool is shut down",
                ));
            };
            sender
                .send(job)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "blocking pool is shut down"))?;
        }
        self.maybe_grow();

        Ok(Submitted {
            abort,
            done,
            outcome,
        })
    }

    /// Add a thread if work is queued and we are under the cap. Only one
    /// caller decides at a time.
    fn maybe_grow(&self) {
        if self.jobs.is_empty() || self.threads() >= self.max_threads {
            return;
        }
        if self
            .spawning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !self.jobs.is_empty() && self.threads() < self.max_threads {
            self.spawn_thread();
        }
        self.spawning.store(false, Ordering::Release);
    }

    fn spawn_thread(&self) {
        let jobs = self.jobs.clone();
        let threads = self.threads.clone();
        let idle_ttl = self.idle_ttl;
        let id = threads.fetch_add(1, Ordering::AcqRel);

        let spawned = thread::Builder::new()
            .name(format!("spindle-blocking-{}", id))
            .spawn(move || blocking_worker(jobs, idle_ttl, &threads));
        if let Err(err) = spawned {
            self.threads.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(%err, "failed to spawn blocking thread");
        }
    }

    /// Stop accepting work. Idle threads exit once the queue drains.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }
}

/// Serve jobs until idle for `idle_ttl` or the pool shuts down. The
/// thread leaves `threads` before its final queue check, so a job queued
/// while it exits is either taken here or seen by `maybe_grow`.
fn blocking_worker(jobs: Receiver<Job>, idle_ttl: Duration, threads: &AtomicUsize) {
    loop {
        match jobs.recv_timeout(idle_ttl) {
            Ok(job) => job.run(),
            Err(RecvTimeoutError::Timeout) => {
                threads.fetch_sub(1, Ordering::AcqRel);
                match jobs.try_recv() {
                    Ok(job) => {
                        threads.fetch_add(1, Ordering::AcqRel);
                        job.run();
                    }
                    Err(_) => {
                        tracing::trace!("blocking thread idle, exiting");
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                threads.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }
}

/// Run `f` on the blocking pool and wait for its result.
///
/// A panic inside `f` surfaces as [`Error::BlockingTask`]. If the caller
/// is cancelled, `f` is asked to abort and this returns only after the
/// pool is done with it: `Err(Cancelled)` if it never ran, otherwise
/// whatever it produced, with the abort left pending so the caller's next
/// wait reports `Cancelled`.
pub async fn spawn_blocking<F, R>(cx: &Cx, f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let submitted = cx.handle().blocking().submit(f)?;
    let interrupted = submitted.done.wait(cx, None).await.is_err();
    if interrupted {
        tracing::debug!("blocking call interrupted, waiting for the pool to let go");
        submitted.abort.set();
        submitted.done.wait_uninterruptible().await;
    }
    let outcome = match submitted.outcome.take() {
        Some(Outcome::Value(value)) => Ok(value),
        Some(Outcome::Failed(msg)) => Err(Error::BlockingTask(msg)),
        Some(Outcome::Skipped) | None => return Err(Cancelled.into()),
    };
    if interrupted {
        // The callable ran anyway; the abort still belongs to the caller.
        cx.abort_cell().deliver();
    }
    outcome
}
