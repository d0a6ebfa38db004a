// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! M:N scheduler: worker threads plus one reactor thread.
//!
//! In shared mode wakes land on the global queue; workers pull batches
//! into their local queue and steal from peers when idle. In pinned mode
//! every task has a home worker, is only ever queued there and is never
//! stolen.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::queue::RunQueue;
use super::reactor::Reactor;
use super::task::{RawTask, TaskState};
use crate::context::ContextMode;

/// Tasks a worker pulls from the global queue at once.
const GLOBAL_BATCH: usize = 16;

/// Upper bound on how long an idle worker sleeps before rechecking.
const PARK_TIMEOUT: Duration = Duration::from_millis(5);

pub(crate) struct Scheduler {
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    shared: Arc<SharedState>,
}

/// State shared between workers, the reactor thread and spawners.
pub(crate) struct SharedState {
    local_queues: Vec<RunQueue>,
    global_queue: RunQueue,
    reactor: Arc<Reactor>,
    /// Spawned tasks that have not completed yet.
    active_tasks: AtomicUsize,
    all_done: (Mutex<()>, Condvar),
    shutdown: AtomicBool,
    worker_count: usize,
    mode: ContextMode,
    next_home: AtomicUsize,
    next_id: AtomicU64,
    work_available: (Mutex<bool>, Condvar),
}

impl Scheduler {
    pub fn start(workers: usize, mode: ContextMode, reactor: Arc<Reactor>) -> io::Result<Self> {
        let worker_count = workers.max(1);
        let shared = Arc::new(SharedState {
            local_queues: (0..worker_count).map(|_| RunQueue::new()).collect(),
            global_queue: RunQueue::new(),
            reactor,
            active_tasks: AtomicUsize::new(0),
            all_done: (Mutex::new(()), Condvar::new()),
            shutdown: AtomicBool::new(false),
            worker_count,
            mode,
            next_home: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            work_available: (Mutex::new(false), Condvar::new()),
        });

        let scheduler = Self {
            threads: Mutex::new(Vec::with_capacity(worker_count + 1)),
            shared,
        };

        let reactor_shared = scheduler.shared.clone();
        scheduler.spawn_thread("spindle-reactor".to_string(), move || {
            reactor_loop(&reactor_shared)
        })?;
        for id in 0..worker_count {
            let shared = scheduler.shared.clone();
            scheduler.spawn_thread(format!("spindle-worker-{}", id), move || {
                worker_loop(id, &shared)
            })?;
        }

        tracing::debug!(workers = worker_count, %mode, "scheduler started");
        Ok(scheduler)
    }

    fn spawn_thread(
        &self,
        name: String,
        body: impl FnOnce() + Send + 'static,
    ) -> io::Result<()> {
        match thread::Builder::new().name(name).spawn(body) {
            Ok(handle) => {
                self.threads.lock().push(handle);
                Ok(())
            }
            Err(err) => {
                self.stop_threads();
                Err(err)
            }
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Wait for every spawned task to finish, then stop all threads.
    pub fn shutdown(&self) {
        {
            let (lock, cvar) = &self.shared.all_done;
            let mut guard = lock.lock();
            while self.shared.active_tasks.load(Ordering::Acquire) > 0 {
                cvar.wait(&mut guard);
            }
        }
        self.stop_threads();
        tracing::debug!("scheduler stopped");
    }

    fn stop_threads(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.reactor.request_shutdown();
        self.shared.notify_all();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            self.shutdown();
        }
    }
}

impl SharedState {
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Home worker for a new task: inherited from the parent in pinned
    /// mode, otherwise assigned round-robin. Shared mode has no homes.
    pub fn home_for(&self, parent: Option<usize>) -> Option<usize> {
        match self.mode {
            ContextMode::Shared => None,
            ContextMode::Pinned => Some(parent.unwrap_or_else(|| {
                self.next_home.fetch_add(1, Ordering::Relaxed) % self.worker_count
            })),
        }
    }

    /// Hand a fresh task to the workers.
    pub fn schedule(self: &Arc<Self>, task: Arc<RawTask>) {
        self.active_tasks.fetch_add(1, Ordering::AcqRel);

        let weak: Weak<SharedState> = Arc::downgrade(self);
        *task.header.schedule_fn.lock() = Some(Arc::new(move |t: Arc<RawTask>| {
            if let Some(shared) = weak.upgrade() {
                shared.enqueue(t);
            }
        }));

        self.enqueue(task);
    }

    fn enqueue(&self, task: Arc<RawTask>) {
        match task.header.home {
            Some(home) => {
                self.local_queues[home % self.worker_count].push_back(task);
                // Only the home worker can take it.
                self.notify_all();
            }
            None => {
                self.global_queue.push_back(task);
                self.notify_one();
            }
        }
    }

    fn notify_one(&self) {
        let (lock, cvar) = &self.work_available;
        *lock.lock() = true;
        cvar.notify_one();
    }

    fn notify_all(&self) {
        let (lock, cvar) = &self.work_available;
        *lock.lock() = true;
        cvar.notify_all();
    }

    fn task_finished(&self) {
        if self.active_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (lock, cvar) = &self.all_done;
            let _guard = lock.lock();
            cvar.notify_all();
        }
    }
}

/// Simple xorshift64 for random victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn worker_loop(id: usize, shared: &SharedState) {
    let local = &shared.local_queues[id];
    let stealing = shared.mode == ContextMode::Shared;
    let mut rng = (id as u64).wrapping_add(0x9E3779B97F4A7C15);

    loop {
        if let Some(task) = local.pop_front() {
            run_task(task, shared);
            continue;
        }

        if stealing {
            let mut batch = shared.global_queue.pop_batch(GLOBAL_BATCH).into_iter();
            if let Some(first) = batch.next() {
                local.push_batch(batch);
                run_task(first, shared);
                continue;
            }

            if shared.worker_count > 1 {
                let victim = (xorshift64(&mut rng) as usize) % shared.worker_count;
                if victim != id {
                    let mut stolen = shared.local_queues[victim].steal_half().into_iter();
                    if let Some(first) = stolen.next() {
                        local.push_batch(stolen);
                        run_task(first, shared);
                        continue;
                    }
                }
            }
        }

        if shared.shutdown.load(Ordering::Acquire) {
            while let Some(task) = local.pop_front() {
                run_task(task, shared);
            }
            break;
        }

        let (lock, cvar) = &shared.work_available;
        let mut ready = lock.lock();
        if !local.is_empty() || (stealing && !shared.global_queue.is_empty()) {
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !*ready {
            cvar.wait_for(&mut ready, PARK_TIMEOUT);
        }
        *ready = false;
    }
}

/// Resume a task once and settle its next state.
fn run_task(task: Arc<RawTask>, shared: &SharedState) {
    if task.state() == TaskState::Complete {
        return;
    }

    task.header
        .state
        .store(TaskState::Running as u8, Ordering::Release);

    if task.poll() {
        task.mark_complete();
        tracing::trace!(task = task.header.id, "task complete");
        shared.task_finished();
        return;
    }

    let parked = task.header.state.compare_exchange(
        TaskState::Running as u8,
        TaskState::Waiting as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    if parked.is_err() {
        // Woken while running (Notified): go straight back on a queue.
        task.header
            .state
            .store(TaskState::Ready as u8, Ordering::Release);
        shared.enqueue(task);
    }
}

fn reactor_loop(shared: &SharedState) {
    while !shared.reactor.should_shutdown() {
        if let Err(err) = shared.reactor.turn() {
            tracing::warn!(%err, "reactor poll failed");
            thread::sleep(Duration::from_millis(1));
        }
    }
}
