// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structured concurrency: spawn a group of children, join them together.
//!
//! Results come back in spawn order. Child failures are collected rather
//! than short-circuiting, so every child runs to completion before the
//! join resolves.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;

use crate::blocking::spawn_blocking;
use crate::context::Cx;
use crate::coroutine::Task;
use crate::error::{Cancelled, Error, GroupFailure, Result};
use crate::event::{Event, Waiter};
use crate::runtime::TaskRef;

/// Outcome of joining a group.
#[derive(Debug)]
pub enum JoinResult<T> {
    /// Every child succeeded; values in spawn order.
    Ok(Vec<T>),
    /// At least one child failed; errors in spawn order.
    Failed(Vec<Error>),
}

impl<T> JoinResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, JoinResult::Ok(_))
    }

    pub fn into_result(self) -> Result<Vec<T>> {
        match self {
            JoinResult::Ok(values) => Ok(values),
            JoinResult::Failed(errors) => Err(Error::Group(GroupFailure { errors })),
        }
    }
}

struct Outcomes<T> {
    values: Vec<Option<T>>,
    errors: Vec<(usize, Error)>,
}

/// A spawned group, awaiting [`Join::join`].
#[must_use = "a spawned group should be joined"]
pub struct Join<T> {
    waiter: Waiter,
    outcomes: Arc<Mutex<Outcomes<T>>>,
    children: Vec<TaskRef>,
}

impl<T: Send + 'static> Join<T> {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Handles to the children, e.g. for targeted cancellation.
    pub fn children(&self) -> &[TaskRef] {
        &self.children
    }

    pub fn is_finished(&self) -> bool {
        self.waiter.is_set()
    }

    /// Wait for every child.
    ///
    /// If the caller is cancelled while waiting, the cancellation is
    /// forwarded to every child and this returns `Err(Cancelled)` once all
    /// of them have exited.
    pub async fn join(self, cx: &Cx) -> Result<JoinResult<T>, Cancelled> {
        if let Err(cancelled) = self.waiter.wait(cx, None).await {
            tracing::debug!(children = self.children.len(), "join cancelled, cancelling children");
            for child in &self.children {
                child.cancel();
            }
            self.waiter.wait_uninterruptible().await;
            return Err(cancelled);
        }
        Ok(self.collect())
    }

    /// Join, turning any child failure into `Error::Group`.
    pub async fn values(self, cx: &Cx) -> Result<Vec<T>> {
        self.join(cx).await?.into_result()
    }

    fn collect(self) -> JoinResult<T> {
        let mut outcomes = self.outcomes.lock();
        if !outcomes.errors.is_empty() {
            let mut errors = std::mem::take(&mut outcomes.errors);
            errors.sort_by_key(|(idx, _)| *idx);
            return JoinResult::Failed(errors.into_iter().map(|(_, err)| err).collect());
        }
        let values = std::mem::take(&mut outcomes.values);
        JoinResult::Ok(values.into_iter().flatten().collect())
    }
}

/// Spawn every task as a child of `cx`.
pub fn spawn<T: Send + 'static>(cx: &Cx, tasks: impl IntoIterator<Item = Task<T>>) -> Join<T> {
    let tasks: Vec<Task<T>> = tasks.into_iter().collect();
    let outcomes = Arc::new(Mutex::new(Outcomes {
        values: (0..tasks.len()).map(|_| None).collect(),
        errors: Vec::new(),
    }));

    let mut events = Vec::with_capacity(tasks.len());
    let mut children = Vec::with_capacity(tasks.len());
    for (idx, task) in tasks.into_iter().enumerate() {
        let done = Event::new();
        events.push(done.clone());
        let outcomes = outcomes.clone();
        children.push(cx.handle().spawn_with(task, cx.home(), move |outcome| {
            {
                let mut outcomes = outcomes.lock();
                match outcome {
                    Ok(value) => outcomes.values[idx] = Some(value),
                    Err(err) => outcomes.errors.push((idx, err)),
                }
            }
            done.set();
        }));
    }

    Join {
        waiter: Waiter::new(events),
        outcomes,
        children,
    }
}

/// Spawn `f(cx, x)` for every `x`, in order.
pub fn map<X, T, F, Fut>(cx: &Cx, f: F, xs: impl IntoIterator<Item = X>) -> Join<T>
where
    X: Send + 'static,
    T: Send + 'static,
    F: Fn(Cx, X) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let f = Arc::new(f);
    spawn(
        cx,
        xs.into_iter().map(|x| {
            let f = f.clone();
            Task::new(move |cx| (*f)(cx, x))
        }),
    )
}

/// Like [`map`], but each call runs on the blocking pool.
pub fn map_blocking<X, R, F>(cx: &Cx, f: F, xs: impl IntoIterator<Item = X>) -> Join<R>
where
    X: Send + 'static,
    R: Send + 'static,
    F: Fn(X) -> R + Send + Sync + 'static,
{
    let f = Arc::new(f);
    spawn(
        cx,
        xs.into_iter().map(|x| {
            let f = f.clone();
            Task::new(move |cx: Cx| async move { spawn_blocking(&cx, move || (*f)(x)).await })
        }),
    )
}

/// Let other ready tasks run before continuing.
pub fn yield_now(cx: &Cx) -> YieldNow<'_> {
    YieldNow { cx, yielded: false }
}

#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow<'a> {
    cx: &'a Cx,
    yielded: bool,
}

impl Future for YieldNow<'_> {
    type Output = Result<(), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cx.take_abort() {
            return Poll::Ready(Err(Cancelled));
        }
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        self.yielded = true;
        task.waker().wake_by_ref();
        Poll::Pending
    }
}
