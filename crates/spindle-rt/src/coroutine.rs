// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Resumable computations.
//!
//! The scheduler drives everything through [`Coroutine::resume`], which
//! carries either "continue" or "abort" into the computation. Two shapes
//! are supported:
//!
//! - `async` code, wrapped in a [`FutureCoroutine`]. Aborts are parked in
//!   the task's abort cell and surface as `Err(Cancelled)` from the next
//!   suspension point.
//! - Hand-written step machines implementing [`Generator`], wrapped in a
//!   [`StepCoroutine`]. These receive the abort directly as their resume
//!   input and describe each suspension with a [`Suspend`] value.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::cancel::AbortCell;
use crate::context::Cx;
use crate::error::Result;
use crate::event::{Event, WaitState, Waiter};

/// Value delivered to a computation when it is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Continue,
    /// Cancellation was injected while suspended.
    Abort,
}

pub trait Coroutine: Send {
    type Output;

    fn resume(&mut self, waker: &Waker, input: Resume) -> Poll<Self::Output>;

    fn is_done(&self) -> bool;
}

impl<C: Coroutine + ?Sized> Coroutine for Box<C> {
    type Output = C::Output;

    fn resume(&mut self, waker: &Waker, input: Resume) -> Poll<Self::Output> {
        (**self).resume(waker, input)
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }
}

pub struct FutureCoroutine<F> {
    future: Option<Pin<Box<F>>>,
    abort: Arc<AbortCell>,
}

impl<F: Future + Send> FutureCoroutine<F> {
    pub fn new(future: F, abort: Arc<AbortCell>) -> Self {
        Self {
            future: Some(Box::pin(future)),
            abort,
        }
    }
}

impl<F: Future + Send> Coroutine for FutureCoroutine<F> {
    type Output = F::Output;

    fn resume(&mut self, waker: &Waker, input: Resume) -> Poll<F::Output> {
        let Some(future) = self.future.as_mut() else {
            return Poll::Pending;
        };
        if input == Resume::Abort {
            self.abort.deliver();
        }
        let mut cx = Context::from_waker(waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => {
                self.future = None;
                Poll::Ready(value)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_done(&self) -> bool {
        self.future.is_none()
    }
}

/// What a stepped computation waits on before its next step.
#[derive(Debug, Clone)]
pub enum Suspend {
    /// Until the event is set or the timeout elapses.
    Event(Event, Option<Duration>),
    /// Until every event of the waiter is set or the timeout elapses.
    All(Waiter, Option<Duration>),
    Sleep(Duration),
    /// Let other tasks run, then continue.
    Yield,
}

#[derive(Debug)]
pub enum Step<T> {
    Suspend(Suspend),
    Complete(T),
}

/// A computation written as an explicit state machine.
///
/// `step` runs until the next suspension or completion. `input` is
/// `Resume::Abort` when cancellation was injected while suspended; the
/// generator may clean up and complete, or suspend again.
pub trait Generator: Send {
    type Output;

    fn step(&mut self, cx: &Cx, input: Resume) -> Step<Self::Output>;
}

enum Parked {
    Yield { yielded: bool },
    Wait { events: Vec<Event>, state: WaitState },
}

impl Parked {
    fn new(suspend: Suspend, cx: &Cx) -> Self {
        let deadline = |timeout: Option<Duration>| {
            timeout.map(|t| cx.handle().clock().deadline_after(t))
        };
        match suspend {
            Suspend::Yield => Parked::Yield { yielded: false },
            Suspend::Event(event, timeout) => Parked::Wait {
                events: vec![event],
                state: WaitState::new(deadline(timeout)),
            },
            Suspend::All(waiter, timeout) => Parked::Wait {
                events: waiter.events().to_vec(),
                state: WaitState::new(deadline(timeout)),
            },
            Suspend::Sleep(duration) => Parked::Wait {
                events: vec![Event::new()],
                state: WaitState::new(deadline(Some(duration))),
            },
        }
    }

    fn poll(&mut self, cx: &Cx, waker: &Waker) -> Poll<()> {
        match self {
            Parked::Yield { yielded: true } => Poll::Ready(()),
            Parked::Yield { yielded } => {
                *yielded = true;
                waker.wake_by_ref();
                Poll::Pending
            }
            Parked::Wait { events, state } => state.poll(events, Some(cx.handle()), waker),
        }
    }

    fn release(&mut self, cx: &Cx) {
        if let Parked::Wait { events, state } = self {
            state.release(events, Some(cx.handle()));
        }
    }
}

pub struct StepCoroutine<G> {
    generator: G,
    cx: Cx,
    parked: Option<Parked>,
    done: bool,
}

impl<G: Generator> StepCoroutine<G> {
    pub fn new(generator: G, cx: Cx) -> Self {
        Self {
            generator,
            cx,
            parked: None,
            done: false,
        }
    }
}

impl<G: Generator> Coroutine for StepCoroutine<G> {
    type Output = G::Output;

    fn resume(&mut self, waker: &Waker, input: Resume) -> Poll<G::Output> {
        if self.done {
            return Poll::Pending;
        }
        let mut input = input;
        loop {
            if input == Resume::Continue {
                if let Some(parked) = self.parked.as_mut() {
                    if parked.poll(&self.cx, waker).is_pending() {
                        return Poll::Pending;
                    }
                }
            }
            if let Some(mut parked) = self.parked.take() {
                parked.release(&self.cx);
            }
            match self.generator.step(&self.cx, input) {
                Step::Complete(value) => {
                    self.done = true;
                    return Poll::Ready(value);
                }
                Step::Suspend(suspend) => {
                    self.parked = Some(Parked::new(suspend, &self.cx));
                    input = Resume::Continue;
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

impl<G> Drop for StepCoroutine<G> {
    fn drop(&mut self) {
        if let Some(mut parked) = self.parked.take() {
            parked.release(&self.cx);
        }
    }
}

pub(crate) type BoxedCoroutine<T> = Box<dyn Coroutine<Output = Result<T>> + Send>;

type Start<T> = Box<dyn FnOnce(Cx) -> BoxedCoroutine<T> + Send>;

/// A computation ready to be spawned. Nothing runs until it is handed to
/// the runtime.
pub struct Task<T> {
    start: Start<T>,
}

impl<T: Send + 'static> Task<T> {
    /// Task from an `async` body that receives its own context.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            start: Box::new(move |cx: Cx| -> BoxedCoroutine<T> {
                let abort = cx.abort_cell().clone();
                Box::new(FutureCoroutine::new(body(cx), abort))
            }),
        }
    }

    /// Task from a hand-written step machine.
    pub fn stepped<G>(generator: G) -> Self
    where
        G: Generator<Output = Result<T>> + 'static,
    {
        Self {
            start: Box::new(move |cx: Cx| -> BoxedCoroutine<T> {
                Box::new(StepCoroutine::new(generator, cx))
            }),
        }
    }

    pub(crate) fn start(self, cx: Cx) -> BoxedCoroutine<T> {
        (self.start)(cx)
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task")
    }
}
