// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleeping, deadlines and periodic ticks.
//!
//! All durations are normalized to whole microseconds on the runtime
//! clock.

use std::sync::Arc;
use std::time::Duration;

use crate::context::Cx;
use crate::coroutine::Task;
use crate::error::{Cancelled, Error, Result};
use crate::event::{micros, Event};
use crate::green::task::ResultSlot;

/// Suspend the calling task for `duration`.
pub async fn sleep(cx: &Cx, duration: Duration) -> Result<(), Cancelled> {
    let never = Event::new();
    never.wait(cx, Some(duration)).await
}

/// Seconds on the runtime clock.
pub fn now(cx: &Cx) -> f64 {
    cx.now() as f64 / 1_000_000.0
}

/// Run `task` as a child with a deadline.
///
/// Returns `(Some(value), true)` if it finished in time, `(None, true)` if
/// it finished by being cancelled, and `(None, false)` if the deadline
/// passed first, in which case the child has been told to abort. Other
/// child errors propagate. If the caller itself is cancelled, the child is
/// cancelled too and the cancellation propagates.
pub async fn timeout<T: Send + 'static>(
    cx: &Cx,
    task: Task<T>,
    duration: Duration,
) -> Result<(Option<T>, bool)> {
    let done = Event::new();
    let slot = Arc::new(ResultSlot::new());
    let child = {
        let done = done.clone();
        let slot = slot.clone();
        cx.handle().spawn_with(task, cx.home(), move |outcome| {
            slot.set(outcome);
            done.set();
        })
    };

    if let Err(cancelled) = done.wait(cx, Some(duration)).await {
        child.cancel();
        return Err(cancelled.into());
    }
    if !done.is_set() {
        tracing::debug!(task = child.id(), ?duration, "deadline passed, cancelling");
        child.cancel();
        return Ok((None, false));
    }
    match slot.take() {
        Some(Ok(value)) => Ok((Some(value), true)),
        Some(Err(Error::Cancelled(_))) | None => Ok((None, true)),
        Some(Err(err)) => Err(err),
    }
}

/// Periodic ticker that catches up rather than drifting.
///
/// Each tick targets the previous deadline plus the period. A tick that
/// is already late fires immediately and the schedule restarts from now.
#[derive(Debug, Clone)]
pub struct Interval {
    deadline: u64,
    period: u64,
}

/// Ticker with the given period. The first tick fires at `start`
/// (microseconds on the runtime clock) or immediately.
pub fn interval(cx: &Cx, period: Duration, start: Option<u64>) -> Interval {
    Interval {
        deadline: start.unwrap_or_else(|| cx.now()),
        period: micros(period),
    }
}

impl Interval {
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period)
    }

    /// Advance the schedule as of `now`; returns how long to sleep.
    fn advance(&mut self, now: u64) -> u64 {
        if now >= self.deadline {
            self.deadline = now + self.period;
            0
        } else {
            let delay = self.deadline - now;
            self.deadline += self.period;
            delay
        }
    }

    pub async fn tick(&mut self, cx: &Cx) -> Result<(), Cancelled> {
        let delay = self.advance(cx.now());
        if delay == 0 {
            return cx.checkpoint();
        }
        sleep(cx, Duration::from_micros(delay)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_tick_fires_now_and_restarts() {
        let mut iv = Interval {
            deadline: 100,
            period: 50,
        };
        assert_eq!(iv.advance(130), 0);
        assert_eq!(iv.deadline, 180);
    }

    #[test]
    fn early_tick_waits_for_deadline() {
        let mut iv = Interval {
            deadline: 100,
            period: 50,
        };
        assert_eq!(iv.advance(90), 10);
        assert_eq!(iv.deadline, 150);
        assert_eq!(iv.advance(120), 30);
        assert_eq!(iv.deadline, 200);
    }
}
