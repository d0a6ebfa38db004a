// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cancellation delivery.
//!
//! The scheduler marks a task for abort; on its next resume the task's
//! coroutine receives `Resume::Abort`. Future-based tasks have no way to
//! receive a value on resume, so the abort is parked in an `AbortCell`
//! which the next suspension point consumes and turns into `Cancelled`.

use std::sync::atomic::{AtomicBool, Ordering};

/// One pending abort, shared between a task's coroutine and its context.
#[derive(Debug, Default)]
pub struct AbortCell {
    pending: AtomicBool,
}

impl AbortCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an abort for the next suspension point.
    pub fn deliver(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Consume a parked abort. Returns true at most once per delivery.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
