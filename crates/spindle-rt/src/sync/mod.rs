// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coordination primitives for tasks on one runtime.
//!
//! All waits go through `Event`, so they are interruptible by cancellation
//! and never block the worker thread.

mod barrier;
mod channel;
mod semaphore;

pub use barrier::Barrier;
pub use channel::{
    channel, unbounded_channel, Receiver, RecvError, SendError, Sender, TryRecvError,
    TrySendError, UnboundedReceiver, UnboundedSender,
};
pub use semaphore::{Lock, LockGuard, Semaphore, SemaphoreGuard};
