// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Green-task substrate: task state machine, run queues, worker threads,
//! the epoll reactor and its timer queue.

pub(crate) mod queue;
pub(crate) mod reactor;
pub(crate) mod scheduler;
pub(crate) mod task;
pub(crate) mod timer;
