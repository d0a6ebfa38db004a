// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run queues.
//!
//! One mutex-protected deque type serves as both the per-worker queue
//! and the global injection queue. Owners pop from the front; stealers
//! take from the back.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::task::RawTask;

pub(crate) struct RunQueue {
    deque: Mutex<VecDeque<Arc<RawTask>>>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_back(&self, task: Arc<RawTask>) {
        self.deque.lock().push_back(task);
    }

    pub fn push_batch(&self, tasks: impl IntoIterator<Item = Arc<RawTask>>) {
        self.deque.lock().extend(tasks);
    }

    pub fn pop_front(&self) -> Option<Arc<RawTask>> {
        self.deque.lock().pop_front()
    }

    /// Pop up to `n` tasks from the front.
    pub fn pop_batch(&self, n: usize) -> Vec<Arc<RawTask>> {
        let mut q = self.deque.lock();
        let count = n.min(q.len());
        q.drain(..count).collect()
    }

    /// Take half the queue from the back, at least one task if any.
    pub fn steal_half(&self) -> Vec<Arc<RawTask>> {
        let mut q = self.deque.lock();
        let count = match q.len() {
            0 => return Vec::new(),
            1 => 1,
            n => n / 2,
        };
        let keep = q.len() - count;
        q.drain(keep..).rev().collect()
    }

    pub fn len(&self) -> usize {
        self.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::{Coroutine, Resume};
    use std::task::{Poll, Waker};

    struct Done;

    impl Coroutine for Done {
        type Output = ();

        fn resume(&mut self, _: &Waker, _: Resume) -> Poll<()> {
            Poll::Ready(())
        }

        fn is_done(&self) -> bool {
            true
        }
    }

    fn dummy(id: u64) -> Arc<RawTask> {
        RawTask::new(Box::new(Done), id, None)
    }

    #[test]
    fn fifo_order() {
        let q = RunQueue::new();
        for id in 0..3 {
            q.push_back(dummy(id));
        }
        let ids: Vec<u64> = std::iter::from_fn(|| q.pop_front())
            .map(|t| t.header.id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn steal_takes_back_half() {
        let q = RunQueue::new();
        q.push_batch((0..6).map(dummy));
        let stolen: Vec<u64> = q.steal_half().iter().map(|t| t.header.id).collect();
        assert_eq!(stolen, vec![5, 4, 3]);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front().map(|t| t.header.id), Some(0));
    }

    #[test]
    fn steal_single_and_empty() {
        let q = RunQueue::new();
        assert!(q.steal_half().is_empty());
        q.push_back(dummy(9));
        assert_eq!(q.steal_half().len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_batch_bounds() {
        let q = RunQueue::new();
        q.push_batch((0..3).map(dummy));
        assert_eq!(q.pop_batch(8).len(), 3);
        assert!(q.pop_batch(8).is_empty());
    }
}
