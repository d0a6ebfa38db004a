// SPDX-License-Identifier: (MIT OR Apache-2.0)
mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{run_both, run_task};
use spindle_rt::sync::{channel, unbounded_channel, Barrier, Lock, RecvError, Semaphore};
use spindle_rt::{sleep, spawn, timeout, yield_now, Error, Task};

#[test]
fn semaphore_bounds_concurrency() {
    for outcome in run_both(|| {
        Task::new(|cx| async move {
            let sem = Arc::new(Semaphore::new(2));
            let inside = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let tasks = (0..50usize).map(|i| {
                let (sem, inside, peak) = (sem.clone(), inside.clone(), peak.clone());
                Task::new(move |cx| async move {
                    let _permit = sem.acquire(&cx).await?;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(&cx, Duration::from_millis(1)).await?;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
            });
            let values = spawn(&cx, tasks).values(&cx).await?;
            Ok((values, peak.load(Ordering::SeqCst), sem.available()))
        })
    }) {
        let (values, peak, available) = outcome.unwrap();
        assert_eq!(values, (0..50).collect::<Vec<_>>());
        assert!(peak <= 2 && peak >= 1);
        assert_eq!(available, 2);
    }
}

#[test]
fn lock_serializes_updates() {
    let (values, total) = run_task(Task::new(|cx| async move {
        let lock = Arc::new(Lock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks = (0..50usize).map(|i| {
            let (lock, counter) = (lock.clone(), counter.clone());
            Task::new(move |cx| async move {
                let _guard = lock.acquire(&cx).await?;
                // Non-atomic read-modify-write, split by a yield.
                let seen = counter.load(Ordering::SeqCst);
                yield_now(&cx).await?;
                counter.store(seen + 1, Ordering::SeqCst);
                Ok(i)
            })
        });
        let values = spawn(&cx, tasks).values(&cx).await?;
        assert!(!lock.is_locked());
        Ok((values, counter.load(Ordering::SeqCst)))
    }))
    .unwrap();
    assert_eq!(values, (0..50).collect::<Vec<_>>());
    assert_eq!(total, 50);
}

#[test]
fn cancelled_acquire_leaves_permit_alone() {
    let available = run_task(Task::new(|cx| async move {
        let sem = Arc::new(Semaphore::new(1));
        let held = sem.try_acquire()?;
        let waiter = {
            let sem = sem.clone();
            Task::new(move |cx| async move {
                let _permit = sem.acquire(&cx).await?;
                Ok(())
            })
        };
        let (_, finished) = timeout(&cx, waiter, Duration::from_millis(20)).await?;
        assert!(!finished);
        // Let the waiter observe its abort and leave the queue.
        sleep(&cx, Duration::from_millis(20)).await?;
        drop(held);
        Ok(sem.available())
    }))
    .unwrap();
    assert_eq!(available, 1);
}

#[test]
fn barrier_hands_out_each_index_once() {
    let indices = run_task(Task::new(|cx| async move {
        let barrier = Arc::new(Barrier::new(3));
        let arrivals = Arc::new(AtomicUsize::new(0));
        let tasks = (0..3u64).map(|i| {
            let (barrier, arrivals) = (barrier.clone(), arrivals.clone());
            Task::new(move |cx| async move {
                sleep(&cx, Duration::from_millis(5 * i)).await?;
                arrivals.fetch_add(1, Ordering::SeqCst);
                let index = barrier.wait(&cx).await?;
                assert_eq!(arrivals.load(Ordering::SeqCst), 3);
                Ok(index)
            })
        });
        spawn(&cx, tasks).values(&cx).await
    }))
    .unwrap();
    let indices: BTreeSet<usize> = indices.into_iter().collect();
    assert_eq!(indices, BTreeSet::from([0, 1, 2]));
}

#[test]
fn channel_delivers_every_item_once() {
    for outcome in run_both(|| {
        Task::new(|cx| async move {
            let (tx, rx) = channel::<u32>(2);

            let producers = (0..2u32).map(|p| {
                let tx = tx.clone();
                Task::new(move |cx| async move {
                    for n in 0..20 {
                        tx.send(&cx, p * 100 + n).await?;
                    }
                    Ok(())
                })
            });
            let producers = spawn(&cx, producers);
            let closer = Task::new(move |cx| async move {
                producers.values(&cx).await?;
                tx.close();
                Ok(Vec::new())
            });

            let consumers = (0..4).map(|_| {
                let rx = rx.clone();
                Task::new(move |cx| async move {
                    let mut got = Vec::new();
                    loop {
                        match rx.receive(&cx).await {
                            Ok(item) => got.push(item),
                            Err(RecvError::Closed) => return Ok(got),
                            Err(err) => return Err(err.into()),
                        }
                    }
                })
            });
            let batches = spawn(&cx, std::iter::once(closer).chain(consumers))
                .values(&cx)
                .await?;
            Ok(batches.into_iter().flatten().collect::<Vec<u32>>())
        })
    }) {
        let items = outcome.unwrap();
        let distinct: BTreeSet<u32> = items.iter().copied().collect();
        let produced: BTreeSet<u32> = (0..20).chain(100..120).collect();
        assert_eq!(items.len(), 40);
        assert_eq!(distinct, produced);
    }
}

#[test]
fn dropping_last_sender_ends_stream() {
    let items = run_task(Task::new(|cx| async move {
        let (tx, rx) = channel::<u8>(1);
        let producer = Task::new(move |cx| async move {
            for n in 0..5 {
                tx.send(&cx, n).await?;
            }
            Ok(Vec::new())
        });
        let consumer = Task::new(move |cx| async move {
            let mut got = Vec::new();
            while let Ok(item) = rx.receive(&cx).await {
                got.push(item);
            }
            Ok(got)
        });
        let mut batches = spawn(&cx, [producer, consumer]).values(&cx).await?;
        Ok(batches.remove(1))
    }))
    .unwrap();
    assert_eq!(items, vec![0, 1, 2, 3, 4]);
}

#[test]
fn unbounded_channel_never_waits() {
    let items = run_task(Task::new(|cx| async move {
        let (tx, rx) = unbounded_channel::<usize>();
        for n in 0..1000 {
            tx.send(n)?;
        }
        drop(tx);
        let mut got = Vec::new();
        loop {
            match rx.receive(&cx).await {
                Ok(n) => got.push(n),
                Err(RecvError::Closed) => break,
                Err(err) => return Err(Error::from(err)),
            }
        }
        Ok(got)
    }))
    .unwrap();
    assert_eq!(items, (0..1000).collect::<Vec<_>>());
}
