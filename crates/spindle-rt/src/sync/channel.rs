// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-producer multi-consumer channels.
//!
//! Blocked senders and receivers queue FIFO on per-waiter events. The
//! channel closes when `close()` is called or the last sender is
//! dropped; receivers then drain what is buffered and see
//! `RecvError::Closed`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Cx;
use crate::error::Error;
use crate::event::Event;

#[derive(PartialEq, Eq)]
pub enum SendError<T> {
    /// The channel is closed or has no receivers; the message is returned.
    Closed(T),
    /// Cancelled while waiting for space; the message is returned.
    Cancelled(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Closed(msg) | SendError::Cancelled(msg) => msg,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => f.write_str("Closed(..)"),
            SendError::Cancelled(_) => f.write_str("Cancelled(..)"),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => write!(f, "sending on a closed channel"),
            SendError::Cancelled(_) => write!(f, "send cancelled"),
        }
    }
}

impl<T> std::error::Error for SendError<T> {}

#[derive(PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel is full"),
            TrySendError::Closed(_) => write!(f, "sending on a closed channel"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// Closed and drained: end of stream.
    #[error("channel closed")]
    Closed,
    #[error("receive cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    #[error("channel is empty")]
    Empty,
    #[error("channel closed")]
    Closed,
}

impl From<RecvError> for Error {
    fn from(err: RecvError) -> Self {
        match err {
            RecvError::Closed => Error::ChannelClosed,
            RecvError::Cancelled => Error::Cancelled(crate::error::Cancelled),
        }
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        match err {
            SendError::Closed(_) => Error::ChannelClosed,
            SendError::Cancelled(_) => Error::Cancelled(crate::error::Cancelled),
        }
    }
}

struct Chan<T> {
    /// `None` for unbounded.
    capacity: Option<usize>,
    state: Mutex<ChanState<T>>,
}

struct ChanState<T> {
    buffer: VecDeque<T>,
    closed: bool,
    senders: usize,
    receivers: usize,
    send_waiters: VecDeque<Event>,
    recv_waiters: VecDeque<Event>,
}

#[derive(Clone, Copy)]
enum Side {
    Send,
    Recv,
}

impl<T> ChanState<T> {
    fn waiters(&mut self, side: Side) -> &mut VecDeque<Event> {
        match side {
            Side::Send => &mut self.send_waiters,
            Side::Recv => &mut self.recv_waiters,
        }
    }

    fn wake_one(&mut self, side: Side) {
        if let Some(event) = self.waiters(side).pop_front() {
            event.set();
        }
    }

    fn wake_all(&mut self) {
        for event in self.send_waiters.drain(..).chain(self.recv_waiters.drain(..)) {
            event.set();
        }
    }

    fn enqueue(&mut self, side: Side) -> Event {
        let event = Event::new();
        self.waiters(side).push_back(event.clone());
        event
    }

    fn refuses_sends(&self) -> bool {
        self.closed || self.receivers == 0
    }

    fn is_drained(&self) -> bool {
        self.closed || self.senders == 0
    }
}

impl<T> Chan<T> {
    fn new(capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(ChanState {
                buffer: VecDeque::new(),
                closed: false,
                senders: 1,
                receivers: 1,
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
            }),
        })
    }

    fn has_room(&self, state: &ChanState<T>) -> bool {
        self.capacity.map_or(true, |cap| state.buffer.len() < cap)
    }

    fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        let mut state = self.state.lock();
        if state.refuses_sends() {
            return Err(TrySendError::Closed(msg));
        }
        if !self.has_room(&state) {
            return Err(TrySendError::Full(msg));
        }
        state.buffer.push_back(msg);
        state.wake_one(Side::Recv);
        Ok(())
    }

    async fn send(&self, cx: &Cx, msg: T) -> Result<(), SendError<T>> {
        loop {
            let space = {
                let mut state = self.state.lock();
                if state.refuses_sends() {
                    return Err(SendError::Closed(msg));
                }
                if self.has_room(&state) {
                    state.buffer.push_back(msg);
                    state.wake_one(Side::Recv);
                    return Ok(());
                }
                state.enqueue(Side::Send)
            };
            if space.wait(cx, None).await.is_err() {
                self.abandon(&space, Side::Send);
                return Err(SendError::Cancelled(msg));
            }
        }
    }

    fn try_receive(&self) -> Result<T, TryRecvError> {
        let mut state = self.state.lock();
        if let Some(msg) = state.buffer.pop_front() {
            state.wake_one(Side::Send);
            return Ok(msg);
        }
        if state.is_drained() {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    async fn receive(&self, cx: &Cx) -> Result<T, RecvError> {
        loop {
            let ready = {
                let mut state = self.state.lock();
                if let Some(msg) = state.buffer.pop_front() {
                    state.wake_one(Side::Send);
                    return Ok(msg);
                }
                if state.is_drained() {
                    return Err(RecvError::Closed);
                }
                state.enqueue(Side::Recv)
            };
            if ready.wait(cx, None).await.is_err() {
                self.abandon(&ready, Side::Recv);
                return Err(RecvError::Cancelled);
            }
        }
    }

    /// A cancelled waiter that was already woken passes the wakeup on;
    /// otherwise it just leaves the queue.
    fn abandon(&self, event: &Event, side: Side) {
        let mut state = self.state.lock();
        if event.is_set() {
            state.wake_one(side);
        } else {
            state.waiters(side).retain(|queued| !queued.same(event));
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.wake_all();
        }
    }

    fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Bounded channel. A capacity of zero is treated as one.
pub fn channel<T: Send>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Chan::new(Some(capacity.max(1)));
    (Sender { chan: chan.clone() }, Receiver { chan })
}

pub fn unbounded_channel<T: Send>() -> (UnboundedSender<T>, Receiver<T>) {
    let chan = Chan::new(None);
    (UnboundedSender { chan: chan.clone() }, Receiver { chan })
}

pub type UnboundedReceiver<T> = Receiver<T>;

pub struct Sender<T> {
    chan: Arc<Chan<T>>,
}

impl<T: Send> Sender<T> {
    /// Send, waiting while the buffer is full.
    pub async fn send(&self, cx: &Cx, msg: T) -> Result<(), SendError<T>> {
        self.chan.send(cx, msg).await
    }

    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.chan.try_send(msg)
    }

    /// Close for every handle. Buffered items stay receivable.
    pub fn close(&self) {
        self.chan.close();
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.chan.capacity.unwrap_or(usize::MAX)
    }
}

pub struct UnboundedSender<T> {
    chan: Arc<Chan<T>>,
}

impl<T: Send> UnboundedSender<T> {
    /// Never waits.
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.chan.try_send(msg).map_err(|err| match err {
            TrySendError::Full(msg) | TrySendError::Closed(msg) => SendError::Closed(msg),
        })
    }

    pub fn close(&self) {
        self.chan.close();
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Receiver<T> {
    chan: Arc<Chan<T>>,
}

impl<T: Send> Receiver<T> {
    /// Next item; `RecvError::Closed` once closed and drained.
    pub async fn receive(&self, cx: &Cx) -> Result<T, RecvError> {
        self.chan.receive(cx).await
    }

    pub fn try_receive(&self) -> Result<T, TryRecvError> {
        self.chan.try_receive()
    }

    pub fn close(&self) {
        self.chan.close();
    }

    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

macro_rules! impl_sender_handle {
    ($ty:ident) => {
        impl<T> Clone for $ty<T> {
            fn clone(&self) -> Self {
                self.chan.state.lock().senders += 1;
                Self {
                    chan: self.chan.clone(),
                }
            }
        }

        impl<T> Drop for $ty<T> {
            fn drop(&mut self) {
                let mut state = self.chan.state.lock();
                state.senders -= 1;
                if state.senders == 0 {
                    state.wake_all();
                }
            }
        }
    };
}

impl_sender_handle!(Sender);
impl_sender_handle!(UnboundedSender);

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.state.lock().receivers += 1;
        Self {
            chan: self.chan.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut state = self.chan.state.lock();
        state.receivers -= 1;
        if state.receivers == 0 {
            for event in state.send_waiters.drain(..) {
                event.set();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_send_respects_capacity() {
        let (tx, rx) = channel::<u8>(2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert_eq!(tx.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(rx.try_receive(), Ok(1));
        tx.try_send(3).unwrap();
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn close_drains_then_ends() {
        let (tx, rx) = channel::<u8>(4);
        tx.try_send(7).unwrap();
        tx.close();
        assert_eq!(tx.try_send(8), Err(TrySendError::Closed(8)));
        assert_eq!(rx.try_receive(), Ok(7));
        assert_eq!(rx.try_receive(), Err(TryRecvError::Closed));
    }

    #[test]
    fn last_sender_drop_closes() {
        let (tx, rx) = unbounded_channel::<u8>();
        let tx2 = tx.clone();
        tx.send(1).unwrap();
        drop(tx);
        assert_eq!(rx.try_receive(), Ok(1));
        assert_eq!(rx.try_receive(), Err(TryRecvError::Empty));
        drop(tx2);
        assert_eq!(rx.try_receive(), Err(TryRecvError::Closed));
    }

    #[test]
    fn sending_without_receivers_fails() {
        let (tx, rx) = channel::<u8>(1);
        drop(rx);
        assert_eq!(tx.try_send(1), Err(TrySendError::Closed(1)));
    }

    #[test]
    fn zero_capacity_holds_one() {
        let (tx, _rx) = channel::<u8>(0);
        assert_eq!(tx.capacity(), 1);
        tx.try_send(1).unwrap();
        assert!(matches!(tx.try_send(2), Err(TrySendError::Full(2))));
    }

    #[test]
    fn send_waiters_fifo_and_abandon() {
        let (tx, rx) = channel::<u8>(1);
        let first = tx.chan.state.lock().enqueue(Side::Send);
        let second = tx.chan.state.lock().enqueue(Side::Send);
        tx.try_send(1).unwrap();
        rx.try_receive().unwrap();
        assert!(first.is_set());
        assert!(!second.is_set());
        tx.chan.abandon(&first, Side::Send);
        assert!(second.is_set());
    }
}
