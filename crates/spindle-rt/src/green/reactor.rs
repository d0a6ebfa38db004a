// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness reactor: epoll plus the timer queue, driven by one thread.
//!
//! Each fd carries at most one read and one write interest. Firing an
//! interest sets its `Event`; one-shot interests are dropped as they fire,
//! persistent ones stay until removed. Registrations are edge-triggered
//! and every change re-arms the fd with `EPOLL_CTL_MOD`, which reports
//! readiness that already exists at registration time.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;
use std::time::Instant;

use parking_lot::Mutex;

use super::timer::{TimerKey, Timers};
use crate::event::Event;

/// Longest the reactor sleeps with no timer pending.
const IDLE_POLL_MS: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

struct Interest {
    event: Event,
    persistent: bool,
}

#[derive(Default)]
struct FdSlot {
    read: Option<Interest>,
    write: Option<Interest>,
}

impl FdSlot {
    fn get_mut(&mut self, dir: Direction) -> &mut Option<Interest> {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn epoll_events(&self) -> u32 {
        let mut events = libc::EPOLLET as u32;
        if self.read.is_some() {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.write.is_some() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    /// Collect fired events; true if the interest set changed.
    fn fire(&mut self, flags: u32, fired: &mut Vec<Event>) -> bool {
        let readable =
            flags & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
        let writable = flags & (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
        let mut changed = false;
        for (ready, slot) in [(readable, &mut self.read), (writable, &mut self.write)] {
            if !ready {
                continue;
            }
            if let Some(interest) = slot {
                fired.push(interest.event.clone());
                if !interest.persistent {
                    *slot = None;
                    changed = true;
                }
            }
        }
        changed
    }
}

pub struct Reactor {
    epoll_fd: RawFd,
    /// Eventfd used to interrupt `epoll_wait`.
    wake_fd: RawFd,
    slots: Mutex<HashMap<RawFd, FdSlot>>,
    timers: Timers,
    shutdown: AtomicBool,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            slots: Mutex::new(HashMap::new()),
            timers: Timers::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn reader_add(&self, fd: RawFd, persistent: bool) -> io::Result<Event> {
        self.add(fd, Direction::Read, persistent)
    }

    pub fn writer_add(&self, fd: RawFd, persistent: bool) -> io::Result<Event> {
        self.add(fd, Direction::Write, persistent)
    }

    pub fn reader_rem(&self, fd: RawFd) -> io::Result<bool> {
        self.remove(fd, Direction::Read)
    }

    pub fn writer_rem(&self, fd: RawFd) -> io::Result<bool> {
        self.remove(fd, Direction::Write)
    }

    /// Register interest in `dir` readiness on `fd`, replacing any previous
    /// interest in that direction.
    pub fn add(&self, fd: RawFd, dir: Direction, persistent: bool) -> io::Result<Event> {
        let event = Event::new();
        let mut slots = self.slots.lock();
        let existed = slots.contains_key(&fd);
        let slot = slots.entry(fd).or_default();
        let previous = slot.get_mut(dir).replace(Interest {
            event: event.clone(),
            persistent,
        });
        let op = if existed {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        if let Err(err) = self.ctl(op, fd, slot.epoll_events()) {
            *slot.get_mut(dir) = previous;
            if slot.is_empty() {
                slots.remove(&fd);
            }
            return Err(err);
        }
        tracing::trace!(fd, ?dir, persistent, "registered interest");
        Ok(event)
    }

    /// Drop the `dir` interest on `fd`. Returns whether one existed.
    pub fn remove(&self, fd: RawFd, dir: Direction) -> io::Result<bool> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&fd) else {
            return Ok(false);
        };
        if slot.get_mut(dir).take().is_none() {
            return Ok(false);
        }
        if slot.is_empty() {
            slots.remove(&fd);
            self.ctl_del(fd)?;
        } else {
            let events = slot.epoll_events();
            self.ctl(libc::EPOLL_CTL_MOD, fd, events)?;
        }
        Ok(true)
    }

    /// Drop every interest on `fd` and wake whoever was parked on it.
    /// Called before the fd is closed.
    pub fn forget(&self, fd: RawFd) {
        let slot = self.slots.lock().remove(&fd);
        let Some(slot) = slot else {
            return;
        };
        if let Err(err) = self.ctl_del(fd) {
            tracing::debug!(fd, %err, "epoll deregistration failed");
        }
        for interest in [slot.read, slot.write].into_iter().flatten() {
            interest.event.set();
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl_del(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if the fd was already closed.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn add_timer(&self, at: Instant, waker: Waker) -> TimerKey {
        let (key, earliest) = self.timers.insert(at, waker);
        if earliest {
            self.wake();
        }
        key
    }

    pub(crate) fn update_timer(&self, key: TimerKey, waker: &Waker) {
        self.timers.update(key, waker);
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        self.timers.remove(key);
    }

    /// One reactor cycle: sleep until I/O or the next deadline, then fire.
    pub fn turn(&self) -> io::Result<usize> {
        let timeout_ms = match self.timers.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                // Round up so timers never fire early.
                let ms = wait.as_micros().div_ceil(1000);
                ms.min(IDLE_POLL_MS as u128) as i32
            }
            None => IDLE_POLL_MS,
        };
        let woken = self.poll_once(timeout_ms)?;
        Ok(woken + self.timers.fire_expired(Instant::now()))
    }

    /// Run one epoll cycle, blocking up to `timeout_ms`. Returns the
    /// number of events set.
    pub fn poll_once(&self, timeout_ms: i32) -> io::Result<usize> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        // Setting an event wakes tasks, which takes scheduler locks; collect
        // under our lock and fire outside it.
        let mut fired = Vec::new();
        {
            let mut slots = self.slots.lock();
            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                let flags = ev.events;

                if fd == self.wake_fd {
                    let mut buf = [0u8; 8];
                    unsafe {
                        libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                    }
                    continue;
                }

                let Some(slot) = slots.get_mut(&fd) else {
                    continue;
                };
                if !slot.fire(flags, &mut fired) {
                    continue;
                }
                let outcome = if slot.is_empty() {
                    slots.remove(&fd);
                    self.ctl_del(fd)
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, slot.epoll_events())
                };
                if let Err(err) = outcome {
                    tracing::debug!(fd, %err, "re-arming fd failed");
                }
            }
        }

        let woken = fired.len();
        for event in fired {
            event.set();
        }
        Ok(woken)
    }

    /// Interrupt a blocked `epoll_wait`.
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        for (_, slot) in slots.drain() {
            for interest in [slot.read, slot.write].into_iter().flatten() {
                interest.event.set();
            }
        }
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn write_byte(stream: &UnixStream) {
        use std::io::Write;
        (&*stream).write_all(&[1]).unwrap();
    }

    #[test]
    fn one_shot_read_fires_and_is_dropped() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let event = reactor.reader_add(a.as_raw_fd(), false).unwrap();
        assert_eq!(reactor.poll_once(0).unwrap(), 0);
        assert!(!event.is_set());

        write_byte(&b);
        assert_eq!(reactor.poll_once(100).unwrap(), 1);
        assert!(event.is_set());
        assert!(!reactor.reader_rem(a.as_raw_fd()).unwrap());
    }

    #[test]
    fn persistent_write_stays_registered() {
        let reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let event = reactor.writer_add(a.as_raw_fd(), true).unwrap();
        reactor.poll_once(100).unwrap();
        assert!(event.is_set());
        assert!(reactor.writer_rem(a.as_raw_fd()).unwrap());
    }

    #[test]
    fn both_directions_share_one_fd() {
        let reactor = Reactor::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let write = reactor.writer_add(fd, true).unwrap();
        let read = reactor.reader_add(fd, false).unwrap();
        reactor.poll_once(100).unwrap();
        assert!(write.is_set());
        assert!(!read.is_set());

        write_byte(&b);
        reactor.poll_once(100).unwrap();
        assert!(read.is_set());
        assert!(reactor.writer_rem(fd).unwrap());
    }

    #[test]
    fn forget_wakes_parked_interest() {
        let reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let event = reactor.reader_add(a.as_raw_fd(), false).unwrap();
        reactor.forget(a.as_raw_fd());
        assert!(event.is_set());
    }

    struct Noop;

    impl std::task::Wake for Noop {
        fn wake(self: std::sync::Arc<Self>) {}
    }

    #[test]
    fn turn_fires_timers() {
        let reactor = Reactor::new().unwrap();
        let waker = Waker::from(std::sync::Arc::new(Noop));
        reactor.add_timer(Instant::now(), waker);
        assert_eq!(reactor.turn().unwrap(), 1);
    }

    #[test]
    fn shutdown_flag() {
        let reactor = Reactor::new().unwrap();
        assert!(!reactor.should_shutdown());
        reactor.request_shutdown();
        assert!(reactor.should_shutdown());
    }
}
