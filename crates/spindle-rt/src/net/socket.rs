// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness-driven sockets.
//!
//! Every operation tries the non-blocking syscall first. On EAGAIN it
//! registers interest with the reactor, parks on the returned event and
//! retries when woken. Reads, accept and connect use one-shot interest;
//! write loops keep a persistent write interest for their whole duration
//! and release it on exit.

use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use super::addr::{resolve_address, Address, Family, SockAddr, SockType};
use super::msg::{decode, ControlBuf, ControlMessage, RecvMsg, RecvMsgInto};
use crate::context::Cx;
use crate::error::Result;
use crate::green::reactor::Reactor;
use crate::runtime::Handle;

/// Backlog used by `listen(None)`.
pub fn default_backlog() -> i32 {
    libc::SOMAXCONN.min(128)
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn closed() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

/// Open a non-blocking socket.
pub fn socket(cx: &Cx, family: Family, sock_type: SockType, protocol: i32) -> Result<Socket> {
    let fd = cvt(unsafe {
        libc::socket(
            family.0,
            sock_type.0 | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            protocol,
        )
    })?;
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(Socket::from_owned(cx.handle().clone(), fd, family, sock_type, protocol))
}

/// A connected pair of non-blocking sockets.
pub fn socketpair(
    cx: &Cx,
    family: Family,
    sock_type: SockType,
    protocol: i32,
) -> Result<(Socket, Socket)> {
    let mut fds = [0 as RawFd; 2];
    cvt(unsafe {
        libc::socketpair(
            family.0,
            sock_type.0 | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            protocol,
            fds.as_mut_ptr(),
        )
    })?;
    let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    let handle = cx.handle();
    Ok((
        Socket::from_owned(handle.clone(), a, family, sock_type, protocol),
        Socket::from_owned(handle.clone(), b, family, sock_type, protocol),
    ))
}

pub struct Socket {
    fd: Option<OwnedFd>,
    family: Family,
    sock_type: SockType,
    protocol: i32,
    handle: Handle,
}

impl Socket {
    fn from_owned(
        handle: Handle,
        fd: OwnedFd,
        family: Family,
        sock_type: SockType,
        protocol: i32,
    ) -> Self {
        Self {
            fd: Some(fd),
            family,
            sock_type,
            protocol,
            handle,
        }
    }

    /// Adopt an existing socket descriptor, switching it to non-blocking.
    ///
    /// # Safety
    /// `fd` must be an open socket that nothing else owns.
    pub unsafe fn from_raw_fd(cx: &Cx, fd: RawFd) -> Result<Socket> {
        let fd = OwnedFd::from_raw_fd(fd);
        let raw = fd.as_raw_fd();
        let flags = cvt(libc::fcntl(raw, libc::F_GETFL))?;
        cvt(libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        let family = Family(getsockopt_int(raw, libc::SOL_SOCKET, libc::SO_DOMAIN)?);
        let sock_type = SockType(getsockopt_int(raw, libc::SOL_SOCKET, libc::SO_TYPE)?);
        let protocol = getsockopt_int(raw, libc::SOL_SOCKET, libc::SO_PROTOCOL)?;
        Ok(Self::from_owned(cx.handle().clone(), fd, family, sock_type, protocol))
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn sock_type(&self) -> SockType {
        self.sock_type
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    /// Raw descriptor, or -1 once closed.
    pub fn fileno(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    fn raw(&self) -> io::Result<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).ok_or_else(closed)
    }

    fn reactor(&self) -> &Reactor {
        self.handle.reactor()
    }

    /// Close the descriptor. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            self.reactor().forget(fd.as_raw_fd());
        }
    }

    /// Give up ownership of the descriptor without closing it.
    pub fn detach(&mut self) -> Option<RawFd> {
        let fd = self.fd.take()?;
        self.reactor().forget(fd.as_raw_fd());
        Some(fd.into_raw_fd())
    }

    pub fn dup(&self) -> Result<Socket> {
        let fd = cvt(unsafe { libc::fcntl(self.raw()?, libc::F_DUPFD_CLOEXEC, 0) })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_owned(
            self.handle.clone(),
            fd,
            self.family,
            self.sock_type,
            self.protocol,
        ))
    }

    /// Resolve `address` for this socket's family, type and protocol.
    pub async fn resolve_address(&self, cx: &Cx, address: &Address, local: bool) -> Result<SockAddr> {
        let v6only = self.family == Family::INET6
            && self.getsockopt(libc::IPPROTO_IPV6, libc::IPV6_V6ONLY)? != 0;
        resolve_address(
            cx,
            self.family,
            self.sock_type,
            self.protocol,
            v6only,
            address,
            local,
        )
        .await
    }

    pub async fn bind(&self, cx: &Cx, address: &Address) -> Result<()> {
        let addr = self.resolve_address(cx, address, true).await?;
        cvt(unsafe { libc::bind(self.raw()?, addr.as_ptr(), addr.len()) })?;
        Ok(())
    }

    pub fn listen(&self, backlog: Option<i32>) -> Result<()> {
        let backlog = backlog.unwrap_or_else(default_backlog).max(0);
        cvt(unsafe { libc::listen(self.raw()?, backlog) })?;
        Ok(())
    }

    pub async fn accept(&self, cx: &Cx) -> Result<(Socket, SockAddr)> {
        let (fd, addr) = self
            .read_ready(cx, |fd| {
                let mut addr = SockAddr::empty();
                let raw = cvt(unsafe {
                    libc::accept4(
                        fd,
                        addr.as_mut_ptr(),
                        addr.len_mut(),
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                })?;
                Ok((unsafe { OwnedFd::from_raw_fd(raw) }, addr))
            })
            .await?;
        let conn = Self::from_owned(
            self.handle.clone(),
            fd,
            self.family,
            self.sock_type,
            self.protocol,
        );
        Ok((conn, addr))
    }

    pub async fn connect(&self, cx: &Cx, address: &Address) -> Result<()> {
        let addr = self.resolve_address(cx, address, false).await?;
        let fd = self.raw()?;
        match cvt(unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) }) {
            Ok(_) => return Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) || is_transient(&err) => {}
            Err(err) => return Err(err.into()),
        }

        loop {
            let writable = self.reactor().writer_add(fd, false)?;
            if let Err(cancelled) = writable.wait(cx, None).await {
                let _ = self.reactor().writer_rem(fd);
                return Err(cancelled.into());
            }
            match self.take_error()? {
                None => return Ok(()),
                Some(err)
                    if is_transient(&err)
                        || matches!(
                            err.raw_os_error(),
                            Some(libc::EINPROGRESS) | Some(libc::EALREADY)
                        ) => {}
                Some(err) => return Err(err.into()),
            }
        }
    }

    /// Pending `SO_ERROR`, cleared by reading it.
    pub fn take_error(&self) -> Result<Option<io::Error>> {
        let err = self.getsockopt(libc::SOL_SOCKET, libc::SO_ERROR)?;
        Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        cvt(unsafe { libc::shutdown(self.raw()?, how) })?;
        Ok(())
    }

    pub fn getsockname(&self) -> Result<SockAddr> {
        let mut addr = SockAddr::empty();
        cvt(unsafe { libc::getsockname(self.raw()?, addr.as_mut_ptr(), addr.len_mut()) })?;
        Ok(addr)
    }

    pub fn getpeername(&self) -> Result<SockAddr> {
        let mut addr = SockAddr::empty();
        cvt(unsafe { libc::getpeername(self.raw()?, addr.as_mut_ptr(), addr.len_mut()) })?;
        Ok(addr)
    }

    pub fn getsockopt(&self, level: i32, name: i32) -> Result<i32> {
        Ok(getsockopt_int(self.raw()?, level, name)?)
    }

    pub fn getsockopt_bytes(&self, level: i32, name: i32, buflen: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; buflen];
        let mut len = buflen as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(
                self.raw()?,
                level,
                name,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        })?;
        buf.truncate(len as usize);
        Ok(buf)
    }

    pub fn setsockopt(&self, level: i32, name: i32, value: i32) -> Result<()> {
        self.setsockopt_bytes(level, name, &value.to_ne_bytes())
    }

    pub fn setsockopt_bytes(&self, level: i32, name: i32, value: &[u8]) -> Result<()> {
        cvt(unsafe {
            libc::setsockopt(
                self.raw()?,
                level,
                name,
                value.as_ptr() as *const libc::c_void,
                value.len() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    /// Receive up to `bufsize` bytes. Empty means the peer closed.
    pub async fn recv(&self, cx: &Cx, bufsize: usize, flags: i32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; bufsize];
        let n = self.recv_into(cx, &mut buf, flags).await?;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn recv_into(&self, cx: &Cx, buf: &mut [u8], flags: i32) -> Result<usize> {
        self.read_ready(cx, |fd| {
            cvt_size(unsafe {
                libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
            })
        })
        .await
    }

    pub async fn recvfrom(
        &self,
        cx: &Cx,
        bufsize: usize,
        flags: i32,
    ) -> Result<(Vec<u8>, Option<SockAddr>)> {
        let mut buf = vec![0u8; bufsize];
        let (n, addr) = self.recvfrom_into(cx, &mut buf, flags).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    pub async fn recvfrom_into(
        &self,
        cx: &Cx,
        buf: &mut [u8],
        flags: i32,
    ) -> Result<(usize, Option<SockAddr>)> {
        self.read_ready(cx, |fd| {
            let mut addr = SockAddr::empty();
            let n = cvt_size(unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    flags,
                    addr.as_mut_ptr(),
                    addr.len_mut(),
                )
            })?;
            Ok((n, (!addr.is_empty()).then_some(addr)))
        })
        .await
    }

    pub async fn recvmsg(
        &self,
        cx: &Cx,
        bufsize: usize,
        ancbufsize: usize,
        flags: i32,
    ) -> Result<RecvMsg> {
        let mut buf = vec![0u8; bufsize];
        let received = self
            .recvmsg_into(cx, &mut [buf.as_mut_slice()], ancbufsize, flags)
            .await?;
        buf.truncate(received.bytes);
        Ok(RecvMsg {
            data: buf,
            ancillary: received.ancillary,
            flags: received.flags,
            address: received.address,
        })
    }

    /// Scatter-read into `buffers`, collecting up to `ancbufsize` bytes of
    /// ancillary data.
    pub async fn recvmsg_into(
        &self,
        cx: &Cx,
        buffers: &mut [&mut [u8]],
        ancbufsize: usize,
        flags: i32,
    ) -> Result<RecvMsgInto> {
        let mut control = ControlBuf::with_capacity(ancbufsize);
        self.read_ready(cx, |fd| {
            let mut iov: Vec<libc::iovec> = buffers
                .iter_mut()
                .map(|b| libc::iovec {
                    iov_base: b.as_mut_ptr() as *mut libc::c_void,
                    iov_len: b.len(),
                })
                .collect();
            let mut addr = SockAddr::empty();
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_name = addr.as_mut_ptr() as *mut libc::c_void;
            msg.msg_namelen = addr.len();
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = iov.len() as _;
            control.attach(&mut msg);

            let n = cvt_size(unsafe { libc::recvmsg(fd, &mut msg, flags) })?;
            *addr.len_mut() = msg.msg_namelen;
            Ok(RecvMsgInto {
                bytes: n,
                ancillary: unsafe { decode(&msg) },
                flags: msg.msg_flags,
                address: (!addr.is_empty()).then_some(addr),
            })
        })
        .await
    }

    /// Send all of `data`, waiting for buffer space as needed.
    pub async fn send(&self, cx: &Cx, data: &[u8], flags: i32) -> Result<usize> {
        let mut sent = 0;
        self.write_ready(cx, |fd| {
            let rest = &data[sent..];
            let n = cvt_size(unsafe {
                libc::send(
                    fd,
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    flags | libc::MSG_NOSIGNAL,
                )
            })?;
            sent += n;
            Ok((sent >= data.len()).then_some(sent))
        })
        .await
    }

    /// Send all of `data` to `address`. Empty `data` sends nothing.
    pub async fn sendto(&self, cx: &Cx, data: &[u8], address: &Address, flags: i32) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let addr = self.resolve_address(cx, address, false).await?;
        let mut sent = 0;
        self.write_ready(cx, |fd| {
            let rest = &data[sent..];
            let n = cvt_size(unsafe {
                libc::sendto(
                    fd,
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    flags | libc::MSG_NOSIGNAL,
                    addr.as_ptr(),
                    addr.len(),
                )
            })?;
            sent += n;
            Ok((sent >= data.len()).then_some(sent))
        })
        .await
    }

    /// Gather-send `buffers` with optional ancillary data. Completes after
    /// one successful call and returns the bytes it accepted.
    pub async fn sendmsg(
        &self,
        cx: &Cx,
        buffers: &[&[u8]],
        ancillary: &[ControlMessage],
        flags: i32,
        address: Option<&Address>,
    ) -> Result<usize> {
        let addr = match address {
            Some(address) => Some(self.resolve_address(cx, address, false).await?),
            None => None,
        };
        let mut control = ControlBuf::encode(ancillary);
        self.write_ready(cx, |fd| {
            let mut iov: Vec<libc::iovec> = buffers
                .iter()
                .map(|b| libc::iovec {
                    iov_base: b.as_ptr() as *mut libc::c_void,
                    iov_len: b.len(),
                })
                .collect();
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            if let Some(addr) = &addr {
                msg.msg_name = addr.as_ptr() as *mut libc::c_void;
                msg.msg_namelen = addr.len();
            }
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = iov.len() as _;
            control.attach(&mut msg);
            let n = cvt_size(unsafe { libc::sendmsg(fd, &msg, flags | libc::MSG_NOSIGNAL) })?;
            Ok(Some(n))
        })
        .await
    }

    /// Retry `attempt` until it stops reporting would-block, parking on
    /// one-shot read readiness in between.
    async fn read_ready<R>(
        &self,
        cx: &Cx,
        mut attempt: impl FnMut(RawFd) -> io::Result<R>,
    ) -> Result<R> {
        loop {
            let fd = self.raw()?;
            match attempt(fd) {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => {}
                Err(err) => return Err(err.into()),
            }
            let readable = self.reactor().reader_add(fd, false)?;
            if let Err(cancelled) = readable.wait(cx, None).await {
                let _ = self.reactor().reader_rem(fd);
                return Err(cancelled.into());
            }
        }
    }

    /// Drive `attempt` until it returns `Some`. After the first miss a
    /// persistent write interest is held until the loop exits.
    async fn write_ready<R>(
        &self,
        cx: &Cx,
        mut attempt: impl FnMut(RawFd) -> io::Result<Option<R>>,
    ) -> Result<R> {
        let fd = self.raw()?;
        match attempt(fd) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) if is_transient(&err) => {}
            Err(err) => return Err(err.into()),
        }

        let writable = self.reactor().writer_add(fd, true)?;
        let outcome = loop {
            if let Err(cancelled) = writable.wait(cx, None).await {
                break Err(cancelled.into());
            }
            writable.clear();
            match attempt(fd) {
                Ok(Some(value)) => break Ok(value),
                Ok(None) => {}
                Err(err) if is_transient(&err) => {}
                Err(err) => break Err(err.into()),
            }
        };
        if let Err(err) = self.reactor().writer_rem(fd) {
            tracing::debug!(fd, %err, "releasing write interest failed");
        }
        outcome
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fileno())
            .field("family", &self.family.0)
            .field("type", &self.sock_type.0)
            .field("protocol", &self.protocol)
            .finish()
    }
}

fn getsockopt_int(fd: RawFd, level: i32, name: i32) -> io::Result<i32> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(value)
}
