// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ancillary data for `sendmsg` / `recvmsg`.

use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use super::addr::SockAddr;

/// One control message (`cmsghdr` plus payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub level: i32,
    pub kind: i32,
    pub data: Vec<u8>,
}

impl ControlMessage {
    pub fn new(level: i32, kind: i32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            level,
            kind,
            data: data.into(),
        }
    }

    /// `SCM_RIGHTS` message passing file descriptors.
    pub fn rights(fds: &[RawFd]) -> Self {
        let data = fds.iter().flat_map(|fd| fd.to_ne_bytes()).collect::<Vec<u8>>();
        Self::new(libc::SOL_SOCKET, libc::SCM_RIGHTS, data)
    }

    /// File descriptors carried by an `SCM_RIGHTS` message.
    pub fn fds(&self) -> Option<Vec<RawFd>> {
        if self.level != libc::SOL_SOCKET || self.kind != libc::SCM_RIGHTS {
            return None;
        }
        let width = mem::size_of::<RawFd>();
        Some(
            self.data
                .chunks_exact(width)
                .map(|chunk| {
                    let mut raw = [0u8; mem::size_of::<RawFd>()];
                    raw.copy_from_slice(chunk);
                    RawFd::from_ne_bytes(raw)
                })
                .collect(),
        )
    }
}

/// Result of [`Socket::recvmsg`](super::Socket::recvmsg).
#[derive(Debug, Clone)]
pub struct RecvMsg {
    pub data: Vec<u8>,
    pub ancillary: Vec<ControlMessage>,
    /// `MSG_*` flags reported by the kernel, e.g. `MSG_TRUNC`.
    pub flags: i32,
    pub address: Option<SockAddr>,
}

/// Result of [`Socket::recvmsg_into`](super::Socket::recvmsg_into).
#[derive(Debug, Clone)]
pub struct RecvMsgInto {
    pub bytes: usize,
    pub ancillary: Vec<ControlMessage>,
    pub flags: i32,
    pub address: Option<SockAddr>,
}

/// `cmsghdr`-aligned control buffer.
pub(crate) struct ControlBuf {
    words: Vec<u64>,
    len: usize,
}

impl ControlBuf {
    pub fn with_capacity(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(mem::size_of::<u64>())],
            len,
        }
    }

    pub fn encode(messages: &[ControlMessage]) -> Self {
        let len = messages
            .iter()
            .map(|m| unsafe { libc::CMSG_SPACE(m.data.len() as u32) } as usize)
            .sum();
        let mut buf = Self::with_capacity(len);
        if len == 0 {
            return buf;
        }

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        buf.attach(&mut msg);
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        for message in messages {
            if cmsg.is_null() {
                break;
            }
            unsafe {
                (*cmsg).cmsg_level = message.level;
                (*cmsg).cmsg_type = message.kind;
                (*cmsg).cmsg_len = libc::CMSG_LEN(message.data.len() as u32) as _;
                ptr::copy_nonoverlapping(
                    message.data.as_ptr(),
                    libc::CMSG_DATA(cmsg),
                    message.data.len(),
                );
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        buf
    }

    /// Point `msg`'s control fields at this buffer.
    pub fn attach(&mut self, msg: &mut libc::msghdr) {
        if self.len == 0 {
            msg.msg_control = ptr::null_mut();
            msg.msg_controllen = 0;
        } else {
            msg.msg_control = self.words.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = self.len as _;
        }
    }
}

/// Parse the control messages the kernel left in `msg`.
///
/// # Safety
/// `msg.msg_control` must point to `msg.msg_controllen` valid bytes.
pub(crate) unsafe fn decode(msg: &libc::msghdr) -> Vec<ControlMessage> {
    let mut out = Vec::new();
    if msg.msg_control.is_null() || msg.msg_controllen == 0 {
        return out;
    }
    let end = msg.msg_control as usize + msg.msg_controllen as usize;
    let header = libc::CMSG_LEN(0) as usize;
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let data = libc::CMSG_DATA(cmsg);
        let claimed = ((*cmsg).cmsg_len as usize).saturating_sub(header);
        let available = end.saturating_sub(data as usize);
        let bytes = std::slice::from_raw_parts(data, claimed.min(available)).to_vec();
        out.push(ControlMessage {
            level: (*cmsg).cmsg_level,
            kind: (*cmsg).cmsg_type,
            data: bytes,
        });
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
    out
}
