// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sockets driven by the reactor, plus address resolution.

mod addr;
mod msg;
mod socket;

pub use addr::{getaddrinfo, resolve_address, AddrInfo, Address, Family, SockAddr, SockType};
pub use msg::{ControlMessage, RecvMsg, RecvMsgInto};
pub use socket::{default_backlog, socket, socketpair, Socket};
