// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Socket addresses and name resolution.
//!
//! `Address` is what callers pass in: a host/port pair (host may be a
//! name), an IPv6 tuple, or a filesystem path. `SockAddr` is the resolved
//! OS-level form handed to the kernel. Resolution takes a numeric fast
//! path when it can and otherwise runs `getaddrinfo` on the blocking pool.

use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

use crate::blocking::spawn_blocking;
use crate::context::Cx;
use crate::error::{Error, Result};

/// Address family (`AF_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Family(pub i32);

impl Family {
    pub const UNSPEC: Family = Family(libc::AF_UNSPEC);
    pub const INET: Family = Family(libc::AF_INET);
    pub const INET6: Family = Family(libc::AF_INET6);
    pub const UNIX: Family = Family(libc::AF_UNIX);
}

/// Socket type (`SOCK_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockType(pub i32);

impl SockType {
    pub const STREAM: SockType = SockType(libc::SOCK_STREAM);
    pub const DGRAM: SockType = SockType(libc::SOCK_DGRAM);
    pub const RAW: SockType = SockType(libc::SOCK_RAW);
    pub const SEQPACKET: SockType = SockType(libc::SOCK_SEQPACKET);
}

/// Caller-facing address, not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `(host, port)`. The host may be a name, a numeric address, empty
    /// (wildcard) or `"<broadcast>"`.
    Inet { host: String, port: u16 },
    Inet6 {
        host: String,
        port: u16,
        flowinfo: Option<u32>,
        scope_id: Option<u32>,
    },
    Unix(PathBuf),
}

impl Address {
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Address::Inet {
            host: host.into(),
            port,
        }
    }

    pub fn inet6(host: impl Into<String>, port: u16) -> Self {
        Address::Inet6 {
            host: host.into(),
            port,
            flowinfo: None,
            scope_id: None,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Address::Unix(path.into())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::inet(v4.ip().to_string(), v4.port()),
            SocketAddr::V6(v6) => Address::Inet6 {
                host: v6.ip().to_string(),
                port: v6.port(),
                flowinfo: Some(v6.flowinfo()),
                scope_id: Some(v6.scope_id()),
            },
        }
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Address::inet(host, port)
    }
}

/// Resolved OS-level socket address.
#[derive(Clone)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    pub(crate) fn empty() -> Self {
        Self {
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    /// # Safety
    /// `addr` must point to at least `len` readable bytes.
    pub(crate) unsafe fn from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Self {
        let mut out = Self::empty();
        let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
        ptr::copy_nonoverlapping(
            addr as *const u8,
            &mut out.storage as *mut _ as *mut u8,
            len,
        );
        out.len = len as libc::socklen_t;
        out
    }

    pub fn unix(path: &Path) -> io::Result<Self> {
        let bytes = path.as_os_str().as_bytes();
        let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
        if bytes.len() >= sun.sun_path.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path too long for a unix socket address",
            ));
        }
        if bytes.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unix socket path contains a nul byte",
            ));
        }
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
        Ok(unsafe { Self::from_raw(&sun as *const _ as *const libc::sockaddr, len as libc::socklen_t) })
    }

    pub fn family(&self) -> Family {
        Family(self.storage.ss_family as i32)
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    pub(crate) fn len_mut(&mut self) -> &mut libc::socklen_t {
        &mut self.len
    }

    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self.family() {
            Family::INET => {
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            Family::INET6 => {
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    pub fn as_unix_path(&self) -> Option<PathBuf> {
        if self.family() != Family::UNIX {
            return None;
        }
        let sun = unsafe { &*(self.as_ptr() as *const libc::sockaddr_un) };
        let offset = mem::size_of::<libc::sa_family_t>();
        let max = (self.len as usize).saturating_sub(offset).min(sun.sun_path.len());
        let bytes: Vec<u8> = sun.sun_path[..max]
            .iter()
            .map(|c| *c as u8)
            .take_while(|b| *b != 0)
            .collect();
        Some(PathBuf::from(OsStr::from_bytes(&bytes)))
    }

    fn set_v6_extras(&mut self, flowinfo: Option<u32>, scope_id: Option<u32>) {
        if self.family() != Family::INET6 {
            return;
        }
        let sin6 = unsafe { &mut *(self.as_mut_ptr() as *mut libc::sockaddr_in6) };
        if let Some(flowinfo) = flowinfo {
            sin6.sin6_flowinfo = flowinfo;
        }
        if let Some(scope_id) = scope_id {
            sin6.sin6_scope_id = scope_id;
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => {
                let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                unsafe {
                    Self::from_raw(
                        &sin as *const _ as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            SocketAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                unsafe {
                    Self::from_raw(
                        &sin6 as *const _ as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
            }
        }
    }
}

impl PartialEq for SockAddr {
    fn eq(&self, other: &Self) -> bool {
        let bytes = |a: &SockAddr| unsafe {
            std::slice::from_raw_parts(a.as_ptr() as *const u8, a.len as usize).to_vec()
        };
        self.len == other.len && bytes(self) == bytes(other)
    }
}

impl Eq for SockAddr {}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(addr) = self.as_socket_addr() {
            return write!(f, "{}", addr);
        }
        if let Some(path) = self.as_unix_path() {
            return write!(f, "unix:{}", path.display());
        }
        write!(f, "SockAddr(family={}, len={})", self.family().0, self.len)
    }
}

/// One `getaddrinfo` record.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub family: Family,
    pub sock_type: SockType,
    pub protocol: i32,
    pub canonname: Option<String>,
    pub addr: SockAddr,
}

/// Name lookup, run on the blocking pool.
pub async fn getaddrinfo(
    cx: &Cx,
    host: Option<&str>,
    port: Option<u16>,
    family: Family,
    sock_type: SockType,
    protocol: i32,
    flags: i32,
) -> Result<Vec<AddrInfo>> {
    let host = host
        .map(CString::new)
        .transpose()
        .map_err(|_| Error::InvalidAddress("host contains a nul byte".to_string()))?;
    let service = port.map(|p| p.to_string());
    let hints = Hints {
        family,
        sock_type,
        protocol,
        flags,
    };
    Ok(spawn_blocking(cx, move || lookup(host, service, hints)).await??)
}

#[derive(Clone, Copy)]
struct Hints {
    family: Family,
    sock_type: SockType,
    protocol: i32,
    flags: i32,
}

fn lookup(host: Option<CString>, service: Option<String>, hints: Hints) -> io::Result<Vec<AddrInfo>> {
    let service = service
        .map(CString::new)
        .transpose()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut raw_hints: libc::addrinfo = unsafe { mem::zeroed() };
    raw_hints.ai_family = hints.family.0;
    raw_hints.ai_socktype = hints.sock_type.0;
    raw_hints.ai_protocol = hints.protocol;
    raw_hints.ai_flags = hints.flags;

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(
            host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
            service.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            &raw_hints,
            &mut res,
        )
    };
    if rc != 0 {
        return Err(gai_error(rc));
    }

    let mut records = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        let canonname = if ai.ai_canonname.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(ai.ai_canonname) }.to_string_lossy().into_owned())
        };
        if !ai.ai_addr.is_null() {
            records.push(AddrInfo {
                family: Family(ai.ai_family),
                sock_type: SockType(ai.ai_socktype),
                protocol: ai.ai_protocol,
                canonname,
                addr: unsafe { SockAddr::from_raw(ai.ai_addr, ai.ai_addrlen) },
            });
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(records)
}

fn gai_error(rc: libc::c_int) -> io::Error {
    if rc == libc::EAI_SYSTEM {
        return io::Error::last_os_error();
    }
    let detail = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
        .to_string_lossy()
        .into_owned();
    io::Error::new(
        io::ErrorKind::Other,
        format!("failed to lookup address information: {}", detail),
    )
}

/// Turn `address` into a kernel address for a socket of the given shape.
///
/// Numeric hosts skip DNS. An empty host means the wildcard address and
/// `"<broadcast>"` the IPv4 broadcast address. `local` marks addresses
/// that will be bound to. When several records come back, the first wins.
#[allow(clippy::too_many_arguments)]
pub async fn resolve_address(
    cx: &Cx,
    family: Family,
    sock_type: SockType,
    protocol: i32,
    v6only: bool,
    address: &Address,
    local: bool,
) -> Result<SockAddr> {
    let (host, port, flowinfo, scope_id) = match (family, address) {
        (Family::UNIX, Address::Unix(path)) => return Ok(SockAddr::unix(path)?),
        (Family::INET | Family::INET6, Address::Inet { host, port }) => (host, *port, None, None),
        (
            Family::INET6,
            Address::Inet6 {
                host,
                port,
                flowinfo,
                scope_id,
            },
        ) => (host, *port, *flowinfo, *scope_id),
        (Family::INET, _) => {
            return Err(Error::InvalidAddress(
                "AF_INET address must be a (host, port) pair".to_string(),
            ))
        }
        (Family::INET6, _) => {
            return Err(Error::InvalidAddress(
                "AF_INET6 address must be a (host, port[, flowinfo[, scope_id]]) tuple".to_string(),
            ))
        }
        (Family::UNIX, _) => {
            return Err(Error::InvalidAddress(
                "AF_UNIX address must be a filesystem path".to_string(),
            ))
        }
        (other, _) => {
            return Err(Error::InvalidAddress(format!(
                "unsupported address family {}",
                other.0
            )))
        }
    };

    if host.contains('\0') {
        return Err(Error::InvalidAddress("host contains a nul byte".to_string()));
    }

    if let Some(addr) = numeric(family, host, port, flowinfo, scope_id) {
        return Ok(addr);
    }

    let lookup_host = match host.as_str() {
        "" => None,
        "<broadcast>" => Some("255.255.255.255"),
        name => Some(name),
    };
    let mut flags = 0;
    if local {
        flags |= libc::AI_PASSIVE;
    }
    if family == Family::INET6 && !v6only {
        flags |= libc::AI_V4MAPPED;
    }

    let records = getaddrinfo(cx, lookup_host, Some(port), family, sock_type, protocol, flags).await?;
    let Some(first) = records.into_iter().next() else {
        return Err(Error::InvalidAddress(format!("no address found for {:?}", host)));
    };
    let mut addr = first.addr;
    addr.set_v6_extras(flowinfo, scope_id);
    Ok(addr)
}

fn numeric(
    family: Family,
    host: &str,
    port: u16,
    flowinfo: Option<u32>,
    scope_id: Option<u32>,
) -> Option<SockAddr> {
    let ip: IpAddr = host.parse().ok()?;
    match (family, ip) {
        (Family::INET, IpAddr::V4(v4)) => Some(SocketAddr::V4(SocketAddrV4::new(v4, port)).into()),
        (Family::INET6, IpAddr::V6(v6)) => Some(
            SocketAddr::V6(SocketAddrV6::new(
                v6,
                port,
                flowinfo.unwrap_or(0),
                scope_id.unwrap_or(0),
            ))
            .into(),
        ),
        _ => None,
    }
}
