use std::ffi::{CStr, CString};
use std::io::{Error, ErrorKind, Result};
use std::mem::{size_of, zeroed};
use std::net::SocketAddr;
use std::ptr::{null, null_mut};
use std::time::Duration;

use errno::{errno, set_errno};
use libc::{c_int, c_void, sockaddr, socklen_t};
use os_socketaddr::OsSocketAddr;

use crate::line::{Family, Kind};
use crate::readiness;

use super::RawSock;

// Send failures on a dead peer must surface as errors, not SIGPIPE.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: c_int = 0;

fn family_raw(family: Family) -> c_int {
    match family {
        Family::V4 => libc::AF_INET,
        Family::V6 => libc::AF_INET6,
    }
}

fn kind_raw(kind: Kind) -> c_int {
    match kind {
        Kind::Tcp => libc::SOCK_STREAM,
        Kind::Udp => libc::SOCK_DGRAM,
    }
}

fn protocol_raw(kind: Kind) -> c_int {
    match kind {
        Kind::Tcp => libc::IPPROTO_TCP,
        Kind::Udp => libc::IPPROTO_UDP,
    }
}

pub fn socket(family: Family, kind: Kind) -> Result<RawSock> {
    let fd = unsafe { libc::socket(family_raw(family), kind_raw(kind), protocol_raw(kind)) };

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    if let Err(e) = set_int_opt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    log::trace!(target: "netline_sys", "socket({}) created", fd);

    Ok(fd)
}

pub fn close(sock: RawSock) -> Result<()> {
    log::trace!(target: "netline_sys", "close socket({})", sock);

    if unsafe { libc::close(sock) } < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn bind(sock: RawSock, addr: &SocketAddr) -> Result<()> {
    let addr: OsSocketAddr = (*addr).into();

    if unsafe { libc::bind(sock, addr.as_ptr(), addr.len()) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

pub fn listen(sock: RawSock) -> Result<()> {
    if unsafe { libc::listen(sock, libc::SOMAXCONN) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

pub fn accept(sock: RawSock) -> Result<(RawSock, Option<SocketAddr>)> {
    let mut storage = [0u8; size_of::<libc::sockaddr_in6>()];

    let mut len = storage.len() as socklen_t;

    let conn = unsafe { libc::accept(sock, storage.as_mut_ptr() as *mut sockaddr, &mut len) };

    if conn < 0 {
        return Err(Error::last_os_error());
    }

    let peer =
        unsafe { OsSocketAddr::copy_from_raw(storage.as_ptr() as *const sockaddr, len) }.into_addr();

    log::trace!(target: "netline_sys", "socket({}) accepted connection({}) from {:?}", sock, conn, peer);

    Ok((conn, peer))
}

/// Plain blocking connect; the OS picks the timeout.
pub fn connect(sock: RawSock, addr: &SocketAddr) -> Result<()> {
    let addr: OsSocketAddr = (*addr).into();

    if unsafe { libc::connect(sock, addr.as_ptr(), addr.len()) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

/// Connect with an enforced millisecond timeout: non-blocking connect,
/// writability wait, then `SO_ERROR`. Blocking mode is restored either way.
pub fn connect_timeout(sock: RawSock, addr: &SocketAddr, timeout_ms: u32) -> Result<()> {
    set_nonblocking(sock, true)?;

    let connected = start_connect(sock, addr, timeout_ms);

    let restored = set_nonblocking(sock, false);

    connected.and(restored)
}

fn start_connect(sock: RawSock, addr: &SocketAddr, timeout_ms: u32) -> Result<()> {
    let addr: OsSocketAddr = (*addr).into();

    if unsafe { libc::connect(sock, addr.as_ptr(), addr.len()) } == 0 {
        return Ok(());
    }

    let e = errno();

    set_errno(e);

    if e.0 != libc::EINPROGRESS {
        return Err(Error::from_raw_os_error(e.0));
    }

    if !readiness::wait_writable(sock, Duration::from_millis(timeout_ms as u64))? {
        return Err(Error::new(ErrorKind::TimedOut, "connect timed out"));
    }

    take_socket_error(sock)
}

fn take_socket_error(sock: RawSock) -> Result<()> {
    let mut err: c_int = 0;

    let mut len = size_of::<c_int>() as socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            sock,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        )
    };

    if ret < 0 {
        return Err(Error::last_os_error());
    }

    if err != 0 {
        return Err(Error::from_raw_os_error(err));
    }

    Ok(())
}

fn set_nonblocking(sock: RawSock, on: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(sock, libc::F_GETFL) };

    if flags < 0 {
        return Err(Error::last_os_error());
    }

    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };

    if unsafe { libc::fcntl(sock, libc::F_SETFL, flags) } < 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

pub fn send(sock: RawSock, buf: &[u8]) -> Result<usize> {
    let len = unsafe { libc::send(sock, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS) };

    if len < 0 {
        let e = errno();

        set_errno(e);

        return Err(Error::from_raw_os_error(e.0));
    }

    log::trace!(target: "netline_sys", "socket({}) sent bytes({})", sock, len);

    Ok(len as usize)
}

pub fn send_to(sock: RawSock, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
    let addr: OsSocketAddr = (*addr).into();

    let len = unsafe {
        libc::sendto(
            sock,
            buf.as_ptr() as *const c_void,
            buf.len(),
            SEND_FLAGS,
            addr.as_ptr(),
            addr.len(),
        )
    };

    if len < 0 {
        let e = errno();

        set_errno(e);

        return Err(Error::from_raw_os_error(e.0));
    }

    log::trace!(target: "netline_sys", "socket({}) sendto bytes({})", sock, len);

    Ok(len as usize)
}

pub fn recv(sock: RawSock, buf: &mut [u8]) -> Result<usize> {
    let len = unsafe { libc::recv(sock, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };

    if len < 0 {
        let e = errno();

        set_errno(e);

        return Err(Error::from_raw_os_error(e.0));
    }

    log::trace!(target: "netline_sys", "socket({}) read bytes({})", sock, len);

    Ok(len as usize)
}

pub fn local_addr(sock: RawSock) -> Result<SocketAddr> {
    let mut storage = [0u8; size_of::<libc::sockaddr_in6>()];

    let mut len = storage.len() as socklen_t;

    if unsafe { libc::getsockname(sock, storage.as_mut_ptr() as *mut sockaddr, &mut len) } < 0 {
        return Err(Error::last_os_error());
    }

    unsafe { OsSocketAddr::copy_from_raw(storage.as_ptr() as *const sockaddr, len) }
        .into_addr()
        .ok_or_else(|| Error::new(ErrorKind::Other, "unknown address family"))
}

fn set_int_opt(sock: RawSock, level: c_int, name: c_int, value: c_int) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            sock,
            level,
            name,
            &value as *const _ as *const c_void,
            size_of::<c_int>() as socklen_t,
        )
    };

    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn set_reuse_address(sock: RawSock) -> Result<()> {
    set_int_opt(sock, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

pub fn set_no_delay(sock: RawSock) -> Result<()> {
    set_int_opt(sock, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

pub fn set_keep_alive(sock: RawSock) -> Result<()> {
    set_int_opt(sock, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)
}

pub fn set_broadcast(sock: RawSock) -> Result<()> {
    set_int_opt(sock, libc::SOL_SOCKET, libc::SO_BROADCAST, 1)
}

pub fn set_ipv6_only(sock: RawSock) -> Result<()> {
    set_int_opt(sock, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1)
}

pub fn set_recv_buffer(sock: RawSock, bytes: i32) -> Result<()> {
    set_int_opt(sock, libc::SOL_SOCKET, libc::SO_RCVBUF, bytes)
}

pub fn set_send_buffer(sock: RawSock, bytes: i32) -> Result<()> {
    set_int_opt(sock, libc::SOL_SOCKET, libc::SO_SNDBUF, bytes)
}

fn set_timeout_opt(sock: RawSock, name: c_int, timeout_ms: u32) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: (timeout_ms / 1000) as libc::time_t,
        tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
    };

    let ret = unsafe {
        libc::setsockopt(
            sock,
            libc::SOL_SOCKET,
            name,
            &tv as *const _ as *const c_void,
            size_of::<libc::timeval>() as socklen_t,
        )
    };

    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

fn get_timeout_opt(sock: RawSock, name: c_int) -> Result<u32> {
    let mut tv: libc::timeval = unsafe { zeroed() };

    let mut len = size_of::<libc::timeval>() as socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            sock,
            libc::SOL_SOCKET,
            name,
            &mut tv as *mut _ as *mut c_void,
            &mut len,
        )
    };

    if ret < 0 {
        return Err(Error::last_os_error());
    }

    Ok(tv.tv_sec as u32 * 1000 + tv.tv_usec as u32 / 1000)
}

pub fn set_recv_timeout(sock: RawSock, timeout_ms: u32) -> Result<()> {
    set_timeout_opt(sock, libc::SO_RCVTIMEO, timeout_ms)
}

pub fn recv_timeout(sock: RawSock) -> Result<u32> {
    get_timeout_opt(sock, libc::SO_RCVTIMEO)
}

pub fn set_send_timeout(sock: RawSock, timeout_ms: u32) -> Result<()> {
    set_timeout_opt(sock, libc::SO_SNDTIMEO, timeout_ms)
}

pub fn send_timeout(sock: RawSock) -> Result<u32> {
    get_timeout_opt(sock, libc::SO_SNDTIMEO)
}

/// Resolve `(host, port)` into socket addresses for the given family
/// and kind. `passive` asks for a bindable wildcard address.
pub fn resolve(
    host: Option<&str>,
    port: u16,
    family: Family,
    kind: Kind,
    passive: bool,
) -> Result<Vec<SocketAddr>> {
    let mut hints: libc::addrinfo = unsafe { zeroed() };

    hints.ai_family = family_raw(family);
    hints.ai_socktype = kind_raw(kind);
    hints.ai_protocol = protocol_raw(kind);
    hints.ai_flags = if passive { libc::AI_PASSIVE } else { 0 };

    if family == Family::V6 && !passive {
        hints.ai_flags |= libc::AI_ADDRCONFIG;
    }

    let host = match host {
        Some(h) => Some(
            CString::new(h).map_err(|_| Error::new(ErrorKind::InvalidInput, "host contains NUL"))?,
        ),
        None => None,
    };

    let service = CString::new(port.to_string()).unwrap();

    let mut list: *mut libc::addrinfo = null_mut();

    let rc = unsafe {
        libc::getaddrinfo(
            host.as_ref().map_or(null(), |h| h.as_ptr()),
            service.as_ptr(),
            &hints,
            &mut list,
        )
    };

    if rc != 0 {
        return Err(Error::new(ErrorKind::Other, gai_error(rc)));
    }

    let mut out = Vec::new();

    let mut entry = list;

    while !entry.is_null() {
        let info = unsafe { &*entry };

        let addr = unsafe { OsSocketAddr::copy_from_raw(info.ai_addr, info.ai_addrlen) };

        if let Some(addr) = addr.into_addr() {
            out.push(addr);
        }

        entry = info.ai_next;
    }

    unsafe { libc::freeaddrinfo(list) };

    Ok(out)
}

fn gai_error(rc: c_int) -> String {
    if rc == libc::EAI_SYSTEM {
        return Error::last_os_error().to_string();
    }

    unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
        .to_string_lossy()
        .into_owned()
}

/// Turn a `%zone` suffix into a scope id: numeric zones verbatim,
/// interface names via `if_nametoindex`, unknown zones 0.
pub fn scope_id(zone: &str) -> u32 {
    if let Ok(index) = zone.parse::<u32>() {
        return index;
    }

    match CString::new(zone) {
        Ok(name) => unsafe { libc::if_nametoindex(name.as_ptr()) },
        Err(_) => 0,
    }
}
