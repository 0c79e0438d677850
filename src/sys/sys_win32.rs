use std::io::{Error, ErrorKind, Result};
use std::mem::{size_of, zeroed};
use std::net::SocketAddr;
use std::ptr::{null, null_mut};
use std::time::Duration;

use once_cell::sync::OnceCell;
use os_socketaddr::OsSocketAddr;
use winapi::ctypes::{c_char, c_int};
use winapi::shared::minwindef::DWORD;
use winapi::shared::winerror::WSAEWOULDBLOCK;
use winapi::shared::ws2def::{
    ADDRINFOW, AF_INET, AF_INET6, AI_ADDRCONFIG, AI_PASSIVE, IPPROTO_IPV6, IPPROTO_TCP,
    IPPROTO_UDP, SOCKADDR,
};
use winapi::shared::ws2ipdef::IPV6_V6ONLY;
use winapi::um::winsock2::{
    accept as wsa_accept, bind as wsa_bind, closesocket, connect as wsa_connect,
    getsockname, getsockopt, ioctlsocket, listen as wsa_listen, recv as wsa_recv,
    send as wsa_send, sendto, setsockopt, socket as wsa_socket, u_long, WSAGetLastError,
    WSAStartup, FIONBIO, INVALID_SOCKET, SOCKET_ERROR, SOCK_DGRAM, SOCK_STREAM, SOL_SOCKET,
    SOMAXCONN, SO_BROADCAST, SO_ERROR, SO_KEEPALIVE, SO_RCVBUF, SO_RCVTIMEO, SO_REUSEADDR,
    SO_SNDBUF, SO_SNDTIMEO, TCP_NODELAY, WSADATA,
};
use winapi::um::ws2tcpip::{FreeAddrInfoW, GetAddrInfoW};

use crate::line::{Family, Kind};
use crate::readiness;

use super::RawSock;

/// Start Winsock once per process. `WSACleanup` is left to process
/// teardown; the OS reclaims Winsock state at exit.
fn startup() {
    static WSA: OnceCell<()> = OnceCell::new();

    WSA.get_or_init(|| {
        let mut data: WSADATA = unsafe { zeroed() };

        // Winsock 2.2, the floor for GetAddrInfoW (Vista+).
        let rc = unsafe { WSAStartup(0x0202, &mut data) };

        if rc != 0 {
            log::debug!(target: "netline_sys", "WSAStartup failed({})", rc);
        }
    });
}

fn family_raw(family: Family) -> c_int {
    match family {
        Family::V4 => AF_INET,
        Family::V6 => AF_INET6,
    }
}

fn kind_raw(kind: Kind) -> c_int {
    match kind {
        Kind::Tcp => SOCK_STREAM,
        Kind::Udp => SOCK_DGRAM,
    }
}

fn protocol_raw(kind: Kind) -> c_int {
    match kind {
        Kind::Tcp => IPPROTO_TCP as c_int,
        Kind::Udp => IPPROTO_UDP as c_int,
    }
}

fn wsa_error() -> Error {
    Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

pub fn socket(family: Family, kind: Kind) -> Result<RawSock> {
    startup();

    let sock = unsafe { wsa_socket(family_raw(family), kind_raw(kind), protocol_raw(kind)) };

    if sock == INVALID_SOCKET {
        return Err(wsa_error());
    }

    log::trace!(target: "netline_sys", "socket({}) created", sock);

    Ok(sock)
}

pub fn close(sock: RawSock) -> Result<()> {
    log::trace!(target: "netline_sys", "close socket({})", sock);

    if unsafe { closesocket(sock) } == SOCKET_ERROR {
        Err(wsa_error())
    } else {
        Ok(())
    }
}

pub fn bind(sock: RawSock, addr: &SocketAddr) -> Result<()> {
    let addr: OsSocketAddr = (*addr).into();

    if unsafe { wsa_bind(sock, addr.as_ptr(), addr.len()) } == SOCKET_ERROR {
        return Err(wsa_error());
    }

    Ok(())
}

pub fn listen(sock: RawSock) -> Result<()> {
    if unsafe { wsa_listen(sock, SOMAXCONN as c_int) } == SOCKET_ERROR {
        return Err(wsa_error());
    }

    Ok(())
}

pub fn accept(sock: RawSock) -> Result<(RawSock, Option<SocketAddr>)> {
    let mut storage = [0u8; 128];

    let mut len = storage.len() as c_int;

    let conn = unsafe { wsa_accept(sock, storage.as_mut_ptr() as *mut SOCKADDR, &mut len) };

    if conn == INVALID_SOCKET {
        return Err(wsa_error());
    }

    let peer = unsafe { OsSocketAddr::copy_from_raw(storage.as_ptr() as *const SOCKADDR, len) }
        .into_addr();

    log::trace!(target: "netline_sys", "socket({}) accepted connection({}) from {:?}", sock, conn, peer);

    Ok((conn, peer))
}

/// Plain blocking connect; the OS picks the timeout.
pub fn connect(sock: RawSock, addr: &SocketAddr) -> Result<()> {
    let addr: OsSocketAddr = (*addr).into();

    if unsafe { wsa_connect(sock, addr.as_ptr(), addr.len()) } == SOCKET_ERROR {
        return Err(wsa_error());
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

    if unsafe { wsa_connect(sock, addr.as_ptr(), addr.len()) } == 0 {
        return Ok(());
    }

    let e = unsafe { WSAGetLastError() };

    if e != WSAEWOULDBLOCK {
        return Err(Error::from_raw_os_error(e));
    }

    if !readiness::wait_writable(sock, Duration::from_millis(timeout_ms as u64))? {
        return Err(Error::new(ErrorKind::TimedOut, "connect timed out"));
    }

    take_socket_error(sock)
}

fn take_socket_error(sock: RawSock) -> Result<()> {
    let mut err: c_int = 0;

    let mut len = size_of::<c_int>() as c_int;

    let ret = unsafe {
        getsockopt(
            sock,
            SOL_SOCKET,
            SO_ERROR,
            &mut err as *mut _ as *mut c_char,
            &mut len,
        )
    };

    if ret == SOCKET_ERROR {
        return Err(wsa_error());
    }

    if err != 0 {
        return Err(Error::from_raw_os_error(err));
    }

    Ok(())
}

fn set_nonblocking(sock: RawSock, on: bool) -> Result<()> {
    let mut mode: u_long = if on { 1 } else { 0 };

    if unsafe { ioctlsocket(sock, FIONBIO, &mut mode) } == SOCKET_ERROR {
        return Err(wsa_error());
    }

    Ok(())
}

pub fn send(sock: RawSock, buf: &[u8]) -> Result<usize> {
    let len = unsafe { wsa_send(sock, buf.as_ptr() as *const c_char, buf.len() as c_int, 0) };

    if len == SOCKET_ERROR {
        return Err(wsa_error());
    }

    log::trace!(target: "netline_sys", "socket({}) sent bytes({})", sock, len);

    Ok(len as usize)
}

pub fn send_to(sock: RawSock, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
    let addr: OsSocketAddr = (*addr).into();

    let len = unsafe {
        sendto(
            sock,
            buf.as_ptr() as *const c_char,
            buf.len() as c_int,
            0,
            addr.as_ptr(),
            addr.len(),
        )
    };

    if len == SOCKET_ERROR {
        return Err(wsa_error());
    }

    log::trace!(target: "netline_sys", "socket({}) sendto bytes({})", sock, len);

    Ok(len as usize)
}

pub fn recv(sock: RawSock, buf: &mut [u8]) -> Result<usize> {
    let len = unsafe { wsa_recv(sock, buf.as_mut_ptr() as *mut c_char, buf.len() as c_int, 0) };

    if len == SOCKET_ERROR {
        return Err(wsa_error());
    }

    log::trace!(target: "netline_sys", "socket({}) read bytes({})", sock, len);

    Ok(len as usize)
}

pub fn local_addr(sock: RawSock) -> Result<SocketAddr> {
    let mut storage = [0u8; 128];

    let mut len = storage.len() as c_int;

    if unsafe { getsockname(sock, storage.as_mut_ptr() as *mut SOCKADDR, &mut len) } == SOCKET_ERROR
    {
        return Err(wsa_error());
    }

    unsafe { OsSocketAddr::copy_from_raw(storage.as_ptr() as *const SOCKADDR, len) }
        .into_addr()
        .ok_or_else(|| Error::new(ErrorKind::Other, "unknown address family"))
}

fn set_int_opt(sock: RawSock, level: c_int, name: c_int, value: c_int) -> Result<()> {
    let ret = unsafe {
        setsockopt(
            sock,
            level,
            name,
            &value as *const _ as *const c_char,
            size_of::<c_int>() as c_int,
        )
    };

    if ret == SOCKET_ERROR {
        Err(wsa_error())
    } else {
        Ok(())
    }
}

pub fn set_reuse_address(sock: RawSock) -> Result<()> {
    set_int_opt(sock, SOL_SOCKET, SO_REUSEADDR, 1)
}

pub fn set_no_delay(sock: RawSock) -> Result<()> {
    set_int_opt(sock, IPPROTO_TCP as c_int, TCP_NODELAY, 1)
}

pub fn set_keep_alive(sock: RawSock) -> Result<()> {
    set_int_opt(sock, SOL_SOCKET, SO_KEEPALIVE, 1)
}

pub fn set_broadcast(sock: RawSock) -> Result<()> {
    set_int_opt(sock, SOL_SOCKET, SO_BROADCAST, 1)
}

pub fn set_ipv6_only(sock: RawSock) -> Result<()> {
    set_int_opt(sock, IPPROTO_IPV6 as c_int, IPV6_V6ONLY, 1)
}

pub fn set_recv_buffer(sock: RawSock, bytes: i32) -> Result<()> {
    set_int_opt(sock, SOL_SOCKET, SO_RCVBUF, bytes)
}

pub fn set_send_buffer(sock: RawSock, bytes: i32) -> Result<()> {
    set_int_opt(sock, SOL_SOCKET, SO_SNDBUF, bytes)
}

// Winsock takes socket timeouts as DWORD milliseconds.
fn set_timeout_opt(sock: RawSock, name: c_int, timeout_ms: u32) -> Result<()> {
    let value: DWORD = timeout_ms;

    let ret = unsafe {
        setsockopt(
            sock,
            SOL_SOCKET,
            name,
            &value as *const _ as *const c_char,
            size_of::<DWORD>() as c_int,
        )
    };

    if ret == SOCKET_ERROR {
        Err(wsa_error())
    } else {
        Ok(())
    }
}

fn get_timeout_opt(sock: RawSock, name: c_int) -> Result<u32> {
    let mut value: DWORD = 0;

    let mut len = size_of::<DWORD>() as c_int;

    let ret = unsafe {
        getsockopt(
            sock,
            SOL_SOCKET,
            name,
            &mut value as *mut _ as *mut c_char,
            &mut len,
        )
    };

    if ret == SOCKET_ERROR {
        return Err(wsa_error());
    }

    Ok(value)
}

pub fn set_recv_timeout(sock: RawSock, timeout_ms: u32) -> Result<()> {
    set_timeout_opt(sock, SO_RCVTIMEO, timeout_ms)
}

pub fn recv_timeout(sock: RawSock) -> Result<u32> {
    get_timeout_opt(sock, SO_RCVTIMEO)
}

pub fn set_send_timeout(sock: RawSock, timeout_ms: u32) -> Result<()> {
    set_timeout_opt(sock, SO_SNDTIMEO, timeout_ms)
}

pub fn send_timeout(sock: RawSock) -> Result<u32> {
    get_timeout_opt(sock, SO_SNDTIMEO)
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
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
    startup();

    let mut hints: ADDRINFOW = unsafe { zeroed() };

    hints.ai_family = family_raw(family);
    hints.ai_socktype = kind_raw(kind);
    hints.ai_protocol = protocol_raw(kind);
    hints.ai_flags = if passive { AI_PASSIVE } else { 0 };

    if family == Family::V6 && !passive {
        hints.ai_flags |= AI_ADDRCONFIG;
    }

    let host = host.map(wide);

    let service = wide(&port.to_string());

    let mut list: *mut ADDRINFOW = null_mut();

    let rc = unsafe {
        GetAddrInfoW(
            host.as_ref().map_or(null(), |h| h.as_ptr()),
            service.as_ptr(),
            &hints,
            &mut list,
        )
    };

    if rc != 0 {
        return Err(wsa_error());
    }

    let mut out = Vec::new();

    let mut entry = list;

    while !entry.is_null() {
        let info = unsafe { &*entry };

        let addr = unsafe {
            OsSocketAddr::copy_from_raw(info.ai_addr as *const SOCKADDR, info.ai_addrlen as _)
        };

        if let Some(addr) = addr.into_addr() {
            out.push(addr);
        }

        entry = info.ai_next;
    }

    unsafe { FreeAddrInfoW(list) };

    Ok(out)
}

/// Windows zone ids are numeric interface indices (`fe80::1%3`).
pub fn scope_id(zone: &str) -> u32 {
    zone.parse::<u32>().unwrap_or(0)
}
