//! The line object: one OS socket handle behind a uniform,
//! error-checked API, with connect/disconnect notifications.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::addr;
use crate::error::{Error, Result};
use crate::sys::{self, RawSock};

/// Transport flavour of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Connection-based byte stream.
    Tcp,
    /// Datagrams.
    Udp,
}

/// Address family of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn unspecified_ip(self) -> &'static str {
        match self {
            Family::V4 => "0.0.0.0",
            Family::V6 => "::",
        }
    }
}

/// Notification hook invoked on connect/disconnect transitions.
pub type Callback = Arc<dyn Fn(&Line) + Send + Sync>;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic millisecond ticks shared by all line timestamps.
pub fn ticks_now() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

const NO_HANDLE: isize = -1;

/// Default client connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u32 = 100;

/// One socket endpoint.
///
/// A line starts inactive, becomes active through [`connect`](Line::connect),
/// [`connect_broadcast`](Line::connect_broadcast), [`listen`](Line::listen)
/// or as the product of [`accept`](Line::accept), and returns to inactive
/// through [`close`](Line::close), drop, or a connection-terminating TCP
/// failure. A closed line cannot be activated again.
///
/// `send`, `recv`, `accept` and `close` take `&self` and may be called
/// from different threads; `close` racing a blocked `send`/`recv` is the
/// supported way to cancel it.
pub struct Line {
    handle: AtomicIsize,
    active: AtomicBool,
    retired: AtomicBool,
    kind: Kind,
    family: Family,
    peer_ip: String,
    peer_addr: Option<SocketAddr>,
    connect_timeout: u32,
    last_sent: AtomicU64,
    last_received: AtomicU64,
    data: Option<Arc<dyn Any + Send + Sync>>,
    on_connected: Option<Callback>,
    on_disconnected: Option<Callback>,
}

impl Line {
    /// New inactive line: TCP over IPv4, peer `127.0.0.1`.
    pub fn new() -> Self {
        Self {
            handle: AtomicIsize::new(NO_HANDLE),
            active: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            kind: Kind::Tcp,
            family: Family::V4,
            peer_ip: "127.0.0.1".to_string(),
            peer_addr: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_MS,
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
            data: None,
            on_connected: None,
            on_disconnected: None,
        }
    }

    fn raw(&self) -> RawSock {
        self.handle.load(Ordering::SeqCst) as RawSock
    }

    /// The OS handle, or the invalid sentinel when inactive.
    pub fn handle(&self) -> RawSock {
        self.raw()
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Printable remote address. Meaningful after a TCP connect or
    /// accept; datagram lines report the family's any-address.
    pub fn peer_ip(&self) -> &str {
        &self.peer_ip
    }

    /// Tick of the last successful send (see [`ticks_now`]).
    pub fn last_sent(&self) -> u64 {
        self.last_sent.load(Ordering::Relaxed)
    }

    /// Tick of the last successful receive.
    pub fn last_received(&self) -> u64 {
        self.last_received.load(Ordering::Relaxed)
    }

    pub fn connect_timeout(&self) -> u32 {
        self.connect_timeout
    }

    /// Client connect timeout in milliseconds.
    pub fn set_connect_timeout(&mut self, timeout_ms: u32) {
        self.connect_timeout = timeout_ms;
    }

    /// Change the transport flavour. Fails while the line is active.
    pub fn set_kind(&mut self, kind: Kind) -> Result<()> {
        if self.active() {
            return Err(Error::Config("kind is immutable while the line is active"));
        }

        self.kind = kind;

        Ok(())
    }

    /// Change the address family. Fails while the line is active.
    pub fn set_family(&mut self, family: Family) -> Result<()> {
        if self.active() {
            return Err(Error::Config("family is immutable while the line is active"));
        }

        self.family = family;

        Ok(())
    }

    /// Attach an opaque user object. The line never inspects it.
    pub fn set_data(&mut self, data: Arc<dyn Any + Send + Sync>) {
        self.data = Some(data);
    }

    pub fn data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.data.as_ref()
    }

    /// Hook fired once per transition into the active state.
    pub fn set_on_connected<F>(&mut self, hook: F)
    where
        F: Fn(&Line) + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(hook));
    }

    /// Hook fired once per transition out of the active state.
    pub fn set_on_disconnected<F>(&mut self, hook: F)
    where
        F: Fn(&Line) + Send + Sync + 'static,
    {
        self.on_disconnected = Some(Arc::new(hook));
    }

    /// Connect to `host:port` as a client.
    ///
    /// TCP lines connect with the configured timeout. IPv4 UDP lines
    /// connect the datagram socket, fixing the peer; IPv6 UDP lines
    /// stay unconnected and send to the resolved address. Broadcast
    /// literals are rejected here; use [`connect_broadcast`](Line::connect_broadcast).
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.connect_inner(host, port, false)
    }

    /// Connect an IPv4 UDP line for broadcast: enables `SO_BROADCAST`
    /// and leaves the socket unconnected.
    pub fn connect_broadcast(&mut self, host: &str, port: u16) -> Result<()> {
        self.connect_inner(host, port, true)
    }

    fn connect_inner(&mut self, host: &str, port: u16, broadcast: bool) -> Result<()> {
        self.ensure_inactive()?;

        if self.family == Family::V4 && addr::is_broadcast(host) && !broadcast {
            return Err(Error::Config("broadcast address requires broadcast mode"));
        }

        let mut target = host.to_string();
        let mut zone = None;

        if self.family == Family::V6 && target.contains(':') {
            if !addr::is_ipv6(&target) {
                return Err(Error::Address {
                    addr: target,
                    reason: "not a valid IPv6 literal",
                });
            }

            let normalized = addr::normalize(&target);

            let (bare, z) = addr::split_zone(&normalized);

            if addr::is_link_local(bare) {
                zone = z.map(str::to_owned);
            }

            // Resolve without the zone; the scope id is applied below.
            target = bare.to_string();
        }

        if self.family == Family::V4 && target == "localhost" {
            target = "127.0.0.1".to_string();
        }

        let resolved = sys::resolve(Some(&target), port, self.family, self.kind, false)
            .map_err(|e| Error::Resolve {
                host: host.to_string(),
                detail: e.to_string(),
            })?;

        let mut peer = *resolved.first().ok_or_else(|| Error::Resolve {
            host: host.to_string(),
            detail: "no usable address".to_string(),
        })?;

        if let (SocketAddr::V6(v6), Some(zone)) = (&mut peer, zone) {
            if v6.scope_id() == 0 {
                v6.set_scope_id(sys::scope_id(&zone));
            }
        }

        let sock = sys::socket(self.family, self.kind)?;

        if let Err(e) = self.establish(sock, peer, broadcast) {
            let _ = sys::close(sock);

            return Err(e);
        }

        self.activate(sock);

        Ok(())
    }

    fn establish(&mut self, sock: RawSock, peer: SocketAddr, broadcast: bool) -> Result<()> {
        #[cfg(unix)]
        sys::set_reuse_address(sock)?;

        match self.kind {
            Kind::Tcp => {
                sys::connect_timeout(sock, &peer, self.connect_timeout)
                    .map_err(|source| Error::Connect { addr: peer, source })?;

                self.peer_ip = peer.ip().to_string();
                self.peer_addr = None;
            }

            Kind::Udp => {
                self.peer_ip = self.family.unspecified_ip().to_string();

                match (self.family, broadcast) {
                    // Fix the peer so plain send/recv apply.
                    (Family::V4, false) => {
                        sys::connect(sock, &peer)
                            .map_err(|source| Error::Connect { addr: peer, source })?;

                        self.peer_addr = None;
                    }

                    (Family::V4, true) => {
                        sys::set_broadcast(sock)?;

                        self.peer_addr = Some(peer);
                    }

                    // IPv6 datagram lines stay unconnected.
                    (Family::V6, _) => {
                        self.peer_addr = Some(peer);
                    }
                }
            }
        }

        Ok(())
    }

    /// Bind a server line to `port` (0 asks the OS for one). TCP lines
    /// also start listening; UDP lines are ready to `recv`.
    pub fn listen(&mut self, port: u16) -> Result<()> {
        self.ensure_inactive()?;

        let resolved = sys::resolve(None, port, self.family, self.kind, true).map_err(|e| {
            Error::Resolve {
                host: "<any>".to_string(),
                detail: e.to_string(),
            }
        })?;

        let local = *resolved.first().ok_or_else(|| Error::Resolve {
            host: "<any>".to_string(),
            detail: "no usable address".to_string(),
        })?;

        let sock = sys::socket(self.family, self.kind)?;

        if let Err(e) = self.prepare_server(sock, local) {
            let _ = sys::close(sock);

            return Err(e);
        }

        if self.kind == Kind::Udp {
            self.peer_ip = self.family.unspecified_ip().to_string();
        }

        self.activate(sock);

        Ok(())
    }

    fn prepare_server(&self, sock: RawSock, local: SocketAddr) -> Result<()> {
        // Two listeners serve dual-stack setups; never fall into
        // accidental v4-mapped mode.
        if self.family == Family::V6 {
            sys::set_ipv6_only(sock)?;
        }

        #[cfg(unix)]
        sys::set_reuse_address(sock)?;

        sys::bind(sock, &local)?;

        if self.kind == Kind::Tcp {
            sys::listen(sock)?;
        }

        Ok(())
    }

    /// Take the next pending connection off a listening TCP line.
    ///
    /// The returned line owns the accepted handle, inherits kind,
    /// family and both hooks, and is already active (its `on_connected`
    /// has fired). A failed accept closes the listener and aborts, so a
    /// server loop blocked here winds down when the line is closed from
    /// another thread.
    pub fn accept(&self) -> Result<Line> {
        if self.kind != Kind::Tcp {
            return Err(Error::Config("datagram lines cannot accept"));
        }

        let sock = self.raw();

        match sys::accept(sock) {
            Ok((conn, peer)) => {
                let line = Line {
                    handle: AtomicIsize::new(conn as isize),
                    active: AtomicBool::new(true),
                    retired: AtomicBool::new(false),
                    kind: self.kind,
                    family: self.family,
                    peer_ip: peer
                        .map(|p| p.ip().to_string())
                        .unwrap_or_else(|| self.family.unspecified_ip().to_string()),
                    peer_addr: None,
                    connect_timeout: self.connect_timeout,
                    last_sent: AtomicU64::new(ticks_now()),
                    last_received: AtomicU64::new(ticks_now()),
                    data: None,
                    on_connected: self.on_connected.clone(),
                    on_disconnected: self.on_disconnected.clone(),
                };

                log::debug!("line({}) accepted line({}) from {}", sock, conn, line.peer_ip);

                line.notify_connected();

                Ok(line)
            }

            Err(e) => {
                log::debug!("accept on line({}) failed: {}", sock, e);

                self.close();

                Err(Error::Aborted)
            }
        }
    }

    /// Send a byte buffer, returning the number of bytes handed to the
    /// OS.
    ///
    /// A TCP send failure means the connection is gone: the line closes
    /// itself (firing `on_disconnected`) and the call aborts. UDP send
    /// failures are often per-datagram; the error propagates and the
    /// line stays open.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let sock = self.raw();

        let result = match self.peer_addr {
            Some(ref peer) if self.kind == Kind::Udp => sys::send_to(sock, buf, peer),
            _ => sys::send(sock, buf),
        };

        match result {
            Ok(n) => {
                self.last_sent.store(ticks_now(), Ordering::Relaxed);

                Ok(n)
            }

            Err(e) => match self.kind {
                Kind::Tcp => {
                    log::debug!("line({}) send failed: {}", sock, e);

                    self.close();

                    Err(Error::Aborted)
                }

                Kind::Udp => Err(Error::Io(e)),
            },
        }
    }

    /// Receive into a byte buffer, returning the number of bytes read.
    ///
    /// A TCP return of 0 is the peer's orderly close: the line closes
    /// itself and 0 is returned. TCP errors abort as in
    /// [`send`](Line::send); UDP errors propagate without closing.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let sock = self.raw();

        match sys::recv(sock, buf) {
            Ok(0) if self.kind == Kind::Tcp => {
                log::debug!("line({}) peer closed", sock);

                self.close();

                Ok(0)
            }

            Ok(n) => {
                self.last_received.store(ticks_now(), Ordering::Relaxed);

                Ok(n)
            }

            Err(e) => match self.kind {
                Kind::Tcp => {
                    log::debug!("line({}) recv failed: {}", sock, e);

                    self.close();

                    Err(Error::Aborted)
                }

                Kind::Udp => Err(Error::Io(e)),
            },
        }
    }

    /// Close the line. Safe to call repeatedly and from any thread; the
    /// first call releases the handle and fires `on_disconnected`, the
    /// rest are no-ops.
    pub fn close(&self) {
        let handle = self.handle.swap(NO_HANDLE, Ordering::SeqCst);

        if handle == NO_HANDLE {
            return;
        }

        self.retired.store(true, Ordering::SeqCst);

        let was_active = self.active.swap(false, Ordering::SeqCst);

        if let Err(e) = sys::close(handle as RawSock) {
            log::debug!("close line({}): {}", handle, e);
        }

        if was_active {
            self.notify_disconnected();
        }
    }

    /// Disable Nagle batching on a TCP line.
    pub fn enable_no_delay(&self) -> Result<()> {
        Ok(sys::set_no_delay(self.raw())?)
    }

    /// Probe idle TCP connections for dead peers.
    pub fn enable_keep_alive(&self) -> Result<()> {
        Ok(sys::set_keep_alive(self.raw())?)
    }

    /// Allow broadcast sends on a UDP line.
    pub fn enable_broadcast(&self) -> Result<()> {
        Ok(sys::set_broadcast(self.raw())?)
    }

    /// Restrict an IPv6 line to IPv6 traffic. No-op on IPv4 lines.
    pub fn enable_ipv6_only(&self) -> Result<()> {
        if self.family != Family::V6 {
            return Ok(());
        }

        Ok(sys::set_ipv6_only(self.raw())?)
    }

    pub fn enable_reuse_address(&self) -> Result<()> {
        Ok(sys::set_reuse_address(self.raw())?)
    }

    /// Kernel receive buffer size, clamped to [512, 1048576].
    pub fn set_receive_buffer(&self, bytes: usize) -> Result<()> {
        let bytes = bytes.clamp(512, 1_048_576);

        Ok(sys::set_recv_buffer(self.raw(), bytes as i32)?)
    }

    /// Kernel send buffer size.
    pub fn set_send_buffer(&self, bytes: usize) -> Result<()> {
        Ok(sys::set_send_buffer(self.raw(), bytes as i32)?)
    }

    /// Blocking-receive timeout in milliseconds; 0 blocks forever.
    pub fn receive_timeout(&self) -> Result<u32> {
        Ok(sys::recv_timeout(self.raw())?)
    }

    pub fn set_receive_timeout(&self, timeout_ms: u32) -> Result<()> {
        Ok(sys::set_recv_timeout(self.raw(), timeout_ms)?)
    }

    /// Blocking-send timeout in milliseconds; 0 blocks forever.
    pub fn send_timeout(&self) -> Result<u32> {
        Ok(sys::send_timeout(self.raw())?)
    }

    pub fn set_send_timeout(&self, timeout_ms: u32) -> Result<()> {
        Ok(sys::set_send_timeout(self.raw(), timeout_ms)?)
    }

    /// Local address of an active line; how a port-0 server learns its
    /// OS-assigned port.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(sys::local_addr(self.raw())?)
    }

    fn ensure_inactive(&self) -> Result<()> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(Error::Config("a closed line cannot be activated again"));
        }

        if self.active() {
            return Err(Error::Config("line is already active"));
        }

        Ok(())
    }

    fn activate(&mut self, sock: RawSock) {
        self.handle.store(sock as isize, Ordering::SeqCst);

        let now = ticks_now();

        self.last_sent.store(now, Ordering::Relaxed);
        self.last_received.store(now, Ordering::Relaxed);

        self.active.store(true, Ordering::SeqCst);

        log::debug!("line({}) active, peer {}", sock, self.peer_ip);

        self.notify_connected();
    }

    fn notify_connected(&self) {
        if let Some(hook) = self.on_connected.clone() {
            // Hook panics must not unwind into the line.
            let _ = catch_unwind(AssertUnwindSafe(|| hook(self)));
        }
    }

    fn notify_disconnected(&self) {
        if let Some(hook) = self.on_disconnected.clone() {
            let _ = catch_unwind(AssertUnwindSafe(|| hook(self)));
        }
    }
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Line {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Line")
            .field("handle", &self.raw())
            .field("active", &self.active())
            .field("kind", &self.kind)
            .field("family", &self.family)
            .field("peer_ip", &self.peer_ip)
            .finish()
    }
}
