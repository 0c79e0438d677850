use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netline::{Error, Family, Line, INVALID_SOCK};

#[test]
fn tcp_echo_roundtrip() {
    _ = pretty_env_logger::try_init();

    let connected = Arc::new(AtomicUsize::new(0));

    let mut server = Line::new();

    {
        let connected = connected.clone();

        server.set_on_connected(move |_| {
            connected.fetch_add(1, Ordering::SeqCst);
        });
    }

    server.listen(0).unwrap();

    let port = server.local_addr().unwrap().port();

    let server = Arc::new(server);

    let echo = {
        let server = server.clone();

        thread::spawn(move || {
            let conn = server.accept().unwrap();

            let mut buf = [0u8; 32];

            let n = conn.recv(&mut buf).unwrap();

            conn.send(&buf[..n]).unwrap();

            n
        })
    };

    let mut client = Line::new();

    {
        let connected = connected.clone();

        client.set_on_connected(move |_| {
            connected.fetch_add(1, Ordering::SeqCst);
        });
    }

    client.set_connect_timeout(2000);

    client.connect("localhost", port).unwrap();

    assert!(client.active());
    assert_eq!(client.peer_ip(), "127.0.0.1");

    let sent_before = client.last_sent();

    thread::sleep(Duration::from_millis(15));

    assert_eq!(client.send(b"hello").unwrap(), 5);

    assert!(client.last_sent() > sent_before);

    let mut buf = [0u8; 32];

    let n = client.recv(&mut buf).unwrap();

    assert_eq!(&buf[..n], b"hello");

    assert_eq!(echo.join().unwrap(), 5);

    // Listener activation, the accepted line (inherited hook), and the
    // client each fire once.
    assert_eq!(connected.load(Ordering::SeqCst), 3);
}

#[test]
fn peer_close_drains_to_zero_and_disconnects_once() {
    _ = pretty_env_logger::try_init();

    let disconnected = Arc::new(AtomicUsize::new(0));

    let mut server = Line::new();

    server.listen(0).unwrap();

    let port = server.local_addr().unwrap().port();

    let mut client = Line::new();

    {
        let disconnected = disconnected.clone();

        client.set_on_disconnected(move |_| {
            disconnected.fetch_add(1, Ordering::SeqCst);
        });
    }

    client.set_connect_timeout(2000);

    client.connect("127.0.0.1", port).unwrap();

    // The backlog holds the connection until we take it.
    let conn = server.accept().unwrap();

    conn.close();

    let mut buf = [0u8; 8];

    assert_eq!(client.recv(&mut buf).unwrap(), 0);

    assert!(!client.active());
    assert_eq!(client.handle(), INVALID_SOCK);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);

    // Idempotent: a second close fires nothing.
    client.close();

    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
}

#[test]
fn connect_refused_propagates() {
    _ = pretty_env_logger::try_init();

    // Grab a port the OS just handed out, then free it again.
    let mut probe = Line::new();

    probe.listen(0).unwrap();

    let port = probe.local_addr().unwrap().port();

    probe.close();

    let mut client = Line::new();

    client.set_connect_timeout(500);

    let err = client.connect("127.0.0.1", port).unwrap_err();

    assert!(matches!(err, Error::Connect { .. }), "got {:?}", err);

    assert!(!client.active());
    assert_eq!(client.handle(), INVALID_SOCK);
}

#[test]
fn closed_line_cannot_reactivate() {
    _ = pretty_env_logger::try_init();

    let mut line = Line::new();

    line.listen(0).unwrap();

    line.close();

    let err = line.listen(0).unwrap_err();

    assert!(matches!(err, Error::Config(_)), "got {:?}", err);
}

#[test]
fn hook_panics_are_suppressed() {
    _ = pretty_env_logger::try_init();

    let mut server = Line::new();

    server.set_on_connected(|_| panic!("bad hook"));

    server.listen(0).unwrap();

    assert!(server.active());
}

#[test]
fn tcp_options_apply() {
    _ = pretty_env_logger::try_init();

    let mut server = Line::new();

    server.listen(0).unwrap();

    let port = server.local_addr().unwrap().port();

    let mut client = Line::new();

    client.set_connect_timeout(2000);

    client.connect("127.0.0.1", port).unwrap();

    client.enable_no_delay().unwrap();
    client.enable_keep_alive().unwrap();
    client.enable_reuse_address().unwrap();

    client.set_receive_buffer(4096).unwrap();
    client.set_send_buffer(4096).unwrap();

    client.set_receive_timeout(250).unwrap();

    let ms = client.receive_timeout().unwrap();

    assert!((200..=300).contains(&ms), "timeout readback {}", ms);

    client.set_send_timeout(250).unwrap();

    assert!(client.send_timeout().unwrap() > 0);

    // IPv4 line: the v6-only toggle is a documented no-op.
    client.enable_ipv6_only().unwrap();
}

#[test]
fn tcp_echo_ipv6_loopback() {
    _ = pretty_env_logger::try_init();

    let mut server = Line::new();

    server.set_family(Family::V6).unwrap();

    if server.listen(0).is_err() {
        eprintln!("no IPv6 stack available, skipping");
        return;
    }

    let port = server.local_addr().unwrap().port();

    let mut client = Line::new();

    client.set_family(Family::V6).unwrap();
    client.set_connect_timeout(2000);

    if client.connect("::1", port).is_err() {
        eprintln!("cannot reach ::1, skipping");
        return;
    }

    assert_eq!(client.peer_ip(), "::1");

    let conn = server.accept().unwrap();

    client.send(b"six").unwrap();

    let mut buf = [0u8; 8];

    let n = conn.recv(&mut buf).unwrap();

    assert_eq!(&buf[..n], b"six");
}
