use std::time::Duration;

use netline::{readable, readable_any, Error, Family, Kind, Line};

fn udp_line() -> Line {
    let mut line = Line::new();

    line.set_kind(Kind::Udp).unwrap();

    line
}

#[test]
fn udp_unicast_observed_via_readable() {
    _ = pretty_env_logger::try_init();

    let mut receiver = udp_line();

    receiver.listen(0).unwrap();

    let port = receiver.local_addr().unwrap().port();

    assert_eq!(receiver.peer_ip(), "0.0.0.0");

    let mut sender = udp_line();

    sender.connect("127.0.0.1", port).unwrap();

    assert_eq!(sender.send(&[0x01, 0x02, 0x03]).unwrap(), 3);

    let ready = readable(&[receiver.handle()], Duration::from_secs(1)).unwrap();

    assert_eq!(ready, vec![receiver.handle()]);

    let mut buf = [0u8; 16];

    let n = receiver.recv(&mut buf).unwrap();

    assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);
}

#[test]
fn udp_send_error_leaves_line_open() {
    _ = pretty_env_logger::try_init();

    let mut receiver = udp_line();

    receiver.listen(0).unwrap();

    let port = receiver.local_addr().unwrap().port();

    let mut sender = udp_line();

    sender.connect("127.0.0.1", port).unwrap();

    // Larger than any datagram the stack will take.
    let oversized = vec![0u8; 100_000];

    let err = sender.send(&oversized).unwrap_err();

    assert!(matches!(err, Error::Io(_)), "got {:?}", err);

    // Per-datagram failure; the line is still usable.
    assert!(sender.active());

    assert_eq!(sender.send(&[9]).unwrap(), 1);

    assert!(readable_any(&[receiver.handle()], Duration::from_secs(1)).unwrap());
}

#[test]
fn udp_lines_cannot_accept() {
    _ = pretty_env_logger::try_init();

    let mut receiver = udp_line();

    receiver.listen(0).unwrap();

    let err = receiver.accept().unwrap_err();

    assert!(matches!(err, Error::Config(_)), "got {:?}", err);

    // The refusal is a configuration error, not an abort; the line
    // stays up.
    assert!(receiver.active());
}

#[test]
fn broadcast_mode_activates_unconnected() {
    _ = pretty_env_logger::try_init();

    let mut line = udp_line();

    line.connect_broadcast("255.255.255.255", 9999).unwrap();

    assert!(line.active());
    assert_eq!(line.peer_ip(), "0.0.0.0");

    // Whether the environment routes broadcast or not, the line must
    // survive the attempt.
    match line.send(b"ping") {
        Ok(_) | Err(Error::Io(_)) => {}
        Err(e) => panic!("unexpected error {:?}", e),
    }

    assert!(line.active());
}

#[test]
fn udp_ipv6_sends_unconnected() {
    _ = pretty_env_logger::try_init();

    let mut receiver = udp_line();

    if receiver.set_family(Family::V6).is_err() || receiver.listen(0).is_err() {
        eprintln!("no IPv6 stack available, skipping");
        return;
    }

    let port = receiver.local_addr().unwrap().port();

    assert_eq!(receiver.peer_ip(), "::");

    let mut sender = udp_line();

    sender.set_family(Family::V6).unwrap();

    if sender.connect("::1", port).is_err() {
        eprintln!("cannot reach ::1, skipping");
        return;
    }

    // IPv6 datagram lines stay unconnected and send to the resolved
    // peer each time.
    assert_eq!(sender.send(b"v6").unwrap(), 2);

    assert!(readable_any(&[receiver.handle()], Duration::from_secs(1)).unwrap());

    let mut buf = [0u8; 8];

    let n = receiver.recv(&mut buf).unwrap();

    assert_eq!(&buf[..n], b"v6");
}
