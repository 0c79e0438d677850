//! Textual IP helpers: IPv6 validation and canonicalisation, link-local
//! and broadcast detection, and printable addresses out of raw sockaddr
//! storage.

use std::net::{Ipv4Addr, Ipv6Addr};

use os_socketaddr::OsSocketAddr;

use crate::error::{Error, Result};

/// Split an IPv6 literal into the bare address and an optional
/// `%zone` suffix.
pub fn split_zone(s: &str) -> (&str, Option<&str>) {
    match s.split_once('%') {
        Some((ip, zone)) => (ip, Some(zone)),
        None => (s, None),
    }
}

/// Whether `s` is a syntactically valid textual IPv6 address, with or
/// without a `%zone` suffix. Purely lexical; no name resolution.
pub fn is_ipv6(s: &str) -> bool {
    let (ip, zone) = split_zone(s);

    if let Some(zone) = zone {
        if zone.is_empty() {
            return false;
        }
    }

    ip.parse::<Ipv6Addr>().is_ok()
}

/// Canonical form of an IPv6 literal: hex lowercased, leading zeros
/// dropped, the longest zero run collapsed to `::`. A `%zone` suffix is
/// preserved verbatim. Anything that is not IPv6 comes back unchanged.
pub fn normalize(s: &str) -> String {
    if !is_ipv6(s) {
        return s.to_string();
    }

    let (ip, zone) = split_zone(s);

    // Infallible after the validity check above.
    let canonical = match ip.parse::<Ipv6Addr>() {
        Ok(addr) => addr.to_string(),
        Err(_) => return s.to_string(),
    };

    match zone {
        Some(zone) => format!("{}%{}", canonical, zone),
        None => canonical,
    }
}

/// Whether `s` is an IPv6 address in `fe80::/10`.
pub fn is_link_local(s: &str) -> bool {
    let (ip, _) = split_zone(s);

    match ip.parse::<Ipv6Addr>() {
        Ok(addr) => (addr.segments()[0] & 0xffc0) == 0xfe80,
        Err(_) => false,
    }
}

/// Whether `s` is an IPv4 broadcast-style literal: the limited
/// broadcast, the any-address, or a final octet of 255.
pub fn is_broadcast(s: &str) -> bool {
    match s.parse::<Ipv4Addr>() {
        Ok(ip) => ip.is_broadcast() || ip.is_unspecified() || ip.octets()[3] == 255,
        Err(_) => false,
    }
}

/// Extract the printable IP from a raw sockaddr storage blob, as
/// captured by `accept`/`recvfrom`.
pub fn ip_from_sockaddr(storage: &[u8]) -> Result<String> {
    let addr = unsafe {
        OsSocketAddr::copy_from_raw(storage.as_ptr() as *const _, storage.len() as _)
    };

    match addr.into_addr() {
        Some(addr) => Ok(addr.ip().to_string()),
        None => Err(Error::Address {
            addr: format!("<{} byte sockaddr>", storage.len()),
            reason: "unknown address family",
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    #[test]
    fn ipv6_validity() {
        assert!(is_ipv6("::1"));
        assert!(is_ipv6("fe80::1%eth0"));
        assert!(is_ipv6("FE80::0001%eth0"));
        assert!(is_ipv6("2001:db8::8a2e:370:7334"));
        assert!(is_ipv6("::ffff:192.0.2.1"));

        assert!(!is_ipv6("fe80::1%"));
        assert!(!is_ipv6("192.168.1.1"));
        assert!(!is_ipv6("host.example"));
        assert!(!is_ipv6("fe80::1::2"));
        assert!(!is_ipv6(""));
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize("FE80::0001%eth0"), "fe80::1%eth0");
        assert_eq!(normalize("2001:0DB8:0000:0000:0000:0000:0000:0001"), "2001:db8::1");
        assert_eq!(normalize("::1"), "::1");

        // Non-IPv6 input passes through untouched.
        assert_eq!(normalize("192.168.1.1"), "192.168.1.1");
        assert_eq!(normalize("not-an-address"), "not-an-address");
    }

    #[test]
    fn normalization_is_idempotent() {
        for s in [
            "FE80::0001%eth0",
            "2001:0db8::0:1",
            "::",
            "::ffff:10.0.0.1",
            "garbage",
            "10.1.2.3",
        ] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "normalize({:?}) not idempotent", s);
        }
    }

    #[test]
    fn normalization_preserves_validity() {
        for s in ["FE80::1%en0", "::1", "1:2:3:4:5:6:7:8", "bogus", "1.2.3.4", "fe80::1%"] {
            assert_eq!(is_ipv6(&normalize(s)), is_ipv6(s), "validity changed for {:?}", s);
        }
    }

    #[test]
    fn link_local() {
        assert!(is_link_local("fe80::1"));
        assert!(is_link_local("fe80::0001%eth0"));
        assert!(is_link_local("febf::1"));

        assert!(!is_link_local("fec0::1"));
        assert!(!is_link_local("2001:db8::1"));
        assert!(!is_link_local("127.0.0.1"));
    }

    #[test]
    fn broadcast_detection() {
        assert!(is_broadcast("255.255.255.255"));
        assert!(is_broadcast("192.168.1.255"));
        assert!(is_broadcast("0.0.0.0"));

        assert!(!is_broadcast("192.168.1.1"));
        assert!(!is_broadcast("::"));
        assert!(!is_broadcast("broadcast"));
    }

    #[test]
    fn printable_ip_from_storage() {
        let addr: SocketAddr = "93.184.216.34:80".parse().unwrap();
        let raw = OsSocketAddr::from(addr);
        let blob = unsafe {
            std::slice::from_raw_parts(raw.as_ptr() as *const u8, raw.len() as usize)
        };

        assert_eq!(ip_from_sockaddr(blob).unwrap(), "93.184.216.34");

        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let raw = OsSocketAddr::from(addr);
        let blob = unsafe {
            std::slice::from_raw_parts(raw.as_ptr() as *const u8, raw.len() as usize)
        };

        assert_eq!(ip_from_sockaddr(blob).unwrap(), "2001:db8::1");

        // A family no socket call hands out.
        assert!(ip_from_sockaddr(&[0xffu8; 16]).is_err());
    }
}
