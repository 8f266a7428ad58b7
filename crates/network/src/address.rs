//! Address classification
//!
//! Pure helpers for reasoning about where a multiaddress points: loopback,
//! private (RFC 1918) or public hosts, circuit-relay hops, and the
//! `host:port` pair a multiaddress dials.
//!
//! Only loopback and the three RFC 1918 ranges count as private. Link-local,
//! CGNAT and the other reserved ranges are classified as public.

use std::fmt;
use std::net::IpAddr;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed multiaddress {input:?}: {reason}")]
    Malformed { input: String, reason: String },
}

/// Coarse reachability class of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Loopback,
    Private,
    Public,
}

/// `127.x.x.x`, `::1` (any zero-padded spelling) or `localhost`.
pub fn is_loopback(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    if let Some(rest) = host.strip_prefix("127.") {
        return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.');
    }
    match host.strip_suffix('1') {
        Some(prefix) => !prefix.is_empty() && prefix.chars().all(|c| c == '0' || c == ':'),
        None => false,
    }
}

/// Loopback, `10/8`, `172.16/12` or `192.168/16`.
pub fn is_private(host: &str) -> bool {
    if is_loopback(host) {
        return true;
    }
    let mut parts = host.split('.');
    let first = parts.next().unwrap_or_default();
    let second = parts.next();
    match first {
        "10" => true,
        "172" => second
            .and_then(|s| s.parse::<u8>().ok())
            .map_or(false, |octet| (16..=31).contains(&octet)),
        "192" => second == Some("168"),
        _ => false,
    }
}

pub fn classify(host: &str) -> AddressClass {
    if is_loopback(host) {
        AddressClass::Loopback
    } else if is_private(host) {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

/// One `/tag/value` component of a multiaddress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub tag: &'static str,
    /// Empty for value-less protocols such as `p2p-circuit` or `ws`.
    pub value: String,
}

fn segment_of(proto: &Protocol<'_>) -> Segment {
    let tag = proto.tag();
    let rendered = proto.to_string();
    let value = rendered
        .strip_prefix('/')
        .and_then(|s| s.strip_prefix(tag))
        .map(|s| s.trim_start_matches('/'))
        .unwrap_or_default()
        .to_string();
    Segment { tag, value }
}

/// Parse multiaddress text into its ordered segments. Never returns a
/// partial parse.
pub fn segments(input: &str) -> Result<Vec<Segment>, AddressError> {
    let addr = parse(input)?;
    Ok(segments_of(&addr))
}

pub fn segments_of(addr: &Multiaddr) -> Vec<Segment> {
    addr.iter().map(|p| segment_of(&p)).collect()
}

pub fn parse(input: &str) -> Result<Multiaddr, AddressError> {
    input.parse().map_err(|e: libp2p::multiaddr::Error| AddressError::Malformed {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Host part of a dialable address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Dns(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(ip) => write!(f, "{}", ip),
            Host::Dns(name) => f.write_str(name),
        }
    }
}

/// `host:port` of a multiaddress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: Host,
    pub port: u16,
}

/// Extract `host:port` from an address that starts with an IP or DNS
/// component followed by a TCP or UDP port. Anything else (bare
/// `/p2p/...`, `/p2p-circuit` first, missing port) yields `None`.
pub fn node_address(addr: &Multiaddr) -> Option<NodeAddress> {
    let mut iter = addr.iter();
    let host = match iter.next()? {
        Protocol::Ip4(ip) => Host::Ip(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Host::Ip(IpAddr::V6(ip)),
        Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) | Protocol::Dnsaddr(name) => {
            Host::Dns(name.to_string())
        }
        _ => return None,
    };
    let port = match iter.next()? {
        Protocol::Tcp(port) | Protocol::Udp(port) => port,
        _ => return None,
    };
    Some(NodeAddress { host, port })
}

/// Whether the address routes through a circuit relay.
pub fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Whether the address contains a `dns4`/`dns6` component.
pub fn has_dns(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Dns4(_) | Protocol::Dns6(_)))
}

/// Whether the address contains an `ip4`/`ip6` component.
pub fn has_ip(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Ip4(_) | Protocol::Ip6(_)))
}

/// Peer id of the relay in a `/.../p2p/<relay>/p2p-circuit/...` address.
pub fn relay_peer(addr: &Multiaddr) -> Option<PeerId> {
    let mut last_peer = None;
    for proto in addr.iter() {
        match proto {
            Protocol::P2p(peer) => last_peer = Some(peer),
            Protocol::P2pCircuit => return last_peer,
            _ => {}
        }
    }
    None
}

/// Trailing `/p2p/<id>` of an address, if any.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last()? {
        Protocol::P2p(peer) => Some(peer),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_loopback_forms() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("127.10.20.30"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("0:0:0:0:0:0:0:1"));
        assert!(is_loopback("localhost"));
        assert!(!is_loopback("128.0.0.1"));
        assert!(!is_loopback("127.evil.com"));
        assert!(!is_loopback("::"));
    }

    #[test]
    fn test_private_ranges() {
        assert!(is_private("10.1.2.3"));
        assert!(is_private("172.16.0.1"));
        assert!(is_private("172.31.255.255"));
        assert!(is_private("192.168.1.1"));
        assert!(is_private("127.0.0.1"));
        assert!(!is_private("172.15.0.1"));
        assert!(!is_private("172.32.0.1"));
        assert!(!is_private("192.169.0.1"));
        assert!(!is_private("203.0.113.5"));
    }

    #[test]
    fn test_link_local_is_not_private() {
        assert_eq!(classify("169.254.1.1"), AddressClass::Public);
        assert_eq!(classify("100.64.0.1"), AddressClass::Public);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("127.0.0.1"), AddressClass::Loopback);
        assert_eq!(classify("10.0.0.1"), AddressClass::Private);
        assert_eq!(classify("8.8.8.8"), AddressClass::Public);
    }

    #[test]
    fn test_segments_in_order() {
        let segs = segments("/ip4/203.0.113.5/tcp/9000/ws").unwrap();
        let pairs: Vec<_> = segs.iter().map(|s| (s.tag, s.value.as_str())).collect();
        assert_eq!(pairs, vec![("ip4", "203.0.113.5"), ("tcp", "9000"), ("ws", "")]);
    }

    #[test]
    fn test_segments_rejects_malformed() {
        assert!(segments("/ip4/999.0.0.1/tcp/1").is_err());
        assert!(segments("not a multiaddr").is_err());
        assert!(segments("/tcp").is_err());
    }

    #[test]
    fn test_node_address_ip_and_dns() {
        let addr: Multiaddr = "/ip4/203.0.113.5/tcp/9000".parse().unwrap();
        let na = node_address(&addr).unwrap();
        assert_eq!(na.host.to_string(), "203.0.113.5");
        assert_eq!(na.port, 9000);

        let addr: Multiaddr = "/dns4/node1.example.org/tcp/9001/ws".parse().unwrap();
        let na = node_address(&addr).unwrap();
        assert_eq!(na.host, Host::Dns("node1.example.org".to_string()));
        assert_eq!(na.port, 9001);
    }

    #[test]
    fn test_node_address_needs_port() {
        let addr: Multiaddr = "/ip4/203.0.113.5".parse().unwrap();
        assert!(node_address(&addr).is_none());
        let addr: Multiaddr = "/p2p-circuit".parse().unwrap();
        assert!(node_address(&addr).is_none());
    }

    #[test]
    fn test_relay_peer_extraction() {
        let relay = PeerId::random();
        let target = PeerId::random();
        let addr: Multiaddr = format!("/ip4/203.0.113.9/tcp/4001/p2p/{}/p2p-circuit/p2p/{}", relay, target)
            .parse()
            .unwrap();
        assert!(is_relayed(&addr));
        assert_eq!(relay_peer(&addr), Some(relay));
        assert_eq!(peer_id_of(&addr), Some(target));
    }

    proptest! {
        #[test]
        fn prop_rfc1918_is_private(b in 0u8..=255, c in 0u8..=255, d in 0u8..=255, second in 16u8..=31) {
            let ten = format!("10.{}.{}.{}", b, c, d);
            let one_seven_two = format!("172.{}.{}.{}", second, c, d);
            let one_nine_two = format!("192.168.{}.{}", c, d);
            prop_assert!(is_private(&ten));
            prop_assert!(is_private(&one_seven_two));
            prop_assert!(is_private(&one_nine_two));
        }

        #[test]
        fn prop_loopback_implies_private(b in 0u8..=255, c in 0u8..=255, d in 0u8..=255) {
            let host = format!("127.{}.{}.{}", b, c, d);
            prop_assert!(is_loopback(&host));
            prop_assert!(is_private(&host));
        }
    }
}
