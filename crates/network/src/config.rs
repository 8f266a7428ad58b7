//! Transport node configuration
//!
//! Loaded once at startup (defaults, optionally overlaid by a JSON file)
//! and never changed for the lifetime of the node.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use ipnet::IpNet;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use crate::bootstrap::default_bootstrap_addrs;

/// Durations are written as integer milliseconds in config files.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportNodeConfig {
    /// Multiaddresses (with `/p2p/<id>`) dialled at start and whenever the
    /// node falls under `min_connections`.
    pub bootstrap_nodes: Vec<Multiaddr>,

    pub enable_ipv4: bool,
    pub ipv4_bind_address: Ipv4Addr,
    pub ipv4_tcp_port: u16,
    pub ipv4_ws_port: Option<u16>,
    pub enable_ipv6: bool,
    pub ipv6_bind_address: Ipv6Addr,
    pub ipv6_tcp_port: u16,
    pub ipv6_ws_port: Option<u16>,

    pub mdns_enabled: bool,
    #[serde(with = "duration_ms")]
    pub mdns_interval: Duration,

    pub dht_enabled: bool,
    pub dht_max_inbound_streams: usize,
    pub dht_max_outbound_streams: usize,
    #[serde(with = "duration_ms")]
    pub dht_query_timeout: Duration,

    pub min_connections: usize,
    pub max_connections: u32,
    pub max_parallel_dials: u32,
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub autodial_interval: Duration,
    #[serde(with = "duration_ms")]
    pub idle_connection_timeout: Duration,

    /// Extra addresses to announce (still subject to the announce filter).
    pub announce_addresses: Vec<Multiaddr>,
    /// Never announce addresses inside these networks.
    pub filter_announced_addresses: Vec<IpNet>,
    pub announce_private_ip: bool,

    /// Answer `status` commands on the command protocol.
    pub serve_status: bool,
}

impl Default for TransportNodeConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: default_bootstrap_addrs(),
            enable_ipv4: true,
            ipv4_bind_address: Ipv4Addr::UNSPECIFIED,
            ipv4_tcp_port: 0,
            ipv4_ws_port: Some(9001),
            enable_ipv6: false,
            ipv6_bind_address: Ipv6Addr::LOCALHOST,
            ipv6_tcp_port: 9002,
            ipv6_ws_port: Some(9003),
            mdns_enabled: true,
            mdns_interval: Duration::from_secs(20),
            dht_enabled: true,
            dht_max_inbound_streams: 500,
            dht_max_outbound_streams: 500,
            dht_query_timeout: Duration::from_secs(60),
            min_connections: 2,
            max_connections: 6000,
            max_parallel_dials: 2500,
            dial_timeout: Duration::from_secs(30),
            autodial_interval: Duration::from_secs(5),
            idle_connection_timeout: Duration::from_secs(60),
            announce_addresses: Vec::new(),
            filter_announced_addresses: vec!["172.15.0.0/24".parse().expect("valid hardcoded CIDR")],
            announce_private_ip: false,
            serve_status: true,
        }
    }
}

impl TransportNodeConfig {
    /// Outbound-only node: no listeners, no discovery, no responder. Used
    /// for relaying commands through a single well-known peer.
    pub fn client_only(bootstrap_nodes: Vec<Multiaddr>) -> Self {
        Self {
            bootstrap_nodes,
            enable_ipv4: false,
            enable_ipv6: false,
            mdns_enabled: false,
            dht_enabled: false,
            min_connections: 1,
            max_connections: 100,
            serve_status: false,
            ..Self::default()
        }
    }

    /// Loopback-only node on an ephemeral TCP port with discovery off.
    pub fn local(serve_status: bool) -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            ipv4_bind_address: Ipv4Addr::LOCALHOST,
            ipv4_ws_port: None,
            mdns_enabled: false,
            min_connections: 0,
            serve_status,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Bind multiaddresses for the enabled IP families.
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        let mut addrs = Vec::new();
        if self.enable_ipv4 {
            addrs.push(
                format!("/ip4/{}/tcp/{}", self.ipv4_bind_address, self.ipv4_tcp_port)
                    .parse()
                    .expect("ip4/tcp multiaddr from typed parts"),
            );
            if let Some(ws) = self.ipv4_ws_port {
                addrs.push(
                    format!("/ip4/{}/tcp/{}/ws", self.ipv4_bind_address, ws)
                        .parse()
                        .expect("ip4/tcp/ws multiaddr from typed parts"),
                );
            }
        }
        if self.enable_ipv6 {
            addrs.push(
                format!("/ip6/{}/tcp/{}", self.ipv6_bind_address, self.ipv6_tcp_port)
                    .parse()
                    .expect("ip6/tcp multiaddr from typed parts"),
            );
            if let Some(ws) = self.ipv6_ws_port {
                addrs.push(
                    format!("/ip6/{}/tcp/{}/ws", self.ipv6_bind_address, ws)
                        .parse()
                        .expect("ip6/tcp/ws multiaddr from typed parts"),
                );
            }
        }
        addrs
    }
}
