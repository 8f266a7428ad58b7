//! Public address resolution for remote peers
//!
//! Given the candidate multiaddresses known for a peer, pick the one public
//! endpoint that identifies it. Three passes run in strict order and the
//! first hit wins:
//!
//! 1. DNS candidates that resolve to a public IP (hostname is kept),
//! 2. literal public IPs,
//! 3. circuit-relay candidates (flagged as relay-only).
//!
//! Relay candidates are skipped by the first two passes. A candidate that
//! fails to resolve or has no usable `host:port` is skipped, never fatal.

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use libp2p::Multiaddr;
use serde::Serialize;
use tracing::{debug, trace};

use crate::address::{self, Host};

/// Hostname resolution seam.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolve a hostname to one IP address.
    async fn resolve(&self, host: &str) -> io::Result<IpAddr>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        tokio::net::lookup_host((host, 0))
            .await?
            .next()
            .map(|sock| sock.ip())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))
    }
}

/// Outcome of public address resolution.
///
/// A resolved result has either `resolved_ip` set or `is_relay == true`.
/// When neither holds the peer has no public address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddressResult {
    pub resolved_ip: Option<String>,
    pub resolved_dns: Option<String>,
    pub port: u16,
    pub is_relay: bool,
    pub relay_peer_id: Option<String>,
}

impl NodeAddressResult {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_ip.is_some() || self.is_relay
    }

    fn direct(ip: String, dns: Option<String>, port: u16) -> Self {
        Self {
            resolved_ip: Some(ip),
            resolved_dns: dns,
            port,
            is_relay: false,
            relay_peer_id: None,
        }
    }
}

/// Picks the best publicly reachable address out of a candidate list.
#[derive(Debug, Clone, Default)]
pub struct NodeAddressResolver<R> {
    dns: R,
}

impl<R: DnsResolver> NodeAddressResolver<R> {
    pub fn new(dns: R) -> Self {
        Self { dns }
    }

    pub async fn resolve(&self, candidates: &[Multiaddr]) -> NodeAddressResult {
        if let Some(found) = self.dns_pass(candidates).await {
            return found;
        }
        if let Some(found) = direct_ip_pass(candidates) {
            return found;
        }
        if let Some(found) = relay_pass(candidates) {
            return found;
        }
        debug!("No public address among {} candidates", candidates.len());
        NodeAddressResult::unresolved()
    }

    async fn dns_pass(&self, candidates: &[Multiaddr]) -> Option<NodeAddressResult> {
        for candidate in candidates {
            if address::is_relayed(candidate) || !address::has_dns(candidate) {
                continue;
            }
            let Some(node) = address::node_address(candidate) else {
                trace!("Skipping {}: no host:port", candidate);
                continue;
            };
            let Host::Dns(hostname) = node.host else {
                continue;
            };
            match self.dns.resolve(&hostname).await {
                Ok(ip) => {
                    let ip = ip.to_string();
                    if address::is_private(&ip) {
                        trace!("{} resolves to non-public {}", hostname, ip);
                        continue;
                    }
                    return Some(NodeAddressResult::direct(ip, Some(hostname), node.port));
                }
                Err(e) => {
                    debug!("DNS lookup for {} failed: {}", hostname, e);
                }
            }
        }
        None
    }
}

fn direct_ip_pass(candidates: &[Multiaddr]) -> Option<NodeAddressResult> {
    candidates
        .iter()
        .filter(|c| !address::is_relayed(c) && address::has_ip(c))
        .filter_map(address::node_address)
        .find_map(|node| match node.host {
            Host::Ip(ip) if !address::is_private(&ip.to_string()) => {
                Some(NodeAddressResult::direct(ip.to_string(), None, node.port))
            }
            _ => None,
        })
}

fn relay_pass(candidates: &[Multiaddr]) -> Option<NodeAddressResult> {
    let candidate = candidates.iter().find(|c| address::is_relayed(c))?;
    let node = address::node_address(candidate);
    let relay_peer_id = address::relay_peer(candidate)
        .map(|peer| peer.to_string())
        .or_else(|| node.as_ref().map(|n| n.host.to_string()));
    Some(NodeAddressResult {
        resolved_ip: None,
        resolved_dns: None,
        port: node.map_or(0, |n| n.port),
        is_relay: true,
        relay_peer_id,
    })
}
