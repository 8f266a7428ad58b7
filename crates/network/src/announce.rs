//! Announce filter
//!
//! Decides which of the node's own addresses are advertised to the
//! network. Rules apply in order and the first match decides:
//!
//! 1. loopback → denied
//! 2. inside an operator denylist CIDR → denied
//! 3. private while private announcing is off → denied
//! 4. otherwise → allowed
//!
//! Addresses without a literal IP (circuit-relay hops, DNS names) cannot be
//! judged and are announced anyway: blocking them would silently take the
//! node off the discovery layer.

use std::net::IpAddr;

use ipnet::IpNet;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;

use crate::address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Loopback,
    Denylisted,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceDecision {
    Allowed,
    Denied(DenyReason),
    /// No literal IP to classify; announced.
    Unclassifiable,
}

impl AnnounceDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, AnnounceDecision::Denied(_))
    }
}

/// Operator policy for self-address announcement.
#[derive(Debug, Clone, Default)]
pub struct AnnounceFilter {
    denylist: Vec<IpNet>,
    allow_private: bool,
}

impl AnnounceFilter {
    pub fn new(denylist: Vec<IpNet>, allow_private: bool) -> Self {
        Self {
            denylist,
            allow_private,
        }
    }

    pub fn decide(&self, addr: &Multiaddr) -> AnnounceDecision {
        let Some(ip) = leading_ip(addr) else {
            return AnnounceDecision::Unclassifiable;
        };
        let host = ip.to_string();
        if address::is_loopback(&host) || ip.is_loopback() {
            return AnnounceDecision::Denied(DenyReason::Loopback);
        }
        if self.denylist.iter().any(|net| net.contains(&ip)) {
            return AnnounceDecision::Denied(DenyReason::Denylisted);
        }
        if !self.allow_private && address::is_private(&host) {
            return AnnounceDecision::Denied(DenyReason::Private);
        }
        AnnounceDecision::Allowed
    }

    pub fn should_announce(&self, addr: &Multiaddr) -> bool {
        self.decide(addr).is_allowed()
    }

    /// Keep only the addresses this policy announces.
    pub fn filter<'a, I>(&self, addrs: I) -> Vec<Multiaddr>
    where
        I: IntoIterator<Item = &'a Multiaddr>,
    {
        addrs
            .into_iter()
            .filter(|a| self.should_announce(a))
            .cloned()
            .collect()
    }
}

/// Standalone form of [`AnnounceFilter::should_announce`].
pub fn should_announce(addr: &Multiaddr, denylist: &[IpNet], allow_private: bool) -> bool {
    AnnounceFilter::new(denylist.to_vec(), allow_private).should_announce(addr)
}

/// The IP of an address that begins with `/ip4` or `/ip6`.
fn leading_ip(addr: &Multiaddr) -> Option<IpAddr> {
    match addr.iter().next()? {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    }
}
