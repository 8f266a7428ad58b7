//! Bootstrap node configuration
//!
//! Well-known entry points for joining the compute network. Each address
//! carries the peer id of the node behind it.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::warn;

/// Default bootstrap nodes
///
/// Format: /ip4/<IP>/tcp/<PORT>/p2p/<PEER_ID> or /dns4/<HOST>/tcp/<PORT>/p2p/<PEER_ID>
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "/ip4/212.146.66.248/tcp/30080/p2p/16Uiu2HAmTC7cW9fb5ooFUupm6sAkcRJHHLGhiq2Bor8CzAAwFJCo",
    "/dns4/node1.oceanprotocol.com/tcp/9000/p2p/16Uiu2HAmLhRDqfufZiQnxvQs2XHhd6hwkLSPfjAQg1gH8wgRixiP",
    "/dns4/node2.oceanprotocol.com/tcp/9000/p2p/16Uiu2HAmHwzeVw7RpGopjZe6qNBJbzDDBdqtrSk7Gcx1emYsfgL4",
    "/dns4/node3.oceanprotocol.com/tcp/9000/p2p/16Uiu2HAmBKSeEP3v4tYEPsZsZv9VELinyMCsrVTJW9BvQeFXx28U",
    "/dns4/node4.oceanprotocol.com/tcp/9000/p2p/16Uiu2HAmSTVTArioKm2wVcyeASHYEsnx2ZNq467Z4GMDU4ErEPom",
];

/// The default list as full multiaddresses (peer id included).
pub fn default_bootstrap_addrs() -> Vec<Multiaddr> {
    DEFAULT_BOOTSTRAP_NODES
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Parse a comma separated list (as found in `BOOTSTRAP_NODES`). Malformed
/// entries are logged and skipped.
pub fn parse_bootstrap_list(list: &str) -> Vec<Multiaddr> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("Ignoring bootstrap address {:?}: {}", s, e);
                None
            }
        })
        .collect()
}

/// Split a bootstrap address into the peer id and the address to dial.
///
/// Returns `None` when the address has no `/p2p/<id>` component.
pub fn split_bootstrap_addr(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let peer_id = addr.iter().find_map(|proto| match proto {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })?;

    let dial_addr: Multiaddr = addr
        .iter()
        .filter(|proto| !matches!(proto, Protocol::P2p(_)))
        .collect();

    Some((peer_id, dial_addr))
}

/// Bootstrap peers grouped for dialing. Entries without a peer id are
/// dropped with a warning.
pub fn bootstrap_peers(addrs: &[Multiaddr]) -> Vec<(PeerId, Multiaddr)> {
    addrs
        .iter()
        .filter_map(|addr| {
            let split = split_bootstrap_addr(addr);
            if split.is_none() {
                warn!("Bootstrap address {} has no peer id, skipping", addr);
            }
            split
        })
        .collect()
}
