//! Peer health checks
//!
//! One check walks a fixed sequence of stages and stops at the first
//! failure:
//!
//! ```text
//! ResolvingPeerId -> GatheringAddresses -> ResolvingPublicAddress -> Probing
//! ```
//!
//! A failed check is ordinary output (`succeeded == false` with a cause),
//! never an error.

use std::fmt;
use std::time::{Duration, Instant};

use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::address;
use crate::node::{PeerDirectory, StreamDialer};
use crate::protocol::{encode_request, FrameHead, StatusFrame, CHUNK_SIZE};
use crate::resolver::{DnsResolver, NodeAddressResolver, NodeAddressResult};
use crate::stream_client::{StreamClientConfig, StreamProtocolClient};

/// Give up waiting for a complete status frame past this many bytes.
const MAX_STATUS_FRAME: usize = CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStage {
    ResolvingPeerId,
    GatheringAddresses,
    ResolvingPublicAddress,
    Probing,
}

/// Why a peer is not eligible
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    InvalidPeer,
    NoPeerData,
    NoPublicIp,
    /// The status probe failed; carries the error reported by the exchange.
    Probe(String),
}

impl FailureCause {
    pub fn stage(&self) -> CheckStage {
        match self {
            FailureCause::InvalidPeer => CheckStage::ResolvingPeerId,
            FailureCause::NoPeerData => CheckStage::GatheringAddresses,
            FailureCause::NoPublicIp => CheckStage::ResolvingPublicAddress,
            FailureCause::Probe(_) => CheckStage::Probing,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::InvalidPeer => f.write_str("invalid peer"),
            FailureCause::NoPeerData => f.write_str("no peer data"),
            FailureCause::NoPublicIp => f.write_str("no public IP"),
            FailureCause::Probe(error) => f.write_str(error),
        }
    }
}

impl Serialize for FailureCause {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of one health check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub peer_id: String,
    pub address: NodeAddressResult,
    pub succeeded: bool,
    #[serde(rename = "errorCause")]
    pub cause: Option<FailureCause>,
    /// Status payload returned by the peer (text after the status frame)
    pub status: Option<String>,
    /// Measured duration of this check
    pub elapsed_ms: u64,
    /// Audit window supplied by the caller, carried through unchanged
    pub delta_time_ms: u64,
}

impl HealthCheckResult {
    pub fn error_cause(&self) -> Option<String> {
        self.cause.as_ref().map(ToString::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Bound on the local peer store lookup
    pub peer_store_timeout: Duration,
    /// Bound on the DHT lookup
    pub find_peer_timeout: Duration,
    pub client: StreamClientConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            peer_store_timeout: Duration::from_secs(2),
            find_peer_timeout: Duration::from_secs(5),
            client: StreamClientConfig::default(),
        }
    }
}

pub struct PeerHealthChecker<N, R> {
    client: StreamProtocolClient<N>,
    resolver: NodeAddressResolver<R>,
    config: HealthCheckConfig,
    recorder: Option<mpsc::UnboundedSender<HealthCheckResult>>,
}

impl<N, R> PeerHealthChecker<N, R>
where
    N: PeerDirectory + StreamDialer,
    R: DnsResolver,
{
    pub fn new(node: N, dns: R, config: HealthCheckConfig) -> Self {
        Self {
            client: StreamProtocolClient::new(node, config.client.clone()),
            resolver: NodeAddressResolver::new(dns),
            config,
            recorder: None,
        }
    }

    /// Every result is also pushed to `recorder` (fire-and-forget).
    pub fn with_recorder(mut self, recorder: mpsc::UnboundedSender<HealthCheckResult>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    fn directory(&self) -> &N {
        self.client.dialer()
    }

    /// Check one peer. `known` addresses, when given, are used verbatim.
    pub async fn check_peer(&self, peer: &str, known: &[Multiaddr], delta_time: Duration) -> HealthCheckResult {
        let started = Instant::now();
        let mut address = NodeAddressResult::unresolved();

        let outcome = self.run_stages(peer, known, &mut address).await;
        let (succeeded, cause, status) = match outcome {
            Ok(status) => (true, None, Some(status)),
            Err(cause) => (false, Some(cause), None),
        };

        let result = HealthCheckResult {
            peer_id: peer.to_string(),
            address,
            succeeded,
            cause,
            status,
            elapsed_ms: started.elapsed().as_millis() as u64,
            delta_time_ms: delta_time.as_millis() as u64,
        };

        let ips = serde_json::to_string(&result.address).unwrap_or_default();
        match &result.cause {
            None => info!("Eligible     {}:  IPs:{}", peer, ips),
            Some(cause) => info!("Not eligible {}:  IPs:{}  cause:{}", peer, ips, cause),
        }

        if let Some(recorder) = &self.recorder {
            let _ = recorder.send(result.clone());
        }
        result
    }

    async fn run_stages(
        &self,
        peer: &str,
        known: &[Multiaddr],
        address: &mut NodeAddressResult,
    ) -> Result<String, FailureCause> {
        let peer_id: PeerId = peer.parse().map_err(|_| FailureCause::InvalidPeer)?;

        let candidates = self.gather_addresses(&peer_id, known).await;
        if candidates.is_empty() {
            return Err(FailureCause::NoPeerData);
        }

        *address = self.resolver.resolve(&candidates).await;
        if !address.is_resolved() {
            return Err(FailureCause::NoPublicIp);
        }

        let dial_addrs = normalize_dial_addrs(&peer_id, &candidates);
        debug!("Probing {} via {} addresses", peer_id, dial_addrs.len());
        self.probe(peer_id, &dial_addrs).await
    }

    async fn gather_addresses(&self, peer: &PeerId, known: &[Multiaddr]) -> Vec<Multiaddr> {
        if !known.is_empty() {
            return known.to_vec();
        }

        let mut addrs = tokio::time::timeout(self.config.peer_store_timeout, self.directory().peer_addresses(peer))
            .await
            .unwrap_or_default();
        if addrs.is_empty() {
            for addr in self.directory().find_peer(peer, self.config.find_peer_timeout).await {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        addrs
    }

    /// Send `status` and judge the reply. The status frame may span
    /// several reads and is buffered until complete; payload after it is
    /// concatenated into the returned text.
    async fn probe(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<String, FailureCause> {
        let request = encode_request("status", &peer.to_string(), None, None)
            .map_err(|e| FailureCause::Probe(e.to_string()))?;

        let mut first: Option<StatusFrame> = None;
        let mut head: Option<Vec<u8>> = Some(Vec::new());
        let mut payload = Vec::new();
        let result = self
            .client
            .send_to(peer, addrs, &request, |chunk| {
                let Some(buf) = head.as_mut() else {
                    payload.extend_from_slice(chunk);
                    return;
                };
                buf.extend_from_slice(chunk);
                match StatusFrame::parse_head(&buf[..]) {
                    FrameHead::Frame(frame, rest) => {
                        first = Some(frame);
                        payload.extend_from_slice(rest);
                    }
                    FrameHead::Incomplete if buf.len() <= MAX_STATUS_FRAME => return,
                    FrameHead::NotStatus | FrameHead::Incomplete => payload.extend_from_slice(&buf[..]),
                }
                head = None;
            })
            .await;

        if let Err(e) = result {
            return Err(FailureCause::Probe(e.to_string()));
        }
        if let Some(unfinished) = head {
            payload.extend_from_slice(&unfinished);
        }
        match first {
            Some(frame) if frame.is_error() => Err(FailureCause::Probe(
                frame
                    .error
                    .unwrap_or_else(|| format!("HTTP {}", frame.http_status)),
            )),
            _ => Ok(String::from_utf8_lossy(&payload).into_owned()),
        }
    }

    /// Check every peer in the local store, at most `concurrency` at a
    /// time. Results come back in completion order.
    pub async fn check_known_peers(&self, concurrency: usize, delta_time: Duration) -> Vec<HealthCheckResult> {
        let peers = self.directory().known_peers().await;
        debug!("Auditing {} known peers", peers.len());
        futures::stream::iter(peers)
            .map(|peer| async move { self.check_peer(&peer.to_string(), &[], delta_time).await })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

/// Make the dial set uniform: either every address names the peer or none
/// does. Circuit addresses that do not name it get `/p2p/<peer>` appended.
/// The partition with the peer id wins only when strictly larger.
pub fn normalize_dial_addrs(peer: &PeerId, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    let needle = peer.to_string();
    let (with_id, without_id): (Vec<_>, Vec<_>) = addrs
        .iter()
        .cloned()
        .partition(|addr| addr.to_string().contains(&needle));

    let without_id: Vec<Multiaddr> = without_id
        .into_iter()
        .map(|addr| {
            if address::is_relayed(&addr) {
                addr.with(Protocol::P2p(*peer))
            } else {
                addr
            }
        })
        .collect();

    if with_id.len() > without_id.len() {
        with_id
    } else {
        without_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_failure_cause_text() {
        assert_eq!(FailureCause::InvalidPeer.to_string(), "invalid peer");
        assert_eq!(FailureCause::NoPeerData.to_string(), "no peer data");
        assert_eq!(FailureCause::NoPublicIp.to_string(), "no public IP");
        assert_eq!(FailureCause::Probe("boom".into()).stage(), CheckStage::Probing);
    }

    #[test]
    fn test_normalize_prefers_majority_with_id() {
        let peer = PeerId::random();
        let addrs = vec![
            ma(&format!("/ip4/203.0.113.5/tcp/9000/p2p/{}", peer)),
            ma(&format!("/ip4/203.0.113.5/tcp/9001/ws/p2p/{}", peer)),
            ma("/ip4/198.51.100.2/tcp/9000"),
        ];
        let out = normalize_dial_addrs(&peer, &addrs);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|a| a.to_string().contains(&peer.to_string())));
    }

    #[test]
    fn test_normalize_tie_goes_to_without_id() {
        let peer = PeerId::random();
        let addrs = vec![
            ma(&format!("/ip4/203.0.113.5/tcp/9000/p2p/{}", peer)),
            ma("/ip4/198.51.100.2/tcp/9000"),
        ];
        assert_eq!(normalize_dial_addrs(&peer, &addrs), vec![ma("/ip4/198.51.100.2/tcp/9000")]);
    }

    #[test]
    fn test_normalize_appends_peer_to_circuit() {
        let peer = PeerId::random();
        let relay = PeerId::random();
        let circuit = ma(&format!("/ip4/203.0.113.9/tcp/4001/p2p/{}/p2p-circuit", relay));
        let out = normalize_dial_addrs(&peer, &[circuit.clone()]);
        assert_eq!(out, vec![circuit.with(Protocol::P2p(peer))]);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = HealthCheckResult {
            peer_id: "peer".into(),
            address: NodeAddressResult::unresolved(),
            succeeded: false,
            cause: Some(FailureCause::NoPeerData),
            status: None,
            elapsed_ms: 3,
            delta_time_ms: 60_000,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["peerId"], "peer");
        assert_eq!(json["errorCause"], "no peer data");
        assert_eq!(json["deltaTimeMs"], 60_000);
        assert_eq!(json["address"]["isRelay"], false);
    }
}
