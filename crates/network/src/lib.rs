//! Tidewatch Network
//!
//! libp2p node management for a decentralized compute network.
//!
//! ## Features
//!
//! - Address classification and public address resolution for remote peers
//! - Self-address announcement policy (loopback, private, CIDR denylist)
//! - Transport node: TCP/WebSocket, Noise, Yamux, Kademlia, mDNS, relay client
//! - Request/response over raw protocol streams with dial retries
//! - Peer health checks and audits
//! - Gateway command relay to compute nodes

pub mod address;
mod announce;
mod behaviour;
mod bootstrap;
mod config;
mod gateway;
mod health;
mod node;
mod protocol;
mod resolver;
mod responder;
mod stream_client;

pub use address::{AddressClass, AddressError, Host, NodeAddress, Segment};
pub use announce::{should_announce, AnnounceDecision, AnnounceFilter, DenyReason};
pub use behaviour::{agent_version, NodeBehaviour, NodeBehaviourEvent, KADEMLIA_PROTOCOL};
pub use bootstrap::{
    bootstrap_peers, default_bootstrap_addrs, parse_bootstrap_list, split_bootstrap_addr,
    DEFAULT_BOOTSTRAP_NODES,
};
pub use config::TransportNodeConfig;
pub use gateway::{
    start_gateway_client, GatewayClient, GatewayConfig, GatewayError, GatewayReply,
    GatewayResponse, RemoteErrorKind, ResponseStream, DEFAULT_GATEWAY_ADDRESS,
};
pub use health::{
    normalize_dial_addrs, CheckStage, FailureCause, HealthCheckConfig, HealthCheckResult,
    PeerHealthChecker,
};
pub use node::{
    BoxedStream, DialError, NetworkError, NetworkStats, NodeHandle, PeerDirectory,
    ProtocolStream, StreamDialer, TransportNode,
};
pub use protocol::{
    encode_request, read_chunk, Command, CommandRequest, FrameHead, NodeStatus, StatusFrame, CHUNK_SIZE,
    PROTOCOL_ID,
};
pub use resolver::{DnsResolver, NodeAddressResolver, NodeAddressResult, SystemResolver};
pub use responder::{respond, serve_status, ResponderInfo};
pub use stream_client::{
    exchange_status, SendError, StreamClientConfig, StreamProtocolClient, DIAL_RETRIES_ENV,
};

// Re-export commonly used libp2p types
pub use libp2p::{identity::Keypair, Multiaddr, PeerId, StreamProtocol};
