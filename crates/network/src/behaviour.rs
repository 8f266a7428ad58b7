//! Network behaviour for the transport node
//!
//! Combines connection limits, Kademlia DHT, Identify, Ping, mDNS, relay
//! client, DCUtR and raw protocol streams.

use std::io;

use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{
    connection_limits::{self, ConnectionLimits},
    dcutr, identify, identity::Keypair, kad, mdns, ping, relay, Multiaddr, PeerId,
    StreamProtocol,
};

use crate::config::TransportNodeConfig;

/// Kademlia protocol name shared by every node of the network
pub const KADEMLIA_PROTOCOL: StreamProtocol = StreamProtocol::new("/ocean/nodes/1.0.0/kad/1.0.0");

/// Identify protocol version
pub const IDENTIFY_PROTOCOL_VERSION: &str = "ipfs/0.1.0";

pub fn agent_version() -> String {
    format!("tidewatch/{}", env!("CARGO_PKG_VERSION"))
}

/// Combined network behaviour. The derive generates `NodeBehaviourEvent`.
#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub limits: connection_limits::Behaviour,
    /// Disabled for client-only nodes
    pub kademlia: Toggle<kad::Behaviour<kad::store::MemoryStore>>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    /// Raw streams for the command protocol
    pub stream: libp2p_stream::Behaviour,
}

impl NodeBehaviour {
    /// Build the behaviour around the relay client handed out by the swarm
    /// builder. Fails only if the mDNS socket cannot be created.
    pub fn new(
        keypair: &Keypair,
        relay_client: relay::client::Behaviour,
        config: &TransportNodeConfig,
    ) -> io::Result<Self> {
        let local_peer_id = PeerId::from(keypair.public());

        let limits = connection_limits::Behaviour::new(
            ConnectionLimits::default()
                .with_max_established(Some(config.max_connections))
                .with_max_pending_outgoing(Some(config.max_parallel_dials)),
        );

        let kademlia = config.dht_enabled.then(|| {
            let mut kad_config = kad::Config::new(KADEMLIA_PROTOCOL);
            kad_config.set_query_timeout(config.dht_query_timeout);
            let store = kad::store::MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
            kademlia.set_mode(Some(kad::Mode::Server));
            kademlia
        });

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_string(), keypair.public())
                .with_agent_version(agent_version()),
        );

        let mdns = if config.mdns_enabled {
            let mdns_config = mdns::Config {
                query_interval: config.mdns_interval,
                ..Default::default()
            };
            Some(mdns::tokio::Behaviour::new(mdns_config, local_peer_id)?)
        } else {
            None
        };

        Ok(Self {
            limits,
            kademlia: Toggle::from(kademlia),
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            mdns: Toggle::from(mdns),
            relay_client,
            dcutr: dcutr::Behaviour::new(local_peer_id),
            stream: libp2p_stream::Behaviour::new(),
        })
    }

    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.stream.new_control()
    }

    /// Add a known peer address to the routing table (no-op without DHT).
    pub fn add_address(&mut self, peer_id: &PeerId, addr: Multiaddr) {
        if let Some(kad) = self.kademlia.as_mut() {
            kad.add_address(peer_id, addr);
        }
    }

    /// Start a DHT lookup for `peer_id`. `None` when the DHT is disabled.
    pub fn find_closest(&mut self, peer_id: PeerId) -> Option<kad::QueryId> {
        self.kademlia.as_mut().map(|kad| kad.get_closest_peers(peer_id))
    }

    /// Refresh the routing table. `None` when the DHT is disabled or empty.
    pub fn bootstrap(&mut self) -> Option<kad::QueryId> {
        self.kademlia.as_mut().and_then(|kad| kad.bootstrap().ok())
    }
}
