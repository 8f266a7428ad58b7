//! Transport node
//!
//! Owns the libp2p swarm. The swarm is driven by a single background task;
//! everything else talks to it through a cloneable [`NodeHandle`] that sends
//! commands over a channel and awaits a oneshot reply. Raw protocol streams
//! bypass the driver and go straight through the `libp2p_stream` control.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, StreamExt};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::core::transport::{ListenerId, TransportError};
use libp2p::core::ConnectedPoint;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::SwarmEvent;
use libp2p::{
    identify, identity::Keypair, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId,
    StreamProtocol, Swarm, SwarmBuilder,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::announce::AnnounceFilter;
use crate::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use crate::bootstrap::bootstrap_peers;
use crate::config::TransportNodeConfig;
use crate::protocol::PROTOCOL_ID;
use crate::responder::{self, ResponderInfo};

/// Addresses remembered per peer; older entries are evicted first.
const MAX_ADDRS_PER_PEER: usize = 32;

const COMMAND_CHANNEL_SIZE: usize = 256;

/// Bound on every listener reporting its first address at startup.
const LISTEN_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Transport error: {0}")]
    Transport(String),

    /// A listen address could not be bound. Fatal at startup.
    #[error("Listen error: {0}")]
    Listen(String),

    #[error("Swarm build error: {0}")]
    SwarmBuild(String),

    #[error("Behaviour error: {0}")]
    Behaviour(String),

    #[error("Transport node stopped")]
    NodeStopped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol not supported by peer: {0}")]
    ProtocolMismatch(String),

    /// No address given can ever reach the peer (unsupported transport,
    /// wrong peer id, nothing to dial).
    #[error("peer not dialable: {0}")]
    InvalidAddress(String),

    #[error("transport node stopped")]
    NodeStopped,
}

impl DialError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DialError::Unreachable(_) | DialError::Timeout(_))
    }
}

impl From<&libp2p::swarm::DialError> for DialError {
    fn from(e: &libp2p::swarm::DialError) -> Self {
        use libp2p::swarm::DialError as SwarmDialError;
        match e {
            SwarmDialError::LocalPeerId { .. } | SwarmDialError::NoAddresses | SwarmDialError::WrongPeerId { .. } => {
                DialError::InvalidAddress(e.to_string())
            }
            SwarmDialError::Transport(errors)
                if !errors.is_empty()
                    && errors
                        .iter()
                        .all(|(_, err)| matches!(err, TransportError::MultiaddrNotSupported(_))) =>
            {
                DialError::InvalidAddress(e.to_string())
            }
            _ => DialError::Unreachable(e.to_string()),
        }
    }
}

impl From<libp2p_stream::OpenStreamError> for DialError {
    fn from(e: libp2p_stream::OpenStreamError) -> Self {
        match e {
            libp2p_stream::OpenStreamError::UnsupportedProtocol(protocol) => {
                DialError::ProtocolMismatch(protocol.to_string())
            }
            other => DialError::Unreachable(other.to_string()),
        }
    }
}

/// Bidirectional byte stream to a remote peer
pub trait ProtocolStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProtocolStream for T {}

pub type BoxedStream = Box<dyn ProtocolStream>;

/// Opens protocol streams to remote peers.
#[async_trait]
pub trait StreamDialer: Send + Sync {
    /// Connect to `peer` (using `addrs` when not already connected) and
    /// negotiate `protocol`. The whole operation is bounded by `timeout`.
    async fn dial_protocol(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        protocol: StreamProtocol,
        timeout: Duration,
    ) -> Result<BoxedStream, DialError>;
}

/// Read access to what the node knows about other peers.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Addresses held in the local peer store.
    async fn peer_addresses(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Active routing lookup. Empty when nothing is found in time.
    async fn find_peer(&self, peer: &PeerId, timeout: Duration) -> Vec<Multiaddr>;

    /// Every peer in the local store.
    async fn known_peers(&self) -> Vec<PeerId>;
}

/// Snapshot of the node's networking state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub local_peer_id: String,
    pub listen_addresses: Vec<Multiaddr>,
    pub external_addresses: Vec<Multiaddr>,
    pub connected_peers: usize,
    pub known_peers: usize,
}

type PeerStoreEntries = Vec<(PeerId, Vec<Multiaddr>)>;

enum NodeCommand {
    PeerStore {
        reply: oneshot::Sender<PeerStoreEntries>,
    },
    PeerAddresses {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Connect {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), DialError>>,
    },
    Stats {
        reply: oneshot::Sender<NetworkStats>,
    },
    Shutdown,
}

/// Cloneable handle to a running transport node
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    control: libp2p_stream::Control,
    local_peer_id: PeerId,
    /// Bound on establishing a connection
    dial_timeout: Duration,
}

impl NodeHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Whether `peer` (textual peer id) is this node.
    pub fn is_target_peer_self(&self, peer: &str) -> bool {
        peer.parse::<PeerId>().map_or(false, |p| p == self.local_peer_id)
    }

    /// Stream control for protocols not covered by [`StreamDialer`].
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| NetworkError::NodeStopped)?;
        rx.await.map_err(|_| NetworkError::NodeStopped)
    }

    pub async fn peer_store_all(&self) -> Result<PeerStoreEntries, NetworkError> {
        self.request(|reply| NodeCommand::PeerStore { reply }).await
    }

    pub async fn peer_addresses(&self, peer: PeerId) -> Result<Vec<Multiaddr>, NetworkError> {
        self.request(|reply| NodeCommand::PeerAddresses { peer, reply }).await
    }

    pub async fn known_peers(&self) -> Result<Vec<PeerId>, NetworkError> {
        Ok(self
            .peer_store_all()
            .await?
            .into_iter()
            .map(|(peer, _)| peer)
            .collect())
    }

    pub async fn has_peer(&self, peer: PeerId) -> Result<bool, NetworkError> {
        Ok(!self.peer_addresses(peer).await?.is_empty())
    }

    /// DHT lookup merged with the peer store. Returns what is known when
    /// `timeout` elapses (possibly nothing).
    pub async fn find_peer(&self, peer: PeerId, timeout: Duration) -> Result<Vec<Multiaddr>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::FindPeer { peer, reply: tx })
            .await
            .map_err(|_| NetworkError::NodeStopped)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(addrs)) => Ok(addrs),
            Ok(Err(_)) => Err(NetworkError::NodeStopped),
            Err(_) => {
                debug!("find_peer {} timed out after {:?}", peer, timeout);
                Ok(Vec::new())
            }
        }
    }

    /// Ensure a connection to `peer`, dialing `addrs` if needed. Gives up
    /// after the configured `dial_timeout`.
    pub async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), DialError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Connect { peer, addrs, reply: tx })
            .await
            .map_err(|_| DialError::NodeStopped)?;
        match tokio::time::timeout(self.dial_timeout, rx).await {
            Ok(reply) => reply.map_err(|_| DialError::NodeStopped)?,
            Err(_) => {
                debug!("Connecting to {} timed out after {:?}", peer, self.dial_timeout);
                Err(DialError::Timeout(self.dial_timeout))
            }
        }
    }

    pub async fn network_stats(&self) -> Result<NetworkStats, NetworkError> {
        self.request(|reply| NodeCommand::Stats { reply }).await
    }

    /// Stop the background driver. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown).await;
    }
}

#[async_trait]
impl StreamDialer for NodeHandle {
    async fn dial_protocol(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        protocol: StreamProtocol,
        timeout: Duration,
    ) -> Result<BoxedStream, DialError> {
        let attempt = async {
            self.connect(peer, addrs).await?;
            let mut control = self.control.clone();
            let stream = control.open_stream(peer, protocol).await?;
            Ok::<_, DialError>(Box::new(stream) as BoxedStream)
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl PeerDirectory for NodeHandle {
    async fn peer_addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        NodeHandle::peer_addresses(self, *peer).await.unwrap_or_default()
    }

    async fn find_peer(&self, peer: &PeerId, timeout: Duration) -> Vec<Multiaddr> {
        NodeHandle::find_peer(self, *peer, timeout).await.unwrap_or_default()
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        NodeHandle::known_peers(self).await.unwrap_or_default()
    }
}

/// A started transport node: the swarm driver plus, when enabled, the
/// status responder.
pub struct TransportNode {
    handle: NodeHandle,
    driver: JoinHandle<()>,
    responder: Option<JoinHandle<()>>,
}

impl TransportNode {
    /// Build the swarm, bind every listen address and start background
    /// discovery. Bind failures (port in use) are returned, not retried.
    pub async fn start(config: TransportNodeConfig, keypair: Keypair) -> Result<Self, NetworkError> {
        let local_peer_id = PeerId::from(keypair.public());
        info!("Local peer ID: {}", local_peer_id);

        let public_key = hex::encode(keypair.public().encode_protobuf());
        let mut swarm = build_swarm(keypair, &config).await?;

        // All checks run before our own listeners hold any port
        let listen_addresses = config.listen_addresses();
        for addr in &listen_addresses {
            ensure_port_free(addr).await?;
        }
        let mut listeners = Vec::new();
        for addr in listen_addresses {
            let id = swarm
                .listen_on(addr.clone())
                .map_err(|e| NetworkError::Listen(format!("{}: {}", addr, e)))?;
            listeners.push((id, addr));
        }

        let filter = AnnounceFilter::new(
            config.filter_announced_addresses.clone(),
            config.announce_private_ip,
        );
        for addr in &config.announce_addresses {
            if filter.should_announce(addr) {
                swarm.add_external_address(addr.clone());
            } else {
                debug!("Not announcing configured address {}", addr);
            }
        }

        let control = swarm.behaviour().stream_control();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let mut driver = NodeDriver::new(swarm, commands_rx, filter, &config);
        driver.await_listeners(listeners).await?;

        let responder = if config.serve_status {
            let incoming = control
                .clone()
                .accept(PROTOCOL_ID)
                .map_err(|e| NetworkError::Behaviour(e.to_string()))?;
            let info = ResponderInfo {
                peer_id: local_peer_id,
                public_key: Some(public_key),
                started: Instant::now(),
            };
            Some(tokio::spawn(responder::serve_status(incoming, info)))
        } else {
            None
        };

        driver.dial_bootstrap();
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            handle: NodeHandle {
                commands: commands_tx,
                control,
                local_peer_id,
                dial_timeout: config.dial_timeout,
            },
            driver,
            responder,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.handle.local_peer_id
    }

    /// Stop the driver and the responder and wait for the driver to exit.
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        if let Some(responder) = self.responder {
            responder.abort();
        }
        let _ = self.driver.await;
    }
}

/// libp2p binds TCP listeners with port reuse, so a port held by another
/// process would be shared without error. Bind it exclusively once first.
async fn ensure_port_free(addr: &Multiaddr) -> Result<(), NetworkError> {
    let Some(socket) = socket_addr(addr) else {
        return Ok(());
    };
    if socket.port() == 0 {
        return Ok(());
    }
    tokio::net::TcpListener::bind(socket)
        .await
        .map(drop)
        .map_err(|e| NetworkError::Listen(format!("{}: {}", addr, e)))
}

fn socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut ip = None;
    let mut port = None;
    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(v4) => ip = Some(IpAddr::V4(v4)),
            Protocol::Ip6(v6) => ip = Some(IpAddr::V6(v6)),
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }
    Some(SocketAddr::new(ip?, port?))
}

async fn build_swarm(keypair: Keypair, config: &TransportNodeConfig) -> Result<Swarm<NodeBehaviour>, NetworkError> {
    let idle_timeout = config.idle_connection_timeout;
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_dns()
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_behaviour(
            |key, relay_client| -> Result<NodeBehaviour, Box<dyn std::error::Error + Send + Sync>> {
                Ok(NodeBehaviour::new(key, relay_client, config)?)
            },
        )
        .map_err(|e| NetworkError::SwarmBuild(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();
    Ok(swarm)
}

struct NodeDriver {
    swarm: Swarm<NodeBehaviour>,
    commands: mpsc::Receiver<NodeCommand>,
    filter: AnnounceFilter,
    peer_store: HashMap<PeerId, Vec<Multiaddr>>,
    find_queries: HashMap<kad::QueryId, (PeerId, Vec<Multiaddr>, oneshot::Sender<Vec<Multiaddr>>)>,
    pending_connects: HashMap<PeerId, Vec<oneshot::Sender<Result<(), DialError>>>>,
    /// Outgoing dials still pending, with the time they must finish by
    dial_deadlines: HashMap<PeerId, Instant>,
    dial_timeout: Duration,
    bootstrap: Vec<(PeerId, Multiaddr)>,
    min_connections: usize,
    autodial_interval: Duration,
}

impl NodeDriver {
    fn new(
        swarm: Swarm<NodeBehaviour>,
        commands: mpsc::Receiver<NodeCommand>,
        filter: AnnounceFilter,
        config: &TransportNodeConfig,
    ) -> Self {
        Self {
            swarm,
            commands,
            filter,
            peer_store: HashMap::new(),
            find_queries: HashMap::new(),
            pending_connects: HashMap::new(),
            dial_deadlines: HashMap::new(),
            dial_timeout: config.dial_timeout,
            bootstrap: bootstrap_peers(&config.bootstrap_nodes),
            min_connections: config.min_connections,
            autodial_interval: config.autodial_interval.max(Duration::from_millis(100)),
        }
    }

    async fn run(mut self) {
        let mut autodial = tokio::time::interval(self.autodial_interval);
        autodial.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = autodial.tick() => self.on_autodial_tick(),
            }
        }
        info!("Transport node stopped");
    }

    /// Drive the swarm until every listener reported an address. A
    /// listener that closes first fails startup.
    async fn await_listeners(&mut self, listeners: Vec<(ListenerId, Multiaddr)>) -> Result<(), NetworkError> {
        let mut waiting: HashMap<ListenerId, Multiaddr> = listeners.into_iter().collect();
        let deadline = tokio::time::sleep(LISTEN_READY_TIMEOUT);
        tokio::pin!(deadline);

        while !waiting.is_empty() {
            let event = tokio::select! {
                event = self.swarm.select_next_some() => event,
                _ = &mut deadline => {
                    let pending: Vec<String> = waiting.values().map(ToString::to_string).collect();
                    return Err(NetworkError::Listen(format!("no listener came up on {}", pending.join(", "))));
                }
            };
            match &event {
                SwarmEvent::NewListenAddr { listener_id, .. } => {
                    waiting.remove(listener_id);
                }
                SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                    if let Some(addr) = waiting.remove(listener_id) {
                        let reason = match reason {
                            Ok(()) => "listener closed".to_string(),
                            Err(e) => e.to_string(),
                        };
                        return Err(NetworkError::Listen(format!("{}: {}", addr, reason)));
                    }
                }
                _ => {}
            }
            self.handle_swarm_event(event);
        }
        Ok(())
    }

    fn dial_bootstrap(&mut self) {
        let local = *self.swarm.local_peer_id();
        for (peer, addr) in self.bootstrap.clone() {
            if peer == local || self.swarm.is_connected(&peer) {
                continue;
            }
            self.swarm.behaviour_mut().add_address(&peer, addr.clone());
            self.remember(peer, addr.clone());
            let opts = DialOpts::peer_id(peer)
                .addresses(vec![addr.clone()])
                .condition(PeerCondition::DisconnectedAndNotDialing)
                .build();
            match self.swarm.dial(opts) {
                Ok(()) => self.track_dial(peer),
                Err(e) => debug!("Bootstrap dial {} failed: {}", addr, e),
            }
        }
        self.swarm.behaviour_mut().bootstrap();
    }

    fn track_dial(&mut self, peer: PeerId) {
        let deadline = Instant::now() + self.dial_timeout;
        self.dial_deadlines.entry(peer).or_insert(deadline);
    }

    /// Abort dials that outlived `dial_timeout`. Checked on the autodial
    /// tick, so a dial may overrun by up to one interval.
    fn expire_dials(&mut self) {
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .dial_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            self.dial_deadlines.remove(&peer);
            if self.swarm.is_connected(&peer) {
                continue;
            }
            debug!("Dial to {} exceeded {:?}, aborting", peer, self.dial_timeout);
            let _ = self.swarm.disconnect_peer_id(peer);
            self.resolve_connects(&peer, Err(DialError::Timeout(self.dial_timeout)));
        }
    }

    fn on_autodial_tick(&mut self) {
        self.expire_dials();
        for waiters in self.pending_connects.values_mut() {
            waiters.retain(|w| !w.is_closed());
        }
        self.pending_connects.retain(|_, waiters| !waiters.is_empty());

        let connected = self.swarm.connected_peers().count();
        if connected < self.min_connections && !self.bootstrap.is_empty() {
            trace!(
                "{} connections below minimum {}, redialing bootstrap",
                connected,
                self.min_connections
            );
            self.dial_bootstrap();
        }
    }

    fn remember(&mut self, peer: PeerId, addr: Multiaddr) {
        if peer == *self.swarm.local_peer_id() {
            return;
        }
        let addrs = self.peer_store.entry(peer).or_default();
        if addrs.contains(&addr) {
            return;
        }
        if addrs.len() >= MAX_ADDRS_PER_PEER {
            addrs.remove(0);
        }
        addrs.push(addr);
    }

    fn announce_self(&mut self, addr: Multiaddr) {
        let decision = self.filter.decide(&addr);
        if decision.is_allowed() {
            debug!("Announcing {}", addr);
            self.swarm.add_external_address(addr);
        } else {
            trace!("Not announcing {}: {:?}", addr, decision);
        }
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::PeerStore { reply } => {
                let entries = self
                    .peer_store
                    .iter()
                    .map(|(peer, addrs)| (*peer, addrs.clone()))
                    .collect();
                let _ = reply.send(entries);
            }
            NodeCommand::PeerAddresses { peer, reply } => {
                let _ = reply.send(self.peer_store.get(&peer).cloned().unwrap_or_default());
            }
            NodeCommand::FindPeer { peer, reply } => {
                let known = self.peer_store.get(&peer).cloned().unwrap_or_default();
                match self.swarm.behaviour_mut().find_closest(peer) {
                    Some(query_id) => {
                        debug!("Started DHT lookup for {} ({:?})", peer, query_id);
                        self.find_queries.insert(query_id, (peer, known, reply));
                    }
                    None => {
                        let _ = reply.send(known);
                    }
                }
            }
            NodeCommand::Connect { peer, addrs, reply } => self.connect(peer, addrs, reply),
            NodeCommand::Stats { reply } => {
                let _ = reply.send(NetworkStats {
                    local_peer_id: self.swarm.local_peer_id().to_string(),
                    listen_addresses: self.swarm.listeners().cloned().collect(),
                    external_addresses: self.swarm.external_addresses().cloned().collect(),
                    connected_peers: self.swarm.connected_peers().count(),
                    known_peers: self.peer_store.len(),
                });
            }
            NodeCommand::Shutdown => {}
        }
    }

    fn connect(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, reply: oneshot::Sender<Result<(), DialError>>) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        if peer == *self.swarm.local_peer_id() {
            let _ = reply.send(Err(DialError::InvalidAddress("cannot dial the local peer".into())));
            return;
        }
        let opts = DialOpts::peer_id(peer)
            .addresses(addrs)
            .extend_addresses_through_behaviour()
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        match self.swarm.dial(opts) {
            Ok(()) => {
                trace!("Dialing {}", peer);
                self.track_dial(peer);
                self.pending_connects.entry(peer).or_default().push(reply);
            }
            // Already dialing: wait for that attempt.
            Err(libp2p::swarm::DialError::DialPeerConditionFalse(_)) => {
                self.pending_connects.entry(peer).or_default().push(reply);
            }
            Err(e) => {
                let _ = reply.send(Err(DialError::from(&e)));
            }
        }
    }

    fn resolve_connects(&mut self, peer: &PeerId, result: Result<(), DialError>) {
        if let Some(waiters) = self.pending_connects.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.announce_self(address);
            }

            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.swarm.remove_external_address(&address);
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                debug!("Connected to {}", peer_id);
                self.dial_deadlines.remove(&peer_id);
                if let ConnectedPoint::Dialer { address, .. } = endpoint {
                    self.remember(peer_id, address);
                }
                self.resolve_connects(&peer_id, Ok(()));
            }

            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => match cause {
                Some(error) => debug!("Connection to {} closed: {}", peer_id, error),
                None => trace!("Connection to {} closed", peer_id),
            },

            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                debug!("Dial to {} failed: {}", peer_id, error);
                if !self.swarm.is_connected(&peer_id) {
                    self.dial_deadlines.remove(&peer_id);
                    self.resolve_connects(&peer_id, Err(DialError::from(&error)));
                }
            }

            SwarmEvent::NewExternalAddrCandidate { address } => {
                // Observed by a remote peer; only trusted on a port we listen on.
                let listen_ports: Vec<u16> = self.swarm.listeners().filter_map(tcp_port).collect();
                if tcp_port(&address).map_or(false, |p| listen_ports.contains(&p)) {
                    self.announce_self(address);
                } else {
                    trace!("Ignoring external address candidate {}", address);
                }
            }

            SwarmEvent::ListenerError { error, .. } => {
                warn!("Listener error: {}", error);
            }

            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                trace!("Identified {} ({})", peer_id, info.agent_version);
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().add_address(&peer_id, addr.clone());
                    self.remember(peer_id, addr);
                }
            }

            NodeBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    debug!("mDNS discovered {} at {}", peer_id, addr);
                    self.swarm.behaviour_mut().add_address(&peer_id, addr.clone());
                    self.remember(peer_id, addr);
                }
            }

            NodeBehaviourEvent::Kademlia(kad::Event::RoutingUpdated { peer, addresses, .. }) => {
                for addr in addresses.iter() {
                    self.remember(peer, addr.clone());
                }
            }

            NodeBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetClosestPeers(result),
                step,
                ..
            }) => {
                let peers = match result {
                    Ok(ok) => ok.peers,
                    Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                };
                self.on_closest_peers(id, peers, step.last);
            }

            _ => {}
        }
    }

    fn on_closest_peers(&mut self, id: kad::QueryId, peers: Vec<kad::PeerInfo>, last: bool) {
        let Some((target, found, _)) = self.find_queries.get_mut(&id) else {
            return;
        };
        let target = *target;
        let mut discovered = Vec::new();
        for info in peers {
            for addr in info.addrs {
                if info.peer_id == target && !found.contains(&addr) {
                    found.push(addr.clone());
                }
                discovered.push((info.peer_id, addr));
            }
        }
        for (peer, addr) in discovered {
            self.remember(peer, addr);
        }
        if last {
            if let Some((_, found, reply)) = self.find_queries.remove(&id) {
                debug!("DHT lookup for {} found {} addresses", target, found.len());
                let _ = reply.send(found);
            }
        }
    }
}

fn tcp_port(addr: &Multiaddr) -> Option<u16> {
    addr.iter().find_map(|p| match p {
        Protocol::Tcp(port) => Some(port),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_stream_error_mapping() {
        let err = DialError::from(libp2p_stream::OpenStreamError::UnsupportedProtocol(PROTOCOL_ID));
        assert_eq!(err, DialError::ProtocolMismatch("/ocean/nodes/1.0.0".into()));
    }

    #[test]
    fn test_tcp_port() {
        let addr: Multiaddr = "/ip4/203.0.113.5/tcp/9001/ws".parse().unwrap();
        assert_eq!(tcp_port(&addr), Some(9001));
        let addr: Multiaddr = "/p2p-circuit".parse().unwrap();
        assert_eq!(tcp_port(&addr), None);
    }

    #[test]
    fn test_swarm_dial_error_mapping() {
        let err = DialError::from(&libp2p::swarm::DialError::NoAddresses);
        assert!(matches!(err, DialError::InvalidAddress(_)));
        assert!(!err.is_transient());

        let addr: Multiaddr = "/ip4/203.0.113.5/tcp/9001/tls/sni/example.com/ws".parse().unwrap();
        let unsupported =
            libp2p::swarm::DialError::Transport(vec![(addr.clone(), TransportError::MultiaddrNotSupported(addr))]);
        assert!(matches!(DialError::from(&unsupported), DialError::InvalidAddress(_)));

        assert!(DialError::Unreachable("connection refused".into()).is_transient());
        assert!(DialError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!DialError::ProtocolMismatch("/ocean/nodes/1.0.0".into()).is_transient());
    }

    #[test]
    fn test_socket_addr() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9000/ws".parse().unwrap();
        assert_eq!(socket_addr(&addr), Some("127.0.0.1:9000".parse().unwrap()));
        let addr: Multiaddr = "/ip6/::1/tcp/9001".parse().unwrap();
        assert_eq!(socket_addr(&addr), Some("[::1]:9001".parse().unwrap()));
        let addr: Multiaddr = "/dns4/example.com/tcp/9000".parse().unwrap();
        assert_eq!(socket_addr(&addr), None);
    }

    #[tokio::test]
    async fn test_occupied_port_is_rejected() {
        let held = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap();

        assert!(matches!(ensure_port_free(&addr).await, Err(NetworkError::Listen(_))));
        drop(held);
        assert!(ensure_port_free(&"/ip4/127.0.0.1/tcp/0".parse().unwrap()).await.is_ok());
    }

    #[test]
    fn test_network_error_display() {
        let err = NetworkError::Listen("/ip4/127.0.0.1/tcp/9000: address in use".into());
        assert!(err.to_string().starts_with("Listen error"));
        assert_eq!(DialError::NodeStopped.to_string(), "transport node stopped");
    }

    #[tokio::test]
    async fn test_start_local_node() {
        let keypair = Keypair::generate_ed25519();
        let expected = PeerId::from(keypair.public());
        let node = TransportNode::start(TransportNodeConfig::local(false), keypair)
            .await
            .unwrap();
        let handle = node.handle();

        assert_eq!(handle.local_peer_id(), expected);
        assert!(handle.is_target_peer_self(&expected.to_string()));
        assert!(!handle.is_target_peer_self("garbage"));
        assert!(handle.peer_store_all().await.unwrap().is_empty());
        assert!(!handle.has_peer(PeerId::random()).await.unwrap());

        node.shutdown().await;
        assert!(matches!(handle.network_stats().await, Err(NetworkError::NodeStopped)));
    }

    #[tokio::test]
    async fn test_find_unknown_peer_is_empty() {
        let node = TransportNode::start(TransportNodeConfig::local(false), Keypair::generate_ed25519())
            .await
            .unwrap();
        let addrs = node
            .handle()
            .find_peer(PeerId::random(), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(addrs.is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_loopback_listen_address_not_announced() {
        let node = TransportNode::start(TransportNodeConfig::local(false), Keypair::generate_ed25519())
            .await
            .unwrap();
        let handle = node.handle();

        let mut stats = handle.network_stats().await.unwrap();
        for _ in 0..50 {
            if !stats.listen_addresses.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            stats = handle.network_stats().await.unwrap();
        }
        assert!(!stats.listen_addresses.is_empty());
        assert!(stats.external_addresses.is_empty());
        node.shutdown().await;
    }
}
