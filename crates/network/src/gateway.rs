//! Gateway command relay
//!
//! Sends application commands to a compute node through one well-known
//! gateway peer. Every call opens a fresh stream on the gateway connection,
//! writes `{command, node, authorization?, ...body}` and half-closes.
//!
//! The client is constructed explicitly and owns nothing global. Use
//! [`GatewayClient::with_dialer`] to run it over an existing node, or
//! [`start_gateway_client`] to get a dedicated outbound-only node whose
//! lifetime the caller controls.

use std::io;
use std::time::Duration;

use futures::AsyncWriteExt;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::address;
use crate::config::TransportNodeConfig;
use crate::node::{BoxedStream, DialError, NetworkError, NodeHandle, StreamDialer, TransportNode};
use crate::protocol::{encode_request, read_chunk, Command, StatusFrame, PROTOCOL_ID};

/// Public gateway used when no relay is configured. The TLS server name is
/// carried by the `dns4` host; the websocket transport only dials
/// `/tls/ws` and `/wss`, not an explicit `/sni` segment.
pub const DEFAULT_GATEWAY_ADDRESS: &str = "/dns4/198-145-104-8.kzwfwjn5ji4puuok23h2yyzro0fe1rqv1bqzbmrjf7uqyj504rawjl4zs68mepr.libp2p.direct/tcp/9001/tls/ws/p2p/16Uiu2HAmR9z4EhF9zoZcErrdcEJKCjfTpXJfBcmbNppbT3QYtBpi";

/// Error text a gateway reports when it cannot reach the target node.
const PEER_UNREACHABLE_MARKER: &str = "Cannot connect to peer";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway multiaddress, ending in `/p2p/<gateway id>`
    pub relay_address: Multiaddr,
    pub protocol: StreamProtocol,
    /// Extra attempts after a peer-unreachable failure
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub dial_timeout: Duration,
    /// Bound on reading each response chunk
    pub response_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            relay_address: DEFAULT_GATEWAY_ADDRESS
                .parse()
                .expect("valid hardcoded gateway multiaddr"),
            protocol: PROTOCOL_ID,
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(60),
        }
    }
}

impl GatewayConfig {
    pub fn with_relay(relay_address: Multiaddr) -> Self {
        Self {
            relay_address,
            ..Self::default()
        }
    }
}

/// Structured classification of a remote error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The gateway could not reach the target node. Retried.
    PeerUnreachable,
    /// Any other application-level failure. Not retried.
    Application,
}

impl RemoteErrorKind {
    fn classify(message: &str) -> Self {
        if message.contains(PEER_UNREACHABLE_MARKER) {
            RemoteErrorKind::PeerUnreachable
        } else {
            RemoteErrorKind::Application
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway node error: {0}")]
    Dial(#[from] DialError),

    #[error("Gateway node error: no response from peer")]
    NoResponse,

    #[error("Gateway node error: {message}")]
    Remote {
        http_status: Option<u16>,
        message: String,
        kind: RemoteErrorKind,
    },

    #[error("Gateway node error: {0}")]
    Io(#[from] io::Error),

    #[error("Gateway node error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Gateway node error: response timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gateway node error: invalid relay address {0}")]
    InvalidRelayAddress(String),

    #[error("Gateway node error: {0}")]
    Transport(#[from] NetworkError),
}

impl GatewayError {
    fn remote(http_status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        GatewayError::Remote {
            http_status,
            kind: RemoteErrorKind::classify(&message),
            message,
        }
    }

    /// Whether retrying might help: the gateway could not reach the target
    /// or a transient failure kept us from reaching the gateway.
    pub fn is_peer_unreachable(&self) -> bool {
        match self {
            GatewayError::Dial(e) => e.is_transient(),
            GatewayError::Remote { kind, .. } => *kind == RemoteErrorKind::PeerUnreachable,
            _ => false,
        }
    }
}

/// Drained response of a non-streaming command
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResponse {
    Json(Value),
    Raw(Vec<u8>),
}

impl GatewayResponse {
    fn interpret(chunk: &[u8]) -> Self {
        match serde_json::from_slice(chunk) {
            Ok(value) => GatewayResponse::Json(value),
            Err(_) => GatewayResponse::Raw(chunk.to_vec()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            GatewayResponse::Json(value) => Some(value),
            GatewayResponse::Raw(_) => None,
        }
    }

    /// Error text carried by the response, if any.
    fn error_text(&self) -> Option<String> {
        match self {
            GatewayResponse::Json(Value::String(text)) => Some(text.clone()),
            GatewayResponse::Json(value) => value.get("error").and_then(Value::as_str).map(str::to_string),
            GatewayResponse::Raw(_) => None,
        }
    }
}

/// Incremental reader for streaming commands
pub struct ResponseStream {
    pending: Option<Vec<u8>>,
    stream: BoxedStream,
    chunk_timeout: Duration,
}

impl ResponseStream {
    /// Next chunk, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, GatewayError> {
        if let Some(chunk) = self.pending.take() {
            return Ok(Some(chunk));
        }
        match tokio::time::timeout(self.chunk_timeout, read_chunk(&mut self.stream)).await {
            Ok(chunk) => Ok(chunk?),
            Err(_) => Err(GatewayError::Timeout(self.chunk_timeout)),
        }
    }

    /// Read everything that is left.
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>, GatewayError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub fn into_inner(self) -> BoxedStream {
        self.stream
    }
}

pub enum GatewayReply {
    Response(GatewayResponse),
    Stream(ResponseStream),
}

impl GatewayReply {
    pub fn into_response(self) -> Option<GatewayResponse> {
        match self {
            GatewayReply::Response(response) => Some(response),
            GatewayReply::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ResponseStream> {
        match self {
            GatewayReply::Stream(stream) => Some(stream),
            GatewayReply::Response(_) => None,
        }
    }
}

pub struct GatewayClient<D> {
    dialer: D,
    relay_peer: PeerId,
    config: GatewayConfig,
}

impl<D: StreamDialer> GatewayClient<D> {
    pub fn with_dialer(dialer: D, config: GatewayConfig) -> Result<Self, GatewayError> {
        let relay_peer = address::peer_id_of(&config.relay_address)
            .ok_or_else(|| GatewayError::InvalidRelayAddress(config.relay_address.to_string()))?;
        Ok(Self {
            dialer,
            relay_peer,
            config,
        })
    }

    pub fn relay_peer(&self) -> PeerId {
        self.relay_peer
    }

    /// Send `command` for `target` and wait for its reply. Peer-unreachable
    /// failures are retried up to `max_retries` times; everything else is
    /// returned immediately.
    pub async fn send_command(
        &self,
        command: Command,
        target: &str,
        body: Option<&Map<String, Value>>,
        authorization: Option<&str>,
    ) -> Result<GatewayReply, GatewayError> {
        let request = encode_request(command.as_str(), target, authorization, body)?;
        let mut retries = 0;
        loop {
            match self.attempt(command, &request).await {
                Err(e) if e.is_peer_unreachable() && retries < self.config.max_retries => {
                    retries += 1;
                    warn!(
                        "{} for {} failed ({}), retry {}/{}",
                        command, target, e, retries, self.config.max_retries
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    /// Non-streaming convenience wrapper.
    pub async fn request(
        &self,
        command: Command,
        target: &str,
        body: Option<&Map<String, Value>>,
        authorization: Option<&str>,
    ) -> Result<GatewayResponse, GatewayError> {
        match self.send_command(command, target, body, authorization).await? {
            GatewayReply::Response(response) => Ok(response),
            GatewayReply::Stream(stream) => {
                let bytes = stream.collect_bytes().await?;
                Ok(GatewayResponse::interpret(&bytes))
            }
        }
    }

    async fn attempt(&self, command: Command, request: &[u8]) -> Result<GatewayReply, GatewayError> {
        let mut stream = self
            .dialer
            .dial_protocol(
                self.relay_peer,
                vec![self.config.relay_address.clone()],
                self.config.protocol.clone(),
                self.config.dial_timeout,
            )
            .await?;
        stream.write_all(request).await?;
        stream.close().await?;

        let first = self.read(&mut stream).await?.unwrap_or_default();
        if first.is_empty() {
            return Err(GatewayError::NoResponse);
        }

        // Only an explicit error code fails here; unparseable frames pass.
        let (status, rest) = StatusFrame::split(&first);
        if let Some(status) = &status {
            if status.is_error() {
                let message = status
                    .error
                    .clone()
                    .unwrap_or_else(|| status.http_status.to_string());
                return Err(GatewayError::remote(Some(status.http_status), message));
            }
        }

        if command.is_streaming() {
            let pending = match status {
                Some(_) if rest.is_empty() => None,
                Some(_) => Some(rest.to_vec()),
                None => Some(first.clone()),
            };
            return Ok(GatewayReply::Stream(ResponseStream {
                pending,
                stream,
                chunk_timeout: self.config.response_timeout,
            }));
        }

        // Last chunk wins.
        let mut last = if status.is_some() && !rest.is_empty() {
            GatewayResponse::interpret(rest)
        } else {
            GatewayResponse::interpret(&first)
        };
        let mut chunks = 1;
        while let Some(chunk) = self.read(&mut stream).await? {
            chunks += 1;
            last = GatewayResponse::interpret(&chunk);
        }
        debug!("{} answered with {} chunks", command, chunks);

        if let Some(final_status) = last.as_json().and_then(StatusFrame::from_value) {
            if final_status.is_error() {
                let message = final_status.error.unwrap_or_else(|| "request failed".to_string());
                return Err(GatewayError::remote(Some(final_status.http_status), message));
            }
        }
        if let Some(text) = last.error_text() {
            if RemoteErrorKind::classify(&text) == RemoteErrorKind::PeerUnreachable {
                return Err(GatewayError::remote(None, text));
            }
        }
        Ok(GatewayReply::Response(last))
    }

    async fn read(&self, stream: &mut BoxedStream) -> Result<Option<Vec<u8>>, GatewayError> {
        match tokio::time::timeout(self.config.response_timeout, read_chunk(stream)).await {
            Ok(chunk) => Ok(chunk?),
            Err(_) => Err(GatewayError::Timeout(self.config.response_timeout)),
        }
    }
}

/// Start a dedicated outbound-only node connected to the gateway. The
/// caller owns the returned node and shuts it down when done.
pub async fn start_gateway_client(
    config: GatewayConfig,
    keypair: Keypair,
) -> Result<(GatewayClient<NodeHandle>, TransportNode), GatewayError> {
    if address::peer_id_of(&config.relay_address).is_none() {
        return Err(GatewayError::InvalidRelayAddress(config.relay_address.to_string()));
    }
    let node_config = TransportNodeConfig::client_only(vec![config.relay_address.clone()]);
    let node = TransportNode::start(node_config, keypair).await?;
    let client = GatewayClient::with_dialer(node.handle(), config)?;
    Ok((client, node))
}
