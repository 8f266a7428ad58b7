//! Shared test doubles: scripted streams, a mock node (dialer + peer
//! directory) and static DNS.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};
use tidewatch_network::{
    BoxedStream, DialError, DnsResolver, Multiaddr, PeerDirectory, PeerId, StreamDialer, StreamProtocol,
};

/// Stream that answers with a fixed list of chunks (one per read) and
/// records everything written to it.
pub struct ScriptedStream {
    chunks: VecDeque<Vec<u8>>,
    fail_read: bool,
    written: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl AsyncRead for ScriptedStream {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        if self.fail_read {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")));
        }
        match self.chunks.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.chunks.push_front(chunk[n..].to_vec());
                }
                Poll::Ready(Ok(n))
            }
            None => Poll::Ready(Ok(0)),
        }
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        *self.closed.lock().unwrap() = true;
        Poll::Ready(Ok(()))
    }
}

/// What one dial attempt does
#[derive(Debug, Clone)]
pub enum DialScript {
    Fail(DialError),
    Respond(Vec<Vec<u8>>),
    /// Dial succeeds, reading fails
    Broken,
}

impl DialScript {
    pub fn respond(chunks: &[&str]) -> Self {
        DialScript::Respond(chunks.iter().map(|c| c.as_bytes().to_vec()).collect())
    }

    pub fn unreachable() -> Self {
        DialScript::Fail(DialError::Unreachable("connection refused".into()))
    }
}

#[derive(Default)]
struct MockState {
    script: VecDeque<DialScript>,
    dials: Vec<(PeerId, Vec<Multiaddr>, StreamProtocol)>,
    requests: Vec<Arc<Mutex<Vec<u8>>>>,
    closed: Vec<Arc<Mutex<bool>>>,
    store: HashMap<PeerId, Vec<Multiaddr>>,
    dht: HashMap<PeerId, Vec<Multiaddr>>,
    find_calls: usize,
}

/// In-memory stand-in for a transport node
#[derive(Clone, Default)]
pub struct MockNode {
    state: Arc<Mutex<MockState>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behaviour of the next dial attempts, in order. Once the
    /// script runs out every dial fails as unreachable.
    pub fn script(&self, steps: impl IntoIterator<Item = DialScript>) -> &Self {
        self.state.lock().unwrap().script.extend(steps);
        self
    }

    pub fn with_stored(&self, peer: PeerId, addrs: &[&str]) -> &Self {
        self.state
            .lock()
            .unwrap()
            .store
            .insert(peer, addrs.iter().map(|a| a.parse().unwrap()).collect());
        self
    }

    pub fn with_dht(&self, peer: PeerId, addrs: &[&str]) -> &Self {
        self.state
            .lock()
            .unwrap()
            .dht
            .insert(peer, addrs.iter().map(|a| a.parse().unwrap()).collect());
        self
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().unwrap().dials.len()
    }

    pub fn dialed_addrs(&self, attempt: usize) -> Vec<Multiaddr> {
        self.state.lock().unwrap().dials[attempt].1.clone()
    }

    pub fn find_calls(&self) -> usize {
        self.state.lock().unwrap().find_calls
    }

    /// Bytes written on the stream opened by the given attempt.
    pub fn request(&self, index: usize) -> Vec<u8> {
        self.state.lock().unwrap().requests[index].lock().unwrap().clone()
    }

    pub fn request_json(&self, index: usize) -> serde_json::Value {
        serde_json::from_slice(&self.request(index)).unwrap()
    }

    pub fn was_half_closed(&self, index: usize) -> bool {
        *self.state.lock().unwrap().closed[index].lock().unwrap()
    }
}

#[async_trait]
impl StreamDialer for MockNode {
    async fn dial_protocol(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        protocol: StreamProtocol,
        _timeout: Duration,
    ) -> Result<BoxedStream, DialError> {
        let mut state = self.state.lock().unwrap();
        state.dials.push((peer, addrs, protocol));
        let step = state.script.pop_front().unwrap_or_else(DialScript::unreachable);
        let (chunks, fail_read) = match step {
            DialScript::Fail(e) => return Err(e),
            DialScript::Respond(chunks) => (chunks, false),
            DialScript::Broken => (Vec::new(), true),
        };
        let written = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        state.requests.push(written.clone());
        state.closed.push(closed.clone());
        Ok(Box::new(ScriptedStream {
            chunks: chunks.into(),
            fail_read,
            written,
            closed,
        }))
    }
}

#[async_trait]
impl PeerDirectory for MockNode {
    async fn peer_addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.state.lock().unwrap().store.get(peer).cloned().unwrap_or_default()
    }

    async fn find_peer(&self, peer: &PeerId, _timeout: Duration) -> Vec<Multiaddr> {
        let mut state = self.state.lock().unwrap();
        state.find_calls += 1;
        state.dht.get(peer).cloned().unwrap_or_default()
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        self.state.lock().unwrap().store.keys().copied().collect()
    }
}

/// DNS answering from a fixed table
#[derive(Clone, Default)]
pub struct StaticDns {
    records: HashMap<String, IpAddr>,
}

impl StaticDns {
    pub fn with(mut self, host: &str, ip: &str) -> Self {
        self.records.insert(host.to_string(), ip.parse().unwrap());
        self
    }
}

#[async_trait]
impl DnsResolver for StaticDns {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        self.records
            .get(host)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, host.to_string()))
    }
}

pub fn ma(s: &str) -> Multiaddr {
    s.parse().unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tidewatch_network=debug")
        .with_test_writer()
        .try_init();
}
