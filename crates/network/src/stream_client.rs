//! Request/response over a protocol stream
//!
//! Dials a peer, writes one request, half-closes, then hands every response
//! chunk to a caller-supplied sink. Only the dial is retried: once a stream
//! is open, a failure is a peer-side fault and is reported as-is.

use std::io;
use std::time::Duration;

use futures::AsyncWriteExt;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use thiserror::Error;
use tracing::{debug, warn};

use crate::node::{DialError, StreamDialer};
use crate::protocol::{read_chunk, StatusFrame, PROTOCOL_ID};

/// Environment override for the number of dial attempts.
pub const DIAL_RETRIES_ENV: &str = "DIAL_PROTOCOL_RETRIES";

#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    pub protocol: StreamProtocol,
    /// Total dial attempts (not additional retries). At least one is made.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Bound on each dial attempt
    pub dial_timeout: Duration,
    /// Bound on writing the request and draining the response
    pub response_timeout: Duration,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_ID,
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(3),
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamClientConfig {
    /// Defaults with `DIAL_PROTOCOL_RETRIES` applied when set and numeric.
    pub fn from_env() -> Self {
        Self::default().with_retries_override(std::env::var(DIAL_RETRIES_ENV).ok().as_deref())
    }

    pub fn with_retries_override(mut self, value: Option<&str>) -> Self {
        match value.map(|v| v.trim().parse::<u32>()) {
            Some(Ok(n)) => self.max_retries = n,
            Some(Err(e)) => warn!("Ignoring {}: {}", DIAL_RETRIES_ENV, e),
            None => {}
        }
        self
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Cannot connect to peer({last})")]
    DialExhausted { attempts: u32, last: DialError },

    #[error("{0}")]
    StreamIo(#[from] io::Error),

    #[error("response timed out after {0:?}")]
    ResponseTimeout(Duration),
}

impl SendError {
    /// In-band status reported to the caller for this failure.
    pub fn status(&self) -> StatusFrame {
        StatusFrame::error(404, self.to_string())
    }
}

/// Status of a completed exchange: 200, or the failure's 404 frame.
pub fn exchange_status(result: &Result<(), SendError>) -> StatusFrame {
    match result {
        Ok(()) => StatusFrame::ok(),
        Err(e) => e.status(),
    }
}

pub struct StreamProtocolClient<D> {
    dialer: D,
    config: StreamClientConfig,
}

impl<D: StreamDialer> StreamProtocolClient<D> {
    pub fn new(dialer: D, config: StreamClientConfig) -> Self {
        Self { dialer, config }
    }

    pub fn config(&self) -> &StreamClientConfig {
        &self.config
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Send `message` to `peer` and feed each response chunk to `sink`.
    pub async fn send_to<F>(
        &self,
        peer: PeerId,
        addrs: &[Multiaddr],
        message: &[u8],
        mut sink: F,
    ) -> Result<(), SendError>
    where
        F: FnMut(&[u8]) + Send,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;
        let mut stream = loop {
            attempt += 1;
            match self
                .dialer
                .dial_protocol(peer, addrs.to_vec(), self.config.protocol.clone(), self.config.dial_timeout)
                .await
            {
                Ok(stream) => break stream,
                Err(e) if attempt >= max_attempts || !e.is_transient() => {
                    debug!("Giving up on {} after {} attempts: {}", peer, attempt, e);
                    return Err(SendError::DialExhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    warn!("Dial {} attempt {}/{} failed: {}", peer, attempt, max_attempts, e);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        };

        let exchange = async {
            stream.write_all(message).await?;
            stream.close().await?;
            while let Some(chunk) = read_chunk(&mut stream).await? {
                sink(&chunk);
            }
            Ok::<_, io::Error>(())
        };
        match tokio::time::timeout(self.config.response_timeout, exchange).await {
            Ok(result) => result.map_err(SendError::from),
            Err(_) => Err(SendError::ResponseTimeout(self.config.response_timeout)),
        }
    }
}
