//! Status responder
//!
//! Answers inbound requests on the command protocol. Only `status` is
//! served; every other command gets a 501 so callers can tell a live peer
//! that lacks the command from an unreachable one.

use std::time::Instant;

use futures::{AsyncRead, AsyncWrite, AsyncWriteExt, StreamExt};
use libp2p::PeerId;
use tracing::{debug, trace};

use crate::protocol::{read_to_end_limited, CommandRequest, NodeStatus, StatusFrame, MAX_REQUEST_SIZE};

/// Identity reported in the node status payload
#[derive(Debug, Clone)]
pub struct ResponderInfo {
    pub peer_id: PeerId,
    pub public_key: Option<String>,
    pub started: Instant,
}

impl ResponderInfo {
    pub fn node_status(&self) -> NodeStatus {
        NodeStatus {
            id: self.peer_id.to_string(),
            public_key: self.public_key.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            http: false,
            p2p: true,
            uptime: self.started.elapsed().as_secs(),
        }
    }
}

/// Serve every inbound stream until the node goes away. Each stream is
/// handled on its own task.
pub async fn serve_status(mut incoming: libp2p_stream::IncomingStreams, info: ResponderInfo) {
    while let Some((peer, stream)) = incoming.next().await {
        let info = info.clone();
        tokio::spawn(async move {
            if let Err(e) = respond(stream, &info).await {
                debug!("Status request from {} failed: {}", peer, e);
            }
        });
    }
    trace!("Status responder stopped");
}

/// Read one request (until the remote half-closes) and write the answer.
pub async fn respond<S>(mut stream: S, info: &ResponderInfo) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_to_end_limited(&mut stream, MAX_REQUEST_SIZE).await?;

    let frames = match serde_json::from_slice::<CommandRequest>(&request) {
        Ok(request) if request.command == "status" => {
            let status = serde_json::to_vec(&info.node_status())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            vec![StatusFrame::ok().to_bytes(), status]
        }
        Ok(request) => {
            trace!("Unsupported command {:?}", request.command);
            vec![StatusFrame::error(501, format!("Unsupported command: {}", request.command)).to_bytes()]
        }
        Err(e) => vec![StatusFrame::error(400, format!("Invalid request: {}", e)).to_bytes()],
    };

    for frame in frames {
        stream.write_all(&frame).await?;
        stream.flush().await?;
    }
    stream.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Request bytes in, response bytes captured.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl AsyncRead for Duplex {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.input).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Duplex {
        fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            self.output.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn info() -> ResponderInfo {
        ResponderInfo {
            peer_id: PeerId::random(),
            public_key: None,
            started: Instant::now(),
        }
    }

    async fn answer(request: &[u8]) -> String {
        let mut duplex = Duplex {
            input: Cursor::new(request.to_vec()),
            output: Vec::new(),
        };
        respond(&mut duplex, &info()).await.unwrap();
        String::from_utf8(duplex.output).unwrap()
    }

    #[tokio::test]
    async fn test_status_answered() {
        let out = answer(br#"{"command":"status","node":"x"}"#).await;
        assert!(out.starts_with(r#"{"httpStatus":200}"#));
        let payload: serde_json::Value = serde_json::from_str(&out[r#"{"httpStatus":200}"#.len()..]).unwrap();
        assert_eq!(payload["p2p"], true);
        assert_eq!(payload["http"], false);
    }

    #[tokio::test]
    async fn test_other_commands_unsupported() {
        let out = answer(br#"{"command":"startCompute","node":"x"}"#).await;
        assert_eq!(out, r#"{"httpStatus":501,"error":"Unsupported command: startCompute"}"#);
    }

    #[tokio::test]
    async fn test_garbage_is_bad_request() {
        let out = answer(b"\x00\x01garbage").await;
        assert!(out.starts_with(r#"{"httpStatus":400"#));
    }
}
