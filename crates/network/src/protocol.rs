//! Command protocol
//!
//! A request is one JSON object `{command, node, authorization?, ...}`
//! written to a fresh stream, after which the writer half-closes. The
//! response is a sequence of chunks: conventionally a status frame
//! `{httpStatus, error?}` first, then payload chunks (JSON or raw bytes).

use std::fmt;

use futures::{AsyncRead, AsyncReadExt};
use libp2p::StreamProtocol;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol identifier for command and status traffic
pub const PROTOCOL_ID: StreamProtocol = StreamProtocol::new("/ocean/nodes/1.0.0");

/// Size of one read from a response stream. Each read is one chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a request frame accepted by the responder.
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Wire commands understood by compute nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "nonce")]
    Nonce,
    #[serde(rename = "getComputeEnvironments")]
    GetComputeEnvironments,
    #[serde(rename = "startCompute")]
    StartCompute,
    #[serde(rename = "freeStartCompute")]
    FreeStartCompute,
    #[serde(rename = "stopCompute")]
    StopCompute,
    #[serde(rename = "getComputeStatus")]
    GetComputeStatus,
    #[serde(rename = "getComputeResult")]
    GetComputeResult,
    #[serde(rename = "getComputeStreamableLogs")]
    GetComputeStreamableLogs,
    #[serde(rename = "createAuthToken")]
    CreateAuthToken,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Status,
        Command::Nonce,
        Command::GetComputeEnvironments,
        Command::StartCompute,
        Command::FreeStartCompute,
        Command::StopCompute,
        Command::GetComputeStatus,
        Command::GetComputeResult,
        Command::GetComputeStreamableLogs,
        Command::CreateAuthToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Nonce => "nonce",
            Command::GetComputeEnvironments => "getComputeEnvironments",
            Command::StartCompute => "startCompute",
            Command::FreeStartCompute => "freeStartCompute",
            Command::StopCompute => "stopCompute",
            Command::GetComputeStatus => "getComputeStatus",
            Command::GetComputeResult => "getComputeResult",
            Command::GetComputeStreamableLogs => "getComputeStreamableLogs",
            Command::CreateAuthToken => "createAuthToken",
        }
    }

    /// Commands whose response is consumed incrementally instead of drained.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Command::GetComputeStreamableLogs | Command::GetComputeResult)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown command: {}", s))
    }
}

/// Build the request frame. Keys in `body` override the envelope keys.
pub fn encode_request(
    command: &str,
    node: &str,
    authorization: Option<&str>,
    body: Option<&Map<String, Value>>,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = Map::new();
    frame.insert("command".into(), Value::String(command.to_string()));
    frame.insert("node".into(), Value::String(node.to_string()));
    if let Some(auth) = authorization {
        frame.insert("authorization".into(), Value::String(auth.to_string()));
    }
    if let Some(body) = body {
        for (key, value) in body {
            frame.insert(key.clone(), value.clone());
        }
    }
    serde_json::to_vec(&Value::Object(frame))
}

/// Request frame as seen by a responder.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Leading status frame of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFrame {
    pub http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusFrame {
    pub fn ok() -> Self {
        Self {
            http_status: 200,
            error: None,
        }
    }

    pub fn error(http_status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.http_status >= 400
    }

    /// Interpret a chunk as a status frame. Anything that is not a JSON
    /// object with a numeric `httpStatus` yields `None`.
    pub fn parse(chunk: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(chunk).ok()?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let status = value.get("httpStatus")?.as_u64()?;
        Some(Self {
            http_status: u16::try_from(status).unwrap_or(u16::MAX),
            error: value.get("error").and_then(Value::as_str).map(str::to_string),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Split a leading status frame off a chunk. Frames written back to
    /// back may arrive in one read, so whatever follows the first JSON value
    /// is returned as payload. Without a complete leading status frame the
    /// whole chunk is payload.
    pub fn split(chunk: &[u8]) -> (Option<Self>, &[u8]) {
        match Self::parse_head(chunk) {
            FrameHead::Frame(frame, rest) => (Some(frame), rest),
            FrameHead::NotStatus | FrameHead::Incomplete => (None, chunk),
        }
    }

    /// Like [`StatusFrame::split`], but tells a frame cut short by the end
    /// of `buf` apart from data that is not a status frame at all.
    pub fn parse_head(buf: &[u8]) -> FrameHead<'_> {
        let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => match Self::from_value(&value) {
                Some(frame) => FrameHead::Frame(frame, trim_leading_whitespace(&buf[values.byte_offset()..])),
                None => FrameHead::NotStatus,
            },
            Some(Err(e)) if e.is_eof() => FrameHead::Incomplete,
            Some(Err(_)) => FrameHead::NotStatus,
            None => FrameHead::Incomplete,
        }
    }
}

/// Outcome of reading the start of a response
#[derive(Debug, PartialEq)]
pub enum FrameHead<'a> {
    /// A status frame and whatever followed it
    Frame(StatusFrame, &'a [u8]),
    NotStatus,
    /// Empty, or a JSON value still missing bytes
    Incomplete,
}

fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Node status payload returned after a 200 status frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub version: String,
    pub http: bool,
    pub p2p: bool,
    /// Seconds since the node started
    pub uptime: u64,
}

/// Read one chunk. `Ok(None)` at end of stream.
pub async fn read_chunk<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf))
}

/// Read a whole request until the remote half-closes, bounded by `limit`.
pub async fn read_to_end_limited<S>(stream: &mut S, limit: usize) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut data = Vec::new();
    (&mut *stream).take(limit as u64 + 1).read_to_end(&mut data).await?;
    if data.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("request exceeds {} bytes", limit),
        ));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[test]
    fn test_command_wire_names() {
        for command in Command::ALL {
            let json = serde_json::to_string(&command).unwrap();
            assert_eq!(json, format!("\"{}\"", command.as_str()));
            assert_eq!(command.as_str().parse::<Command>().unwrap(), command);
        }
        assert!("launchRockets".parse::<Command>().is_err());
    }

    #[test]
    fn test_streaming_commands() {
        let streaming: Vec<_> = Command::ALL.iter().filter(|c| c.is_streaming()).collect();
        assert_eq!(streaming, vec![&Command::GetComputeResult, &Command::GetComputeStreamableLogs]);
    }

    #[test]
    fn test_encode_request_body_overrides() {
        let mut body = Map::new();
        body.insert("jobId".into(), Value::from("abc"));
        body.insert("node".into(), Value::from("override"));

        let bytes = encode_request("getComputeStatus", "16Uiu2peer", Some("token"), Some(&body)).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["command"], "getComputeStatus");
        assert_eq!(value["node"], "override");
        assert_eq!(value["authorization"], "token");
        assert_eq!(value["jobId"], "abc");
    }

    #[test]
    fn test_encode_request_without_authorization() {
        let bytes = encode_request("status", "peer", None, None).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("authorization").is_none());
        let request: CommandRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(request.command, "status");
        assert_eq!(request.node.as_deref(), Some("peer"));
    }

    #[test]
    fn test_status_frame_parse() {
        let frame = StatusFrame::parse(br#"{"httpStatus":404,"error":"Cannot connect to peer"}"#).unwrap();
        assert!(frame.is_error());
        assert_eq!(frame.error.as_deref(), Some("Cannot connect to peer"));

        assert_eq!(StatusFrame::parse(br#"{"httpStatus":200}"#), Some(StatusFrame::ok()));
        assert_eq!(StatusFrame::parse(b"not json"), None);
        assert_eq!(StatusFrame::parse(br#"{"id":"x"}"#), None);
    }

    #[test]
    fn test_parse_head_across_reads() {
        assert_eq!(StatusFrame::parse_head(br#"{"httpSta"#), FrameHead::Incomplete);
        assert_eq!(StatusFrame::parse_head(b"  "), FrameHead::Incomplete);
        assert_eq!(StatusFrame::parse_head(b"raw log line"), FrameHead::NotStatus);
        assert_eq!(StatusFrame::parse_head(br#"{"id":"abc"}"#), FrameHead::NotStatus);
        assert_eq!(
            StatusFrame::parse_head(br#"{"httpStatus":503,"error":"busy"} tail"#),
            FrameHead::Frame(StatusFrame::error(503, "busy"), b"tail")
        );

        // A cut frame is payload for callers that cannot wait for more
        let (frame, rest) = StatusFrame::split(br#"{"httpStatus":4"#);
        assert!(frame.is_none());
        assert_eq!(rest, br#"{"httpStatus":4"#);
    }

    #[test]
    fn test_split_coalesced_frames() {
        let (frame, rest) = StatusFrame::split(br#"{"httpStatus":200}{"id":"abc"}"#);
        assert_eq!(frame, Some(StatusFrame::ok()));
        assert_eq!(rest, br#"{"id":"abc"}"#);

        let (frame, rest) = StatusFrame::split(br#"{"httpStatus":200}"#);
        assert_eq!(frame, Some(StatusFrame::ok()));
        assert!(rest.is_empty());

        let (frame, rest) = StatusFrame::split(b"raw log line");
        assert_eq!(frame, None);
        assert_eq!(rest, b"raw log line");

        let (frame, rest) = StatusFrame::split(br#"{"id":"abc"}"#);
        assert_eq!(frame, None);
        assert_eq!(rest, br#"{"id":"abc"}"#);
    }

    #[test]
    fn test_status_frame_serializes_camel_case() {
        let bytes = StatusFrame::error(501, "Unsupported command: nonce").to_bytes();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"httpStatus":501,"error":"Unsupported command: nonce"}"#
        );
        assert_eq!(StatusFrame::ok().to_bytes(), br#"{"httpStatus":200}"#.to_vec());
    }

    #[tokio::test]
    async fn test_read_chunk_until_eof() {
        let mut cursor = Cursor::new(b"hello".to_vec());
        assert_eq!(read_chunk(&mut cursor).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_chunk(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_to_end_limited() {
        let mut cursor = Cursor::new(vec![7u8; 16]);
        assert_eq!(read_to_end_limited(&mut cursor, 16).await.unwrap().len(), 16);

        let mut cursor = Cursor::new(vec![7u8; 17]);
        assert!(read_to_end_limited(&mut cursor, 16).await.is_err());
    }
}
