//! IPC protocol types for CLI-daemon communication
//!
//! Messages are sent as newline-delimited JSON. Each message is a small
//! envelope carrying a type tag, the sender's client id, a request id for
//! correlating replies, and an opaque payload that is itself JSON (or plain
//! text for error replies), base64-encoded so the frame stays on one line.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Identifier of a client session, also the suffix of its reply address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Generate a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Per-call tag echoed by the daemon so stale replies can be told apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a message, encoded as an integer on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum MessageType {
    /// Reserved, no handler acts on it
    Terminate,
    /// List the mocked hosts
    Status,
    /// Map a host to a directory
    Mock,
    /// Remove a mapped host
    Unmock,
    /// Remove every mapped host
    Clear,
    /// Request succeeded
    Success,
    /// Request failed, payload is the reason
    Error,
    /// Synthesized by the client when no reply arrived in time
    Timeout,
    /// Shut the daemon down
    Stop,
}

/// Integer on the wire that names no [`MessageType`]
#[derive(Debug, Error)]
#[error("unknown message type {0}")]
pub struct UnknownMessageType(pub i32);

impl From<MessageType> for i32 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Terminate => 0,
            MessageType::Status => 1,
            MessageType::Mock => 2,
            MessageType::Unmock => 3,
            MessageType::Clear => 4,
            MessageType::Success => 5,
            MessageType::Error => 6,
            MessageType::Timeout => 7,
            MessageType::Stop => 8,
        }
    }
}

impl TryFrom<i32> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: i32) -> Result<Self, UnknownMessageType> {
        Ok(match value {
            0 => MessageType::Terminate,
            1 => MessageType::Status,
            2 => MessageType::Mock,
            3 => MessageType::Unmock,
            4 => MessageType::Clear,
            5 => MessageType::Success,
            6 => MessageType::Error,
            7 => MessageType::Timeout,
            8 => MessageType::Stop,
            other => return Err(UnknownMessageType(other)),
        })
    }
}

/// Wire envelope shared by requests and replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub msg_type: MessageType,
    /// Present on client requests only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Message {
    /// Build a client request
    pub fn request(
        msg_type: MessageType,
        client_id: ClientId,
        request_id: RequestId,
        data: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            client_id: Some(client_id),
            request_id: Some(request_id),
            data,
        }
    }

    /// Success reply with an optional payload
    pub fn success(data: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Success,
            client_id: None,
            request_id: None,
            data,
        }
    }

    /// Error reply carrying a human-readable reason
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Error,
            client_id: None,
            request_id: None,
            data: reason.into().into_bytes(),
        }
    }

    /// Client-local marker for a call whose reply never arrived
    pub fn timeout() -> Self {
        Self {
            msg_type: MessageType::Timeout,
            client_id: None,
            request_id: None,
            data: Vec::new(),
        }
    }

    /// Tag a reply with the request it answers
    pub fn in_reply_to(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Decode the JSON payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Payload interpreted as text, as carried by error replies
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Serialize a payload for [`Message::data`]
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(payload)?)
}

/// One active host-to-directory mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockedHost {
    pub host: String,
    pub directory: PathBuf,
}

impl MockedHost {
    pub fn new(host: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            directory: directory.into(),
        }
    }
}

/// Payload of a Mock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockData {
    pub host: String,
    #[serde(alias = "dir")]
    pub directory: PathBuf,
}

/// Payload of an Unmock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmockData {
    pub host: String,
}

/// Errors while framing or decoding messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),
}

impl ProtocolError {
    /// Whether the stream is still positioned at a frame boundary
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProtocolError::Io(_))
    }
}

/// Longest frame accepted, terminator included
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Write one message followed by the frame terminator
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message, `None` once the peer has closed the stream
///
/// A malformed or oversized frame yields [`ProtocolError::Json`] or
/// [`ProtocolError::FrameTooLarge`] with the stream still positioned at the
/// following frame, so callers may keep reading.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut frame = Vec::new();
    loop {
        frame.clear();
        match read_frame(reader, &mut frame).await? {
            Frame::Eof => return Ok(None),
            Frame::Oversized(len) => return Err(ProtocolError::FrameTooLarge(len)),
            Frame::Complete if frame.iter().all(u8::is_ascii_whitespace) => continue,
            Frame::Complete => return Ok(Some(serde_json::from_slice(&frame)?)),
        }
    }
}

enum Frame {
    Eof,
    Complete,
    Oversized(usize),
}

/// Read up to and including the next newline into `frame`
///
/// Past [`MAX_FRAME_LEN`] the rest of the line is consumed without being
/// buffered.
async fn read_frame<R>(reader: &mut R, frame: &mut Vec<u8>) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut discarded = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (frame.is_empty(), discarded) {
                (true, 0) => Frame::Eof,
                (_, 0) => Frame::Complete,
                (_, len) => Frame::Oversized(len),
            });
        }

        let (chunk_len, terminated) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        if discarded > 0 || frame.len() + chunk_len > MAX_FRAME_LEN {
            discarded += frame.len() + chunk_len;
            frame.clear();
        } else {
            frame.extend_from_slice(&available[..chunk_len]);
        }
        reader.consume(chunk_len);

        if terminated {
            return Ok(if discarded > 0 {
                Frame::Oversized(discarded)
            } else {
                Frame::Complete
            });
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
