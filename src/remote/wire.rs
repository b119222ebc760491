//! Length-prefixed framing and the inter-Runtime message envelope.
//!
//! 4-byte big-endian length prefix followed by a `bincode`-encoded
//! [`WireMessage`]. Transport-agnostic: anything `AsyncRead + AsyncWrite +
//! Unpin` works, so the same framing serves the TCP listener and tests that
//! run over an in-memory duplex pipe.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RaceError;

/// Frames larger than this are refused rather than risk an unbounded
/// allocation from a corrupt or hostile length prefix.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Handshake { uri: String, runtime_name: String },
    Lookup { name: String },
    LookupReply(LookupResult),
    Instantiate { name: String, implementation: String, config_json: String },
    InstantiateReply(InstantiateResult),
    LifecycleCmd { handle_name: String, cmd: WireLifecycleCommand },
    LifecycleAck { handle_name: String, ok: bool, reason: Option<String> },
    BusEvent {
        channel: String,
        type_id: String,
        payload: Vec<u8>,
        sender_runtime_uri: String,
        sender_name: String,
    },
    TopicRequest { channel: String, topic_key: Option<String>, requester_runtime_uri: String, requester_name: String },
    TopicResponse { channel: String, topic_key: Option<String>, provider_runtime_uri: String, provider_name: String },
    TopicAccept { channel: String, topic_key: Option<String> },
    TopicReject { channel: String, topic_key: Option<String> },
    TopicRelease { channel: String, topic_key: Option<String> },
    /// Ask a peer Runtime for the lifecycle state of every Entity it hosts.
    Inspect,
    InspectReply { entities: Vec<(String, String)> },
    /// Request a clean shutdown of the whole peer Runtime. Idempotent: a
    /// peer that is already shutting down still acknowledges.
    Shutdown,
    ShutdownAck,
    Disconnect,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WireLifecycleCommand {
    Initialize,
    Start,
    Pause,
    Resume,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LookupResult {
    Found { runtime_uri: String },
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstantiateResult {
    Started { runtime_uri: String },
    Error { code: String },
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &WireMessage) -> Result<(), RaceError> {
    let bytes = bincode::serialize(msg).map_err(|e| RaceError::Serialization {
        type_id: "WireMessage".into(),
        reason: e.to_string(),
    })?;
    if bytes.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(RaceError::Serialization {
            type_id: "WireMessage".into(),
            reason: format!("encoded frame {} bytes exceeds max {}", bytes.len(), MAX_FRAME_BYTES),
        });
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WireMessage, RaceError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(RaceError::RemoteTransport {
            peer: "unknown".into(),
            reason: format!("frame length {len} exceeds max {MAX_FRAME_BYTES}"),
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| RaceError::Serialization {
        type_id: "WireMessage".into(),
        reason: e.to_string(),
    })
}
