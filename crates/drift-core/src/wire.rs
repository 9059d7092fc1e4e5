//! Drift wire format — the gossip frame codec.
//!
//! Every frame is exactly one tag byte followed by a type-specific
//! payload. The payload shape is fully determined by the tag; decoding
//! an unrecognized tag is a fatal decode error for that frame (and
//! only that frame — the connection stays open). Changing a tag value
//! here is a protocol break.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::feed::Feed;

// ── Tags ─────────────────────────────────────────────────────────────────────

/// Positive acknowledgement; also "continue streaming". No payload.
pub const TAG_OK: u8 = 0x00;
/// Query for feeds. Payload: schema-free JSON parameter object.
pub const TAG_QUERY: u8 = 0x01;
/// Feed transfer. Payload: canonical feed bytes.
pub const TAG_BLOCKS: u8 = 0x02;
/// Handshake identity exchange. Payload: exactly 8 bytes.
pub const TAG_NODE_ID: u8 = 0x03;
/// Negative acknowledgement. No payload.
/// The conceptual tag is -1; on the wire it is the unsigned byte 0xFF.
pub const TAG_ERR: u8 = 0xFF;

/// Node identifier exchanged during handshake.
///
/// Random, generated once per controller instance. Used purely for
/// duplicate-connection detection, never for authentication.
pub type NodeId = [u8; 8];

// ── Messages ─────────────────────────────────────────────────────────────────

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ok,
    Err,
    Query(serde_json::Value),
    Blocks(Feed),
    NodeId(NodeId),
}

impl Message {
    /// The tag byte this message encodes to.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Ok => TAG_OK,
            Message::Err => TAG_ERR,
            Message::Query(_) => TAG_QUERY,
            Message::Blocks(_) => TAG_BLOCKS,
            Message::NodeId(_) => TAG_NODE_ID,
        }
    }

    /// Encode into a wire frame.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(1);
        buf.put_u8(self.tag());
        match self {
            Message::Ok | Message::Err => {}
            Message::Query(params) => {
                let body = serde_json::to_vec(params)
                    .map_err(|e| WireError::MalformedFrame(e.to_string()))?;
                buf.put_slice(&body);
            }
            Message::Blocks(feed) => buf.put_slice(&feed.to_bytes()),
            Message::NodeId(id) => buf.put_slice(id),
        }
        Ok(buf.freeze())
    }

    /// Decode a wire frame, dispatching on the tag byte.
    pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
        let (&tag, payload) = frame
            .split_first()
            .ok_or_else(|| WireError::MalformedFrame("empty frame".into()))?;
        match tag {
            TAG_OK if payload.is_empty() => Ok(Message::Ok),
            TAG_ERR if payload.is_empty() => Ok(Message::Err),
            TAG_OK | TAG_ERR => Err(WireError::MalformedFrame(
                "signal frame carries a payload".into(),
            )),
            TAG_QUERY => {
                let params = serde_json::from_slice(payload)
                    .map_err(|e| WireError::MalformedFrame(e.to_string()))?;
                Ok(Message::Query(params))
            }
            TAG_BLOCKS => {
                let feed = Feed::from_bytes(payload)
                    .map_err(|e| WireError::MalformedFrame(e.to_string()))?;
                Ok(Message::Blocks(feed))
            }
            TAG_NODE_ID => {
                let id: NodeId = payload
                    .try_into()
                    .map_err(|_| WireError::MalformedFrame("node id must be 8 bytes".into()))?;
                Ok(Message::NodeId(id))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire frames.
///
/// Both are local to the offending frame; neither closes a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message tag: 0x{0:02x}")]
    UnknownTag(u8),
}

// ── Tests ────────────────────────────────────────────────────────────────────
