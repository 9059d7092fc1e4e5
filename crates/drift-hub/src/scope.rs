//! Request/reply scopes.
//!
//! Every frame sent with "reply expected" opens a scope: the receiver
//! gets a [`ReplyScope`] it can answer through, and the answer may in
//! turn expect a reply, continuing the chain on fresh oneshot
//! channels. Streaming transfers are built entirely out of this
//! suspend-resume primitive — there is never more than one frame in
//! flight per scope.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

/// A raw frame travelling over a wire: payload plus an optional
/// channel the receiver answers on.
#[derive(Debug)]
pub(crate) struct Frame {
    pub payload: Bytes,
    pub reply: Option<oneshot::Sender<Frame>>,
}

/// A received frame together with its reply capability, if the sender
/// expects one.
#[derive(Debug)]
pub struct Scope {
    pub payload: Bytes,
    pub reply: Option<ReplyScope>,
}

impl From<Frame> for Scope {
    fn from(frame: Frame) -> Self {
        Self {
            payload: frame.payload,
            reply: frame.reply.map(|tx| ReplyScope { tx }),
        }
    }
}

/// One-shot reply capability for a received frame.
#[derive(Debug)]
pub struct ReplyScope {
    pub(crate) tx: oneshot::Sender<Frame>,
}

impl ReplyScope {
    /// Answer the pending request.
    ///
    /// With `expect_reply`, awaits the peer's next frame on this
    /// exchange and returns its scope; otherwise the exchange ends
    /// here and `None` is returned.
    pub async fn reply(self, payload: Bytes, expect_reply: bool) -> Result<Option<Scope>, HubError> {
        if expect_reply {
            let (tx, rx) = oneshot::channel();
            self.tx
                .send(Frame {
                    payload,
                    reply: Some(tx),
                })
                .map_err(|_| HubError::Closed)?;
            let frame = rx.await.map_err(|_| HubError::Closed)?;
            Ok(Some(frame.into()))
        } else {
            self.tx
                .send(Frame {
                    payload,
                    reply: None,
                })
                .map_err(|_| HubError::Closed)?;
            Ok(None)
        }
    }
}

/// Errors surfaced by hub operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The connection (or the awaited scope) is gone. A mid-flight
    /// exchange hits this on its next send after a disconnect.
    #[error("connection closed")]
    Closed,
}
