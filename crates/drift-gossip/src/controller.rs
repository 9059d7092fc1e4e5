//! The gossip controller: handshake, frame dispatch, and streaming
//! feed transfer.
//!
//! Every wire starts with an identity exchange. Each side posts its
//! 8-byte node id and waits for OK; a side that already holds a live
//! connection to that id answers ERR and force-closes the new wire, so
//! redundant links between the same two nodes collapse to one. Ids are
//! random per controller instance and carry no authority.
//!
//! Feed transfer is strictly one frame in flight: the sender posts one
//! BLOCKS frame, marks whether more follow, and continues only after
//! the receiver's OK. Shares fan out through the hub survey with the
//! originating connection excluded, which keeps a patch from echoing
//! straight back to whoever delivered it.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use drift_core::wire::{Message, NodeId, WireError, TAG_ERR, TAG_OK};
use drift_core::Feed;
use drift_hub::{Connection, ConnectionId, Hub, HubError, ReplyScope, Scope, WirePlug};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::handlers::GossipHandlers;

/// One live connection as seen by the controller. `peer` is `None`
/// until the remote end's handshake frame has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub conn: ConnectionId,
    pub peer: Option<NodeId>,
}

#[derive(Debug, Error)]
pub enum GossipError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Hub(#[from] HubError),

    /// The remote answered a transfer round with ERR.
    #[error("peer rejected transfer")]
    Rejected,

    /// A second wire to an already-connected node. The new wire is
    /// closed; the original session is untouched.
    #[error("duplicate peer")]
    DuplicatePeer,
}

/// Single-byte signal frames. These never fail to encode.
fn ok_frame() -> Bytes {
    Bytes::from_static(&[TAG_OK])
}

fn err_frame() -> Bytes {
    Bytes::from_static(&[TAG_ERR])
}

pub struct GossipController {
    node_id: NodeId,
    hub: Hub,
    handlers: GossipHandlers,
    /// Handshake-resolved identities, keyed by hub connection id.
    peers: DashMap<ConnectionId, NodeId>,
    connections_tx: watch::Sender<Vec<PeerInfo>>,
}

impl GossipController {
    /// Build a controller with a fresh random node id.
    pub fn new(handlers: GossipHandlers) -> Arc<Self> {
        let mut node_id = NodeId::default();
        OsRng.fill_bytes(&mut node_id);
        Self::with_node_id(handlers, node_id)
    }

    /// Build a controller with a caller-chosen node id. Colliding ids
    /// make two distinct nodes refuse each other, so injection is for
    /// deterministic tests and persisted identities.
    pub fn with_node_id(handlers: GossipHandlers, node_id: NodeId) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<GossipController>| {
            let on_message = {
                let weak = weak.clone();
                Arc::new(move |conn: Connection, scope: Scope| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(ctrl) = weak.upgrade() {
                            ctrl.dispatch(conn, scope).await;
                        }
                    }) as futures::future::BoxFuture<'static, ()>
                })
            };
            let on_disconnect = {
                let weak = weak.clone();
                Arc::new(move |id: ConnectionId| {
                    if let Some(ctrl) = weak.upgrade() {
                        ctrl.handle_disconnect(id);
                    }
                })
            };
            GossipController {
                node_id,
                hub: Hub::new(on_message, on_disconnect),
                handlers,
                peers: DashMap::new(),
                connections_tx: watch::Sender::new(Vec::new()),
            }
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }

    /// Watch the live connection set. Republished whenever a handshake
    /// resolves or a wire goes away.
    pub fn connections(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.connections_tx.subscribe()
    }

    /// Tear down every live wire.
    pub fn disconnect_all(&self) {
        for id in self.hub.connection_ids() {
            self.hub.disconnect(id);
        }
    }

    // ── Handshake ────────────────────────────────────────────────────────────

    /// Spawn a wire end. Once joined, this side introduces itself with
    /// a NODE_ID frame and runs the connect hook on acceptance.
    pub fn spawn_wire(self: &Arc<Self>) -> WirePlug {
        let ctrl = self.clone();
        self.hub.spawn_wire(move |conn| {
            tokio::spawn(async move {
                if let Err(e) = ctrl.handshake(conn).await {
                    debug!(error = %e, "handshake aborted");
                }
            });
        })
    }

    async fn handshake(self: &Arc<Self>, conn: Connection) -> Result<(), GossipError> {
        let hello = Message::NodeId(self.node_id).encode()?;
        let Some(scope) = conn.post(hello, true).await? else {
            return Ok(());
        };
        match Message::decode(&scope.payload) {
            Ok(Message::Ok) => {
                trace!(conn = conn.id, "handshake accepted");
                self.publish_connections();
                (self.handlers.on_connect)(conn).await;
                Ok(())
            }
            Ok(Message::Err) => {
                // Remote already talks to us over another wire; it
                // closes this one.
                Err(GossipError::DuplicatePeer)
            }
            other => {
                warn!(conn = conn.id, ?other, "unexpected handshake reply");
                Ok(())
            }
        }
    }

    async fn handle_node_id(
        &self,
        conn: &Connection,
        id: NodeId,
        reply: Option<ReplyScope>,
    ) -> Result<(), GossipError> {
        let duplicate = self
            .peers
            .iter()
            .any(|e| *e.key() != conn.id && e.value() == &id);
        if duplicate {
            warn!(
                conn = conn.id,
                peer = %hex::encode(id),
                "duplicate peer, closing redundant wire"
            );
            if let Some(reply) = reply {
                let _ = reply.reply(err_frame(), false).await;
            }
            conn.close();
            return Err(GossipError::DuplicatePeer);
        }

        self.peers.insert(conn.id, id);
        if let Some(reply) = reply {
            reply.reply(ok_frame(), false).await?;
        }
        trace!(conn = conn.id, peer = %hex::encode(id), "peer resolved");
        self.publish_connections();
        Ok(())
    }

    fn handle_disconnect(&self, id: ConnectionId) {
        self.peers.remove(&id);
        self.publish_connections();
        (self.handlers.on_disconnect)(id);
    }

    fn publish_connections(&self) {
        let infos = self
            .hub
            .connection_ids()
            .into_iter()
            .map(|id| PeerInfo {
                conn: id,
                peer: self.peers.get(&id).map(|e| *e.value()),
            })
            .collect();
        self.connections_tx.send_replace(infos);
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Handle one inbound frame. Invoked by the hub pump for
    /// unsolicited frames and fed reply frames by [`Self::query`].
    async fn dispatch(self: Arc<Self>, conn: Connection, scope: Scope) {
        let msg = match Message::decode(&scope.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn = conn.id, error = %e, "dropping undecodable frame");
                return;
            }
        };
        match msg {
            Message::NodeId(id) => {
                if let Err(e) = self.handle_node_id(&conn, id, scope.reply).await {
                    debug!(conn = conn.id, error = %e, "handshake not completed");
                }
            }
            Message::Blocks(feed) => {
                if let Err(e) = self.download(&conn, feed, scope.reply).await {
                    debug!(conn = conn.id, error = %e, "download ended early");
                }
            }
            Message::Query(params) => {
                // Answered off the pump so a slow transfer does not
                // hold up other frames from this peer.
                let ctrl = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = ctrl.handle_query(params, scope.reply).await {
                        debug!(conn = conn.id, error = %e, "query answer failed");
                    }
                });
            }
            other => {
                // Unsolicited signal frames have no meaning here.
                warn!(conn = conn.id, tag = other.tag(), "dropping unexpected frame");
            }
        }
    }

    // ── Feed transfer ────────────────────────────────────────────────────────

    /// Receive a stream of feeds, acknowledging each frame to pull the
    /// next. Accepted patches are forwarded to every other peer.
    async fn download(
        self: &Arc<Self>,
        conn: &Connection,
        first: Feed,
        mut reply: Option<ReplyScope>,
    ) -> Result<(), GossipError> {
        let mut feed = first;
        loop {
            if let Some(patch) = (self.handlers.on_blocks)(feed, conn.id).await {
                let ctrl = self.clone();
                let from = conn.id;
                tokio::spawn(async move {
                    if let Err(e) = ctrl.share_blocks(vec![patch], Some(from)).await {
                        debug!(error = %e, "patch forwarding failed");
                    }
                });
            }

            // No reply scope means the sender marked this frame final.
            let Some(scope) = reply.take() else {
                return Ok(());
            };
            let Some(next) = scope.reply(ok_frame(), true).await? else {
                return Ok(());
            };
            match Message::decode(&next.payload)? {
                Message::Blocks(more) => {
                    feed = more;
                    reply = next.reply;
                }
                Message::Ok => return Ok(()),
                other => {
                    warn!(conn = conn.id, tag = other.tag(), "expected BLOCKS mid-stream");
                    if let Some(scope) = next.reply {
                        let _ = scope.reply(err_frame(), false).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn handle_query(
        self: &Arc<Self>,
        params: Value,
        reply: Option<ReplyScope>,
    ) -> Result<(), GossipError> {
        let feeds = (self.handlers.on_query)(params).await;
        let Some(reply) = reply else {
            debug!("query arrived without a reply scope");
            return Ok(());
        };
        self.upload(reply, feeds).await
    }

    /// Stream feeds over a reply chain, one frame per acknowledgement.
    /// An empty list answers with a bare OK.
    async fn upload(&self, scope: ReplyScope, feeds: Vec<Feed>) -> Result<(), GossipError> {
        if feeds.is_empty() {
            scope.reply(ok_frame(), false).await?;
            return Ok(());
        }

        let mut scope = Some(scope);
        let mut iter = feeds.into_iter().peekable();
        while let Some(feed) = iter.next() {
            let more = iter.peek().is_some();
            let frame = Message::Blocks(feed).encode()?;
            let current = scope.take().ok_or(HubError::Closed)?;
            let Some(ack) = current.reply(frame, more).await? else {
                // Final frame sent without expecting an answer.
                return Ok(());
            };
            match Message::decode(&ack.payload)? {
                Message::Ok => scope = ack.reply,
                _ => return Err(GossipError::Rejected),
            }
            if more && scope.is_none() {
                warn!("peer acknowledged without continuing the stream");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Push feeds to every connected peer except `exclude`, typically
    /// the connection a patch arrived on. Best-effort: unreachable or
    /// refusing peers are skipped, not retried.
    pub async fn share_blocks(
        self: &Arc<Self>,
        mut feeds: Vec<Feed>,
        exclude: Option<ConnectionId>,
    ) -> Result<(), GossipError> {
        if feeds.is_empty() {
            return Ok(());
        }
        let first = feeds.remove(0);
        let rest = feeds;
        let more = !rest.is_empty();

        let frame = Message::Blocks(first).encode()?;
        let mut replies = self.hub.survey(frame, more, exclude);
        if !more {
            return Ok(());
        }

        // Each peer that acknowledges gets the remainder on its own
        // reply chain, concurrently.
        while let Some((conn_id, scope)) = replies.recv().await {
            match Message::decode(&scope.payload) {
                Ok(Message::Ok) => {
                    let Some(reply) = scope.reply else {
                        warn!(conn = conn_id, "peer acknowledged without continuing the stream");
                        continue;
                    };
                    let ctrl = self.clone();
                    let rest = rest.clone();
                    tokio::spawn(async move {
                        if let Err(e) = ctrl.upload(reply, rest).await {
                            debug!(conn = conn_id, error = %e, "share stream ended early");
                        }
                    });
                }
                _ => debug!(conn = conn_id, "peer declined share"),
            }
        }
        Ok(())
    }

    /// Ask one peer for feeds. The answer streams back over the reply
    /// chain and lands in the blocks hook like any other transfer; a
    /// bare OK means the peer had nothing for us.
    pub async fn query(
        self: &Arc<Self>,
        conn: &Connection,
        params: Value,
    ) -> Result<(), GossipError> {
        let frame = Message::Query(params).encode()?;
        let Some(scope) = conn.post(frame, true).await? else {
            return Ok(());
        };
        match Message::decode(&scope.payload)? {
            Message::Ok => Ok(()),
            Message::Err => Err(GossipError::Rejected),
            _ => {
                self.clone().dispatch(conn.clone(), scope).await;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for GossipController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipController")
            .field("node_id", &hex::encode(self.node_id))
            .field("connections", &self.hub.connection_count())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
