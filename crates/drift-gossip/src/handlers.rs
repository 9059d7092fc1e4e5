//! Application hooks invoked by the gossip controller.
//!
//! The controller knows nothing about feeds beyond their wire shape; what to
//! keep, what to answer, and what to forward is decided by these callbacks.
//! Each field is an `Arc` so a handler set can be cloned into spawned tasks.

use std::sync::Arc;

use drift_core::Feed;
use drift_hub::{Connection, ConnectionId};
use futures::future::BoxFuture;
use serde_json::Value;

/// Fires after a handshake completes on a wire this side initiated.
pub type ConnectHook = Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fires once per connection when its wire goes away.
pub type DisconnectHook = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// Answers a peer's query with the feeds to send back.
pub type QueryHook = Arc<dyn Fn(Value) -> BoxFuture<'static, Vec<Feed>> + Send + Sync>;

/// Receives one feed from a peer. Returning `Some(patch)` asks the
/// controller to forward the patch to every other peer.
pub type BlocksHook = Arc<dyn Fn(Feed, ConnectionId) -> BoxFuture<'static, Option<Feed>> + Send + Sync>;

#[derive(Clone)]
pub struct GossipHandlers {
    pub on_connect: ConnectHook,
    pub on_disconnect: DisconnectHook,
    pub on_query: QueryHook,
    pub on_blocks: BlocksHook,
}

impl Default for GossipHandlers {
    /// Inert handler set: answers queries with nothing and keeps no blocks.
    fn default() -> Self {
        Self {
            on_connect: Arc::new(|_conn| Box::pin(async {})),
            on_disconnect: Arc::new(|_id| {}),
            on_query: Arc::new(|_params| Box::pin(async { Vec::new() })),
            on_blocks: Arc::new(|_feed, _from| Box::pin(async { None })),
        }
    }
}

impl std::fmt::Debug for GossipHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GossipHandlers { .. }")
    }
}
