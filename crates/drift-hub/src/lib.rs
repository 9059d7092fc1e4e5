//! drift-hub — in-process connection multiplexer.
//!
//! A [`Hub`] owns a table of live connections and two callbacks: one
//! for unsolicited inbound frames, one for disconnects. Wires are
//! spawned as [`WirePlug`]s and joined pairwise — `a.open(b)` — which
//! registers one connection on each hub and starts a pump task per
//! side. Request/reply rounds and the survey broadcast are built on
//! the scope chain in [`scope`].
//!
//! The hub knows nothing about peer identity or the wire format; it
//! moves opaque byte frames. Deduplicating logical peers is the
//! handshake layer's job, above this crate.

mod plug;
mod scope;

pub use plug::{WireHandle, WirePlug};
pub use scope::{HubError, ReplyScope, Scope};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use scope::Frame;

/// Hub-local connection identifier.
pub type ConnectionId = u64;

/// Callback for unsolicited inbound frames. Awaited by the pump, so
/// frames from one connection are dispatched one at a time.
pub type MessageHandler =
    Arc<dyn Fn(Connection, Scope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback fired exactly once per side when a connection ends.
pub type DisconnectHandler = Arc<dyn Fn(ConnectionId) + Send + Sync>;

struct ConnEntry {
    tx: mpsc::UnboundedSender<Frame>,
}

pub(crate) struct HubInner {
    connections: DashMap<ConnectionId, ConnEntry>,
    next_id: AtomicU64,
    on_message: MessageHandler,
    on_disconnect: DisconnectHandler,
}

/// Connection multiplexer. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Handle to one live connection. Cheap to clone; sending looks the
/// transport channel up in the hub table, so a closed connection
/// fails with [`HubError::Closed`] rather than lingering.
#[derive(Clone)]
pub struct Connection {
    pub id: ConnectionId,
    hub: Arc<HubInner>,
}

impl Hub {
    pub fn new(on_message: MessageHandler, on_disconnect: DisconnectHandler) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
                on_message,
                on_disconnect,
            }),
        }
    }

    /// Spawn a wire end. `on_open` runs once the plug is joined to a
    /// remote plug and the connection is registered.
    pub fn spawn_wire(&self, on_open: impl FnOnce(Connection) + Send + 'static) -> WirePlug {
        WirePlug::new(self.inner.clone(), Box::new(on_open))
    }

    /// Snapshot of currently registered connection ids.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.connections.iter().map(|e| *e.key()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Drop a connection. The remote pump observes the closed channel
    /// and tears down its own side; both disconnect callbacks fire.
    pub fn disconnect(&self, id: ConnectionId) {
        self.inner.disconnect(id);
    }

    /// Fan `payload` out to every current connection except `exclude`.
    ///
    /// With `expect_reply`, each peer's answer arrives on the returned
    /// receiver as it comes in; the receiver closes once every
    /// surveyed peer has answered or vanished. Without it, the frames
    /// are fire-and-forget and the receiver is immediately empty.
    /// Unreachable peers are skipped — fan-out is best-effort.
    pub fn survey(
        &self,
        payload: Bytes,
        expect_reply: bool,
        exclude: Option<ConnectionId>,
    ) -> mpsc::UnboundedReceiver<(ConnectionId, Scope)> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let targets: Vec<(ConnectionId, mpsc::UnboundedSender<Frame>)> = self
            .inner
            .connections
            .iter()
            .filter(|e| Some(*e.key()) != exclude)
            .map(|e| (*e.key(), e.value().tx.clone()))
            .collect();

        for (id, tx) in targets {
            if expect_reply {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx
                    .send(Frame {
                        payload: payload.clone(),
                        reply: Some(reply_tx),
                    })
                    .is_err()
                {
                    tracing::debug!(conn = id, "survey target already closed");
                    continue;
                }
                let out = out_tx.clone();
                tokio::spawn(async move {
                    if let Ok(frame) = reply_rx.await {
                        let _ = out.send((id, frame.into()));
                    }
                });
            } else if tx
                .send(Frame {
                    payload: payload.clone(),
                    reply: None,
                })
                .is_err()
            {
                tracing::debug!(conn = id, "survey target already closed");
            }
        }

        out_rx
    }
}

impl HubInner {
    /// Register one end of a freshly joined wire and start its pump.
    pub(crate) fn attach(
        self: &Arc<Self>,
        tx: mpsc::UnboundedSender<Frame>,
        mut rx: mpsc::UnboundedReceiver<Frame>,
    ) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, ConnEntry { tx });

        let conn = Connection {
            id,
            hub: self.clone(),
        };

        let hub = self.clone();
        let pump_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                (hub.on_message)(pump_conn.clone(), frame.into()).await;
            }
            // Remote side dropped its sender: tear down our side.
            hub.connections.remove(&id);
            tracing::trace!(conn = id, "connection closed");
            (hub.on_disconnect)(id);
        });

        conn
    }

    fn disconnect(&self, id: ConnectionId) {
        // Dropping the entry drops our sender; the remote pump exits,
        // drops its own sender, and our pump follows.
        self.connections.remove(&id);
    }
}

impl Connection {
    /// Send a frame. With `expect_reply`, awaits the peer's answer and
    /// returns its scope.
    pub async fn post(&self, payload: Bytes, expect_reply: bool) -> Result<Option<Scope>, HubError> {
        let tx = self
            .hub
            .connections
            .get(&self.id)
            .map(|e| e.tx.clone())
            .ok_or(HubError::Closed)?;

        if expect_reply {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(Frame {
                payload,
                reply: Some(reply_tx),
            })
            .map_err(|_| HubError::Closed)?;
            let frame = reply_rx.await.map_err(|_| HubError::Closed)?;
            Ok(Some(frame.into()))
        } else {
            tx.send(Frame {
                payload,
                reply: None,
            })
            .map_err(|_| HubError::Closed)?;
            Ok(None)
        }
    }

    /// Close this connection from our side.
    pub fn close(&self) {
        self.hub.disconnect(self.id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}
