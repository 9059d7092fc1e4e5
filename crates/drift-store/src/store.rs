//! The reducer state machine.
//!
//! Merges feeds into named collections under the registered reducers.
//! Dispatch is serialized by an internal async gate — no two merges
//! interleave, which makes the store the sole arbiter of merge order.
//! Accepted blocks are published on a broadcast channel together with
//! an opaque `origin` token the caller threaded through dispatch; the
//! kernel's gossip bridge uses it to avoid echoing blocks back to the
//! connection they arrived on.
//!
//! Already-known blocks merge as a no-op. That no-op is what
//! terminates the gossip flood: a block a peer has seen before
//! produces no mutation, so it is never re-broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};

use drift_core::feed::{Feed, FeedError, PublicKey, GENESIS_PARENT};

use crate::block::BlockBody;
use crate::reducer::{Reducer, Value};
use crate::repo::Repo;

/// Capacity of the merge-event broadcast channel. A subscriber that
/// falls more than this many merges behind loses the overflow: those
/// blocks stay in the local head but are never announced to that
/// subscriber, so a lagging gossip bridge misses them until a peer
/// pulls the full head set with its next query.
const MERGE_CHANNEL_CAPACITY: usize = 64;

/// Accepted blocks, announced to merge subscribers.
#[derive(Debug, Clone)]
pub struct MergeEvent {
    /// The accepted tail, detached from its chain prefix.
    pub patch: Feed,
    /// Collections the patch touched.
    pub collections: Vec<String>,
    /// Opaque token identifying where the feed came from, if the
    /// dispatcher supplied one. Gossip uses the source connection id.
    pub origin: Option<u64>,
}

/// Result of one dispatch call.
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    /// The accepted tail, if any block was accepted.
    pub patch: Option<Feed>,
    /// Collections modified by this dispatch.
    pub collections: Vec<String>,
}

impl Mutation {
    pub fn is_empty(&self) -> bool {
        self.patch.is_none()
    }
}

/// Errors from the merge path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The registered merge strategy refused the feed. Raised only on
    /// loud dispatch; quiet dispatch reports an empty mutation.
    #[error("rejected by store: {0}")]
    Rejected(String),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

struct Collection {
    reducer: Box<dyn Reducer>,
    state: HashMap<PublicKey, Value>,
    watch_tx: watch::Sender<Value>,
}

impl Collection {
    /// Snapshot of per-author state, keyed by hex author id.
    fn snapshot(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .state
            .iter()
            .map(|(author, value)| (hex::encode(author), value.clone()))
            .collect();
        Value::Object(map)
    }
}

struct StoreInner {
    collections: DashMap<String, Collection>,
    /// Serializes merges. Held across the whole dispatch body.
    gate: Mutex<()>,
    merges: broadcast::Sender<MergeEvent>,
}

/// Reducer state machine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Store {
    repo: Repo,
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(repo: Repo) -> Self {
        let (merges, _) = broadcast::channel(MERGE_CHANNEL_CAPACITY);
        Self {
            repo,
            inner: Arc::new(StoreInner {
                collections: DashMap::new(),
                gate: Mutex::new(()),
                merges,
            }),
        }
    }

    /// Register a named collection. Call before [`Store::load`].
    pub fn register(&self, name: &str, reducer: impl Reducer + 'static) {
        let watch_tx = watch::Sender::new(Value::Object(serde_json::Map::new()));
        self.inner.collections.insert(
            name.to_string(),
            Collection {
                reducer: Box::new(reducer),
                state: HashMap::new(),
                watch_tx,
            },
        );
    }

    /// Replay persisted heads through the registered reducers.
    pub async fn load(&self) {
        let _gate = self.inner.gate.lock().await;
        for (author, feed) in self.repo.list_heads() {
            for block in feed.blocks() {
                let body = match BlockBody::from_bytes(&block.payload) {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(author = hex::encode(&author[..8]), error = %e,
                            "skipping undecodable persisted block");
                        continue;
                    }
                };
                let Some(mut col) = self.inner.collections.get_mut(&body.kind) else {
                    continue;
                };
                let col = col.value_mut();
                let current = col
                    .state
                    .get(&author)
                    .cloned()
                    .unwrap_or_else(|| col.reducer.initial_value());
                match col.reducer.apply(&current, &author, &body.payload) {
                    Ok(next) => {
                        col.state.insert(author, next);
                    }
                    Err(rejection) => {
                        tracing::warn!(author = hex::encode(&author[..8]), %rejection,
                            "persisted block no longer accepted on replay");
                    }
                }
            }
        }
        for mut entry in self.inner.collections.iter_mut() {
            let snapshot = entry.value().snapshot();
            let _ = entry.value_mut().watch_tx.send(snapshot);
        }
    }

    /// Merge a feed.
    ///
    /// `loud` decides whether a refused merge raises
    /// [`StoreError::Rejected`] or is reported as an empty mutation.
    /// `origin` is carried verbatim into the merge event.
    pub async fn dispatch(
        &self,
        feed: &Feed,
        loud: bool,
        origin: Option<u64>,
    ) -> Result<Mutation, StoreError> {
        let _gate = self.inner.gate.lock().await;

        let Some(first) = feed.first() else {
            return Ok(Mutation::default());
        };
        let author = first.author;

        if let Err(e) = feed.verify() {
            return self.refuse(loud, format!("feed failed verification: {e}"));
        }
        if feed.blocks().iter().any(|b| b.author != author) {
            return self.refuse(loud, "mixed-author feed".to_string());
        }

        // Locate where the incoming feed extends our known head.
        let head = self.repo.load_head(&author).filter(|h| !h.is_empty());
        let start = match &head {
            None => {
                if first.parent != GENESIS_PARENT {
                    return self.refuse(loud, "orphaned feed: unknown parent".to_string());
                }
                0
            }
            Some(known) => {
                // Nonempty by the filter above.
                let tip = known.blocks()[known.len() - 1].signature;
                let incoming_tip = feed.blocks()[feed.len() - 1].signature;
                if let Some(i) = feed.blocks().iter().position(|b| b.parent == tip) {
                    i
                } else if known.blocks().iter().any(|kb| kb.signature == incoming_tip) {
                    // Every incoming block is already part of our chain.
                    return Ok(Mutation::default());
                } else {
                    return self.refuse(loud, "orphaned feed: unknown parent".to_string());
                }
            }
        };

        // Apply reducers block by block, staging state until commit.
        let mut staged: HashMap<String, Value> = HashMap::new();
        let mut touched: Vec<String> = Vec::new();
        let mut accepted = 0usize;
        let mut rejection: Option<String> = None;

        for block in &feed.blocks()[start..] {
            let body = match BlockBody::from_bytes(&block.payload) {
                Ok(body) => body,
                Err(e) => {
                    rejection = Some(format!("undecodable block body: {e}"));
                    break;
                }
            };
            let Some(col) = self.inner.collections.get(&body.kind) else {
                rejection = Some(format!("unknown collection: {}", body.kind));
                break;
            };
            let current = staged
                .get(&body.kind)
                .cloned()
                .or_else(|| col.state.get(&author).cloned())
                .unwrap_or_else(|| col.reducer.initial_value());
            match col.reducer.apply(&current, &author, &body.payload) {
                Ok(next) => {
                    staged.insert(body.kind.clone(), next);
                    if !touched.contains(&body.kind) {
                        touched.push(body.kind.clone());
                    }
                    accepted += 1;
                }
                Err(rej) => {
                    rejection = Some(rej.0);
                    break;
                }
            }
        }

        if accepted == 0 {
            return match rejection {
                Some(reason) => self.refuse(loud, reason),
                None => Ok(Mutation::default()),
            };
        }

        // Commit: collection state, watch snapshots, head, merge event.
        let patch = Feed::from(feed.blocks()[start..start + accepted].to_vec());

        for (kind, value) in staged {
            if let Some(mut col) = self.inner.collections.get_mut(&kind) {
                let col = col.value_mut();
                col.state.insert(author, value);
                let snapshot = col.snapshot();
                let _ = col.watch_tx.send(snapshot);
            }
        }

        let mut new_head = head.unwrap_or_default();
        for block in patch.blocks() {
            new_head.push(block.clone())?;
        }
        self.repo.save_head(author, new_head);

        let tip = patch.last().map(|b| hex::encode(&b.id()[..8])).unwrap_or_default();
        tracing::debug!(
            author = hex::encode(&author[..8]),
            blocks = accepted,
            %tip,
            collections = ?touched,
            "merged blocks"
        );
        let _ = self.inner.merges.send(MergeEvent {
            patch: patch.clone(),
            collections: touched.clone(),
            origin,
        });

        let mutation = Mutation {
            patch: Some(patch),
            collections: touched,
        };
        match rejection {
            Some(reason) if loud => Err(StoreError::Rejected(reason)),
            _ => Ok(mutation),
        }
    }

    /// Subscribe to accepted-block events.
    pub fn subscribe_merges(&self) -> broadcast::Receiver<MergeEvent> {
        self.inner.merges.subscribe()
    }

    /// Reactive per-author state snapshot for a collection.
    pub fn watch(&self, name: &str) -> Option<watch::Receiver<Value>> {
        self.inner
            .collections
            .get(name)
            .map(|col| col.watch_tx.subscribe())
    }

    /// Current state snapshot for a collection.
    pub fn state_of(&self, name: &str) -> Option<Value> {
        self.inner.collections.get(name).map(|col| col.snapshot())
    }

    fn refuse(&self, loud: bool, reason: String) -> Result<Mutation, StoreError> {
        if loud {
            Err(StoreError::Rejected(reason))
        } else {
            tracing::debug!(%reason, "quietly dropping refused feed");
            Ok(Mutation::default())
        }
    }
}
