//! drift-kernel — ties identity, store, and gossip into one node.
//!
//! A [`Kernel`] owns a signing identity persisted in its repo, a
//! reducer [`Store`], and a [`GossipController`]. Blocks created
//! locally and blocks accepted from peers take the same path: the
//! store merges them, announces the accepted tail, and a bridge task
//! forwards every announcement to gossip with the originating
//! connection excluded. That single bridge is the only place blocks
//! are ever pushed to the network, so nothing is sent twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, watch, OnceCell};
use tracing::{debug, trace, warn};

use drift_core::feed::{Feed, PublicKey};
use drift_core::Keypair;
use drift_gossip::{GossipController, GossipHandlers, PeerInfo};
use drift_hub::WirePlug;
use drift_store::{BlockBody, Mutation, Reducer, Repo, Store, StoreError};

/// Registry slot holding the node's secret key.
const KEY_SECRET: &str = "reg/sk";

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel not ready, was boot() awaited?")]
    NotReady,

    /// The persisted secret key has the wrong shape.
    #[error("corrupt persisted identity")]
    CorruptIdentity,

    /// A locally authored block was refused by its reducer.
    #[error("rejected by store: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("block encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

struct KernelInner {
    repo: Repo,
    store: Store,
    gossip: Arc<GossipController>,
    identity: OnceLock<Keypair>,
    boot: OnceCell<PublicKey>,
    ready: AtomicBool,
}

/// One node. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn new(repo: Repo) -> Self {
        Self::build(repo, None)
    }

    /// Use a caller-provided identity instead of the persisted one.
    /// The provided key is not written back to the repo.
    pub fn with_keypair(repo: Repo, key: Keypair) -> Self {
        Self::build(repo, Some(key))
    }

    fn build(repo: Repo, key: Option<Keypair>) -> Self {
        let store = Store::new(repo.clone());
        let inner = Arc::new_cyclic(|weak: &Weak<KernelInner>| {
            let handlers = GossipHandlers {
                on_connect: {
                    let weak = weak.clone();
                    Arc::new(move |conn| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            // Fresh wire: pull whatever the peer holds.
                            let Some(inner) = weak.upgrade() else { return };
                            if let Err(e) = inner.gossip.query(&conn, json!({})).await {
                                debug!(conn = conn.id, error = %e, "initial sync failed");
                            }
                        })
                    })
                },
                on_disconnect: Arc::new(|id| {
                    trace!(conn = id, "peer gone");
                }),
                on_query: {
                    let weak = weak.clone();
                    Arc::new(move |_params| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            // Answer with every head we track.
                            match weak.upgrade() {
                                Some(inner) => inner
                                    .repo
                                    .list_heads()
                                    .into_iter()
                                    .map(|(_, feed)| feed)
                                    .collect(),
                                None => Vec::new(),
                            }
                        })
                    })
                },
                on_blocks: {
                    let weak = weak.clone();
                    Arc::new(move |feed, from| {
                        let weak = weak.clone();
                        Box::pin(async move {
                            let Some(inner) = weak.upgrade() else { return None };
                            // Quiet merge; the bridge re-announces
                            // accepted blocks, skipping this wire.
                            if let Err(e) = inner.store.dispatch(&feed, false, Some(from)).await {
                                debug!(conn = from, error = %e, "remote feed refused");
                            }
                            None
                        })
                    })
                },
            };
            let identity = OnceLock::new();
            if let Some(key) = key {
                let _ = identity.set(key);
            }
            KernelInner {
                repo,
                store,
                gossip: GossipController::new(handlers),
                identity,
                boot: OnceCell::new(),
                ready: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    /// Register a named collection. Call before [`Kernel::boot`].
    pub fn register(&self, name: &str, reducer: impl Reducer + 'static) {
        self.inner.store.register(name, reducer);
    }

    /// Bring the node up: restore or mint the identity, replay
    /// persisted heads, and start the merge bridge. Memoized — every
    /// call after the first (including concurrent ones) awaits the
    /// same boot and gets the same key.
    pub async fn boot(&self) -> Result<PublicKey, KernelError> {
        self.inner
            .boot
            .get_or_try_init(|| self.boot_inner())
            .await
            .copied()
    }

    async fn boot_inner(&self) -> Result<PublicKey, KernelError> {
        let key = match self.inner.identity.get() {
            Some(key) => key,
            None => {
                let key = match self.inner.repo.read_reg(KEY_SECRET) {
                    Some(secret) => {
                        let secret: [u8; 32] = secret[..]
                            .try_into()
                            .map_err(|_| KernelError::CorruptIdentity)?;
                        Keypair::from_bytes(&secret)
                    }
                    None => {
                        let key = Keypair::generate();
                        self.inner
                            .repo
                            .write_reg(KEY_SECRET, key.to_bytes().to_vec());
                        key
                    }
                };
                self.inner.identity.get_or_init(|| key)
            }
        };
        let public = key.public;

        self.inner.store.load().await;

        // Merge bridge: the single path from accepted blocks to the
        // network. Ends when the store is dropped.
        let mut merges = self.inner.store.subscribe_merges();
        let gossip = self.inner.gossip.clone();
        tokio::spawn(async move {
            loop {
                match merges.recv().await {
                    Ok(event) => {
                        if let Err(e) = gossip.share_blocks(vec![event.patch], event.origin).await {
                            debug!(error = %e, "block share failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Skipped merges are not pushed; peers pick the
                        // blocks up with their next query instead.
                        warn!(skipped, "merge bridge lagged, blocks not forwarded");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.inner.ready.store(true, Ordering::Release);
        debug!(node = %hex::encode(&public[..8]), "kernel booted");
        Ok(public)
    }

    fn check_ready(&self) -> Result<(), KernelError> {
        if self.inner.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(KernelError::NotReady)
        }
    }

    fn identity(&self) -> Result<&Keypair, KernelError> {
        self.check_ready()?;
        self.inner.identity.get().ok_or(KernelError::NotReady)
    }

    /// The node's public key.
    pub fn pk(&self) -> Result<PublicKey, KernelError> {
        Ok(self.identity()?.public)
    }

    /// The node's own feed, if any block was ever created.
    pub fn feed(&self) -> Result<Option<Feed>, KernelError> {
        let public = self.pk()?;
        Ok(self.inner.repo.load_head(&public))
    }

    /// Sequence number of the node's last own block; new feeds start
    /// at 0.
    fn next_seq(&self) -> Result<u64, KernelError> {
        let Some(feed) = self.feed()? else {
            return Ok(0);
        };
        match feed.last() {
            Some(block) => Ok(BlockBody::from_bytes(&block.payload)?.seq + 1),
            None => Ok(0),
        }
    }

    /// Merge a feed into the store. Accepted blocks reach every
    /// connected peer through the merge bridge.
    pub async fn dispatch(&self, feed: &Feed, loud: bool) -> Result<Mutation, KernelError> {
        self.check_ready()?;
        Ok(self.inner.store.dispatch(feed, loud, None).await?)
    }

    /// Append one block to `branch` (the own feed by default), signed
    /// with the node identity, and merge it loudly. A refused block
    /// leaves the own feed untouched.
    pub async fn create_block(
        &self,
        collection: &str,
        payload: Value,
        branch: Option<Feed>,
    ) -> Result<Feed, KernelError> {
        let seq = self.next_seq()?;
        let key = self.identity()?;
        let mut feed = match branch {
            Some(branch) => branch,
            None => self.feed()?.unwrap_or_default(),
        };

        let body = BlockBody {
            kind: collection.to_string(),
            seq,
            date: now_millis(),
            payload,
        };
        feed.append(body.to_bytes()?, key);

        let mutation = match self.inner.store.dispatch(&feed, true, None).await {
            Ok(mutation) => mutation,
            Err(StoreError::Rejected(reason)) => return Err(KernelError::Rejected(reason)),
            Err(e) => return Err(e.into()),
        };
        if mutation.is_empty() {
            return Err(KernelError::Rejected("block produced no mutation".into()));
        }
        Ok(feed)
    }

    /// Spawn a wire end for this node. Joining it to another node's
    /// plug runs the handshake and an initial sync in both directions.
    pub fn spawn_wire(&self) -> Result<WirePlug, KernelError> {
        self.check_ready()?;
        Ok(self.inner.gossip.spawn_wire())
    }

    /// Watch the live connection set.
    pub fn connections(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.inner.gossip.connections()
    }

    /// Reactive per-author state for a collection.
    pub fn watch(&self, name: &str) -> Option<watch::Receiver<Value>> {
        self.inner.store.watch(name)
    }

    /// Current per-author state snapshot for a collection.
    pub fn state_of(&self, name: &str) -> Option<Value> {
        self.inner.store.state_of(name)
    }

    /// Tear down every live wire.
    pub fn close(&self) {
        self.inner.gossip.disconnect_all();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_store::Rejection;
    use serde_json::json;

    /// Monotonic per-author counter.
    struct Counter;

    impl Reducer for Counter {
        fn initial_value(&self) -> Value {
            Value::from(0)
        }

        fn apply(&self, state: &Value, _author: &PublicKey, payload: &Value)
            -> Result<Value, Rejection>
        {
            if payload.as_i64().unwrap_or(0) <= state.as_i64().unwrap_or(0) {
                return Err(Rejection::new("must increment"));
            }
            Ok(payload.clone())
        }
    }

    fn counter_kernel(repo: Repo) -> Kernel {
        let kernel = Kernel::new(repo);
        kernel.register("x", Counter);
        kernel
    }

    #[tokio::test]
    async fn boot_is_memoized() {
        let kernel = counter_kernel(Repo::new());
        let (a, b) = tokio::join!(kernel.boot(), kernel.boot());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(kernel.boot().await.unwrap(), kernel.pk().unwrap());
    }

    #[tokio::test]
    async fn operations_require_boot() {
        let kernel = counter_kernel(Repo::new());
        assert!(matches!(
            kernel.create_block("x", json!(1), None).await,
            Err(KernelError::NotReady)
        ));
        assert!(matches!(
            kernel.dispatch(&Feed::new(), true).await,
            Err(KernelError::NotReady)
        ));
        assert!(matches!(kernel.spawn_wire(), Err(KernelError::NotReady)));
    }

    #[tokio::test]
    async fn identity_survives_restart() {
        let repo = Repo::new();
        let first = counter_kernel(repo.clone());
        let pk = first.boot().await.unwrap();
        drop(first);

        let second = counter_kernel(repo);
        assert_eq!(second.boot().await.unwrap(), pk);
    }

    #[tokio::test]
    async fn provided_identity_is_used_and_not_persisted() {
        let repo = Repo::new();
        let key = Keypair::generate();
        let public = key.public;
        let kernel = Kernel::with_keypair(repo.clone(), key);
        kernel.register("x", Counter);

        assert_eq!(kernel.boot().await.unwrap(), public);
        assert!(repo.read_reg(KEY_SECRET).is_none());
    }

    #[tokio::test]
    async fn create_block_increments_seq() {
        let kernel = counter_kernel(Repo::new());
        kernel.boot().await.unwrap();

        for n in 1..=3 {
            kernel.create_block("x", json!(n), None).await.unwrap();
        }

        let feed = kernel.feed().unwrap().expect("own feed exists");
        let seqs: Vec<u64> = feed
            .blocks()
            .iter()
            .map(|b| BlockBody::from_bytes(&b.payload).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(
            kernel.state_of("x").unwrap()[hex::encode(kernel.pk().unwrap())],
            json!(3)
        );
    }

    #[tokio::test]
    async fn refused_block_leaves_feed_untouched() {
        let kernel = counter_kernel(Repo::new());
        kernel.boot().await.unwrap();
        kernel.create_block("x", json!(2), None).await.unwrap();

        let err = kernel.create_block("x", json!(1), None).await.unwrap_err();
        assert!(matches!(err, KernelError::Rejected(_)));
        assert_eq!(kernel.feed().unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_identity_fails_boot() {
        let repo = Repo::new();
        repo.write_reg(KEY_SECRET, vec![0u8; 7]);
        let kernel = counter_kernel(repo);
        assert!(matches!(
            kernel.boot().await,
            Err(KernelError::CorruptIdentity)
        ));
    }
}
