//! Key/value storage for feeds, head pointers, and the registry.
//!
//! In-memory, per-process. The registry is a small string-keyed byte
//! store — the kernel persists its secret key there. Heads map each
//! author to their full known feed.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use drift_core::feed::{Feed, PublicKey};

/// Repository handle. Cheap to clone; clones share the same storage.
#[derive(Clone, Default)]
pub struct Repo {
    registry: Arc<DashMap<String, Bytes>>,
    heads: Arc<DashMap<PublicKey, Feed>>,
}

impl Repo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a registry entry, replacing any previous value.
    pub fn write_reg(&self, key: &str, value: impl Into<Bytes>) {
        self.registry.insert(key.to_string(), value.into());
    }

    /// Read a registry entry.
    pub fn read_reg(&self, key: &str) -> Option<Bytes> {
        self.registry.get(key).map(|v| v.clone())
    }

    /// Persist an author's head feed.
    pub fn save_head(&self, author: PublicKey, feed: Feed) {
        self.heads.insert(author, feed);
    }

    /// Load an author's head feed.
    pub fn load_head(&self, author: &PublicKey) -> Option<Feed> {
        self.heads.get(author).map(|f| f.clone())
    }

    /// Snapshot of all known (author, head feed) pairs.
    pub fn list_heads(&self) -> Vec<(PublicKey, Feed)> {
        self.heads
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::Keypair;

    #[test]
    fn registry_round_trip() {
        let repo = Repo::new();
        assert!(repo.read_reg("reg/sk").is_none());
        repo.write_reg("reg/sk", vec![1, 2, 3]);
        assert_eq!(repo.read_reg("reg/sk").unwrap(), Bytes::from(vec![1, 2, 3]));
    }

    #[test]
    fn heads_round_trip() {
        let repo = Repo::new();
        let key = Keypair::generate();
        let mut feed = Feed::new();
        feed.append(&b"block"[..], &key);

        assert!(repo.load_head(&key.public).is_none());
        repo.save_head(key.public, feed.clone());
        assert_eq!(repo.load_head(&key.public).unwrap(), feed);
        assert_eq!(repo.list_heads().len(), 1);
    }

    #[test]
    fn clones_share_storage() {
        let repo = Repo::new();
        let other = repo.clone();
        repo.write_reg("k", vec![9]);
        assert!(other.read_reg("k").is_some());
    }
}
