//! Append-only signed feeds.
//!
//! A feed is one author's chain of blocks. Each block signs the
//! previous block's signature together with its own payload, so the
//! chain order is fixed at signing time and a feed can be verified
//! without any external state. A feed may also be a detached tail of
//! a longer chain — the first block's parent then points at a block
//! the receiver is expected to already have.
//!
//! The canonical binary form defined here IS the BLOCKS wire payload.
//! Changing the layout is a protocol break.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::identity::{self, Keypair};

/// Author public key — 32 raw Ed25519 bytes.
pub type PublicKey = [u8; 32];

/// Detached Ed25519 signature — 64 raw bytes.
pub type Signature = [u8; 64];

/// Parent value of the first block in a full chain.
pub const GENESIS_PARENT: Signature = [0u8; 64];

/// Fixed per-block wire overhead: author + parent + signature + payload length.
const BLOCK_HEADER_LEN: usize = 32 + 64 + 64 + 4;

/// One signed entry of a feed.
///
/// Blocks are immutable once created. Ownership transfers to the
/// store on successful dispatch; nothing mutates a block after that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Author public key.
    pub author: PublicKey,
    /// Signature of the preceding block, or [`GENESIS_PARENT`].
    pub parent: Signature,
    /// Signature over `parent || payload`.
    pub signature: Signature,
    /// Opaque application payload.
    pub payload: Bytes,
}

impl Block {
    /// Stable content id — BLAKE3 of author and signature.
    pub fn id(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.author);
        hasher.update(&self.signature);
        *hasher.finalize().as_bytes()
    }

    /// Verify this block's signature in isolation.
    pub fn verify(&self) -> Result<(), FeedError> {
        let mut message = Vec::with_capacity(64 + self.payload.len());
        message.extend_from_slice(&self.parent);
        message.extend_from_slice(&self.payload);
        identity::verify(&self.author, &message, &self.signature)
            .map_err(|_| FeedError::BadSignature)
    }
}

/// Errors that can arise when interpreting or extending feeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("block signature verification failed")]
    BadSignature,

    #[error("broken chain link at height {0}")]
    BrokenChain(usize),

    #[error("feed bytes truncated")]
    Truncated,
}

/// An ordered chain of blocks, possibly detached from its genesis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feed {
    blocks: Vec<Block>,
}

impl Feed {
    /// Create an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn first(&self) -> Option<&Block> {
        self.blocks.first()
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Append a new signed block authored by `key`.
    pub fn append(&mut self, payload: impl Into<Bytes>, key: &Keypair) -> &Block {
        let payload = payload.into();
        let parent = self.blocks.last().map_or(GENESIS_PARENT, |b| b.signature);

        let mut message = Vec::with_capacity(64 + payload.len());
        message.extend_from_slice(&parent);
        message.extend_from_slice(&payload);
        let signature = key.sign(&message);

        let height = self.blocks.len();
        self.blocks.push(Block {
            author: key.public,
            parent,
            signature,
            payload,
        });
        &self.blocks[height]
    }

    /// Push an existing block, checking that it chains onto the tail.
    pub fn push(&mut self, block: Block) -> Result<(), FeedError> {
        if let Some(last) = self.blocks.last() {
            if block.parent != last.signature {
                return Err(FeedError::BrokenChain(self.blocks.len()));
            }
        }
        self.blocks.push(block);
        Ok(())
    }

    /// The tail of this feed from `from` (block index) onwards.
    pub fn slice(&self, from: usize) -> Feed {
        Feed {
            blocks: self.blocks.get(from..).unwrap_or_default().to_vec(),
        }
    }

    /// Verify every block signature and every chain link.
    ///
    /// The first block's parent is not checked — a detached tail is a
    /// valid feed; whether its parent is known is the store's call.
    pub fn verify(&self) -> Result<(), FeedError> {
        for (height, block) in self.blocks.iter().enumerate() {
            if height > 0 && block.parent != self.blocks[height - 1].signature {
                return Err(FeedError::BrokenChain(height));
            }
            block.verify()?;
        }
        Ok(())
    }

    /// Canonical binary form: `u32-le count`, then per block
    /// `author(32) || parent(64) || signature(64) || u32-le len || payload`.
    pub fn to_bytes(&self) -> Bytes {
        let body: usize = self
            .blocks
            .iter()
            .map(|b| BLOCK_HEADER_LEN + b.payload.len())
            .sum();
        let mut buf = BytesMut::with_capacity(4 + body);
        buf.put_u32_le(self.blocks.len() as u32);
        for block in &self.blocks {
            buf.put_slice(&block.author);
            buf.put_slice(&block.parent);
            buf.put_slice(&block.signature);
            buf.put_u32_le(block.payload.len() as u32);
            buf.put_slice(&block.payload);
        }
        buf.freeze()
    }

    /// Decode the canonical binary form. Fails on any truncation;
    /// trailing garbage after the last block is also an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FeedError> {
        let mut rest = bytes;
        let count = take_u32(&mut rest)? as usize;
        let mut blocks = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let author: PublicKey = take_array::<32>(&mut rest)?;
            let parent: Signature = take_array::<64>(&mut rest)?;
            let signature: Signature = take_array::<64>(&mut rest)?;
            let len = take_u32(&mut rest)? as usize;
            if rest.len() < len {
                return Err(FeedError::Truncated);
            }
            let (payload, tail) = rest.split_at(len);
            rest = tail;
            blocks.push(Block {
                author,
                parent,
                signature,
                payload: Bytes::copy_from_slice(payload),
            });
        }
        if !rest.is_empty() {
            return Err(FeedError::Truncated);
        }
        Ok(Self { blocks })
    }
}

impl From<Vec<Block>> for Feed {
    fn from(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }
}

fn take_u32(rest: &mut &[u8]) -> Result<u32, FeedError> {
    if rest.len() < 4 {
        return Err(FeedError::Truncated);
    }
    let (head, tail) = rest.split_at(4);
    *rest = tail;
    Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}

fn take_array<const N: usize>(rest: &mut &[u8]) -> Result<[u8; N], FeedError> {
    if rest.len() < N {
        return Err(FeedError::Truncated);
    }
    let (head, tail) = rest.split_at(N);
    *rest = tail;
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    Ok(out)
}
