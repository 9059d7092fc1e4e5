//! drift-core — wire format, feeds, and signing identity.
//! All other Drift crates depend on this one.

pub mod feed;
pub mod identity;
pub mod wire;

pub use feed::{Block, Feed, FeedError, PublicKey, Signature};
pub use identity::Keypair;
pub use wire::{Message, NodeId, WireError};
