//! Block body schema.
//!
//! The kernel packs every authored block's payload into this JSON
//! envelope; the store is the sole parser of it on the merge path.
//! `kind` routes the block to a registered collection, `seq` is the
//! author's block sequence (starting at 0), `date` is a unix
//! millisecond timestamp.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockBody {
    /// Collection name this block targets.
    pub kind: String,
    /// Author-local block sequence, starting at 0.
    pub seq: u64,
    /// Unix timestamp in milliseconds at authoring time.
    pub date: u64,
    /// Application content, shaped by the collection's reducer.
    pub payload: Value,
}

impl BlockBody {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
