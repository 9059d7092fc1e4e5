//! Reducers — the pluggable accept/reject strategy.
//!
//! A collection is a named slot of application state plus one reducer.
//! State is tracked per author; the reducer sees the author's current
//! value and the incoming payload and either produces the next value
//! or rejects the block. Rejection of a block rejects everything the
//! block would have changed.

use drift_core::feed::PublicKey;
use thiserror::Error;

pub use serde_json::Value;

/// A reducer's refusal, with the reason the application gave.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Rejection(pub String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Merge strategy for one collection.
pub trait Reducer: Send + Sync {
    /// State an author starts from before their first accepted block.
    fn initial_value(&self) -> Value {
        Value::Null
    }

    /// Fold one accepted-candidate payload into the author's state.
    fn apply(&self, state: &Value, author: &PublicKey, payload: &Value)
        -> Result<Value, Rejection>;
}
