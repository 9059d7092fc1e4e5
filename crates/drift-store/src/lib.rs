//! drift-store — persistence and reducer-based state.
//!
//! Two collaborators live here: the [`Repo`] (key/value storage for
//! raw feeds, head pointers, and a small registry) and the [`Store`]
//! (a reducer state machine that merges feeds into named collections
//! and publishes accepted blocks on a merge-event channel).

pub mod block;
pub mod reducer;
pub mod repo;
pub mod store;

pub use block::BlockBody;
pub use reducer::{Reducer, Rejection, Value};
pub use repo::Repo;
pub use store::{MergeEvent, Mutation, Store, StoreError};
