//! drift-gossip — peer handshake and block gossip over a [`drift_hub::Hub`].
//!
//! A [`GossipController`] owns a hub, identifies itself to every new wire
//! with an 8-byte node id, and moves signed feeds between peers: queries
//! pull blocks, shares push them, and every transfer streams one frame at
//! a time so a slow peer never sees more than it has acknowledged.

pub mod controller;
pub mod handlers;

pub use controller::{GossipController, GossipError, PeerInfo};
pub use handlers::GossipHandlers;
