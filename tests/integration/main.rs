//! Drift integration test harness.
//!
//! Tests here run whole kernels against each other over in-process
//! wires: boot, handshake, block creation, and gossip convergence,
//! with no I/O outside the tokio runtime.
//!
//!   cargo test --test integration
//!
//! Every test builds its own kernels and wires; nothing is shared
//! between tests.

pub use std::time::Duration;

pub use anyhow::Result;
pub use serde_json::{json, Value};
pub use tokio::time::{sleep, timeout};

pub use drift_core::feed::PublicKey;
pub use drift_hub::WireHandle;
pub use drift_kernel::Kernel;
pub use drift_store::{Reducer, Rejection, Repo};

// ── Harness ──────────────────────────────────────────────────────────────────

/// The collection every test kernel registers.
pub const COLLECTION: &str = "counter";

/// Monotonic per-author counter: a block is accepted only if its
/// payload is greater than the author's current value.
pub struct Counter;

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

/// A booted kernel on a fresh repo with the counter collection.
pub async fn node() -> Result<Kernel> {
    let kernel = Kernel::new(Repo::new());
    kernel.register(COLLECTION, Counter);
    kernel.boot().await?;
    Ok(kernel)
}

/// Join two kernels with an in-process wire. Handshake and initial
/// sync start immediately; await [`settled`] before asserting.
pub fn connect(a: &Kernel, b: &Kernel) -> Result<WireHandle> {
    Ok(a.spawn_wire()?.open(b.spawn_wire()?))
}

/// Poll until `cond` holds, panicking with `what` after five seconds.
pub async fn settled(what: &str, cond: impl Fn() -> bool) {
    let outcome = timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for: {what}");
}

/// The counter value a kernel holds for `author`, 0 if unseen.
pub fn counter_of(kernel: &Kernel, author: &PublicKey) -> i64 {
    kernel
        .state_of(COLLECTION)
        .and_then(|state| state[hex::encode(author)].as_i64())
        .unwrap_or(0)
}

/// Number of live connections a kernel currently sees.
pub fn connection_count(kernel: &Kernel) -> usize {
    kernel.connections().borrow().len()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

mod connections;
mod convergence;
mod rejection;
mod streaming;
