//! Wire plugs — the connection endpoints applications exchange.
//!
//! A plug is one loose end of a wire. Two plugs from two hubs are
//! joined with [`WirePlug::open`]; that is the only way a connection
//! comes into existence. The pattern mirrors how peers swap endpoints
//! after transport discovery: `a.spawn_wire(..).open(b.spawn_wire(..))`.

use tokio::sync::mpsc;

use crate::{Connection, HubInner};
use std::sync::Arc;

pub(crate) type OpenHook = Box<dyn FnOnce(Connection) + Send>;

/// One loose end of a wire, bound to its hub.
pub struct WirePlug {
    hub: Arc<HubInner>,
    on_open: OpenHook,
}

impl WirePlug {
    pub(crate) fn new(hub: Arc<HubInner>, on_open: OpenHook) -> Self {
        Self { hub, on_open }
    }

    /// Join this plug to a remote plug.
    ///
    /// Registers a connection on both hubs, starts both pump tasks,
    /// then runs each side's open hook with its own connection handle.
    pub fn open(self, other: WirePlug) -> WireHandle {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();

        let local = self.hub.attach(tx_ab, rx_ba);
        let remote = other.hub.attach(tx_ba, rx_ab);

        (self.on_open)(local.clone());
        (other.on_open)(remote.clone());

        WireHandle { local, remote }
    }
}

/// Handle to an opened wire. Closing it tears the connection down on
/// both sides; dropping it leaves the wire running.
pub struct WireHandle {
    local: Connection,
    remote: Connection,
}

impl WireHandle {
    /// The connection as seen by the hub whose plug called `open`.
    pub fn local(&self) -> &Connection {
        &self.local
    }

    /// The connection as seen by the other hub.
    pub fn remote(&self) -> &Connection {
        &self.remote
    }

    /// Close the wire. Both sides observe the disconnect.
    pub fn close(&self) {
        self.local.close();
        self.remote.close();
    }
}
