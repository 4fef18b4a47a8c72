//! UDP subsystem.
//!
//! On the initiating side the listener stamps every datagram with a
//! per-client connection id and sequence number and ships it as a bundle.
//! Replies coming back are relayed straight to the listener, which sends them
//! to the original client.
//!
//! On the receiving side any bundle for an unknown flow opens a
//! [`connection`] that forwards datagrams to the remote address. Reordering
//! is optional since UDP applications expect loss and reordering anyway.
//! For the same reason a full delivery queue drops datagrams rather than
//! stalling the receive path.

mod connection;
mod listener;

pub use listener::UdpTunnelListener;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::flow::{FlowKey, FlowLimits, FlowTable, HandOff, InboundBundle, OpenPolicy, Routed};
use crate::proto::BundleHeader;
use crate::transport::EndpointId;

use connection::UdpConnection;

pub struct UdpTunnel {
    table: FlowTable,
    next_connection_id: AtomicU32,
    /// Set while a listener runs; bundles then go to it instead of the table
    relay: Mutex<Option<mpsc::Sender<InboundBundle>>>,
}

impl UdpTunnel {
    pub fn new(limits: FlowLimits) -> Self {
        Self {
            table: FlowTable::new(limits),
            next_connection_id: AtomicU32::new(0),
            relay: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// Connection ids start at 1
    pub fn next_connection_id(&self) -> u32 {
        self.next_connection_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Install the listener's relay queue; false if one is already set
    pub(crate) fn set_relay(&self, tx: mpsc::Sender<InboundBundle>) -> bool {
        let mut relay = self.relay.lock();
        if relay.as_ref().is_some_and(|r| !r.is_closed()) {
            return false;
        }
        *relay = Some(tx);
        true
    }

    pub(crate) fn clear_relay(&self) {
        self.relay.lock().take();
    }

    pub(crate) fn deliver(
        &self,
        coord: &Arc<Coordinator>,
        source: EndpointId,
        header: BundleHeader,
        body: Vec<u8>,
    ) {
        let bundle = InboundBundle { header, body };

        let relay = self.relay.lock().clone();
        if let Some(relay) = relay {
            match relay.try_send(bundle) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("UDP listener backlogged, dropping reply"),
                Err(TrySendError::Closed(_)) => debug!("UDP listener gone, dropping reply"),
            }
            return;
        }

        let key = FlowKey::from_header(source, &header);
        let ordered = coord.settings().reorder_udp;
        let routed = self.table.route(key, bundle, OpenPolicy::AnyBundle, ordered);

        if let Routed::Deliver {
            handle,
            ready,
            opened,
        } = routed
        {
            if let Some(endpoint) = opened {
                info!("{} new UDP flow", handle.key());
                UdpConnection::new(coord, handle.clone(), endpoint).spawn();
            }
            if let HandOff::Full { dropped } = handle.hand_off(ready) {
                warn!("{} delivery queue full, dropping {dropped} datagrams", handle.key());
            }
        }
    }
}
