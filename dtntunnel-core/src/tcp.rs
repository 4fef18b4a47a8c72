//! TCP subsystem.
//!
//! The listener accepts local connections and starts a [`connection`] pump
//! for each one. Bundles arriving from the transport are routed through the
//! subsystem's [`FlowTable`]: a sequence 0 bundle for an unknown flow opens a
//! remote-initiated connection, later bundles for an unknown flow wait in the
//! orphan buffer, and everything else passes through the flow's reorder
//! buffer before it reaches the pump. A flow whose delivery queue is full
//! is aborted, since a byte stream cannot skip bundles.

mod connection;
mod listener;

pub use listener::TcpTunnelListener;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::coordinator::Coordinator;
use crate::flow::{FlowKey, FlowLimits, FlowTable, HandOff, InboundBundle, OpenPolicy, Routed};
use crate::proto::BundleHeader;
use crate::transport::EndpointId;

use connection::TcpConnection;

pub struct TcpTunnel {
    table: FlowTable,
    next_connection_id: AtomicU32,
}

impl TcpTunnel {
    pub fn new(limits: FlowLimits) -> Self {
        Self {
            table: FlowTable::new(limits),
            next_connection_id: AtomicU32::new(0),
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

    pub(crate) fn deliver(
        &self,
        coord: &Arc<Coordinator>,
        source: EndpointId,
        header: BundleHeader,
        body: Vec<u8>,
    ) {
        let key = FlowKey::from_header(source, &header);
        let routed = self.table.route(
            key,
            InboundBundle { header, body },
            OpenPolicy::FirstBundle,
            true,
        );

        if let Routed::Deliver {
            handle,
            ready,
            opened,
        } = routed
        {
            if let Some(endpoint) = opened {
                info!("{} new remote-initiated connection", handle.key());
                TcpConnection::new(coord, handle.clone(), endpoint).spawn_remote();
            }
            if let HandOff::Full { dropped } = handle.hand_off(ready) {
                error!(
                    "{} delivery queue full, {dropped} bundles undeliverable, aborting flow",
                    handle.key()
                );
                handle.abort();
                self.table.unregister(&handle);
            }
        }
    }
}
