//! Flow bookkeeping shared by the TCP and UDP subsystems.
//!
//! A flow is one proxied connection (or UDP client/remote pairing) tunneled
//! as a sequence of bundles. This module owns:
//! - [`FlowKey`]: the identity of a flow
//! - [`FlowHandle`]: the table's view of a running connection (delivery
//!   queue sender plus cancellation)
//! - [`FlowTable`]: the connection table, per-flow reorder state and the
//!   orphan buffer, all behind one coarse lock
//!
//! The table lock is only held for lookup, insert, remove and reordering.
//! Handing bundles to a connection happens after the lock is released and
//! never waits: a connection whose queue is full is the caller's problem,
//! not every other flow's.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::proto::BundleHeader;
use crate::reorder::{ReorderBuffer, ReorderError};
use crate::transport::EndpointId;

/// Identity of a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    /// Endpoint of the tunnel on the other side
    pub peer: EndpointId,
    pub client: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub connection_id: u32,
}

impl FlowKey {
    pub fn from_header(peer: EndpointId, header: &BundleHeader) -> Self {
        Self {
            peer,
            client: header.client,
            remote: header.remote,
            connection_id: header.connection_id,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} -> {} (id {})]",
            self.peer, self.client, self.remote, self.connection_id
        )
    }
}

/// A decoded bundle on its way to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundBundle {
    pub header: BundleHeader,
    pub body: Vec<u8>,
}

/// Owner side of a cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observer side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a linked cancellation handle and token
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancelled. A dropped handle counts as cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run `fut` unless cancellation comes first
    pub async fn guard<F: std::future::Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

/// Table-side view of a running connection
#[derive(Debug)]
pub struct FlowHandle {
    key: FlowKey,
    deliveries: mpsc::Sender<InboundBundle>,
    cancel: CancelHandle,
}

/// Connection-side ends of a [`FlowHandle`]
#[derive(Debug)]
pub struct FlowEndpoint {
    pub deliveries: mpsc::Receiver<InboundBundle>,
    pub cancel: CancelToken,
}

impl FlowHandle {
    /// Create a handle with a delivery queue of `queue_depth` bundles
    pub fn new(key: FlowKey, queue_depth: usize) -> (Arc<Self>, FlowEndpoint) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (cancel, token) = cancellation();
        let handle = Arc::new(Self {
            key,
            deliveries: tx,
            cancel,
        });
        (
            handle,
            FlowEndpoint {
                deliveries: rx,
                cancel: token,
            },
        )
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Ask the connection to stop at its next suspension point
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Queue in-order bundles for the connection without waiting.
    ///
    /// Stops at the first bundle that does not fit; the rest are not queued.
    pub fn hand_off(&self, bundles: Vec<InboundBundle>) -> HandOff {
        let total = bundles.len();
        for (queued, bundle) in bundles.into_iter().enumerate() {
            match self.deliveries.try_send(bundle) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    return HandOff::Full {
                        dropped: total - queued,
                    };
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("{} connection gone, dropping delivery", self.key);
                    return HandOff::Closed;
                }
            }
        }
        HandOff::Queued
    }
}

/// Outcome of [`FlowHandle::hand_off`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOff {
    Queued,
    /// The connection has already gone away
    Closed,
    /// The delivery queue is full; the last `dropped` bundles were not queued
    Full { dropped: usize },
}

/// Capacity limits for a [`FlowTable`]
#[derive(Debug, Clone, Copy)]
pub struct FlowLimits {
    /// Depth of each connection's delivery queue
    pub queue_depth: usize,
    /// Out-of-order bundles held per flow, both for reordering and as orphans
    pub max_buffered: usize,
    /// Distinct keys the orphan buffer may hold
    pub max_orphan_flows: usize,
    /// Orphans older than this are discarded
    pub orphan_ttl: Duration,
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            max_buffered: 4096,
            max_orphan_flows: 1024,
            orphan_ttl: Duration::from_secs(600),
        }
    }
}

/// When an unknown key may open a new flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Only sequence 0 opens a flow; later bundles wait as orphans
    FirstBundle,
    /// Any bundle opens a flow
    AnyBundle,
}

/// Outcome of [`FlowTable::route`]
#[derive(Debug)]
pub enum Routed {
    /// Bundles ready for the connection, in order
    Deliver {
        handle: Arc<FlowHandle>,
        ready: Vec<InboundBundle>,
        /// Set when this bundle opened the flow; the caller starts the connection
        opened: Option<FlowEndpoint>,
    },
    /// Held until the flow's opening bundle arrives
    Orphaned,
    /// Dropped without affecting the flow
    Dropped,
    /// The flow could not absorb the bundle and was torn down
    Aborted,
}

struct OrphanFlow {
    first_seen: Instant,
    bundles: Vec<InboundBundle>,
}

/// Bundles that arrived before their flow's opening bundle
struct OrphanBuffer {
    flows: HashMap<FlowKey, OrphanFlow>,
}

impl OrphanBuffer {
    fn new() -> Self {
        Self {
            flows: HashMap::new(),
        }
    }

    fn purge_expired(&mut self, now: Instant, ttl: Duration) {
        self.flows.retain(|key, flow| {
            let keep = now.duration_since(flow.first_seen) < ttl;
            if !keep {
                warn!(
                    "{key} opening bundle never arrived, discarding {} orphans",
                    flow.bundles.len()
                );
            }
            keep
        });
    }

    fn push(&mut self, key: FlowKey, bundle: InboundBundle, limits: &FlowLimits) -> bool {
        let now = Instant::now();
        self.purge_expired(now, limits.orphan_ttl);

        if !self.flows.contains_key(&key) && self.flows.len() >= limits.max_orphan_flows {
            return false;
        }
        let flow = self.flows.entry(key).or_insert_with(|| OrphanFlow {
            first_seen: now,
            bundles: Vec::new(),
        });
        if flow.bundles.len() >= limits.max_buffered {
            return false;
        }
        flow.bundles.push(bundle);
        true
    }

    /// Remove and return the orphans for `key` in arrival order
    fn take(&mut self, key: &FlowKey) -> Vec<InboundBundle> {
        self.flows
            .remove(key)
            .map(|flow| flow.bundles)
            .unwrap_or_default()
    }

    fn bundle_count(&self) -> usize {
        self.flows.values().map(|f| f.bundles.len()).sum()
    }
}

struct FlowEntry {
    handle: Arc<FlowHandle>,
    reorder: ReorderBuffer<InboundBundle>,
}

struct FlowTableInner {
    flows: HashMap<FlowKey, FlowEntry>,
    orphans: OrphanBuffer,
}

/// Connection table plus orphan buffer of one subsystem
pub struct FlowTable {
    inner: Mutex<FlowTableInner>,
    limits: FlowLimits,
}

impl FlowTable {
    pub fn new(limits: FlowLimits) -> Self {
        Self {
            inner: Mutex::new(FlowTableInner {
                flows: HashMap::new(),
                orphans: OrphanBuffer::new(),
            }),
            limits,
        }
    }

    pub fn limits(&self) -> &FlowLimits {
        &self.limits
    }

    /// Insert a connection. An existing entry for the same key is kept and
    /// false is returned; the caller owns closing the new connection.
    pub fn register(&self, handle: Arc<FlowHandle>) -> bool {
        let mut inner = self.inner.lock();
        if inner.flows.contains_key(handle.key()) {
            error!("{} already registered, refusing duplicate", handle.key());
            return false;
        }
        let reorder = ReorderBuffer::with_max_size(self.limits.max_buffered);
        inner
            .flows
            .insert(handle.key().clone(), FlowEntry { handle, reorder });
        true
    }

    /// Remove a connection, but only if the table still holds this exact one
    pub fn unregister(&self, handle: &Arc<FlowHandle>) -> bool {
        let mut inner = self.inner.lock();
        match inner.flows.get(handle.key()) {
            Some(entry) if Arc::ptr_eq(&entry.handle, handle) => {
                inner.flows.remove(handle.key());
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.inner.lock().flows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bundles waiting for an opening bundle
    pub fn orphan_count(&self) -> usize {
        self.inner.lock().orphans.bundle_count()
    }

    /// Cancel every connection and forget all state
    pub fn abort_all(&self) {
        let mut inner = self.inner.lock();
        for (_, entry) in inner.flows.drain() {
            entry.handle.abort();
        }
        inner.orphans.flows.clear();
    }

    /// Route an inbound bundle to its flow.
    ///
    /// With `ordered`, the bundle passes through the flow's reorder buffer and
    /// any orphans for the key are replayed after it; otherwise it is ready
    /// immediately.
    pub fn route(
        &self,
        key: FlowKey,
        bundle: InboundBundle,
        open: OpenPolicy,
        ordered: bool,
    ) -> Routed {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let seqno = bundle.header.seqno;

        let mut opened = None;
        if !inner.flows.contains_key(&key) {
            if open == OpenPolicy::FirstBundle && seqno != 0 {
                if inner.orphans.push(key.clone(), bundle, &self.limits) {
                    debug!("{key} seq {seqno} arrived before flow open, postponed");
                    return Routed::Orphaned;
                }
                warn!("{key} orphan buffer full, dropping seq {seqno}");
                return Routed::Dropped;
            }

            let (handle, endpoint) = FlowHandle::new(key.clone(), self.limits.queue_depth);
            let reorder = ReorderBuffer::with_max_size(self.limits.max_buffered);
            inner
                .flows
                .insert(key.clone(), FlowEntry { handle, reorder });
            opened = Some(endpoint);
        }

        let Some(entry) = inner.flows.get_mut(&key) else {
            return Routed::Dropped;
        };

        if !ordered {
            return Routed::Deliver {
                handle: entry.handle.clone(),
                ready: vec![bundle],
                opened,
            };
        }

        let mut ready = Vec::new();
        let pending = std::iter::once(bundle).chain(inner.orphans.take(&key));
        for item in pending {
            let seq = item.header.seqno;
            match entry.reorder.push(seq, item) {
                Ok(run) => ready.extend(run),
                Err(ReorderError::Duplicate { .. }) => {
                    debug!("{key} duplicate seq {seq}, dropped");
                }
                Err(e @ ReorderError::BufferFull(_)) => {
                    error!("{key} {e}, aborting flow");
                    entry.handle.abort();
                    inner.flows.remove(&key);
                    return Routed::Aborted;
                }
            }
        }

        Routed::Deliver {
            handle: entry.handle.clone(),
            ready,
            opened,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Protocol;
    use std::net::Ipv4Addr;

    fn key(id: u32) -> FlowKey {
        FlowKey {
            peer: EndpointId::parse("dtn://peer/dtntunnel").expect("eid"),
            client: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 40000),
            remote: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
            connection_id: id,
        }
    }

    fn bundle(k: &FlowKey, seqno: u32) -> InboundBundle {
        let header = BundleHeader::new(Protocol::Tcp, k.connection_id, k.client, k.remote)
            .with_seqno(seqno);
        InboundBundle {
            header,
            body: vec![seqno as u8],
        }
    }

    fn seqs(ready: &[InboundBundle]) -> Vec<u32> {
        ready.iter().map(|b| b.header.seqno).collect()
    }

    #[test]
    fn test_register_refuses_duplicate() {
        let table = FlowTable::new(FlowLimits::default());
        let (first, _ep1) = FlowHandle::new(key(1), 4);
        let (second, _ep2) = FlowHandle::new(key(1), 4);

        assert!(table.register(first.clone()));
        assert!(!table.register(second.clone()));
        assert_eq!(table.len(), 1);

        // Only the stored connection can remove the entry
        assert!(!table.unregister(&second));
        assert!(table.contains(&key(1)));
        assert!(table.unregister(&first));
        assert!(table.is_empty());
    }

    #[test]
    fn test_orphans_replayed_after_open() {
        let table = FlowTable::new(FlowLimits::default());
        let k = key(7);

        assert!(matches!(
            table.route(k.clone(), bundle(&k, 2), OpenPolicy::FirstBundle, true),
            Routed::Orphaned
        ));
        assert_eq!(table.orphan_count(), 1);

        match table.route(k.clone(), bundle(&k, 0), OpenPolicy::FirstBundle, true) {
            Routed::Deliver { ready, opened, .. } => {
                assert_eq!(seqs(&ready), vec![0]);
                assert!(opened.is_some());
            }
            other => panic!("expected delivery, got {other:?}"),
        }
        // seq 2 was replayed into the reorder buffer and still waits for 1
        assert_eq!(table.orphan_count(), 0);

        match table.route(k.clone(), bundle(&k, 1), OpenPolicy::FirstBundle, true) {
            Routed::Deliver { ready, opened, .. } => {
                assert_eq!(seqs(&ready), vec![1, 2]);
                assert!(opened.is_none());
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicates_dropped() {
        let table = FlowTable::new(FlowLimits::default());
        let k = key(3);

        let first = table.route(k.clone(), bundle(&k, 0), OpenPolicy::FirstBundle, true);
        assert!(matches!(first, Routed::Deliver { ref ready, .. } if ready.len() == 1));
        let again = table.route(k.clone(), bundle(&k, 0), OpenPolicy::FirstBundle, true);
        assert!(matches!(again, Routed::Deliver { ref ready, .. } if ready.is_empty()));
    }

    #[test]
    fn test_unordered_delivers_in_arrival_order() {
        let table = FlowTable::new(FlowLimits::default());
        let k = key(4);

        let mut arrived = Vec::new();
        for seq in [2, 0, 1] {
            match table.route(k.clone(), bundle(&k, seq), OpenPolicy::AnyBundle, false) {
                Routed::Deliver { ready, .. } => arrived.extend(seqs(&ready)),
                other => panic!("expected delivery, got {other:?}"),
            }
        }
        assert_eq!(arrived, vec![2, 0, 1]);
    }

    #[test]
    fn test_reorder_overflow_aborts_flow() {
        let limits = FlowLimits {
            max_buffered: 2,
            ..Default::default()
        };
        let table = FlowTable::new(limits);
        let k = key(5);
        let (handle, endpoint) = FlowHandle::new(k.clone(), 4);
        assert!(table.register(handle));

        for seq in [1, 2] {
            assert!(matches!(
                table.route(k.clone(), bundle(&k, seq), OpenPolicy::FirstBundle, true),
                Routed::Deliver { .. }
            ));
        }
        assert!(matches!(
            table.route(k.clone(), bundle(&k, 3), OpenPolicy::FirstBundle, true),
            Routed::Aborted
        ));
        assert!(!table.contains(&k));
        assert!(endpoint.cancel.is_cancelled());
    }

    #[test]
    fn test_orphan_limits() {
        let limits = FlowLimits {
            max_buffered: 1,
            max_orphan_flows: 1,
            ..Default::default()
        };
        let table = FlowTable::new(limits);
        let (a, b) = (key(1), key(2));

        assert!(matches!(
            table.route(a.clone(), bundle(&a, 1), OpenPolicy::FirstBundle, true),
            Routed::Orphaned
        ));
        // Per-flow cap
        assert!(matches!(
            table.route(a.clone(), bundle(&a, 2), OpenPolicy::FirstBundle, true),
            Routed::Dropped
        ));
        // Distinct-flow cap
        assert!(matches!(
            table.route(b.clone(), bundle(&b, 1), OpenPolicy::FirstBundle, true),
            Routed::Dropped
        ));
    }

    #[test]
    fn test_orphans_expire() {
        let limits = FlowLimits {
            orphan_ttl: Duration::ZERO,
            ..Default::default()
        };
        let table = FlowTable::new(limits);
        let (a, b) = (key(1), key(2));

        table.route(a.clone(), bundle(&a, 1), OpenPolicy::FirstBundle, true);
        table.route(b.clone(), bundle(&b, 1), OpenPolicy::FirstBundle, true);
        // Inserting b purged a
        assert_eq!(table.orphan_count(), 1);
    }

    #[tokio::test]
    async fn test_abort_all_cancels_connections() {
        let table = FlowTable::new(FlowLimits::default());
        let (handle, mut endpoint) = FlowHandle::new(key(9), 4);
        assert!(table.register(handle));

        table.abort_all();
        assert!(table.is_empty());
        tokio::time::timeout(Duration::from_secs(1), endpoint.cancel.cancelled())
            .await
            .expect("connection was not cancelled");
    }

    #[test]
    fn test_hand_off_to_closed_connection() {
        let (handle, endpoint) = FlowHandle::new(key(1), 1);
        let k = key(1);
        assert_eq!(handle.hand_off(vec![bundle(&k, 0)]), HandOff::Queued);
        drop(endpoint);
        assert_eq!(handle.hand_off(vec![bundle(&k, 1)]), HandOff::Closed);
    }

    #[test]
    fn test_hand_off_never_waits_on_full_queue() {
        let (handle, mut endpoint) = FlowHandle::new(key(1), 2);
        let k = key(1);
        let batch = (0..5).map(|seq| bundle(&k, seq)).collect();
        assert_eq!(handle.hand_off(batch), HandOff::Full { dropped: 3 });

        // What fit is still queued, in order
        assert_eq!(endpoint.deliveries.try_recv().map(|b| b.header.seqno), Ok(0));
        assert_eq!(endpoint.deliveries.try_recv().map(|b| b.header.seqno), Ok(1));
        assert!(endpoint.deliveries.try_recv().is_err());
    }
}
