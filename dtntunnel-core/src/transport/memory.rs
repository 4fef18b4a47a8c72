//! In-process bundle transport.
//!
//! A [`MemoryNetwork`] routes bundles between any number of attached
//! [`MemoryTransport`] handles by exact endpoint id. Each registered endpoint
//! has a bounded store; a send into a full store reports backpressure, like a
//! bundle daemon whose storage is exhausted. Tests can also force the next
//! few sends to report backpressure.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{BundleOptions, BundleTransport, EndpointId, ReceivedBundle, TransportError};

/// Default number of bundles an endpoint store holds
pub const DEFAULT_STORE_CAPACITY: usize = 1024;

struct NetworkInner {
    endpoints: HashMap<EndpointId, mpsc::Sender<ReceivedBundle>>,
    store_capacity: usize,
    forced_backpressure: usize,
    delivered: u64,
}

/// Shared in-process bundle router
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_store_capacity(DEFAULT_STORE_CAPACITY)
    }

    /// Create a network whose endpoint stores hold `store_capacity` bundles
    pub fn with_store_capacity(store_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                endpoints: HashMap::new(),
                store_capacity: store_capacity.max(1),
                forced_backpressure: 0,
                delivered: 0,
            })),
        }
    }

    /// Attach a new node; its endpoint ids are `dtn://{node}/{service}`
    pub fn attach(&self, node: &str) -> MemoryTransport {
        MemoryTransport {
            node: node.to_string(),
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(None),
        }
    }

    /// Make the next `count` sends report backpressure without delivering
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.lock().forced_backpressure += count;
    }

    /// Sends still due to be refused with backpressure
    pub fn pending_forced_failures(&self) -> usize {
        self.inner.lock().forced_backpressure
    }

    /// Total bundles accepted for delivery
    pub fn delivered(&self) -> u64 {
        self.inner.lock().delivered
    }

    fn route(&self, dest: &EndpointId, bundle: ReceivedBundle) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.forced_backpressure > 0 {
            inner.forced_backpressure -= 1;
            return Err(TransportError::Backpressure);
        }

        let tx = inner
            .endpoints
            .get(dest)
            .ok_or_else(|| TransportError::NoRoute(dest.clone()))?;
        match tx.try_send(bundle) {
            Ok(()) => {
                inner.delivered += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Closed(_)) => {
                inner.endpoints.remove(dest);
                Err(TransportError::NoRoute(dest.clone()))
            }
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's handle onto a [`MemoryNetwork`]
pub struct MemoryTransport {
    node: String,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<Option<mpsc::Receiver<ReceivedBundle>>>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl BundleTransport for MemoryTransport {
    fn build_local_eid(&self, service: &str) -> EndpointId {
        EndpointId(format!("dtn://{}/{}", self.node, service))
    }

    async fn register(&self, eid: &EndpointId) -> Result<(), TransportError> {
        let capacity = self.network.inner.lock().store_capacity;
        let (tx, rx) = mpsc::channel(capacity);
        self.network
            .inner
            .lock()
            .endpoints
            .insert(eid.clone(), tx);
        *self.inbox.lock().await = Some(rx);
        Ok(())
    }

    async fn send(
        &self,
        source: &EndpointId,
        dest: &EndpointId,
        _options: &BundleOptions,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.network.route(
            dest,
            ReceivedBundle {
                source: source.clone(),
                payload: payload.to_vec(),
            },
        )
    }

    async fn recv(&self) -> Result<ReceivedBundle, TransportError> {
        let mut inbox = self.inbox.lock().await;
        match inbox.as_mut() {
            Some(rx) => rx.recv().await.ok_or(TransportError::Closed),
            None => Err(TransportError::NotRegistered),
        }
    }
}
