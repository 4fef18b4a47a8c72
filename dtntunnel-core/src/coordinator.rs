//! The tunnel coordinator.
//!
//! One [`Coordinator`] exists per tunnel process. It owns the transport
//! handles, serializes every outgoing bundle, resolves destination endpoints
//! for new flows, counts throughput and routes each received bundle to the
//! TCP or UDP subsystem. Listeners and connections hold a [`Weak`] reference
//! back to it.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::control::{TunnelConfig, TunnelSpec};
use crate::eid_table::DestinationResolver;
use crate::flow::{cancellation, CancelHandle, CancelToken, FlowLimits};
use crate::proto::{split_bundle, Protocol};
use crate::stats::ThroughputStats;
use crate::tcp::{TcpTunnel, TcpTunnelListener};
use crate::tproxy::TproxyError;
use crate::transport::{BundleOptions, BundleTransport, EndpointId, ReceivedBundle, TransportError};
use crate::udp::{UdpTunnel, UdpTunnelListener};

/// Settings every listener and connection reads
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub protocol: Protocol,
    pub max_size: usize,
    pub delay: Duration,
    pub backpressure_retry: Duration,
    pub recv_bufsize: usize,
    pub send_bufsize: usize,
    pub transparent: bool,
    pub reorder_udp: bool,
    pub udp_idle_timeout: Duration,
    pub limits: FlowLimits,
}

impl From<&TunnelConfig> for TunnelSettings {
    fn from(cfg: &TunnelConfig) -> Self {
        Self {
            protocol: cfg.protocol,
            max_size: cfg.max_size,
            delay: cfg.delay.unwrap_or(Duration::ZERO),
            backpressure_retry: cfg.backpressure_retry,
            recv_bufsize: cfg.recv_bufsize,
            send_bufsize: cfg.send_bufsize,
            transparent: cfg.transparent,
            reorder_udp: cfg.reorder_udp,
            udp_idle_timeout: cfg.udp_idle_timeout,
            limits: FlowLimits {
                queue_depth: cfg.delivery_queue_depth,
                max_buffered: cfg.max_reorder_bundles,
                max_orphan_flows: cfg.max_orphan_flows,
                orphan_ttl: cfg.expiration,
            },
        }
    }
}

/// Send and receive handles onto the bundle transport.
///
/// Both may point at the same transport object.
#[derive(Clone)]
pub struct TransportHandles {
    pub send: Arc<dyn BundleTransport>,
    pub recv: Arc<dyn BundleTransport>,
}

impl TransportHandles {
    /// Use one transport object for both directions
    pub fn shared(transport: Arc<dyn BundleTransport>) -> Self {
        Self {
            send: transport.clone(),
            recv: transport,
        }
    }
}

/// A running local listener
pub struct ListenerTask {
    /// Address actually bound, useful when the configured port is 0
    pub local_addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

/// Why a listener could not start
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: TproxyError,
    },

    #[error("a {0} listener is already running")]
    AlreadyRunning(Protocol),
}

/// Why a connection ended abnormally
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport send failed: {0}")]
    Transport(#[from] TransportError),

    #[error("local socket error: {0}")]
    Io(#[from] io::Error),

    #[error("transparent proxy: {0}")]
    Tproxy(#[from] TproxyError),

    #[error("out-of-order delivery: got seq {got}, expected {expected}")]
    OutOfOrder { got: u32, expected: u32 },

    #[error("coordinator is gone")]
    CoordinatorGone,
}

/// Shared state of one tunnel process
pub struct Coordinator {
    local_eid: EndpointId,
    transport: TransportHandles,
    send_lock: Mutex<()>,
    options: BundleOptions,
    resolver: DestinationResolver,
    stats: ThroughputStats,
    settings: TunnelSettings,
    tcp: TcpTunnel,
    udp: UdpTunnel,
    shutdown: CancelHandle,
    shutdown_token: CancelToken,
    this: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(
        config: &TunnelConfig,
        local_eid: EndpointId,
        resolver: DestinationResolver,
        transport: TransportHandles,
    ) -> Arc<Self> {
        let settings = TunnelSettings::from(config);
        let (shutdown, shutdown_token) = cancellation();
        Arc::new_cyclic(|this| Self {
            local_eid,
            transport,
            send_lock: Mutex::new(()),
            options: config.bundle_options(),
            resolver,
            stats: ThroughputStats::new(),
            tcp: TcpTunnel::new(settings.limits),
            udp: UdpTunnel::new(settings.limits),
            settings,
            shutdown,
            shutdown_token,
            this: this.clone(),
        })
    }

    pub fn local_eid(&self) -> &EndpointId {
        &self.local_eid
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn stats(&self) -> &ThroughputStats {
        &self.stats
    }

    pub fn tcp(&self) -> &TcpTunnel {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpTunnel {
        &self.udp
    }

    pub(crate) fn downgrade(&self) -> Weak<Coordinator> {
        self.this.clone()
    }

    /// Token cancelled by [`Coordinator::shutdown`]
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown_token.clone()
    }

    /// Send one bundle to `dest`.
    ///
    /// Sends from all connections are serialized. The bundle is borrowed, so
    /// on [`TransportError::Backpressure`] the caller still holds it intact.
    pub async fn send(&self, bundle: &[u8], dest: &EndpointId) -> Result<(), TransportError> {
        let _guard = self.send_lock.lock().await;
        self.transport
            .send
            .send(&self.local_eid, dest, &self.options, bundle)
            .await?;
        self.stats.record(bundle.len());
        Ok(())
    }

    /// Send, waiting out backpressure.
    ///
    /// Returns `Ok(false)` if `cancel` fired before the bundle went out.
    pub async fn send_retrying(
        &self,
        bundle: &[u8],
        dest: &EndpointId,
        cancel: &mut CancelToken,
    ) -> Result<bool, TransportError> {
        loop {
            match self.send(bundle, dest).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_backpressure() => {
                    debug!(
                        "transport full, retrying {} byte bundle in {:?}",
                        bundle.len(),
                        self.settings.backpressure_retry
                    );
                    if cancel
                        .guard(tokio::time::sleep(self.settings.backpressure_retry))
                        .await
                        .is_none()
                    {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Destination endpoint for a new flow headed to `addr`
    pub fn resolve_destination(&self, addr: Ipv4Addr) -> Option<EndpointId> {
        self.resolver.resolve(addr)
    }

    /// Handle one bundle from the transport.
    ///
    /// Malformed bundles are logged and dropped; nothing here fails the
    /// receive loop or waits on a connection.
    pub fn deliver(self: &Arc<Self>, bundle: ReceivedBundle) {
        let ReceivedBundle { source, payload } = bundle;
        let (header, body) = match split_bundle(&payload) {
            Ok((header, body)) => (header, body.to_vec()),
            Err(e) => {
                warn!("Dropping bundle from {source}: {e}");
                return;
            }
        };
        self.stats.record(payload.len());

        debug!(
            "Recv {} bundle from {source}: id={} seq={} eof={} len={}",
            header.protocol,
            header.connection_id,
            header.seqno,
            header.eof,
            body.len()
        );

        match header.protocol {
            Protocol::Tcp => self.tcp.deliver(self, source, header, body),
            Protocol::Udp => self.udp.deliver(self, source, header, body),
        }
    }

    /// Drain the transport until shutdown or a fatal receive error
    pub async fn run_receive_loop(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut stop = self.shutdown_token();
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!("Receive loop stopping");
                    return Ok(());
                }
                received = self.transport.recv.recv() => match received {
                    Ok(bundle) => self.deliver(bundle),
                    Err(e) => {
                        error!("Error receiving bundle: {e}");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Start the local listener for the configured protocol
    pub fn start_listener(
        self: &Arc<Self>,
        spec: TunnelSpec,
    ) -> Result<ListenerTask, ListenerError> {
        let stop = self.shutdown_token();
        let addr = spec.local;
        let bind_error = move |source: io::Error| ListenerError::Bind {
            addr,
            source: TproxyError::Io(source),
        };
        match self.settings.protocol {
            Protocol::Tcp => {
                let listener = TcpTunnelListener::bind(self, spec)?;
                let local_addr = listener.local_addr().map_err(bind_error)?;
                Ok(ListenerTask {
                    local_addr,
                    handle: tokio::spawn(listener.run(stop)),
                })
            }
            Protocol::Udp => {
                let listener = UdpTunnelListener::bind(self, spec)?;
                let local_addr = listener.local_addr().map_err(bind_error)?;
                Ok(ListenerTask {
                    local_addr,
                    handle: tokio::spawn(listener.run(stop)),
                })
            }
        }
    }

    /// Periodically log and reset the throughput counters
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = self.downgrade();
        let mut stop = self.shutdown_token();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(coord) = this.upgrade() else { break };
                        let snap = coord.stats.snapshot_and_reset();
                        info!(
                            "Bundles:{} B/s:{} ({:.3} Mb/s)",
                            snap.total_bundles,
                            snap.bundles,
                            snap.mbits_per_sec(interval)
                        );
                    }
                }
            }
        })
    }

    /// Stop listeners, the reporter and the receive loop, and abort every flow
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tcp.table().abort_all();
        self.udp.table().abort_all();
    }
}
