use socket2::SockRef;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::coordinator::{ConnectionError, Coordinator, TunnelSettings};
use crate::flow::{FlowEndpoint, FlowHandle, InboundBundle};
use crate::proto::{BundleHeader, Protocol};
use crate::tproxy;

enum Event {
    Cancelled,
    Delivery(Option<InboundBundle>),
    Datagram(io::Result<usize>),
    Idle,
}

/// Receiving-side half of a UDP flow: forwards tunneled datagrams to the
/// remote address and tunnels the remote's answers back.
///
/// The flow ends once neither side has sent anything for the idle timeout.
pub(crate) struct UdpConnection {
    coord: Weak<Coordinator>,
    handle: Arc<FlowHandle>,
    endpoint: FlowEndpoint,
    settings: TunnelSettings,
    template: BundleHeader,
    send_seqno: u32,
    next_recv_seqno: u32,
}

impl UdpConnection {
    pub(crate) fn new(
        coord: &Arc<Coordinator>,
        handle: Arc<FlowHandle>,
        endpoint: FlowEndpoint,
    ) -> Self {
        let key = handle.key();
        let template = BundleHeader::new(Protocol::Udp, key.connection_id, key.client, key.remote);
        Self {
            coord: coord.downgrade(),
            settings: coord.settings().clone(),
            handle,
            endpoint,
            template,
            send_seqno: 0,
            next_recv_seqno: 0,
        }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let key = self.handle.key().clone();
        match self.pump().await {
            Ok(()) => info!("{key} UDP flow closed"),
            Err(e) => error!("{key} UDP flow terminated: {e}"),
        }
        if let Some(coord) = self.coord.upgrade() {
            coord.udp().table().unregister(&self.handle);
        }
    }

    fn open_socket(&self) -> Result<UdpSocket, ConnectionError> {
        // Transparent mode sends from the client's own address
        let bind = if self.settings.transparent {
            self.template.client
        } else {
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
        };
        let socket = tproxy::udp_socket(bind, self.settings.transparent)?;
        if let Err(e) = tproxy::set_buffer_sizes(
            SockRef::from(&socket),
            self.settings.recv_bufsize,
            self.settings.send_bufsize,
        ) {
            warn!("{} failed to set socket buffer sizes: {e}", self.handle.key());
        }
        Ok(socket)
    }

    async fn pump(&mut self) -> Result<(), ConnectionError> {
        let socket = self.open_socket()?;
        socket.connect(self.template.remote).await?;

        let idle_timeout = self.settings.udp_idle_timeout;
        let mut idle_at = Instant::now() + idle_timeout;
        let mut buf = vec![0u8; self.settings.max_size];
        loop {
            let event = tokio::select! {
                biased;
                _ = self.endpoint.cancel.cancelled() => Event::Cancelled,
                item = self.endpoint.deliveries.recv() => Event::Delivery(item),
                received = socket.recv(&mut buf[BundleHeader::SIZE..]) => Event::Datagram(received),
                _ = sleep_until(idle_at) => Event::Idle,
            };
            if matches!(event, Event::Delivery(Some(_)) | Event::Datagram(Ok(_))) {
                idle_at = Instant::now() + idle_timeout;
            }

            match event {
                Event::Cancelled | Event::Delivery(None) => {
                    debug!("{} aborted", self.handle.key());
                    return Ok(());
                }
                Event::Idle => {
                    info!("{} idle for {idle_timeout:?}", self.handle.key());
                    return Ok(());
                }
                Event::Delivery(Some(bundle)) => {
                    let seqno = bundle.header.seqno;
                    if self.settings.reorder_udp {
                        // Datagrams dropped on a full queue leave gaps; going
                        // backwards means the reorder step was bypassed
                        if seqno < self.next_recv_seqno {
                            return Err(ConnectionError::OutOfOrder {
                                got: seqno,
                                expected: self.next_recv_seqno,
                            });
                        }
                        if seqno > self.next_recv_seqno {
                            debug!(
                                "{} skipping {} dropped datagrams",
                                self.handle.key(),
                                seqno - self.next_recv_seqno
                            );
                        }
                    }
                    self.next_recv_seqno = seqno.wrapping_add(1);
                    if bundle.body.is_empty() {
                        continue;
                    }
                    match socket.send(&bundle.body).await {
                        Ok(n) => debug!(
                            "{} sent {n} byte datagram (seq {seqno})",
                            self.handle.key()
                        ),
                        Err(e) => warn!(
                            "{} error sending datagram to {}: {e}",
                            self.handle.key(),
                            self.template.remote
                        ),
                    }
                }
                Event::Datagram(Ok(len)) => {
                    let header = self.template.with_seqno(self.send_seqno);
                    buf[..BundleHeader::SIZE].copy_from_slice(&header.encode());
                    let coord = self.coord.upgrade().ok_or(ConnectionError::CoordinatorGone)?;
                    let sent = coord
                        .send_retrying(
                            &buf[..BundleHeader::SIZE + len],
                            &self.handle.key().peer,
                            &mut self.endpoint.cancel,
                        )
                        .await?;
                    if !sent {
                        return Ok(());
                    }
                    self.send_seqno = self.send_seqno.wrapping_add(1);
                }
                Event::Datagram(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    // ICMP port unreachable from the remote; later datagrams may still land
                    debug!("{} remote refused datagram: {e}", self.handle.key());
                }
                Event::Datagram(Err(e)) => return Err(e.into()),
            }
        }
    }
}
