use socket2::SockRef;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::control::TunnelSpec;
use crate::coordinator::{Coordinator, ListenerError};
use crate::flow::{CancelToken, InboundBundle};
use crate::proto::{BundleHeader, Protocol};
use crate::tproxy;

/// Sequence state for one client/remote pairing
#[derive(Debug)]
struct SourceState {
    connection_id: u32,
    next_seqno: u32,
    last_seen: Instant,
}

/// Per-source sequencing, forgetting sources that went quiet.
///
/// A source seen again after being forgotten starts over with a new
/// connection id, so the far end opens a fresh flow for it.
struct SourceTable {
    idle_timeout: Duration,
    sources: HashMap<(SocketAddrV4, SocketAddrV4), SourceState>,
}

impl SourceTable {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            sources: HashMap::new(),
        }
    }

    /// State for a datagram from `client` to `remote` seen at `now`
    fn stamp(
        &mut self,
        client: SocketAddrV4,
        remote: SocketAddrV4,
        now: Instant,
        new_id: impl FnOnce() -> u32,
    ) -> &mut SourceState {
        if !self.sources.contains_key(&(client, remote)) {
            self.purge_idle(now);
        }
        let state = self.sources.entry((client, remote)).or_insert_with(|| {
            let connection_id = new_id();
            debug!("new UDP source {client} -> {remote} (id {connection_id})");
            SourceState {
                connection_id,
                next_seqno: 0,
                last_seen: now,
            }
        });
        state.last_seen = now;
        state
    }

    fn purge_idle(&mut self, now: Instant) {
        let idle_timeout = self.idle_timeout;
        self.sources.retain(|(client, remote), state| {
            let keep = now.duration_since(state.last_seen) < idle_timeout;
            if !keep {
                debug!(
                    "forgetting idle UDP source {client} -> {remote} (id {})",
                    state.connection_id
                );
            }
            keep
        });
    }

    fn len(&self) -> usize {
        self.sources.len()
    }
}

enum Event {
    Stop,
    Reply(InboundBundle),
    Datagram(io::Result<(usize, SocketAddrV4, SocketAddrV4)>),
}

/// Receives local datagrams and tunnels them; relays replies back
pub struct UdpTunnelListener {
    coord: Weak<Coordinator>,
    socket: UdpSocket,
    spec: TunnelSpec,
    transparent: bool,
    max_size: usize,
    sources: SourceTable,
    replies: mpsc::Receiver<InboundBundle>,
}

impl UdpTunnelListener {
    pub fn bind(coord: &Arc<Coordinator>, spec: TunnelSpec) -> Result<Self, ListenerError> {
        let settings = coord.settings();
        let socket = tproxy::udp_socket(spec.local, settings.transparent).map_err(|source| {
            ListenerError::Bind {
                addr: spec.local,
                source,
            }
        })?;
        if let Err(e) = tproxy::set_buffer_sizes(
            SockRef::from(&socket),
            settings.recv_bufsize,
            settings.send_bufsize,
        ) {
            warn!("failed to set UDP listener buffer sizes: {e}");
        }

        let (tx, replies) = mpsc::channel(settings.limits.queue_depth.max(1));
        if !coord.udp().set_relay(tx) {
            return Err(ListenerError::AlreadyRunning(Protocol::Udp));
        }

        info!(
            "UDP listener on {} (transparent={})",
            socket.local_addr().unwrap_or(SocketAddr::V4(spec.local)),
            settings.transparent
        );
        Ok(Self {
            coord: coord.downgrade(),
            socket,
            spec,
            transparent: settings.transparent,
            max_size: settings.max_size,
            sources: SourceTable::new(settings.udp_idle_timeout),
            replies,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(mut self, mut stop: CancelToken) {
        let mut buf = vec![0u8; self.max_size];
        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => Event::Stop,
                reply = self.replies.recv() => match reply {
                    Some(bundle) => Event::Reply(bundle),
                    None => Event::Stop,
                },
                received = Self::recv(
                    &self.socket,
                    self.transparent,
                    self.spec.remote,
                    &mut buf[BundleHeader::SIZE..],
                ) => Event::Datagram(received),
            };

            match event {
                Event::Stop => break,
                Event::Reply(bundle) => self.relay_reply(bundle).await,
                Event::Datagram(Ok((len, client, remote))) => {
                    if !self.forward(&mut buf, len, client, remote, &mut stop).await {
                        break;
                    }
                }
                Event::Datagram(Err(e)) => {
                    error!("error reading from UDP listener: {e}");
                    break;
                }
            }
        }

        if let Some(coord) = self.coord.upgrade() {
            coord.udp().clear_relay();
        }
        info!("UDP listener stopped");
    }

    /// Receive into `buf`, returning length, client and destination
    async fn recv(
        socket: &UdpSocket,
        transparent: bool,
        remote: SocketAddrV4,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddrV4, SocketAddrV4)> {
        if transparent {
            return tproxy::recv_with_original_dst(socket, buf).await;
        }
        loop {
            let (len, peer) = socket.recv_from(buf).await?;
            match peer {
                SocketAddr::V4(client) => return Ok((len, client, remote)),
                SocketAddr::V6(_) => debug!("ignoring datagram from non-IPv4 source {peer}"),
            }
        }
    }

    /// Ship one datagram sitting at `buf[SIZE..SIZE + len]`.
    ///
    /// Returns false once the listener should stop.
    async fn forward(
        &mut self,
        buf: &mut [u8],
        len: usize,
        client: SocketAddrV4,
        remote: SocketAddrV4,
        stop: &mut CancelToken,
    ) -> bool {
        let Some(coord) = self.coord.upgrade() else {
            return false;
        };
        let Some(dest) = coord.resolve_destination(*remote.ip()) else {
            warn!("no destination endpoint for {remote}, dropping datagram from {client}");
            return true;
        };

        let udp = coord.udp();
        let now = Instant::now();
        let state = self.sources.stamp(client, remote, now, || udp.next_connection_id());

        let header = BundleHeader::new(Protocol::Udp, state.connection_id, client, remote)
            .with_seqno(state.next_seqno);
        buf[..BundleHeader::SIZE].copy_from_slice(&header.encode());

        match coord
            .send_retrying(&buf[..BundleHeader::SIZE + len], &dest, stop)
            .await
        {
            Ok(true) => {
                debug!(
                    "sent {len} byte datagram from {client} to {dest} (id {} seq {})",
                    header.connection_id, header.seqno
                );
                state.next_seqno = state.next_seqno.wrapping_add(1);
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!("error sending datagram from {client} to {dest}: {e}");
                true
            }
        }
    }

    /// Send a reply bundle's body back to the client it is addressed to
    async fn relay_reply(&self, bundle: InboundBundle) {
        let InboundBundle { header, body } = bundle;
        let client = header.client;

        let sent = if self.transparent {
            // Answer from the address the client originally targeted
            match tproxy::udp_socket(header.remote, true) {
                Ok(socket) => socket.send_to(&body, client).await,
                Err(e) => {
                    warn!("cannot bind {} to reply to {client}: {e}", header.remote);
                    return;
                }
            }
        } else {
            self.socket.send_to(&body, client).await
        };

        match sent {
            Ok(n) => debug!("relayed {n} byte reply to {client}"),
            Err(e) => warn!("error relaying reply to {client}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn test_sources_keep_their_sequence() {
        let mut table = SourceTable::new(Duration::from_secs(60));
        let now = Instant::now();
        let mut ids = 0..;
        let mut next_id = || ids.next().unwrap_or_default();

        let state = table.stamp(addr(1, 1000), addr(2, 53), now, &mut next_id);
        assert_eq!(state.connection_id, 0);
        state.next_seqno = 5;

        let state = table.stamp(addr(1, 1000), addr(2, 53), now, &mut next_id);
        assert_eq!((state.connection_id, state.next_seqno), (0, 5));

        // Same client, other destination: separate flow
        let state = table.stamp(addr(1, 1000), addr(3, 53), now, &mut next_id);
        assert_eq!((state.connection_id, state.next_seqno), (1, 0));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_idle_sources_are_forgotten() {
        let idle = Duration::from_secs(60);
        let mut table = SourceTable::new(idle);
        let start = Instant::now();
        let mut ids = 0..;
        let mut next_id = || ids.next().unwrap_or_default();

        table.stamp(addr(1, 1000), addr(2, 53), start, &mut next_id);
        table.stamp(addr(1, 1001), addr(2, 53), start, &mut next_id);
        // Activity keeps the first source alive
        table.stamp(addr(1, 1000), addr(2, 53), start + idle / 2, &mut next_id);

        // A new source past the timeout purges only the silent one
        let later = start + idle + Duration::from_secs(1);
        table.stamp(addr(1, 1002), addr(2, 53), later, &mut next_id);
        assert_eq!(table.len(), 2);

        // The forgotten source comes back under a new connection id
        let state = table.stamp(addr(1, 1001), addr(2, 53), later, &mut next_id);
        assert_eq!((state.connection_id, state.next_seqno), (3, 0));
    }
}
