use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use super::connection::TcpConnection;
use crate::control::TunnelSpec;
use crate::coordinator::{Coordinator, ListenerError};
use crate::flow::{CancelToken, FlowHandle, FlowKey};
use crate::tproxy;

/// Pause after a failed accept (for example when out of descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts local TCP connections and tunnels each one as a flow
pub struct TcpTunnelListener {
    coord: Weak<Coordinator>,
    listener: TcpListener,
    spec: TunnelSpec,
}

impl TcpTunnelListener {
    pub fn bind(coord: &Arc<Coordinator>, spec: TunnelSpec) -> Result<Self, ListenerError> {
        let transparent = coord.settings().transparent;
        let listener = tproxy::tcp_listener(spec.local, transparent).map_err(|source| {
            ListenerError::Bind {
                addr: spec.local,
                source,
            }
        })?;
        info!(
            "TCP listener on {} (transparent={transparent})",
            listener.local_addr().unwrap_or(SocketAddr::V4(spec.local))
        );
        Ok(Self {
            coord: coord.downgrade(),
            listener,
            spec,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut stop: CancelToken) {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accepted(stream, peer),
                    Err(e) => {
                        error!("error accepting connection: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        info!("TCP listener stopped");
    }

    fn accepted(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(coord) = self.coord.upgrade() else {
            tproxy::force_close(stream);
            return;
        };
        let settings = coord.settings();

        let SocketAddr::V4(client) = peer else {
            warn!("rejecting non-IPv4 client {peer}");
            tproxy::force_close(stream);
            return;
        };

        let remote = if settings.transparent {
            match tproxy::original_dst(&stream) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("no original destination for {client}: {e}");
                    tproxy::force_close(stream);
                    return;
                }
            }
        } else {
            self.spec.remote
        };

        let Some(dest) = coord.resolve_destination(*remote.ip()) else {
            warn!("no destination endpoint for {remote}, closing {client}");
            tproxy::force_close(stream);
            return;
        };

        if let Err(e) = tproxy::set_buffer_sizes(
            SockRef::from(&stream),
            settings.recv_bufsize,
            settings.send_bufsize,
        ) {
            warn!("failed to set socket buffer sizes for {client}: {e}");
        }

        let key = FlowKey {
            peer: dest,
            client,
            remote,
            connection_id: coord.tcp().next_connection_id(),
        };
        let (handle, endpoint) = FlowHandle::new(key, settings.limits.queue_depth);
        if !coord.tcp().table().register(handle.clone()) {
            tproxy::force_close(stream);
            return;
        }

        info!("{} accepted local connection", handle.key());
        TcpConnection::new(&coord, handle, endpoint).spawn_local(stream);
    }
}
