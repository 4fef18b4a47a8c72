//! Bundle transport over plain UDP.
//!
//! Each bundle travels as one datagram:
//!
//! - Source endpoint length (2 bytes, big-endian)
//! - Source endpoint id (UTF-8)
//! - Bundle payload
//!
//! Endpoint ids are `udp://ip:port/service`. The destination socket address is
//! taken from the endpoint id; the service part is informational. A full socket
//! send buffer is reported as backpressure.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::warn;

use super::{BundleOptions, BundleTransport, EndpointId, ReceivedBundle, TransportError};

/// Largest UDP payload on IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

const SCHEME: &str = "udp://";

/// Bundle transport bound to one UDP socket
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind a new transport socket
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Extract the socket address from a `udp://ip:port[/service]` endpoint id
pub fn endpoint_addr(eid: &EndpointId) -> Result<SocketAddr, TransportError> {
    let rest = eid
        .as_str()
        .strip_prefix(SCHEME)
        .ok_or_else(|| TransportError::InvalidEndpoint(eid.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    authority
        .parse()
        .map_err(|_| TransportError::InvalidEndpoint(eid.to_string()))
}

fn encode_datagram(source: &EndpointId, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let src = source.as_str().as_bytes();
    let src_len =
        u16::try_from(src.len()).map_err(|_| TransportError::InvalidEndpoint(source.to_string()))?;
    let total = 2 + src.len() + payload.len();
    if total > MAX_DATAGRAM_SIZE {
        return Err(TransportError::BundleTooLarge(total));
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&src_len.to_be_bytes());
    buf.extend_from_slice(src);
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn decode_datagram(buf: &[u8]) -> Option<ReceivedBundle> {
    if buf.len() < 2 {
        return None;
    }
    let src_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let src = buf.get(2..2 + src_len)?;
    let source = EndpointId::parse(std::str::from_utf8(src).ok()?).ok()?;
    Some(ReceivedBundle {
        source,
        payload: buf[2 + src_len..].to_vec(),
    })
}

/// Replace a wildcard host in `source` with the address the datagram came
/// from, so replies to a tunnel bound on 0.0.0.0 reach it.
fn reachable_source(source: EndpointId, peer: SocketAddr) -> EndpointId {
    match endpoint_addr(&source) {
        Ok(addr) if addr.ip().is_unspecified() => {
            let service = source
                .as_str()
                .strip_prefix(SCHEME)
                .and_then(|rest| rest.split_once('/'))
                .map(|(_, service)| service)
                .unwrap_or_default();
            let addr = SocketAddr::new(peer.ip(), addr.port());
            EndpointId(format!("{SCHEME}{addr}/{service}"))
        }
        _ => source,
    }
}

#[async_trait]
impl BundleTransport for UdpTransport {
    fn build_local_eid(&self, service: &str) -> EndpointId {
        EndpointId(format!("{SCHEME}{}/{service}", self.local_addr))
    }

    async fn register(&self, eid: &EndpointId) -> Result<(), TransportError> {
        // Everything arriving on the socket belongs to the one local endpoint.
        endpoint_addr(eid).map(|_| ())
    }

    async fn send(
        &self,
        source: &EndpointId,
        dest: &EndpointId,
        _options: &BundleOptions,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peer = endpoint_addr(dest)?;
        let datagram = encode_datagram(source, payload)?;
        match self.socket.try_send_to(&datagram, peer) {
            Ok(_) => Ok(()),
            Err(e) if is_send_buffer_full(&e) => Err(TransportError::Backpressure),
            Err(e) => Err(e.into()),
        }
    }

    async fn recv(&self) -> Result<ReceivedBundle, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            match decode_datagram(&buf[..n]) {
                Some(mut bundle) => {
                    bundle.source = reachable_source(bundle.source, peer);
                    return Ok(bundle);
                }
                None => warn!("Dropping malformed {n}-byte datagram from {peer}"),
            }
        }
    }
}

fn is_send_buffer_full(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(target_os = "linux")]
    if e.raw_os_error() == Some(libc::ENOBUFS) {
        return true;
    }
    false
}
