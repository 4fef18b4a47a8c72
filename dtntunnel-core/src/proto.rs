//! Bundle framing protocol for the tunnel.
//!
//! Every bundle handed to the transport starts with a fixed 22-byte header
//! followed by opaque payload bytes. Multi-byte fields are big-endian on the
//! wire; conversion happens here and nowhere else.
//!
//! # Header Format
//!
//! - Protocol (1 byte): 6 for TCP, 17 for UDP
//! - EOF (1 byte): non-zero when the sender has closed its side of the flow
//! - Connection ID (4 bytes): assigned by the initiating tunnel
//! - Sequence number (4 bytes): per flow, per direction, starting at 0
//! - Client address (4 bytes) and remote address (4 bytes)
//! - Client port (2 bytes) and remote port (2 bytes)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Tunneled protocol carried in a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// IP protocol number used on the wire
    pub fn wire_id(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    pub fn from_wire(id: u8) -> Result<Self, ProtocolError> {
        match id {
            6 => Ok(Protocol::Tcp),
            17 => Ok(Protocol::Udp),
            other => Err(ProtocolError::UnknownProtocol(other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Header prefixed to every tunneled bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleHeader {
    pub protocol: Protocol,
    /// Sender closed its side of the flow
    pub eof: bool,
    pub connection_id: u32,
    pub seqno: u32,
    /// Address of the host that opened the flow
    pub client: SocketAddrV4,
    /// Address the flow is destined to
    pub remote: SocketAddrV4,
}

impl BundleHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 22;

    pub fn new(
        protocol: Protocol,
        connection_id: u32,
        client: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Self {
        Self {
            protocol,
            eof: false,
            connection_id,
            seqno: 0,
            client,
            remote,
        }
    }

    /// Copy of this header carrying a different sequence number
    pub fn with_seqno(mut self, seqno: u32) -> Self {
        self.seqno = seqno;
        self
    }

    /// Encode header to bytes (network byte order)
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.protocol.wire_id();
        buf[1] = u8::from(self.eof);
        buf[2..6].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.seqno.to_be_bytes());
        buf[10..14].copy_from_slice(&self.client.ip().octets());
        buf[14..18].copy_from_slice(&self.remote.ip().octets());
        buf[18..20].copy_from_slice(&self.client.port().to_be_bytes());
        buf[20..22].copy_from_slice(&self.remote.port().to_be_bytes());
        buf
    }

    /// Decode header from the start of `buf` (network byte order).
    ///
    /// Trailing bytes are the bundle body and are ignored here.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let protocol = Protocol::from_wire(buf[0])?;
        let eof = buf[1] != 0;
        let connection_id = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let seqno = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let client_ip = Ipv4Addr::new(buf[10], buf[11], buf[12], buf[13]);
        let remote_ip = Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]);
        let client_port = u16::from_be_bytes([buf[18], buf[19]]);
        let remote_port = u16::from_be_bytes([buf[20], buf[21]]);

        Ok(Self {
            protocol,
            eof,
            connection_id,
            seqno,
            client: SocketAddrV4::new(client_ip, client_port),
            remote: SocketAddrV4::new(remote_ip, remote_port),
        })
    }
}

/// Split a bundle into its decoded header and body.
pub fn split_bundle(bundle: &[u8]) -> Result<(BundleHeader, &[u8]), ProtocolError> {
    let header = BundleHeader::decode(bundle)?;
    Ok((header, &bundle[BundleHeader::SIZE..]))
}

/// Build a bundle from a header and body.
pub fn frame(header: &BundleHeader, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BundleHeader::SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf
}

/// Protocol-related errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid bundle length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unknown tunneled protocol: {0}")]
    UnknownProtocol(u8),
}
