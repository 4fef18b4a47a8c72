//! Bundle transport contract consumed by the tunnel.
//!
//! The tunnel never talks to a DTN daemon directly. It goes through
//! [`BundleTransport`], which offers registration of a local endpoint, sending
//! a bundle to a destination endpoint and blocking receive. Sends may fail
//! with [`TransportError::Backpressure`] when the transport's store is full;
//! callers retry those without re-framing the payload.
//!
//! Two implementations ship with the crate:
//! - [`memory::MemoryNetwork`]: in-process bundle router with bounded stores
//! - [`udp::UdpTransport`]: one UDP datagram per bundle

pub mod memory;
pub mod udp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;

/// Endpoint identifier (for example `dtn://node/service`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Create an endpoint id, rejecting strings that are not `scheme:ssp`
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        match s.split_once(':') {
            Some((scheme, ssp)) if !scheme.is_empty() && !ssp.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(TransportError::InvalidEndpoint(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EndpointId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Bundle priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Bulk,
    #[default]
    Normal,
    Expedited,
}

/// Extended class-of-service hints.
///
/// Enabled when any flag is set, the ordinal is non-zero or a flow label is
/// present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassOfService {
    pub critical: bool,
    pub streaming: bool,
    pub reliable: bool,
    /// Priority ordinal, 0..=254
    pub ordinal: u8,
    pub flow_label: Option<u32>,
}

impl ClassOfService {
    /// Highest ordinal accepted by the transport
    pub const MAX_ORDINAL: u8 = 254;

    pub fn is_enabled(&self) -> bool {
        self.critical
            || self.streaming
            || self.reliable
            || self.ordinal != 0
            || self.flow_label.is_some()
    }
}

/// Options applied uniformly to every bundle the tunnel sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOptions {
    /// Request custody transfer
    pub custody: bool,
    /// Bundle lifetime
    pub expiration: Duration,
    pub priority: Priority,
    pub class_of_service: Option<ClassOfService>,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            custody: false,
            expiration: Duration::from_secs(600),
            priority: Priority::Normal,
            class_of_service: None,
        }
    }
}

/// A bundle handed up by the transport
#[derive(Debug, Clone)]
pub struct ReceivedBundle {
    pub source: EndpointId,
    pub payload: Vec<u8>,
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport store is full")]
    Backpressure,

    #[error("Invalid endpoint id: {0}")]
    InvalidEndpoint(String),

    #[error("No route to endpoint: {0}")]
    NoRoute(EndpointId),

    #[error("No endpoint registered on this handle")]
    NotRegistered,

    #[error("Bundle too large: {0} bytes")]
    BundleTooLarge(usize),

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// True for the retriable store-full condition
    pub fn is_backpressure(&self) -> bool {
        matches!(self, TransportError::Backpressure)
    }
}

/// Handle onto a bundle transport.
///
/// `recv` must be cancellation safe: callers race it against a stop signal.
#[async_trait]
pub trait BundleTransport: Send + Sync {
    /// Build the local endpoint id for a service demux string
    fn build_local_eid(&self, service: &str) -> EndpointId;

    /// Register `eid` so that bundles addressed to it are returned by `recv`
    async fn register(&self, eid: &EndpointId) -> Result<(), TransportError>;

    /// Send one bundle. The payload is borrowed; on backpressure the caller
    /// still owns it and retries later.
    async fn send(
        &self,
        source: &EndpointId,
        dest: &EndpointId,
        options: &BundleOptions,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Block until a bundle arrives for the registered endpoint
    async fn recv(&self) -> Result<ReceivedBundle, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert!(EndpointId::parse("dtn://host/tunnel").is_ok());
        assert!(EndpointId::parse("ipn:1.2").is_ok());
        assert!(matches!(
            EndpointId::parse("no-scheme"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(EndpointId::parse(":x").is_err());
        assert!(EndpointId::parse("dtn:").is_err());
    }

    #[test]
    fn test_class_of_service_enabled() {
        assert!(!ClassOfService::default().is_enabled());
        let cos = ClassOfService {
            flow_label: Some(9),
            ..Default::default()
        };
        assert!(cos.is_enabled());
    }
}
