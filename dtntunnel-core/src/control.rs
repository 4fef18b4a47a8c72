//! Tunnel configuration.
//!
//! This module manages:
//! - The serde configuration model shared by the binary and the core
//! - Parsing of tunnel specs (`[local_host:]local_port:remote_host:remote_port`)
//! - Validation of option combinations before anything is bound
//! - The registration demux string identifying this tunnel to the transport

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::proto::{BundleHeader, Protocol};
use crate::transport::{BundleOptions, ClassOfService, EndpointId, Priority};

fn default_expiration() -> Duration {
    Duration::from_secs(600)
}

fn default_max_size() -> usize {
    32 * 1024
}

fn default_backpressure_retry() -> Duration {
    Duration::from_secs(1)
}

fn default_max_reorder_bundles() -> usize {
    4096
}

fn default_max_orphan_flows() -> usize {
    1024
}

fn default_delivery_queue_depth() -> usize {
    1024
}

fn default_udp_idle_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_transport_bind() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 4556))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid tunnel spec '{0}': expected [local_host:]local_port:remote_host:remote_port")]
    InvalidTunnelSpec(String),

    #[error("Could not resolve '{0}' to an IPv4 address")]
    Resolve(String),

    #[error("Listen mode does not take a destination endpoint or table")]
    ListenWithDestination,

    #[error("Listen mode does not take a tunnel spec")]
    ListenWithTunnel,

    #[error("A destination endpoint or destination table is required")]
    MissingDestination,

    #[error("Only one of a destination endpoint and a destination table may be given")]
    ConflictingDestinations,

    #[error("A tunnel spec is required")]
    MissingTunnel,

    #[error("Tunnel ports must be non-zero")]
    ZeroPort,

    #[error("A destination table requires transparent mode")]
    TableRequiresTransparent,

    #[error("Transparent mode is only supported on Linux")]
    TransparentUnsupported,

    #[error("Invalid endpoint id: {0}")]
    InvalidEndpoint(String),

    #[error("Class-of-service ordinal {0} exceeds {max}", max = ClassOfService::MAX_ORDINAL)]
    OrdinalOutOfRange(u8),

    #[error("max_size {actual} must exceed the {min}-byte bundle header")]
    MaxSizeTooSmall { min: usize, actual: usize },

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Local and remote ends of a tunnel.
///
/// Hostnames are resolved once at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Address the local listener binds to
    pub local: SocketAddrV4,
    /// Address the far tunnel connects to
    pub remote: SocketAddrV4,
}

fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, ConfigError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .map_err(|_| ConfigError::Resolve(host.to_string()))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| ConfigError::Resolve(host.to_string()))
}

impl FromStr for TunnelSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTunnelSpec(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        let (lhost, lport, rhost, rport) = match parts.as_slice() {
            [lport, rhost, rport] => (None, *lport, *rhost, *rport),
            [lhost, lport, rhost, rport] => (Some(*lhost), *lport, *rhost, *rport),
            _ => return Err(invalid()),
        };

        let local_ip = match lhost {
            Some(h) if !h.is_empty() => resolve_ipv4(h)?,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        let local_port: u16 = lport.parse().map_err(|_| invalid())?;
        if rhost.is_empty() {
            return Err(invalid());
        }
        let remote_ip = resolve_ipv4(rhost)?;
        let remote_port: u16 = rport.parse().map_err(|_| invalid())?;

        Ok(Self {
            local: SocketAddrV4::new(local_ip, local_port),
            remote: SocketAddrV4::new(remote_ip, remote_port),
        })
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

impl Serialize for TunnelSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TunnelSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Configuration for one tunnel endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Only accept remote-initiated flows; no local listener
    pub listen: bool,

    /// Protocol carried by the local front end
    pub protocol: Protocol,

    /// `[local_host:]local_port:remote_host:remote_port`
    pub tunnel: Option<TunnelSpec>,

    /// Fixed destination endpoint for new flows
    pub dest_eid: Option<String>,

    /// Destination table (`network/bits endpoint` per line), matched in file order.
    ///
    /// Only meaningful in transparent mode, where the original destination of
    /// each flow varies.
    pub dest_eid_table: Option<PathBuf>,

    /// Local endpoint id; built from the registration demux when absent
    pub local_eid: Option<String>,

    /// Request custody transfer on every bundle
    pub custody: bool,

    /// Bundle lifetime
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,

    /// Coalescing delay for TCP reads.
    ///
    /// Absent means every read is sent as soon as it completes.
    #[serde(with = "humantime_serde")]
    pub delay: Option<Duration>,

    /// Maximum bundle size, header included
    pub max_size: usize,

    /// SO_RCVBUF for tunnel sockets (0 leaves the system default)
    pub recv_bufsize: usize,

    /// SO_SNDBUF for tunnel sockets (0 leaves the system default)
    pub send_bufsize: usize,

    /// Deliver UDP datagrams in strict sequence order
    pub reorder_udp: bool,

    /// Transparent proxy mode (Linux, needs CAP_NET_ADMIN)
    pub transparent: bool,

    /// Extended class-of-service hints
    pub ecos: ClassOfService,

    /// Interval of the throughput reporter; disabled when absent
    #[serde(with = "humantime_serde")]
    pub stats_interval: Option<Duration>,

    /// Wait between attempts of a send refused with backpressure
    #[serde(with = "humantime_serde")]
    pub backpressure_retry: Duration,

    /// Per-flow cap on out-of-order bundles held for reordering
    pub max_reorder_bundles: usize,

    /// Cap on distinct flows with bundles waiting for their opening bundle
    pub max_orphan_flows: usize,

    /// Depth of each connection's delivery queue
    pub delivery_queue_depth: usize,

    /// UDP flows and listener sources silent this long are forgotten
    #[serde(with = "humantime_serde")]
    pub udp_idle_timeout: Duration,

    /// Bind address of the UDP bundle transport used by the binary
    pub transport_bind: SocketAddr,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen: false,
            protocol: Protocol::Tcp,
            tunnel: None,
            dest_eid: None,
            dest_eid_table: None,
            local_eid: None,
            custody: false,
            expiration: default_expiration(),
            delay: None,
            max_size: default_max_size(),
            recv_bufsize: 0,
            send_bufsize: 0,
            reorder_udp: false,
            transparent: false,
            ecos: ClassOfService::default(),
            stats_interval: None,
            backpressure_retry: default_backpressure_retry(),
            max_reorder_bundles: default_max_reorder_bundles(),
            max_orphan_flows: default_max_orphan_flows(),
            delivery_queue_depth: default_delivery_queue_depth(),
            udp_idle_timeout: default_udp_idle_timeout(),
            transport_bind: default_transport_bind(),
        }
    }
}

impl TunnelConfig {
    /// Check option combinations.
    ///
    /// Listen mode takes neither a destination nor a tunnel spec. Otherwise
    /// exactly one destination source and a tunnel spec with non-zero ports
    /// are required.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen {
            if self.dest_eid.is_some() || self.dest_eid_table.is_some() {
                return Err(ConfigError::ListenWithDestination);
            }
            if self.tunnel.is_some() {
                return Err(ConfigError::ListenWithTunnel);
            }
        } else {
            match (&self.dest_eid, &self.dest_eid_table) {
                (None, None) => return Err(ConfigError::MissingDestination),
                (Some(_), Some(_)) => return Err(ConfigError::ConflictingDestinations),
                (Some(eid), None) => {
                    EndpointId::parse(eid)
                        .map_err(|_| ConfigError::InvalidEndpoint(eid.clone()))?;
                }
                (None, Some(_)) => {
                    if !self.transparent {
                        return Err(ConfigError::TableRequiresTransparent);
                    }
                }
            }
            let spec = self.tunnel.ok_or(ConfigError::MissingTunnel)?;
            if spec.local.port() == 0 || spec.remote.port() == 0 {
                return Err(ConfigError::ZeroPort);
            }
        }

        if let Some(eid) = &self.local_eid {
            EndpointId::parse(eid).map_err(|_| ConfigError::InvalidEndpoint(eid.clone()))?;
        }
        if self.transparent && !cfg!(target_os = "linux") {
            return Err(ConfigError::TransparentUnsupported);
        }
        if self.ecos.ordinal > ClassOfService::MAX_ORDINAL {
            return Err(ConfigError::OrdinalOutOfRange(self.ecos.ordinal));
        }
        if self.max_size <= BundleHeader::SIZE {
            return Err(ConfigError::MaxSizeTooSmall {
                min: BundleHeader::SIZE,
                actual: self.max_size,
            });
        }
        if self.max_reorder_bundles == 0 {
            return Err(ConfigError::ZeroLimit("max_reorder_bundles"));
        }
        if self.max_orphan_flows == 0 {
            return Err(ConfigError::ZeroLimit("max_orphan_flows"));
        }
        if self.delivery_queue_depth == 0 {
            return Err(ConfigError::ZeroLimit("delivery_queue_depth"));
        }
        if self.udp_idle_timeout.is_zero() {
            return Err(ConfigError::ZeroLimit("udp_idle_timeout"));
        }
        Ok(())
    }

    /// Options applied to every bundle this tunnel sends
    pub fn bundle_options(&self) -> BundleOptions {
        BundleOptions {
            custody: self.custody,
            expiration: self.expiration,
            priority: Priority::Normal,
            class_of_service: self.ecos.is_enabled().then_some(self.ecos),
        }
    }

    /// Service demux string used to build the local endpoint id.
    ///
    /// Initiating tunnels embed their destination and tunnel spec so that two
    /// tunnels on one node get distinct endpoints.
    pub fn registration_service(&self) -> String {
        if self.listen {
            return "dtntunnel".to_string();
        }
        let (local, remote) = match self.tunnel {
            Some(spec) => (spec.local, spec.remote),
            None => (
                SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
                SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            ),
        };
        format!(
            "dtntunnel?dest_eid={}&tunnel={}-{}:{}-{}:{}",
            self.dest_eid.as_deref().unwrap_or(""),
            self.protocol,
            local.ip(),
            local.port(),
            remote.ip(),
            remote.port()
        )
    }
}
