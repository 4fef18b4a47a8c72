//! Destination endpoint resolution.
//!
//! A new outgoing flow is sent either to one fixed endpoint or, in
//! transparent mode, to the endpoint of the first table entry whose network
//! contains the flow's original destination address. Entries are tried in
//! file order; this is not a longest-prefix match.

use ipnet::Ipv4Net;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::transport::EndpointId;

/// Destination table errors
#[derive(Debug, thiserror::Error)]
pub enum EidTableError {
    #[error("failed to read destination table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected '<network>/<bits> <endpoint>'")]
    Malformed { line: usize },

    #[error("line {line}: invalid network '{value}'")]
    InvalidNetwork { line: usize, value: String },

    #[error("line {line}: invalid endpoint id '{value}'")]
    InvalidEndpoint { line: usize, value: String },

    #[error("line {line}: duplicate network {network}")]
    DuplicateNetwork { line: usize, network: Ipv4Net },
}

/// Ordered (network, endpoint) table
#[derive(Debug, Clone, Default)]
pub struct DestinationTable {
    entries: Vec<(Ipv4Net, EndpointId)>,
}

impl DestinationTable {
    /// Parse table text. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self, EidTableError> {
        let mut table = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }

            let mut fields = content.split_whitespace();
            let (Some(net), Some(eid)) = (fields.next(), fields.next()) else {
                return Err(EidTableError::Malformed { line });
            };

            let network: Ipv4Net = net.parse().map_err(|_| EidTableError::InvalidNetwork {
                line,
                value: net.to_string(),
            })?;
            let eid = EndpointId::parse(eid).map_err(|_| EidTableError::InvalidEndpoint {
                line,
                value: eid.to_string(),
            })?;

            let network = network.trunc();
            if table.entries.iter().any(|(n, _)| *n == network) {
                return Err(EidTableError::DuplicateNetwork { line, network });
            }
            table.entries.push((network, eid));
        }

        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, EidTableError> {
        let text = fs::read_to_string(path).map_err(|source| EidTableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// First entry, in table order, whose network contains `addr`
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&EndpointId> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, eid)| eid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Picks the destination endpoint for new outgoing flows
#[derive(Debug, Clone, Default)]
pub struct DestinationResolver {
    fixed: Option<EndpointId>,
    table: DestinationTable,
}

impl DestinationResolver {
    pub fn fixed(eid: EndpointId) -> Self {
        Self {
            fixed: Some(eid),
            table: DestinationTable::default(),
        }
    }

    pub fn table(table: DestinationTable) -> Self {
        Self { fixed: None, table }
    }

    /// Resolve the endpoint for a flow headed to `addr`.
    ///
    /// A non-empty table takes precedence over the fixed endpoint.
    pub fn resolve(&self, addr: Ipv4Addr) -> Option<EndpointId> {
        if self.table.is_empty() {
            self.fixed.clone()
        } else {
            self.table.lookup(addr).cloned()
        }
    }
}
