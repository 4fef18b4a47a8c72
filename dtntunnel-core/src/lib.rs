//! Core library for tunneling TCP and UDP flows over a DTN bundle transport.
//!
//! Local connections or datagrams are chopped into bundles, each carrying a
//! small header that identifies the flow and its position in it. The tunnel
//! at the far end reassembles the flow in order and replays it to the real
//! destination.
//!
//! # Architecture
//!
//! - `proto`: the bundle header wire format
//! - `reorder`: per-flow sequence reordering
//! - `flow`: connection table, orphan buffer and cancellation
//! - `coordinator`: the per-process hub that sends, receives and routes bundles
//! - `tcp` / `udp`: listeners and per-flow connection tasks
//! - `transport`: the bundle transport abstraction plus UDP and in-memory
//!   implementations
//! - `eid_table`: destination endpoint lookup by IPv4 network
//! - `tproxy`: transparent proxy socket plumbing (Linux)
//! - `control`: configuration and tunnel specs
//! - `stats`: throughput counters

pub mod control;
pub mod coordinator;
pub mod eid_table;
pub mod flow;
pub mod proto;
pub mod reorder;
pub mod stats;
pub mod tcp;
pub mod tproxy;
pub mod transport;
pub mod udp;

pub use control::{TunnelConfig, TunnelSpec};
pub use coordinator::{Coordinator, ListenerTask, TransportHandles};
pub use proto::{BundleHeader, Protocol};
pub use transport::{BundleTransport, EndpointId};
