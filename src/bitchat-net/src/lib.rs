//! Peer connection management for Bit Chat.
//!
//! Discovers, establishes, multiplexes and maintains the set of live peer
//! connections: a deduplicating registry, the two-way peer handshake,
//! relay-through-peer virtual connections, and periodic connectivity
//! probing (direct / NAT via UPnP / NAT).

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub(crate) mod handshake;
pub mod manager;
pub mod peer;
pub mod probe;
pub mod registry;
pub(crate) mod tunnel;
pub mod webcheck;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::ManagerConfig;
pub use connection::{
    ChannelRequestHandler, Connection, ConnectionFactory, ConnectionHost, ConnectionStream,
    ProxyPeersHandler, Virtual,
};
pub use error::NetError;
pub use manager::ConnectionManager;
pub use peer::PeerId;
pub use probe::{
    ConnectivityMonitor, ConnectivitySnapshot, InternetConnectivityStatus, UpnpDeviceStatus,
};
pub use registry::{AdmissionGuard, AdmissionRefusal, ConnectionRegistry};
pub use webcheck::{EchoOutcome, HttpWebCheck, WebCheck};
