use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("no internet gateway device found: {0}")]
    DeviceNotFound(String),
    #[error("gateway request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMappingProtocol {
    Tcp,
    Udp,
}

/// An existing port mapping as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingEntry {
    /// The LAN endpoint the external port forwards to.
    pub internal_endpoint: SocketAddr,
    pub description: String,
    pub enabled: bool,
    pub lease_seconds: u32,
}

/// A discovered internet gateway exposing the WANIPConnection port-mapping
/// operations. The transport (SSDP discovery, SOAP control) lives behind the
/// implementation.
#[async_trait]
pub trait InternetGatewayDevice: Send + Sync {
    /// The gateway's WAN-side IP address.
    async fn external_ip(&self) -> Result<IpAddr, UpnpError>;

    /// Look up the mapping currently occupying `external_port`, if any.
    async fn port_mapping_entry(
        &self,
        protocol: PortMappingProtocol,
        external_port: u16,
    ) -> Result<Option<PortMappingEntry>, UpnpError>;

    /// Forward `external_port` on the WAN side to `internal_endpoint`.
    async fn add_port_mapping(
        &self,
        protocol: PortMappingProtocol,
        external_port: u16,
        internal_endpoint: SocketAddr,
        description: &str,
    ) -> Result<(), UpnpError>;

    /// Remove the mapping on `external_port`.
    async fn delete_port_mapping(
        &self,
        protocol: PortMappingProtocol,
        external_port: u16,
    ) -> Result<(), UpnpError>;
}

/// Locates an internet gateway device on the local network segment.
#[async_trait]
pub trait GatewayDiscovery: Send + Sync {
    /// Search for a gateway by multicasting on `broadcast_ip`.
    async fn discover(
        &self,
        broadcast_ip: IpAddr,
        timeout: Duration,
    ) -> Result<Arc<dyn InternetGatewayDevice>, UpnpError>;
}
