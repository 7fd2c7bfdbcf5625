use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::{
    GatewayDiscovery, InternetGatewayDevice, PortMappingEntry, PortMappingProtocol, UpnpError,
};

const SSDP_PORT: u16 = 1900;

/// Mappings are added with an indefinite lease; the connectivity probe
/// re-validates them on every cycle, which also restores a mapping after a
/// gateway reboot.
const LEASE_SECONDS: u32 = 0;

/// SSDP/SOAP gateway discovery over the `igd` client.
pub struct IgdDiscovery;

#[async_trait]
impl GatewayDiscovery for IgdDiscovery {
    async fn discover(
        &self,
        broadcast_ip: IpAddr,
        timeout: Duration,
    ) -> Result<Arc<dyn InternetGatewayDevice>, UpnpError> {
        let gateway = igd_next::aio::tokio::search_gateway(igd_next::SearchOptions {
            broadcast_address: SocketAddr::new(broadcast_ip, SSDP_PORT),
            timeout: Some(timeout),
            ..Default::default()
        })
        .await
        .map_err(|e| UpnpError::DeviceNotFound(e.to_string()))?;

        tracing::info!("discovered internet gateway at {}", gateway.addr);
        Ok(Arc::new(IgdGateway { gateway }))
    }
}

struct IgdGateway {
    gateway: igd_next::aio::Gateway<igd_next::aio::tokio::Tokio>,
}

impl From<PortMappingProtocol> for igd_next::PortMappingProtocol {
    fn from(protocol: PortMappingProtocol) -> Self {
        match protocol {
            PortMappingProtocol::Tcp => igd_next::PortMappingProtocol::TCP,
            PortMappingProtocol::Udp => igd_next::PortMappingProtocol::UDP,
        }
    }
}

#[async_trait]
impl InternetGatewayDevice for IgdGateway {
    async fn external_ip(&self) -> Result<IpAddr, UpnpError> {
        self.gateway
            .get_external_ip()
            .await
            .map_err(|e| UpnpError::Request(e.to_string()))
    }

    async fn port_mapping_entry(
        &self,
        _protocol: PortMappingProtocol,
        _external_port: u16,
    ) -> Result<Option<PortMappingEntry>, UpnpError> {
        // The igd client does not expose GetSpecificPortMappingEntry, so
        // every probed port is reported free and AddPortMapping conflict
        // errors drive the delete-and-retry path instead.
        Ok(None)
    }

    async fn add_port_mapping(
        &self,
        protocol: PortMappingProtocol,
        external_port: u16,
        internal_endpoint: SocketAddr,
        description: &str,
    ) -> Result<(), UpnpError> {
        self.gateway
            .add_port(
                protocol.into(),
                external_port,
                internal_endpoint,
                LEASE_SECONDS,
                description,
            )
            .await
            .map_err(|e| UpnpError::Request(e.to_string()))
    }

    async fn delete_port_mapping(
        &self,
        protocol: PortMappingProtocol,
        external_port: u16,
    ) -> Result<(), UpnpError> {
        self.gateway
            .remove_port(protocol.into(), external_port)
            .await
            .map_err(|e| UpnpError::Request(e.to_string()))
    }
}
