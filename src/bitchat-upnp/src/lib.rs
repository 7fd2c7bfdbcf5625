pub mod gateway;
pub mod igd;
pub mod netinfo;

pub use gateway::{
    GatewayDiscovery, InternetGatewayDevice, PortMappingEntry, PortMappingProtocol, UpnpError,
};
pub use igd::IgdDiscovery;
pub use netinfo::{DefaultRoute, NetworkInfo, SystemNetworkInfo};
