//! Periodic connectivity probing.
//!
//! One long-lived task classifies the host's internet connectivity (direct
//! public address, NAT with a UPnP gateway, NAT without one), maintains a
//! UPnP port mapping with collision avoidance, and validates reachability
//! through the echo service. Everything here degrades status on failure;
//! nothing propagates out of the probe loop.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use bitchat_upnp::netinfo::{is_private_ipv4, is_public_ip};
use bitchat_upnp::{
    DefaultRoute, GatewayDiscovery, InternetGatewayDevice, NetworkInfo, PortMappingProtocol,
    UpnpError,
};

use crate::config::ManagerConfig;
use crate::webcheck::{EchoOutcome, WebCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternetConnectivityStatus {
    Unknown,
    NoInternetConnection,
    DirectInternetConnection,
    /// Reserved; never produced by the current probe.
    HttpProxyInternetConnection,
    /// Reserved; never produced by the current probe.
    Socks5ProxyInternetConnection,
    NatInternetConnectionViaUpnpRouter,
    NatInternetConnection,
}

impl fmt::Display for InternetConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::NoInternetConnection => "no internet",
            Self::DirectInternetConnection => "direct",
            Self::HttpProxyInternetConnection => "http proxy",
            Self::Socks5ProxyInternetConnection => "socks5 proxy",
            Self::NatInternetConnectionViaUpnpRouter => "nat via upnp router",
            Self::NatInternetConnection => "nat",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpnpDeviceStatus {
    Unknown,
    DeviceNotFound,
    ExternalIpPrivate,
    PortForwarded,
    PortForwardingFailed,
    PortForwardedNotAccessible,
}

impl fmt::Display for UpnpDeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::DeviceNotFound => "device not found",
            Self::ExternalIpPrivate => "external ip private",
            Self::PortForwarded => "port forwarded",
            Self::PortForwardingFailed => "port forwarding failed",
            Self::PortForwardedNotAccessible => "port forwarded not accessible",
        };
        write!(f, "{}", name)
    }
}

/// One consistent view of the connectivity state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub internet_status: InternetConnectivityStatus,
    pub upnp_status: UpnpDeviceStatus,
    /// Local address when it is itself publicly routable.
    pub local_live_ip: Option<IpAddr>,
    pub upnp_external_ip: Option<IpAddr>,
    pub upnp_external_port: Option<u16>,
    /// External endpoint observed by the echo service.
    pub web_check_endpoint: Option<SocketAddr>,
    pub web_check_success: bool,
    pub web_check_error: bool,
    pub web_check_attempted: bool,
}

impl Default for ConnectivitySnapshot {
    fn default() -> Self {
        Self {
            internet_status: InternetConnectivityStatus::Unknown,
            upnp_status: UpnpDeviceStatus::Unknown,
            local_live_ip: None,
            upnp_external_ip: None,
            upnp_external_port: None,
            web_check_endpoint: None,
            web_check_success: false,
            web_check_error: false,
            web_check_attempted: false,
        }
    }
}

type ConnectivityListener = Arc<dyn Fn(InternetConnectivityStatus, UpnpDeviceStatus) + Send + Sync>;
type GatewayCache = Option<(Ipv4Addr, Arc<dyn InternetGatewayDevice>)>;

/// Owns the connectivity state; mutated only by the probe task.
pub struct ConnectivityMonitor {
    local_port: u16,
    config: ManagerConfig,
    netinfo: Arc<dyn NetworkInfo>,
    discovery: Arc<dyn GatewayDiscovery>,
    web: Arc<dyn WebCheck>,
    state: Mutex<ConnectivitySnapshot>,
    listeners: Mutex<Vec<ConnectivityListener>>,
    received_live_inbound: AtomicBool,
    gateway: tokio::sync::Mutex<GatewayCache>,
}

impl ConnectivityMonitor {
    pub fn new(
        local_port: u16,
        config: ManagerConfig,
        netinfo: Arc<dyn NetworkInfo>,
        discovery: Arc<dyn GatewayDiscovery>,
        web: Arc<dyn WebCheck>,
    ) -> Self {
        Self {
            local_port,
            config,
            netinfo,
            discovery,
            web,
            state: Mutex::new(ConnectivitySnapshot::default()),
            listeners: Mutex::new(Vec::new()),
            received_live_inbound: AtomicBool::new(false),
            gateway: tokio::sync::Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> ConnectivitySnapshot {
        self.state.lock().clone()
    }

    pub fn internet_status(&self) -> InternetConnectivityStatus {
        self.state.lock().internet_status
    }

    pub fn upnp_status(&self) -> UpnpDeviceStatus {
        self.state.lock().upnp_status
    }

    /// The UPnP-mapped external endpoint, when a usable mapping exists.
    pub fn upnp_external_endpoint(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        match (state.upnp_external_ip, state.upnp_external_port) {
            (Some(ip), Some(port)) if port != 0 => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    /// The endpoint other peers should dial, best knowledge first: the echo
    /// service's observation, then the live public address, then a UPnP
    /// mapping that has at least been put to the test.
    pub fn external_endpoint(&self) -> Option<SocketAddr> {
        let state = self.state.lock();

        if state.web_check_success {
            if let Some(endpoint) = state.web_check_endpoint {
                return Some(endpoint);
            }
        }

        match state.internet_status {
            InternetConnectivityStatus::DirectInternetConnection => state
                .local_live_ip
                .map(|ip| SocketAddr::new(ip, self.local_port)),
            InternetConnectivityStatus::NatInternetConnectionViaUpnpRouter
                if matches!(
                    state.upnp_status,
                    UpnpDeviceStatus::PortForwarded | UpnpDeviceStatus::PortForwardedNotAccessible
                ) && state.web_check_attempted =>
            {
                match (state.upnp_external_ip, state.upnp_external_port) {
                    (Some(ip), Some(port)) if port != 0 => Some(SocketAddr::new(ip, port)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// The port to advertise as our service port; falls back to the local
    /// port when no external endpoint is known.
    pub fn external_port(&self) -> u16 {
        self.external_endpoint()
            .map(|endpoint| endpoint.port())
            .unwrap_or(self.local_port)
    }

    pub fn on_status_change<F>(&self, listener: F)
    where
        F: Fn(InternetConnectivityStatus, UpnpDeviceStatus) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Record an inbound connection from a non-private address. Sticky
    /// until the echo service reports a clean "unreachable".
    pub fn mark_live_inbound(&self) {
        self.received_live_inbound.store(true, Ordering::SeqCst);
    }

    pub fn received_live_inbound(&self) -> bool {
        self.received_live_inbound.load(Ordering::SeqCst)
    }

    pub(crate) async fn run(self: Arc<Self>) {
        tokio::time::sleep(self.config.probe_initial_delay).await;
        loop {
            self.probe_cycle().await;
            tokio::time::sleep(self.next_interval()).await;
        }
    }

    fn next_interval(&self) -> Duration {
        match self.state.lock().upnp_status {
            UpnpDeviceStatus::DeviceNotFound | UpnpDeviceStatus::PortForwardingFailed => {
                self.config.probe_retry_interval
            }
            _ => self.config.probe_interval,
        }
    }

    async fn probe_cycle(&self) {
        let previous = {
            let state = self.state.lock();
            (state.internet_status, state.upnp_status)
        };

        let mut next = self.state.lock().clone();
        self.classify(&mut next).await;

        // reachability validation only runs when the classification moved
        if (next.internet_status, next.upnp_status) != previous {
            self.validate(&mut next).await;
        }

        let current = (next.internet_status, next.upnp_status);
        *self.state.lock() = next;

        if current != previous {
            tracing::info!("connectivity changed: {} / upnp {}", current.0, current.1);
            let listeners: Vec<ConnectivityListener> = self.listeners.lock().clone();
            for listener in listeners {
                listener(current.0, current.1);
            }
        }
    }

    async fn classify(&self, next: &mut ConnectivitySnapshot) {
        next.upnp_status = UpnpDeviceStatus::Unknown;
        next.upnp_external_ip = None;
        next.upnp_external_port = None;

        match self.netinfo.default_route() {
            None => {
                next.internet_status = InternetConnectivityStatus::NoInternetConnection;
                next.local_live_ip = None;
            }
            Some(route) if is_public_ip(route.local_ip) => {
                next.internet_status = InternetConnectivityStatus::DirectInternetConnection;
                next.local_live_ip = Some(route.local_ip);
            }
            Some(route) => {
                next.local_live_ip = None;
                self.probe_gateway(&route, next).await;
            }
        }
    }

    async fn probe_gateway(&self, route: &DefaultRoute, next: &mut ConnectivitySnapshot) {
        let gateway = match self.gateway_for(route.broadcast_ip).await {
            Some(gateway) => {
                next.internet_status =
                    InternetConnectivityStatus::NatInternetConnectionViaUpnpRouter;
                gateway
            }
            None => {
                next.internet_status = InternetConnectivityStatus::NatInternetConnection;
                next.upnp_status = UpnpDeviceStatus::DeviceNotFound;
                return;
            }
        };

        let external_ip = match gateway.external_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!("gateway external IP query failed: {}", e);
                *self.gateway.lock().await = None;
                next.internet_status = InternetConnectivityStatus::NatInternetConnection;
                next.upnp_status = UpnpDeviceStatus::DeviceNotFound;
                return;
            }
        };

        next.upnp_external_ip = Some(external_ip);
        if let IpAddr::V4(v4) = external_ip {
            if is_private_ipv4(v4) {
                // the gateway itself sits behind NAT; forwarding is useless
                next.upnp_status = UpnpDeviceStatus::ExternalIpPrivate;
                return;
            }
        }

        let internal = SocketAddr::new(route.local_ip, self.local_port);
        let mut external_port = self.local_port;
        let mut reuse = false;
        for _ in 0..u16::MAX {
            match gateway
                .port_mapping_entry(PortMappingProtocol::Tcp, external_port)
                .await
            {
                Ok(None) => break,
                Ok(Some(entry)) if entry.internal_endpoint == internal => {
                    reuse = true;
                    break;
                }
                Ok(Some(_)) => {
                    external_port = if external_port == u16::MAX {
                        1024
                    } else {
                        external_port + 1
                    };
                }
                // an unanswerable lookup counts as free; AddPortMapping
                // arbitrates the conflict
                Err(_) => break,
            }
        }

        if reuse {
            tracing::debug!("reusing existing port mapping on {}", external_port);
            next.upnp_status = UpnpDeviceStatus::PortForwarded;
            next.upnp_external_port = Some(external_port);
            return;
        }

        match self.map_port(gateway.as_ref(), external_port, internal).await {
            Ok(()) => {
                tracing::info!("forwarded external port {} to {}", external_port, internal);
                next.upnp_status = UpnpDeviceStatus::PortForwarded;
                next.upnp_external_port = Some(external_port);
            }
            Err(e) => {
                tracing::warn!("port forwarding failed on {}: {}", external_port, e);
                next.upnp_status = UpnpDeviceStatus::PortForwardingFailed;
                next.upnp_external_port = None;
            }
        }
    }

    async fn map_port(
        &self,
        gateway: &dyn InternetGatewayDevice,
        external_port: u16,
        internal: SocketAddr,
    ) -> Result<(), UpnpError> {
        let description = self.config.upnp_description.as_str();
        match gateway
            .add_port_mapping(PortMappingProtocol::Tcp, external_port, internal, description)
            .await
        {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::debug!(
                    "add mapping on {} failed ({}), deleting stale entry and retrying",
                    external_port,
                    first
                );
                let _ = gateway
                    .delete_port_mapping(PortMappingProtocol::Tcp, external_port)
                    .await;
                gateway
                    .add_port_mapping(PortMappingProtocol::Tcp, external_port, internal, description)
                    .await
            }
        }
    }

    async fn gateway_for(&self, broadcast: Ipv4Addr) -> Option<Arc<dyn InternetGatewayDevice>> {
        let mut cache = self.gateway.lock().await;
        if let Some((cached_broadcast, gateway)) = cache.as_ref() {
            if *cached_broadcast == broadcast {
                return Some(gateway.clone());
            }
        }
        match self
            .discovery
            .discover(IpAddr::V4(broadcast), self.config.upnp_discover_timeout)
            .await
        {
            Ok(gateway) => {
                *cache = Some((broadcast, gateway.clone()));
                Some(gateway)
            }
            Err(e) => {
                tracing::debug!("gateway discovery failed: {}", e);
                *cache = None;
                None
            }
        }
    }

    async fn validate(&self, next: &mut ConnectivitySnapshot) {
        let web_ok = self.web.web_accessible().await;
        next.web_check_attempted = true;

        if !web_ok {
            tracing::info!("no web access; demoting connectivity status");
            next.web_check_success = false;
            next.web_check_endpoint = None;
            next.local_live_ip = None;
            next.upnp_external_ip = None;
            next.upnp_external_port = None;
            next.internet_status = InternetConnectivityStatus::NoInternetConnection;
            return;
        }

        match next.internet_status {
            InternetConnectivityStatus::DirectInternetConnection => {
                let outcome = self.web.echo(self.local_port).await;
                self.record_echo(next, &outcome);
                if !outcome.reachable && !outcome.error {
                    next.local_live_ip = None;
                }
            }
            InternetConnectivityStatus::NatInternetConnection => {
                // informational; NAT without UPnP cannot act on the answer
                let outcome = self.web.echo(self.local_port).await;
                self.record_echo(next, &outcome);
            }
            InternetConnectivityStatus::NatInternetConnectionViaUpnpRouter
                if next.upnp_status == UpnpDeviceStatus::PortForwarded =>
            {
                if let Some(port) = next.upnp_external_port {
                    let outcome = self.web.echo(port).await;
                    self.record_echo(next, &outcome);
                    if !outcome.reachable && !outcome.error {
                        next.upnp_status = UpnpDeviceStatus::PortForwardedNotAccessible;
                    }
                }
            }
            _ => {}
        }
    }

    fn record_echo(&self, next: &mut ConnectivitySnapshot, outcome: &EchoOutcome) {
        next.web_check_error = outcome.error;
        next.web_check_success = outcome.reachable && !outcome.error;
        if let Some(endpoint) = outcome.endpoint {
            next.web_check_endpoint = Some(endpoint);
        } else if !outcome.error {
            next.web_check_endpoint = None;
        }
        if !outcome.error && !outcome.reachable {
            // a clean "unreachable" invalidates the sticky inbound observation
            self.received_live_inbound.store(false, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_state(&self, snapshot: ConnectivitySnapshot) {
        *self.state.lock() = snapshot;
    }
}
