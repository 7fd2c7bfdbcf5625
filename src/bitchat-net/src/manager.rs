//! The connection manager facade.
//!
//! Owns the TCP listener, the connection registry, the connectivity monitor
//! and the in-flight connect bookkeeping. Background tasks are held as
//! abortable handles; `dispose` stops everything and drops every
//! connection.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use bitchat_upnp::netinfo::is_private_ipv4;
use bitchat_upnp::{GatewayDiscovery, IgdDiscovery, NetworkInfo, SystemNetworkInfo};

use crate::config::ManagerConfig;
use crate::connection::{
    ChannelRequestHandler, Connection, ConnectionFactory, ConnectionHost, ProxyPeersHandler,
};
use crate::error::NetError;
use crate::handshake;
use crate::peer::PeerId;
use crate::probe::{ConnectivityMonitor, InternetConnectivityStatus, UpnpDeviceStatus};
use crate::registry::ConnectionRegistry;
use crate::tunnel;
use crate::webcheck::{HttpWebCheck, WebCheck};

/// Endpoints with a connect currently in flight. Claims are RAII so an
/// early return or panic cannot leak an entry.
struct InFlightSet {
    endpoints: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl InFlightSet {
    fn new() -> Self {
        Self {
            endpoints: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, endpoint: SocketAddr) -> Result<InFlightClaim, NetError> {
        if self.endpoints.lock().insert(endpoint) {
            Ok(InFlightClaim {
                endpoints: self.endpoints.clone(),
                endpoint,
            })
        } else {
            Err(NetError::AlreadyConnecting(endpoint))
        }
    }
}

struct InFlightClaim {
    endpoints: Arc<Mutex<HashSet<SocketAddr>>>,
    endpoint: SocketAddr,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.endpoints.lock().remove(&self.endpoint);
    }
}

/// Discovers, establishes and maintains the set of live peer connections.
pub struct ConnectionManager {
    config: ManagerConfig,
    local_peer_id: PeerId,
    local_port: u16,
    registry: Arc<ConnectionRegistry>,
    monitor: Arc<ConnectivityMonitor>,
    direct_connecting: InFlightSet,
    virtual_connecting: InFlightSet,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Bind the service listener and start the acceptor and connectivity
    /// probe. Falls back to an ephemeral port when `config.local_port` is
    /// taken.
    pub async fn bind(
        config: ManagerConfig,
        factory: Arc<dyn ConnectionFactory>,
        channel_request: Arc<dyn ChannelRequestHandler>,
        proxy_peers: Arc<dyn ProxyPeersHandler>,
    ) -> Result<Arc<Self>, NetError> {
        let web: Arc<dyn WebCheck> = Arc::new(HttpWebCheck::new(&config)?);
        Self::bind_with(
            config,
            factory,
            channel_request,
            proxy_peers,
            Arc::new(SystemNetworkInfo),
            Arc::new(IgdDiscovery),
            web,
        )
        .await
    }

    /// `bind` with explicit host/gateway/web collaborators.
    pub async fn bind_with(
        config: ManagerConfig,
        factory: Arc<dyn ConnectionFactory>,
        channel_request: Arc<dyn ChannelRequestHandler>,
        proxy_peers: Arc<dyn ProxyPeersHandler>,
        netinfo: Arc<dyn NetworkInfo>,
        discovery: Arc<dyn GatewayDiscovery>,
        web: Arc<dyn WebCheck>,
    ) -> Result<Arc<Self>, NetError> {
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.local_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(
                    "port {} unavailable ({}), falling back to an ephemeral port",
                    config.local_port,
                    e
                );
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?
            }
        };
        let local_port = listener.local_addr()?.port();

        let local_peer_id = PeerId::random();
        let registry = ConnectionRegistry::new(
            local_peer_id,
            factory,
            config.clone(),
            channel_request,
            proxy_peers,
        );
        let monitor = Arc::new(ConnectivityMonitor::new(
            local_port,
            config.clone(),
            netinfo,
            discovery,
            web,
        ));

        let manager = Arc::new(Self {
            config: config.clone(),
            local_peer_id,
            local_port,
            registry: registry.clone(),
            monitor: monitor.clone(),
            direct_connecting: InFlightSet::new(),
            virtual_connecting: InFlightSet::new(),
            accept_task: Mutex::new(None),
            probe_task: Mutex::new(None),
        });

        *manager.accept_task.lock() = Some(tokio::spawn(accept_loop(
            listener,
            registry,
            monitor.clone(),
            config,
        )));
        *manager.probe_task.lock() = Some(tokio::spawn(monitor.run()));

        tracing::info!(
            "connection manager listening on port {} as peer {}",
            local_port,
            local_peer_id
        );
        Ok(manager)
    }

    /// Stop the listener and the probe, and drop every connection.
    pub fn dispose(&self) {
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.probe_task.lock().take() {
            handle.abort();
        }
        self.registry.dispose_all();
        tracing::info!("connection manager on port {} disposed", self.local_port);
    }

    /// Connect to `remote_endpoint`, directly when possible, through a
    /// relaying peer when not.
    pub async fn make_connection(
        &self,
        remote_endpoint: SocketAddr,
    ) -> Result<Arc<dyn Connection>, NetError> {
        let _claim = self.direct_connecting.claim(remote_endpoint)?;
        self.ensure_not_self(remote_endpoint)?;
        if let Some(existing) = self.registry.get(remote_endpoint) {
            return Ok(existing);
        }

        match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(remote_endpoint),
        )
        .await
        {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                handshake::initiate(
                    Box::new(stream),
                    &self.registry,
                    remote_endpoint,
                    self.external_port(),
                    &self.config,
                )
                .await
            }
            Ok(Err(e)) => {
                tracing::debug!(
                    "direct connect to {} failed ({}), looking for a relay",
                    remote_endpoint,
                    e
                );
                self.tunnel_connect(remote_endpoint).await
            }
            Err(_) => {
                tracing::debug!(
                    "direct connect to {} timed out, looking for a relay",
                    remote_endpoint
                );
                self.tunnel_connect(remote_endpoint).await
            }
        }
    }

    /// Connect to `remote_endpoint` through `via`'s tunnel channel.
    pub async fn make_virtual_connection(
        &self,
        via: &Arc<dyn Connection>,
        remote_endpoint: SocketAddr,
    ) -> Result<Arc<dyn Connection>, NetError> {
        let _claim = self.virtual_connecting.claim(remote_endpoint)?;
        self.ensure_not_self(remote_endpoint)?;
        if let Some(existing) = self.registry.get(remote_endpoint) {
            return Ok(existing);
        }
        self.open_tunnel(via, remote_endpoint).await
    }

    async fn tunnel_connect(
        &self,
        remote_endpoint: SocketAddr,
    ) -> Result<Arc<dyn Connection>, NetError> {
        let proxy = tunnel::find_proxy(
            self.registry.snapshot(),
            remote_endpoint,
            self.config.proxy_wait_timeout,
        )
        .await?;
        tracing::debug!(
            "relaying to {} through {}",
            remote_endpoint,
            proxy.remote_endpoint()
        );
        self.open_tunnel(&proxy, remote_endpoint).await
    }

    async fn open_tunnel(
        &self,
        via: &Arc<dyn Connection>,
        remote_endpoint: SocketAddr,
    ) -> Result<Arc<dyn Connection>, NetError> {
        let stream = via.request_proxy_tunnel_channel(remote_endpoint).await?;
        handshake::initiate(
            stream,
            &self.registry,
            remote_endpoint,
            self.external_port(),
            &self.config,
        )
        .await
    }

    fn ensure_not_self(&self, remote_endpoint: SocketAddr) -> Result<(), NetError> {
        if self.monitor.external_endpoint() == Some(remote_endpoint) {
            return Err(NetError::SelfConnection(remote_endpoint));
        }
        Ok(())
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// The actually bound service port.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn get_existing_connection(&self, endpoint: SocketAddr) -> Option<Arc<dyn Connection>> {
        self.registry.get(endpoint)
    }

    pub fn is_peer_connection_available(&self, endpoint: SocketAddr) -> bool {
        self.registry.contains(endpoint)
    }

    /// All live connections, for the chat layer to enumerate.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.registry.snapshot()
    }

    /// The typed handle connections use to call back into the manager.
    pub fn host(&self) -> Arc<ConnectionHost> {
        self.registry.host()
    }

    pub fn internet_status(&self) -> InternetConnectivityStatus {
        self.monitor.internet_status()
    }

    pub fn upnp_status(&self) -> UpnpDeviceStatus {
        self.monitor.upnp_status()
    }

    pub fn upnp_external_endpoint(&self) -> Option<SocketAddr> {
        self.monitor.upnp_external_endpoint()
    }

    pub fn get_external_endpoint(&self) -> Option<SocketAddr> {
        self.monitor.external_endpoint()
    }

    pub fn get_external_port(&self) -> u16 {
        self.monitor.external_port()
    }

    fn external_port(&self) -> u16 {
        self.monitor.external_port()
    }

    /// Register a callback fired on every connectivity status change.
    pub fn on_connectivity_changed<F>(&self, listener: F)
    where
        F: Fn(InternetConnectivityStatus, UpnpDeviceStatus) + Send + Sync + 'static,
    {
        self.monitor.on_status_change(listener);
    }
}

/// Accepts transport connections until the manager is disposed. Handshakes
/// run on their own tasks; per-connection failures never stop the loop.
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    monitor: Arc<ConnectivityMonitor>,
    config: ManagerConfig,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        if let IpAddr::V4(ip) = remote.ip() {
            if !is_private_ipv4(ip) {
                monitor.mark_live_inbound();
            }
        }

        let registry = registry.clone();
        let config = config.clone();
        tokio::spawn(async move {
            match handshake::accept(Box::new(stream), remote.ip(), &registry, &config).await {
                Ok(connection) => tracing::debug!(
                    "inbound connection from {} admitted as {}",
                    remote,
                    connection.remote_endpoint()
                ),
                Err(e) => tracing::debug!("inbound handshake from {} failed: {}", remote, e),
            }
        });
    }
}
