//! Shared mocks for unit tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::ManagerConfig;
use crate::connection::{
    ChannelRequestHandler, Connection, ConnectionFactory, ConnectionHost, ConnectionStream,
    ProxyPeersHandler, Virtual,
};
use crate::error::NetError;
use crate::peer::PeerId;
use crate::registry::ConnectionRegistry;

static CREATED: Mutex<Vec<Weak<MockConnection>>> = Mutex::new(Vec::new());

/// Scripted behavior for `request_peer_status`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StatusScript {
    Answer { connected: bool, delay: Duration },
    Fail,
    Hang,
}

pub(crate) struct MockConnection {
    remote_endpoint: SocketAddr,
    remote_peer_id: PeerId,
    is_virtual: bool,
    started: AtomicBool,
    disposed: AtomicBool,
    stream: Mutex<Option<Box<dyn ConnectionStream>>>,
    status_script: Mutex<Option<StatusScript>>,
    tunnel_stream: Mutex<Option<Box<dyn ConnectionStream>>>,
}

impl MockConnection {
    pub(crate) fn new(
        remote_endpoint: SocketAddr,
        remote_peer_id: PeerId,
        is_virtual: bool,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            remote_endpoint,
            remote_peer_id,
            is_virtual,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            stream: Mutex::new(None),
            status_script: Mutex::new(None),
            tunnel_stream: Mutex::new(None),
        });
        CREATED.lock().push(Arc::downgrade(&connection));
        connection
    }

    pub(crate) fn with_status(self: Arc<Self>, script: StatusScript) -> Arc<Self> {
        *self.status_script.lock() = Some(script);
        self
    }

    pub(crate) fn with_tunnel(self: Arc<Self>, stream: Box<dyn ConnectionStream>) -> Arc<Self> {
        *self.tunnel_stream.lock() = Some(stream);
        self
    }

    /// Recover the mock behind a `dyn Connection` handle.
    pub(crate) fn of(connection: &Arc<dyn Connection>) -> Arc<MockConnection> {
        let target = Arc::as_ptr(connection) as *const ();
        CREATED
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|mock| std::ptr::eq(Arc::as_ptr(mock) as *const (), target))
            .expect("connection was not created as a mock")
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        *self.stream.lock() = None;
    }

    async fn request_peer_status(&self, _endpoint: SocketAddr) -> Result<bool, NetError> {
        let script = *self.status_script.lock();
        match script {
            Some(StatusScript::Answer { connected, delay }) => {
                tokio::time::sleep(delay).await;
                Ok(connected)
            }
            Some(StatusScript::Fail) => Err(NetError::Timeout),
            Some(StatusScript::Hang) => std::future::pending().await,
            None => Ok(false),
        }
    }

    async fn request_proxy_tunnel_channel(
        &self,
        _endpoint: SocketAddr,
    ) -> Result<Box<dyn ConnectionStream>, NetError> {
        self.tunnel_stream.lock().take().ok_or(NetError::Timeout)
    }
}

pub(crate) struct MockFactory;

impl ConnectionFactory for MockFactory {
    fn open(
        &self,
        stream: Box<dyn ConnectionStream>,
        remote_peer_id: PeerId,
        remote_endpoint: SocketAddr,
        _host: Arc<ConnectionHost>,
    ) -> Arc<dyn Connection> {
        let connection = MockConnection::new(remote_endpoint, remote_peer_id, stream.is_virtual());
        *connection.stream.lock() = Some(stream);
        connection
    }
}

pub(crate) struct NullChannelHandler;

impl ChannelRequestHandler for NullChannelHandler {
    fn channel_request(
        &self,
        _connection: Arc<dyn Connection>,
        _channel_peer_id: PeerId,
        _channel: Box<dyn ConnectionStream>,
    ) {
    }
}

pub(crate) struct NullProxyHandler;

impl ProxyPeersHandler for NullProxyHandler {
    fn proxy_peers_available(&self, _connection: Arc<dyn Connection>, _peers: Vec<SocketAddr>) {}
}

pub(crate) fn mock_registry(local_peer_id: PeerId) -> Arc<ConnectionRegistry> {
    ConnectionRegistry::new(
        local_peer_id,
        Arc::new(MockFactory),
        ManagerConfig::default(),
        Arc::new(NullChannelHandler),
        Arc::new(NullProxyHandler),
    )
}

/// A plain in-process transport pair; the far end is returned so tests can
/// drive or observe the stream.
pub(crate) fn stream_pair() -> (Box<dyn ConnectionStream>, tokio::io::DuplexStream) {
    let (near, far) = tokio::io::duplex(256);
    (Box::new(near), far)
}

/// A tunneled in-process transport pair.
pub(crate) fn virtual_stream_pair() -> (Box<dyn ConnectionStream>, tokio::io::DuplexStream) {
    let (near, far) = tokio::io::duplex(256);
    (Box::new(Virtual(near)), far)
}
