use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::ManagerConfig;
use crate::error::NetError;
use crate::handshake;
use crate::peer::PeerId;
use crate::registry::ConnectionRegistry;

/// A bidirectional byte stream carrying one peer connection.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Whether this stream rides inside another connection's tunnel channel
    /// rather than over its own TCP socket.
    fn is_virtual(&self) -> bool {
        false
    }
}

impl ConnectionStream for tokio::net::TcpStream {}

/// In-process transport, used for tunnel plumbing and tests.
impl ConnectionStream for tokio::io::DuplexStream {}

/// Marks any stream as a tunneled (virtual) transport.
pub struct Virtual<S>(pub S);

impl<S: AsyncRead + Unpin> AsyncRead for Virtual<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Virtual<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> ConnectionStream for Virtual<S> {
    fn is_virtual(&self) -> bool {
        true
    }
}

/// A live peer connection.
///
/// The channel multiplexer running over the stream is outside this crate;
/// the manager only needs the operations below.
#[async_trait]
pub trait Connection: Send + Sync {
    fn remote_endpoint(&self) -> SocketAddr;

    fn remote_peer_id(&self) -> PeerId;

    /// Whether the underlying stream is tunneled through another peer.
    fn is_virtual(&self) -> bool;

    /// Begin background channel service. Called once by the registry while
    /// it holds the admission lock; must not block.
    fn start(&self);

    /// Close the transport stream, unblocking the service task. Must not
    /// block; safe to call more than once.
    fn dispose(&self);

    /// Ask the remote peer whether it currently holds a connection to
    /// `endpoint`.
    async fn request_peer_status(&self, endpoint: SocketAddr) -> Result<bool, NetError>;

    /// Ask the remote peer to open a tunnel channel relaying to `endpoint`.
    async fn request_proxy_tunnel_channel(
        &self,
        endpoint: SocketAddr,
    ) -> Result<Box<dyn ConnectionStream>, NetError>;
}

/// Chat-layer handler for channels opened by the remote peer.
pub trait ChannelRequestHandler: Send + Sync {
    fn channel_request(
        &self,
        connection: Arc<dyn Connection>,
        channel_peer_id: PeerId,
        channel: Box<dyn ConnectionStream>,
    );
}

/// Chat-layer handler for proxy-peer availability announcements.
pub trait ProxyPeersHandler: Send + Sync {
    fn proxy_peers_available(&self, connection: Arc<dyn Connection>, peers: Vec<SocketAddr>);
}

/// Builds a `Connection` over an admitted stream.
///
/// Invoked by the registry during admission; must not block. The registry
/// calls `start` separately once both indexes are committed.
pub trait ConnectionFactory: Send + Sync {
    fn open(
        &self,
        stream: Box<dyn ConnectionStream>,
        remote_peer_id: PeerId,
        remote_endpoint: SocketAddr,
        host: Arc<ConnectionHost>,
    ) -> Arc<dyn Connection>;
}

/// The single typed handle a `Connection` holds back into the manager.
pub struct ConnectionHost {
    pub(crate) registry: Weak<ConnectionRegistry>,
    pub(crate) config: ManagerConfig,
    pub(crate) channel_request: Arc<dyn ChannelRequestHandler>,
    pub(crate) proxy_peers: Arc<dyn ProxyPeersHandler>,
    pub(crate) local_peer_id: PeerId,
}

impl ConnectionHost {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Route a remotely opened channel to the chat layer.
    pub fn channel_requested(
        &self,
        connection: Arc<dyn Connection>,
        channel_peer_id: PeerId,
        channel: Box<dyn ConnectionStream>,
    ) {
        self.channel_request
            .channel_request(connection, channel_peer_id, channel);
    }

    /// Route a proxy-peers announcement to the chat layer.
    pub fn proxy_peers_available(&self, connection: Arc<dyn Connection>, peers: Vec<SocketAddr>) {
        self.proxy_peers.proxy_peers_available(connection, peers);
    }

    /// Whether the registry currently holds a connection to `endpoint`.
    /// Answers the remote side of a peer-status probe.
    pub fn is_peer_connected(&self, endpoint: SocketAddr) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.contains(endpoint))
            .unwrap_or(false)
    }

    /// Called by a connection's service task when its stream ends; removes
    /// the record if it is still the one indexed.
    pub fn connection_closed(&self, connection: &Arc<dyn Connection>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(connection);
        }
    }

    /// Run the accept-side handshake over an inbound tunnel channel.
    ///
    /// A relayed peer reaches this node as a virtual stream inside one of
    /// the live connections; the connection's channel layer hands that
    /// stream here to get it admitted like any other inbound transport.
    pub async fn accept_virtual_stream(
        &self,
        stream: Box<dyn ConnectionStream>,
        remote_ip: IpAddr,
    ) -> Result<Arc<dyn Connection>, NetError> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| NetError::Io(std::io::ErrorKind::NotConnected.into()))?;
        handshake::accept(stream, remote_ip, &registry, &self.config).await
    }
}
