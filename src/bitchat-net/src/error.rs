use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("connection attempt to {0} already in progress")]
    AlreadyConnecting(SocketAddr),
    #[error("{0} is this node's own external endpoint")]
    SelfConnection(SocketAddr),
    #[error("connection to {0} rejected by peer")]
    Rejected(SocketAddr),
    #[error("peer sent unsupported handshake version {0}")]
    UnsupportedVersion(u8),
    #[error("no connected peer available to relay to {0}")]
    NoProxyPeer(SocketAddr),
    #[error("no connected peer agreed to relay to {0} in time")]
    ProxyWaitTimeout(SocketAddr),
    #[error("network operation timed out")]
    Timeout,
}
