//! Initiator- and acceptor-side handshake drivers.
//!
//! The wire format lives in `bitchat_proto::handshake`; this module runs the
//! exchange over a transport stream and feeds the registry. The acceptor
//! writes its `0x00`/`0x01` reply strictly after the admission decision has
//! committed, so the remote side never acts on a half-admitted record.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use bitchat_proto::handshake::{
    Greeting, GREETING_LEN, HANDSHAKE_VERSION, PEER_ID_LEN, RESPONSE_OK, RESPONSE_REJECTED,
};

use crate::config::ManagerConfig;
use crate::connection::{Connection, ConnectionStream};
use crate::error::NetError;
use crate::peer::PeerId;
use crate::registry::ConnectionRegistry;

async fn timed<T, F>(limit: Duration, operation: F) -> Result<T, NetError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(NetError::Io(e)),
        Err(_) => Err(NetError::Timeout),
    }
}

/// Run the initiator side over a freshly opened stream.
///
/// On rejection the stream is dropped and the registry is re-queried for a
/// connection admitted by the concurrent opposite-direction handshake.
pub(crate) async fn initiate(
    mut stream: Box<dyn ConnectionStream>,
    registry: &Arc<ConnectionRegistry>,
    remote_endpoint: SocketAddr,
    service_port: u16,
    config: &ManagerConfig,
) -> Result<Arc<dyn Connection>, NetError> {
    let greeting = Greeting::new(service_port, registry.local_peer_id().to_bytes());
    timed(config.send_timeout, stream.write_all(&greeting.encode())).await?;
    timed(config.send_timeout, stream.flush()).await?;

    let mut code = [0u8; 1];
    timed(config.recv_timeout, stream.read_exact(&mut code)).await?;

    match code[0] {
        RESPONSE_OK => {
            let mut id = [0u8; PEER_ID_LEN];
            timed(config.recv_timeout, stream.read_exact(&mut id)).await?;
            let remote_peer_id = PeerId::from_bytes(id);

            match registry.add(stream, remote_peer_id, remote_endpoint) {
                Some(connection) => Ok(connection),
                None => lose_race(registry, remote_endpoint, config).await,
            }
        }
        _ => {
            drop(stream);
            lose_race(registry, remote_endpoint, config).await
        }
    }
}

/// Run the acceptor side over an inbound stream.
///
/// `remote_ip` is the address the socket connected from; its ephemeral port
/// is replaced by the service port advertised in the greeting.
pub(crate) async fn accept(
    mut stream: Box<dyn ConnectionStream>,
    remote_ip: IpAddr,
    registry: &Arc<ConnectionRegistry>,
    config: &ManagerConfig,
) -> Result<Arc<dyn Connection>, NetError> {
    let mut version = [0u8; 1];
    timed(config.recv_timeout, stream.read_exact(&mut version)).await?;
    if version[0] != HANDSHAKE_VERSION {
        return Err(NetError::UnsupportedVersion(version[0]));
    }

    let mut body = [0u8; GREETING_LEN - 1];
    timed(config.recv_timeout, stream.read_exact(&mut body)).await?;
    let greeting = Greeting::decode_body(&body);
    let remote_peer_id = PeerId::from_bytes(greeting.peer_id);
    let remote_endpoint = SocketAddr::new(remote_ip, greeting.service_port);

    let is_virtual = stream.is_virtual();
    match registry.begin(remote_peer_id, remote_endpoint, is_virtual) {
        Ok(guard) => {
            let mut reply = Vec::with_capacity(1 + PEER_ID_LEN);
            reply.push(RESPONSE_OK);
            reply.extend_from_slice(registry.local_peer_id().as_bytes());
            timed(config.send_timeout, stream.write_all(&reply)).await?;
            timed(config.send_timeout, stream.flush()).await?;
            Ok(guard.commit(stream))
        }
        Err(refusal) => {
            tracing::debug!(
                "refusing inbound handshake from peer {} at {}: {:?}",
                remote_peer_id,
                remote_endpoint,
                refusal
            );
            let _ = timed(config.send_timeout, stream.write_all(&[RESPONSE_REJECTED])).await;
            let _ = timed(config.send_timeout, stream.flush()).await;
            drop(stream);
            lose_race(registry, remote_endpoint, config).await
        }
    }
}

/// The other side of a simultaneous cross-connect may have admitted its
/// connection already; give that admission a short grace window and return
/// it if it lands.
async fn lose_race(
    registry: &Arc<ConnectionRegistry>,
    remote_endpoint: SocketAddr,
    config: &ManagerConfig,
) -> Result<Arc<dyn Connection>, NetError> {
    registry
        .wait_for_admission(remote_endpoint, config.handshake_grace)
        .await
        .ok_or(NetError::Rejected(remote_endpoint))
}
