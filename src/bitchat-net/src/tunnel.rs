//! Relay selection for virtual connections.
//!
//! When a direct TCP connect fails, every currently connected peer is asked
//! in parallel whether it holds a connection to the target; the first to
//! answer yes becomes the relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::NetError;

/// Poll `connections` in parallel for one that can reach `target`.
///
/// First positive answer wins; slower probes finish against the channel's
/// single slot and are dropped. Individual probe failures are logged and
/// swallowed.
pub(crate) async fn find_proxy(
    connections: Vec<Arc<dyn Connection>>,
    target: SocketAddr,
    wait: Duration,
) -> Result<Arc<dyn Connection>, NetError> {
    if connections.is_empty() {
        return Err(NetError::NoProxyPeer(target));
    }

    let (winner_tx, mut winner_rx) = mpsc::channel::<Arc<dyn Connection>>(1);
    for connection in connections {
        let winner_tx = winner_tx.clone();
        tokio::spawn(async move {
            match connection.request_peer_status(target).await {
                Ok(true) => {
                    let _ = winner_tx.try_send(connection);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(
                        "peer status probe via {} failed: {}",
                        connection.remote_endpoint(),
                        e
                    );
                }
            }
        });
    }
    drop(winner_tx);

    // `recv` returns None once every probe has answered no, which ends the
    // wait early instead of sitting out the full deadline
    match tokio::time::timeout(wait, winner_rx.recv()).await {
        Ok(Some(proxy)) => Ok(proxy),
        Ok(None) | Err(_) => Err(NetError::ProxyWaitTimeout(target)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::testutil::{MockConnection, StatusScript};
    use std::time::Instant;

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn id(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 20])
    }

    #[tokio::test]
    async fn test_empty_registry_fails_immediately() {
        let started = Instant::now();
        let result = find_proxy(Vec::new(), ep("203.0.113.9:4000"), Duration::from_secs(20)).await;
        assert!(matches!(result, Err(NetError::NoProxyPeer(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_first_positive_answer_wins() {
        let slow = MockConnection::new(ep("203.0.113.1:4000"), id(1), false).with_status(
            StatusScript::Answer {
                connected: true,
                delay: Duration::from_millis(200),
            },
        );
        let fast = MockConnection::new(ep("203.0.113.2:4000"), id(2), false).with_status(
            StatusScript::Answer {
                connected: true,
                delay: Duration::from_millis(10),
            },
        );
        let no = MockConnection::new(ep("203.0.113.3:4000"), id(3), false).with_status(
            StatusScript::Answer {
                connected: false,
                delay: Duration::from_millis(1),
            },
        );

        let proxy = find_proxy(
            vec![slow as Arc<dyn Connection>, fast.clone(), no],
            ep("203.0.113.9:4000"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(proxy.remote_endpoint(), fast.remote_endpoint());
    }

    #[tokio::test]
    async fn test_all_negative_fails_before_deadline() {
        let a = MockConnection::new(ep("203.0.113.1:4000"), id(1), false).with_status(
            StatusScript::Answer {
                connected: false,
                delay: Duration::from_millis(5),
            },
        );
        let b = MockConnection::new(ep("203.0.113.2:4000"), id(2), false).with_status(
            StatusScript::Answer {
                connected: false,
                delay: Duration::from_millis(5),
            },
        );

        let started = Instant::now();
        let result = find_proxy(
            vec![a as Arc<dyn Connection>, b],
            ep("203.0.113.9:4000"),
            Duration::from_secs(20),
        )
        .await;
        assert!(matches!(result, Err(NetError::ProxyWaitTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_probe_errors_are_swallowed() {
        let failing =
            MockConnection::new(ep("203.0.113.1:4000"), id(1), false).with_status(StatusScript::Fail);
        let good = MockConnection::new(ep("203.0.113.2:4000"), id(2), false).with_status(
            StatusScript::Answer {
                connected: true,
                delay: Duration::from_millis(20),
            },
        );

        let proxy = find_proxy(
            vec![failing as Arc<dyn Connection>, good.clone()],
            ep("203.0.113.9:4000"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(proxy.remote_endpoint(), good.remote_endpoint());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peers_time_out() {
        let hanging =
            MockConnection::new(ep("203.0.113.1:4000"), id(1), false).with_status(StatusScript::Hang);

        let result = find_proxy(
            vec![hanging as Arc<dyn Connection>],
            ep("203.0.113.9:4000"),
            Duration::from_secs(20),
        )
        .await;
        assert!(matches!(result, Err(NetError::ProxyWaitTimeout(_))));
    }
}
