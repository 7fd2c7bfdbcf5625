use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::ManagerConfig;
use crate::connection::{
    ChannelRequestHandler, Connection, ConnectionFactory, ConnectionHost, ConnectionStream,
    ProxyPeersHandler,
};
use crate::endpoint::allow_new_endpoint;
use crate::peer::PeerId;

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRefusal {
    /// The greeting carried this node's own peer id.
    SelfPeer,
    /// An existing or in-progress connection takes precedence.
    Duplicate,
}

/// Replacement preference between two transports to the same destination.
fn replace_allowed(existing_is_virtual: bool, incoming_is_virtual: bool) -> bool {
    match (existing_is_virtual, incoming_is_virtual) {
        // a direct transport supersedes a tunnel
        (true, false) => true,
        // a tunnel never displaces an existing connection
        (_, true) => false,
        // between direct transports the newcomer wins
        (false, false) => true,
    }
}

enum Slot {
    Live(Arc<dyn Connection>),
    /// Reserved while a handshake between decision and commit is in flight.
    Pending { peer_id: PeerId },
}

#[derive(Default)]
struct Indexes {
    by_endpoint: HashMap<SocketAddr, Slot>,
    by_peer: HashMap<PeerId, SocketAddr>,
}

/// The set of live peer connections, indexed by remote endpoint and by
/// remote peer id.
///
/// Admission is two-phase: `begin` decides and reserves under the lock,
/// `AdmissionGuard::commit` installs the connection once the handshake
/// reply is on the wire. `add` combines both for callers with nothing to
/// write in between.
pub struct ConnectionRegistry {
    local_peer_id: PeerId,
    factory: Arc<dyn ConnectionFactory>,
    host: Arc<ConnectionHost>,
    indexes: Mutex<Indexes>,
    admitted: Notify,
}

impl ConnectionRegistry {
    pub fn new(
        local_peer_id: PeerId,
        factory: Arc<dyn ConnectionFactory>,
        config: ManagerConfig,
        channel_request: Arc<dyn ChannelRequestHandler>,
        proxy_peers: Arc<dyn ProxyPeersHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|registry| Self {
            local_peer_id,
            factory,
            host: Arc::new(ConnectionHost {
                registry: registry.clone(),
                config,
                channel_request,
                proxy_peers,
                local_peer_id,
            }),
            indexes: Mutex::new(Indexes::default()),
            admitted: Notify::new(),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn host(&self) -> Arc<ConnectionHost> {
        self.host.clone()
    }

    /// Decide admission for `(remote_peer_id, remote_endpoint)` and reserve
    /// both index slots. Evicted connections are disposed before this
    /// returns; they remove themselves once their service tasks stop.
    pub fn begin(
        self: &Arc<Self>,
        remote_peer_id: PeerId,
        remote_endpoint: SocketAddr,
        is_virtual: bool,
    ) -> Result<AdmissionGuard, AdmissionRefusal> {
        if remote_peer_id == self.local_peer_id {
            return Err(AdmissionRefusal::SelfPeer);
        }

        let mut evicted = Vec::new();
        {
            let mut indexes = self.indexes.lock();
            let mut evict = Vec::new();

            match indexes.by_endpoint.get(&remote_endpoint) {
                Some(Slot::Pending { .. }) => return Err(AdmissionRefusal::Duplicate),
                Some(Slot::Live(existing)) => {
                    if !replace_allowed(existing.is_virtual(), is_virtual) {
                        return Err(AdmissionRefusal::Duplicate);
                    }
                    evict.push(remote_endpoint);

                    // The same peer may also be indexed at an older endpoint;
                    // that record goes too, to keep one record per peer id.
                    if let Some(&held) = indexes.by_peer.get(&remote_peer_id) {
                        if held != remote_endpoint {
                            if matches!(indexes.by_endpoint.get(&held), Some(Slot::Pending { .. }))
                            {
                                return Err(AdmissionRefusal::Duplicate);
                            }
                            evict.push(held);
                        }
                    }
                }
                None => {
                    if let Some(&held) = indexes.by_peer.get(&remote_peer_id) {
                        match indexes.by_endpoint.get(&held) {
                            Some(Slot::Pending { .. }) => {
                                return Err(AdmissionRefusal::Duplicate)
                            }
                            Some(Slot::Live(existing)) => {
                                if !replace_allowed(existing.is_virtual(), is_virtual) {
                                    return Err(AdmissionRefusal::Duplicate);
                                }
                                if !allow_new_endpoint(&held, &remote_endpoint) {
                                    return Err(AdmissionRefusal::Duplicate);
                                }
                                evict.push(held);
                            }
                            None => {}
                        }
                    }
                }
            }

            for endpoint in evict {
                if let Some(Slot::Live(connection)) = indexes.by_endpoint.remove(&endpoint) {
                    indexes.by_peer.remove(&connection.remote_peer_id());
                    evicted.push(connection);
                }
            }

            indexes.by_endpoint.insert(
                remote_endpoint,
                Slot::Pending {
                    peer_id: remote_peer_id,
                },
            );
            indexes.by_peer.insert(remote_peer_id, remote_endpoint);
        }

        for connection in evicted {
            tracing::info!(
                "evicting {} connection to {} for peer {}",
                if connection.is_virtual() {
                    "virtual"
                } else {
                    "direct"
                },
                connection.remote_endpoint(),
                connection.remote_peer_id(),
            );
            connection.dispose();
        }

        Ok(AdmissionGuard {
            registry: self.clone(),
            remote_peer_id,
            remote_endpoint,
            committed: false,
        })
    }

    /// One-shot admission: decide, build, install and start the connection.
    /// Returns `None` when an existing or in-progress connection takes
    /// precedence (or the peer id is our own).
    pub fn add(
        self: &Arc<Self>,
        stream: Box<dyn ConnectionStream>,
        remote_peer_id: PeerId,
        remote_endpoint: SocketAddr,
    ) -> Option<Arc<dyn Connection>> {
        let is_virtual = stream.is_virtual();
        match self.begin(remote_peer_id, remote_endpoint, is_virtual) {
            Ok(guard) => Some(guard.commit(stream)),
            Err(refusal) => {
                tracing::debug!(
                    "connection from peer {} at {} refused: {:?}",
                    remote_peer_id,
                    remote_endpoint,
                    refusal
                );
                None
            }
        }
    }

    pub fn get(&self, endpoint: SocketAddr) -> Option<Arc<dyn Connection>> {
        match self.indexes.lock().by_endpoint.get(&endpoint) {
            Some(Slot::Live(connection)) => Some(connection.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, endpoint: SocketAddr) -> bool {
        matches!(
            self.indexes.lock().by_endpoint.get(&endpoint),
            Some(Slot::Live(_))
        )
    }

    /// All live connections.
    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.indexes
            .lock()
            .by_endpoint
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(connection) => Some(connection.clone()),
                Slot::Pending { .. } => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.indexes
            .lock()
            .by_endpoint
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `connection` from both indexes if it is still the record held
    /// for its endpoint. Safe to call for connections already replaced or
    /// removed.
    pub fn remove(&self, connection: &Arc<dyn Connection>) {
        let endpoint = connection.remote_endpoint();
        let mut indexes = self.indexes.lock();
        let held = match indexes.by_endpoint.get(&endpoint) {
            Some(Slot::Live(held)) => Arc::ptr_eq(held, connection),
            _ => false,
        };
        if held {
            indexes.by_endpoint.remove(&endpoint);
            if indexes.by_peer.get(&connection.remote_peer_id()) == Some(&endpoint) {
                indexes.by_peer.remove(&connection.remote_peer_id());
            }
        }
    }

    /// Dispose every live connection and empty both indexes.
    pub fn dispose_all(&self) {
        let connections = {
            let mut indexes = self.indexes.lock();
            indexes.by_peer.clear();
            indexes
                .by_endpoint
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Live(connection) => Some(connection),
                    Slot::Pending { .. } => None,
                })
                .collect::<Vec<_>>()
        };
        for connection in connections {
            connection.dispose();
        }
    }

    /// Wait up to `grace` for a connection to `endpoint` to be admitted by
    /// a concurrent handshake. Used by the losing side of a simultaneous
    /// cross-connect after its own admission was refused.
    pub async fn wait_for_admission(
        &self,
        endpoint: SocketAddr,
        grace: Duration,
    ) -> Option<Arc<dyn Connection>> {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.admitted.notified();
            if let Some(connection) = self.get(endpoint) {
                return Some(connection);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(endpoint);
            }
        }
    }

    fn install(&self, connection: Arc<dyn Connection>) {
        {
            let mut indexes = self.indexes.lock();
            indexes.by_endpoint.insert(
                connection.remote_endpoint(),
                Slot::Live(connection.clone()),
            );
            indexes
                .by_peer
                .insert(connection.remote_peer_id(), connection.remote_endpoint());
            connection.start();
        }
        self.admitted.notify_waiters();
    }

    fn release_reservation(&self, remote_peer_id: PeerId, remote_endpoint: SocketAddr) {
        {
            let mut indexes = self.indexes.lock();
            let reserved = matches!(
                indexes.by_endpoint.get(&remote_endpoint),
                Some(Slot::Pending { peer_id }) if *peer_id == remote_peer_id
            );
            if reserved {
                indexes.by_endpoint.remove(&remote_endpoint);
                if indexes.by_peer.get(&remote_peer_id) == Some(&remote_endpoint) {
                    indexes.by_peer.remove(&remote_peer_id);
                }
            }
        }
        self.admitted.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let indexes = self.indexes.lock();
        let mut live = 0;
        for (endpoint, slot) in &indexes.by_endpoint {
            let peer_id = match slot {
                Slot::Live(connection) => {
                    live += 1;
                    assert_eq!(connection.remote_endpoint(), *endpoint);
                    connection.remote_peer_id()
                }
                Slot::Pending { peer_id } => *peer_id,
            };
            assert_ne!(peer_id, self.local_peer_id);
            assert_eq!(indexes.by_peer.get(&peer_id), Some(endpoint));
        }
        assert_eq!(indexes.by_endpoint.len(), indexes.by_peer.len());
        let _ = live;
    }
}

/// A reserved admission. Commit with the transport stream once the
/// handshake reply is written, or drop to release the reservation.
pub struct AdmissionGuard {
    registry: Arc<ConnectionRegistry>,
    remote_peer_id: PeerId,
    remote_endpoint: SocketAddr,
    committed: bool,
}

impl AdmissionGuard {
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    /// Build the connection over `stream`, install it in both indexes and
    /// start its channel service.
    pub fn commit(mut self, stream: Box<dyn ConnectionStream>) -> Arc<dyn Connection> {
        self.committed = true;
        let connection = self.registry.factory.open(
            stream,
            self.remote_peer_id,
            self.remote_endpoint,
            self.registry.host.clone(),
        );
        self.registry.install(connection.clone());
        tracing::info!(
            "admitted {} connection to {} (peer {})",
            if connection.is_virtual() {
                "virtual"
            } else {
                "direct"
            },
            self.remote_endpoint,
            self.remote_peer_id,
        );
        connection
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.registry
                .release_reservation(self.remote_peer_id, self.remote_endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mock_registry, stream_pair, virtual_stream_pair, MockConnection};
    use std::net::SocketAddr;

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn id(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; 20])
    }

    fn stream() -> Box<dyn ConnectionStream> {
        stream_pair().0
    }

    fn virtual_stream() -> Box<dyn ConnectionStream> {
        virtual_stream_pair().0
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let registry = mock_registry(id(0));
        let connection = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();
        assert!(!connection.is_virtual());
        assert!(registry.contains(ep("203.0.113.1:4000")));
        assert!(Arc::ptr_eq(
            &registry.get(ep("203.0.113.1:4000")).unwrap(),
            &connection
        ));
        assert_eq!(registry.len(), 1);
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_self_peer_refused() {
        let registry = mock_registry(id(7));
        assert!(registry.add(stream(), id(7), ep("203.0.113.1:4000")).is_none());
        assert!(registry.is_empty());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_direct_supersedes_tunnel() {
        let registry = mock_registry(id(0));
        let tunneled = registry
            .add(virtual_stream(), id(1), ep("203.0.113.1:4000"))
            .unwrap();
        assert!(tunneled.is_virtual());

        let direct = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();
        assert!(!direct.is_virtual());
        assert!(MockConnection::of(&tunneled).is_disposed());
        assert!(Arc::ptr_eq(
            &registry.get(ep("203.0.113.1:4000")).unwrap(),
            &direct
        ));
        assert_eq!(registry.len(), 1);
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_tunnel_never_displaces() {
        let registry = mock_registry(id(0));
        let direct = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();

        // same endpoint
        assert!(registry
            .add(virtual_stream(), id(1), ep("203.0.113.1:4000"))
            .is_none());
        // same peer, different endpoint
        assert!(registry
            .add(virtual_stream(), id(1), ep("198.51.100.2:4000"))
            .is_none());
        // even against an existing tunnel
        let registry2 = mock_registry(id(0));
        registry2
            .add(virtual_stream(), id(2), ep("203.0.113.9:4000"))
            .unwrap();
        assert!(registry2
            .add(virtual_stream(), id(2), ep("203.0.113.9:4000"))
            .is_none());

        assert!(!MockConnection::of(&direct).is_disposed());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_newest_direct_wins_endpoint() {
        let registry = mock_registry(id(0));
        let old = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();
        let new = registry.add(stream(), id(2), ep("203.0.113.1:4000")).unwrap();
        assert!(MockConnection::of(&old).is_disposed());
        assert!(Arc::ptr_eq(&registry.get(ep("203.0.113.1:4000")).unwrap(), &new));
        assert_eq!(registry.len(), 1);
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_peer_moves_from_public_endpoint() {
        let registry = mock_registry(id(0));
        let old = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();
        let new = registry.add(stream(), id(1), ep("198.51.100.2:5000")).unwrap();
        assert!(MockConnection::of(&old).is_disposed());
        assert!(!registry.contains(ep("203.0.113.1:4000")));
        assert!(Arc::ptr_eq(&registry.get(ep("198.51.100.2:5000")).unwrap(), &new));
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_peer_stuck_at_private_endpoint() {
        let registry = mock_registry(id(0));
        let old = registry.add(stream(), id(1), ep("192.168.1.4:4000")).unwrap();
        assert!(registry.add(stream(), id(1), ep("192.168.1.9:4000")).is_none());
        assert!(!MockConnection::of(&old).is_disposed());
        assert!(registry.contains(ep("192.168.1.4:4000")));
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_peer_stuck_on_family_change_from_ipv4() {
        let registry = mock_registry(id(0));
        registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();
        assert!(registry
            .add(stream(), id(1), ep("[2001:db8::1]:4000"))
            .is_none());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_endpoint_collision_purges_stale_peer_record() {
        let registry = mock_registry(id(0));
        let stale = registry.add(stream(), id(1), ep("203.0.113.5:4000")).unwrap();
        let other = registry.add(stream(), id(2), ep("203.0.113.1:4000")).unwrap();

        // peer 1 reconnects from the endpoint peer 2 occupied
        let fresh = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();
        assert!(MockConnection::of(&other).is_disposed());
        assert!(MockConnection::of(&stale).is_disposed());
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(ep("203.0.113.1:4000")).unwrap(), &fresh));
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_exact() {
        let registry = mock_registry(id(0));
        let old = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();
        let new = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();

        // the evicted record's late removal must not drop its successor
        registry.remove(&old);
        assert!(Arc::ptr_eq(&registry.get(ep("203.0.113.1:4000")).unwrap(), &new));

        registry.remove(&new);
        assert!(registry.is_empty());
        registry.remove(&new);
        assert!(registry.is_empty());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_pending_blocks_concurrent_admission() {
        let registry = mock_registry(id(0));
        let guard = registry.begin(id(1), ep("203.0.113.1:4000"), false).unwrap();

        assert!(matches!(
            registry.begin(id(2), ep("203.0.113.1:4000"), false),
            Err(AdmissionRefusal::Duplicate)
        ));
        assert!(matches!(
            registry.begin(id(1), ep("198.51.100.2:4000"), false),
            Err(AdmissionRefusal::Duplicate)
        ));
        // pending entries are invisible to lookups
        assert!(!registry.contains(ep("203.0.113.1:4000")));
        assert!(registry.snapshot().is_empty());

        drop(guard);
        registry.assert_consistent();
        assert!(registry.begin(id(2), ep("203.0.113.1:4000"), false).is_ok());
    }

    #[tokio::test]
    async fn test_commit_starts_connection() {
        let registry = mock_registry(id(0));
        let guard = registry.begin(id(1), ep("203.0.113.1:4000"), false).unwrap();
        let connection = guard.commit(stream());
        assert!(MockConnection::of(&connection).is_started());
        assert!(registry.contains(ep("203.0.113.1:4000")));
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_wait_for_admission_sees_concurrent_commit() {
        let registry = mock_registry(id(0));
        let target = ep("203.0.113.1:4000");

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait_for_admission(target, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let admitted = registry.add(stream(), id(1), target).unwrap();
        let found = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&admitted, &found));
    }

    #[tokio::test]
    async fn test_wait_for_admission_times_out_empty() {
        let registry = mock_registry(id(0));
        let found = registry
            .wait_for_admission(ep("203.0.113.1:4000"), Duration::from_millis(50))
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_host_answers_peer_status_and_routes_removal() {
        let registry = mock_registry(id(0));
        let host = registry.host();
        let endpoint = ep("203.0.113.1:4000");

        assert!(!host.is_peer_connected(endpoint));
        let connection = registry.add(stream(), id(1), endpoint).unwrap();
        assert!(host.is_peer_connected(endpoint));

        // a dying service task reports back through the host
        host.connection_closed(&connection);
        assert!(!host.is_peer_connected(endpoint));
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_dispose_all_empties_indexes() {
        let registry = mock_registry(id(0));
        let a = registry.add(stream(), id(1), ep("203.0.113.1:4000")).unwrap();
        let b = registry.add(stream(), id(2), ep("203.0.113.2:4000")).unwrap();
        registry.dispose_all();
        assert!(registry.is_empty());
        assert!(MockConnection::of(&a).is_disposed());
        assert!(MockConnection::of(&b).is_disposed());
        registry.assert_consistent();
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        struct Admission {
            peer: u8,
            endpoint_ip: u8,
            port: u16,
            is_virtual: bool,
        }

        fn admissions() -> impl Strategy<Value = Vec<Admission>> {
            proptest::collection::vec(
                (0u8..6, 0u8..4, 4000u16..4004, any::<bool>()).prop_map(
                    |(peer, endpoint_ip, port, is_virtual)| Admission {
                        peer,
                        endpoint_ip,
                        port,
                        is_virtual,
                    },
                ),
                0..32,
            )
        }

        proptest! {
            // after any sequence of admissions the indexes stay mutually
            // consistent, hold no self record, and dedup by endpoint/peer
            #[test]
            fn prop_indexes_stay_consistent(sequence in admissions()) {
                let registry = mock_registry(id(0));
                for step in sequence {
                    let endpoint = SocketAddr::from((
                        [203, 0, 113, step.endpoint_ip],
                        step.port,
                    ));
                    let s: Box<dyn ConnectionStream> = if step.is_virtual {
                        virtual_stream()
                    } else {
                        stream()
                    };
                    let _ = registry.add(s, id(step.peer), endpoint);
                    registry.assert_consistent();
                }
            }
        }
    }
}
