use std::net::SocketAddr;

use bitchat_upnp::netinfo::is_private_ipv4;

pub fn same_address_family(a: &SocketAddr, b: &SocketAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// Whether a peer reconnecting from `incoming` may displace its existing
/// connection at `existing`.
///
/// IPv4 endpoints are sticky across a family change, and private IPv4
/// endpoints are sticky against any switch; everything else may move.
pub fn allow_new_endpoint(existing: &SocketAddr, incoming: &SocketAddr) -> bool {
    if !same_address_family(existing, incoming) {
        return !existing.is_ipv4();
    }
    if let SocketAddr::V4(v4) = existing {
        if is_private_ipv4(*v4.ip()) {
            return false;
        }
    }
    true
}
