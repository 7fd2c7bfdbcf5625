/// Echo service reply frame.
///
/// The connectivity echo service dials back the caller's advertised port and
/// reports the outcome together with the public address it saw the caller
/// connect from:
///
/// ```text
/// [reachable:u8][family:u8][ip:4|16 bytes][port:u16 LE]
/// ```
///
/// - `reachable`: `0` = the dial-back failed, `1` = it succeeded
/// - `family`: `1` = IPv4 (4 IP bytes follow), `2` = IPv6 (16 bytes),
///   anything else = no observed address, the frame ends here
/// - `port`: the source port the caller was seen from

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

const FAMILY_IPV4: u8 = 1;
const FAMILY_IPV6: u8 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EchoCodecError {
    #[error("echo reply truncated: {0} bytes")]
    Truncated(usize),
}

/// Decoded echo service reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    /// Whether the service could open a TCP connection back to the caller.
    pub reachable: bool,
    /// The caller's public endpoint as observed by the service, if any.
    pub endpoint: Option<SocketAddr>,
}

impl EchoReply {
    pub fn decode(data: &[u8]) -> Result<Self, EchoCodecError> {
        if data.len() < 2 {
            return Err(EchoCodecError::Truncated(data.len()));
        }
        let reachable = data[0] != 0;

        let endpoint = match data[1] {
            FAMILY_IPV4 => {
                if data.len() < 2 + 4 + 2 {
                    return Err(EchoCodecError::Truncated(data.len()));
                }
                let ip = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
                let port = u16::from_le_bytes([data[6], data[7]]);
                Some(SocketAddr::new(IpAddr::V4(ip), port))
            }
            FAMILY_IPV6 => {
                if data.len() < 2 + 16 + 2 {
                    return Err(EchoCodecError::Truncated(data.len()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[2..18]);
                let port = u16::from_le_bytes([data[18], data[19]]);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => None,
        };

        Ok(Self {
            reachable,
            endpoint,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(20);
        frame.push(self.reachable as u8);
        match self.endpoint {
            Some(SocketAddr::V4(ep)) => {
                frame.push(FAMILY_IPV4);
                frame.extend_from_slice(&ep.ip().octets());
                frame.extend_from_slice(&ep.port().to_le_bytes());
            }
            Some(SocketAddr::V6(ep)) => {
                frame.push(FAMILY_IPV6);
                frame.extend_from_slice(&ep.ip().octets());
                frame.extend_from_slice(&ep.port().to_le_bytes());
            }
            None => frame.push(0),
        }
        frame
    }
}
