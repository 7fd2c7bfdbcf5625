/// Connection handshake wire format.
///
/// When two peers open a transport stream, the initiator sends a fixed
/// 23-byte greeting and the acceptor answers with a 1-byte status code,
/// followed by its own peer id on success.
///
/// ## Greeting layout (all multi-byte integers little-endian)
///
/// ```text
/// [version:u8][service_port:u16][peer_id:20 bytes]
/// ```
///
/// - `version`: protocol version, currently `1`
/// - `service_port`: the port other peers should dial to reach the sender
///   (the source port of an outgoing socket is ephemeral and useless)
/// - `peer_id`: the sender's 160-bit peer identifier
///
/// ## Response
///
/// - `0x00` followed by the acceptor's 20-byte peer id: admitted
/// - `0x01`: rejected, the acceptor closes the stream

use thiserror::Error;

/// Current handshake protocol version.
pub const HANDSHAKE_VERSION: u8 = 1;

/// Length of a peer identifier in bytes (160 bits).
pub const PEER_ID_LEN: usize = 20;

/// Total greeting frame length: version(1) + port(2) + peer id(20).
pub const GREETING_LEN: usize = 23;

/// Response code: connection admitted, acceptor peer id follows.
pub const RESPONSE_OK: u8 = 0x00;

/// Response code: connection rejected, stream will be closed.
pub const RESPONSE_REJECTED: u8 = 0x01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeCodecError {
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u8),
    #[error("greeting frame truncated: {0} of 23 bytes")]
    Truncated(usize),
}

/// The initiator's opening frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    pub service_port: u16,
    pub peer_id: [u8; PEER_ID_LEN],
}

impl Greeting {
    pub fn new(service_port: u16, peer_id: [u8; PEER_ID_LEN]) -> Self {
        Self {
            service_port,
            peer_id,
        }
    }

    /// Encode to the fixed 23-byte wire frame.
    pub fn encode(&self) -> [u8; GREETING_LEN] {
        let mut frame = [0u8; GREETING_LEN];
        frame[0] = HANDSHAKE_VERSION;
        frame[1..3].copy_from_slice(&self.service_port.to_le_bytes());
        frame[3..].copy_from_slice(&self.peer_id);
        frame
    }

    /// Decode a full greeting frame, version byte included.
    pub fn decode(data: &[u8]) -> Result<Self, HandshakeCodecError> {
        if data.len() < GREETING_LEN {
            return Err(HandshakeCodecError::Truncated(data.len()));
        }
        if data[0] != HANDSHAKE_VERSION {
            return Err(HandshakeCodecError::UnsupportedVersion(data[0]));
        }
        Ok(Self::decode_body(&data[1..]))
    }

    /// Decode the 22-byte body that follows an already-validated version
    /// byte. The acceptor reads the version first to fail fast on
    /// incompatible peers.
    pub fn decode_body(body: &[u8]) -> Self {
        let service_port = u16::from_le_bytes([body[0], body[1]]);
        let mut peer_id = [0u8; PEER_ID_LEN];
        peer_id.copy_from_slice(&body[2..2 + PEER_ID_LEN]);
        Self {
            service_port,
            peer_id,
        }
    }
}
