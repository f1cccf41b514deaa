use crate::{
    packet::buffer::{ByteReader, ByteWriter, PacketError},
    types::SessionToken,
};

/// Identifies the subsystem a message is dispatched to on the receiving
/// side. One byte on the wire, first in every envelope.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ProtocolId {
    /// Lobby negotiation. Connection-request packets live here and are the
    /// only ones exempt from token validation.
    Lobby,
    /// Confirmed state snapshots from the server.
    GameState,
    /// Discrete gameplay events (control changes etc).
    GameEvents,
    /// Clock synchronization between server and clients.
    Synchronization,
}

impl ProtocolId {
    pub fn to_byte(self) -> u8 {
        match self {
            ProtocolId::Lobby => 1,
            ProtocolId::GameState => 2,
            ProtocolId::GameEvents => 3,
            ProtocolId::Synchronization => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<ProtocolId> {
        match byte {
            1 => Some(ProtocolId::Lobby),
            2 => Some(ProtocolId::GameState),
            3 => Some(ProtocolId::GameEvents),
            4 => Some(ProtocolId::Synchronization),
            _ => None,
        }
    }
}

/// Lobby sub-type byte that marks a connection request. Sits at a fixed
/// offset right after the envelope header.
pub const CONNECTION_REQUESTED: u8 = 1;
/// Lobby sub-type of the server's handshake reply carrying the assigned
/// host id and session token.
pub const CONNECTION_ACCEPTED: u8 = 2;
/// Lobby sub-type rejecting a connection request (server full).
pub const CONNECTION_REFUSED: u8 = 3;
/// Lobby sub-type announcing an orderly disconnect.
pub const CONNECTION_CLOSED: u8 = 4;

/// Offset of the lobby sub-type byte: protocol id (1) + token (4).
const SUBTYPE_OFFSET: usize = 5;

/// The order-significant wire envelope:
/// `[protocol_id: 1][session_token: 4, network byte order][payload...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub protocol: ProtocolId,
    pub token: SessionToken,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(protocol: ProtocolId, token: SessionToken, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            token,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(SUBTYPE_OFFSET + self.payload.len());
        writer
            .write_u8(self.protocol.to_byte())
            .write_u32(self.token)
            .write_bytes(&self.payload);
        writer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Envelope, PacketError> {
        let mut reader = ByteReader::new(data);
        let protocol_byte = reader.read_u8()?;
        let protocol = ProtocolId::from_byte(protocol_byte)
            .ok_or(PacketError::UnknownProtocol { byte: protocol_byte })?;
        let token = reader.read_u32()?;
        let payload = reader.rest().to_vec();
        Ok(Envelope {
            protocol,
            token,
            payload,
        })
    }
}

/// Returns whether a raw datagram is a connection request: lobby protocol
/// id plus the connection-request sub-type byte. These packets arrive
/// before the peer has a token, so they bypass token validation.
pub fn is_connection_request(data: &[u8]) -> bool {
    data.len() > SUBTYPE_OFFSET
        && data[0] == ProtocolId::Lobby.to_byte()
        && data[SUBTYPE_OFFSET] == CONNECTION_REQUESTED
}

#[cfg(test)]
mod tests {
    use super::{is_connection_request, Envelope, ProtocolId, CONNECTION_REQUESTED};

    #[test]
    fn envelope_layout() {
        let envelope = Envelope::new(ProtocolId::GameEvents, 0xdead_beef, vec![7, 8, 9]);
        let bytes = envelope.encode();
        assert_eq!(bytes, vec![3, 0xde, 0xad, 0xbe, 0xef, 7, 8, 9]);
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn connection_request_detection() {
        let request = Envelope::new(ProtocolId::Lobby, 0, vec![CONNECTION_REQUESTED, 42]);
        assert!(is_connection_request(&request.encode()));

        let other = Envelope::new(ProtocolId::GameEvents, 0, vec![CONNECTION_REQUESTED]);
        assert!(!is_connection_request(&other.encode()));

        // Lobby but a different sub-type.
        let vote = Envelope::new(ProtocolId::Lobby, 0, vec![9, 1]);
        assert!(!is_connection_request(&vote.encode()));

        // Too short to carry a sub-type byte.
        assert!(!is_connection_request(&[1, 0, 0, 0, 0]));
    }
}
