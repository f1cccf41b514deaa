use std::net::SocketAddr;

use crate::{
    packet::envelope::ProtocolId,
    types::{HostId, SessionToken},
};

/// Why a peer left.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    /// No traffic or no completed handshake within the grace period.
    Timeout,
    /// Orderly disconnect with acknowledgement.
    Normal,
    /// Removed by the server.
    Kicked,
}

/// Typed inbound event produced by the receive loop and drained by the
/// main thread once per tick, in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection handshake completed. On a client this also delivers
    /// the locally assigned host id and session token.
    Connected {
        peer: SocketAddr,
        host_id: HostId,
        token: SessionToken,
    },
    /// The connection attempt was rejected (server full).
    ConnectionRejected { peer: SocketAddr },
    /// A peer disconnected or timed out.
    Disconnected {
        peer: SocketAddr,
        host_id: HostId,
        reason: DisconnectReason,
    },
    /// A validated message, addressed to the protocol handler matching
    /// the embedded protocol id.
    Message {
        peer: SocketAddr,
        host_id: HostId,
        protocol: ProtocolId,
        payload: Vec<u8>,
    },
}
