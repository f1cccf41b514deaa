use std::net::SocketAddr;

use thiserror::Error;

use crate::packet::buffer::PacketError;

/// Errors raised while validating a STUN binding response. All of these
/// are peer-scoped protocol violations: the response is discarded and the
/// next candidate server is tried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    #[error("response shorter than the 20-byte STUN header")]
    TooShort,

    #[error("response type {response_type:#06x} is not a binding success")]
    NotBindingSuccess { response_type: u16 },

    #[error("response does not carry the magic cookie")]
    BadMagicCookie,

    #[error("response transaction id does not match the request")]
    TransactionIdMismatch,

    #[error("mapped address attribute has invalid length {length}")]
    BadAttributeLength { length: u16 },

    #[error("mapped address family is not IPv4")]
    UnsupportedFamily,

    #[error("response carries no mapped address attribute")]
    NoMappedAddress,

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Transport-level errors. Bind failures are fatal for the application;
/// everything else is scoped to one peer or one unit of work.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding the UDP endpoint failed. The transport cannot be degraded
    /// gracefully; the application driver must abort.
    #[error("could not bind UDP endpoint {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The shuffled STUN pool was exhausted without a valid response. The
    /// lobby layer must fall back to LAN-only operation.
    #[error("no public address determined after trying {attempted} STUN server(s)")]
    NoPublicAddress { attempted: usize },

    #[error("no peer registered for {addr}")]
    UnknownPeer { addr: SocketAddr },
}
