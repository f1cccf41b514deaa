//! # Raceline
//! Deterministic client-server state synchronization for a real-time
//! multiplayer racing simulation: a tick-ordered rewind journal, the
//! rollback/replay coordinator that reconciles predicted client state with
//! server-authoritative state, and the UDP transport host that carries
//! tokenized reliable/unreliable messages between peers.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod clock;
mod game_setup;
mod packet;
mod rewind;
mod transport;
mod types;
mod wrapping;

pub use clock::{ClockConfig, SimulationClock};
pub use game_setup::{Difficulty, GameMode, GameSetup, PlayerProfile};
pub use packet::{
    buffer::{ByteReader, ByteWriter, PacketError},
    envelope::{
        is_connection_request, Envelope, ProtocolId, CONNECTION_ACCEPTED, CONNECTION_CLOSED,
        CONNECTION_REFUSED, CONNECTION_REQUESTED,
    },
};
pub use rewind::{
    coordinator::{RewindConfig, RewindCoordinator},
    error::{JournalError, RewindError},
    journal::RewindJournal,
    record::{RecordKind, RewindRecord},
    rewindable::{Rewindable, RewinderId, Simulator},
};
pub use transport::{
    channel::{OrderedReliableReceiver, ReliableSender, RESEND_INTERVAL},
    discovery::{
        encode_command, read_command, DiscoveryResponse, DISCOVERY_COMMAND, DISCOVERY_VERSION,
        PORT_COMMAND,
    },
    error::{StunError, TransportError},
    event::{DisconnectReason, TransportEvent},
    host::{HostConfig, TransportHost, FRAME_ACK, FRAME_RELIABLE, FRAME_UNRELIABLE},
    peer::{Peer, PeerRegistry, TOKEN_GRACE_PERIOD},
    stun::{
        build_binding_request, parse_binding_response, resolve_public_address, MAGIC_COOKIE,
        STUN_PORT,
    },
};
pub use types::{HostId, HostType, MessageIndex, SessionToken, Tick};
pub use wrapping::{sequence_greater_than, sequence_less_than, wrapping_diff};
