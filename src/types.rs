/// Count of fixed-size simulation steps since race start. The only time
/// unit used for ordering across network boundaries; strictly monotonic
/// within a single run.
pub type Tick = u32;

/// Server-assigned unique id for a connected host.
pub type HostId = u32;

/// Per-connection secret embedded in every packet after the handshake.
pub type SessionToken = u32;

/// Wrapping sequence number used by the reliable channel.
pub type MessageIndex = u16;

/// Whether the local host drives the authoritative simulation or predicts
/// ahead of one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostType {
    Server,
    Client,
}

impl HostType {
    pub fn is_server(&self) -> bool {
        *self == HostType::Server
    }
}
