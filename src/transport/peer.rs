use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use log::info;

use crate::{
    game_setup::PlayerProfile,
    transport::channel::{OrderedReliableReceiver, ReliableSender},
    types::{HostId, SessionToken},
};

/// A freshly connected peer that has not proven it holds the session
/// token within this window is evicted.
pub const TOKEN_GRACE_PERIOD: Duration = Duration::from_secs(7);

/// Connection state for one remote host, keyed by its socket address.
///
/// A peer starts in quarantine: `token` is `None` until the handshake
/// assigns one (server side) or the connection-accepted reply delivers
/// one (client side). Datagrams other than connection requests are not
/// accepted from quarantined peers.
pub struct Peer {
    address: SocketAddr,
    host_id: HostId,
    token: Option<SessionToken>,
    connected_at: Instant,
    pub players: Vec<PlayerProfile>,
    pub reliable_out: ReliableSender,
    pub reliable_in: OrderedReliableReceiver,
}

impl Peer {
    pub fn new(address: SocketAddr, host_id: HostId, now: Instant) -> Self {
        Self {
            address,
            host_id,
            token: None,
            connected_at: now,
            players: Vec::new(),
            reliable_out: ReliableSender::new(),
            reliable_in: OrderedReliableReceiver::new(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn token(&self) -> Option<SessionToken> {
        self.token
    }

    pub fn set_token(&mut self, token: SessionToken) {
        self.token = Some(token);
    }

    /// True once the handshake assigned a token, i.e. the peer is out
    /// of quarantine.
    pub fn is_validated(&self) -> bool {
        self.token.is_some()
    }

    /// True if an arriving envelope token authenticates this peer.
    pub fn accepts_token(&self, token: SessionToken) -> bool {
        self.token == Some(token)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

/// All known peers. The transport host shares this between the caller's
/// thread and the receive thread behind a mutex, so methods here take
/// `&mut self` and never block on anything.
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<SocketAddr, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: Peer) {
        self.peers.insert(peer.address(), peer);
    }

    pub fn remove(&mut self, address: &SocketAddr) -> Option<Peer> {
        self.peers.remove(address)
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn get_mut(&mut self, address: &SocketAddr) -> Option<&mut Peer> {
        self.peers.get_mut(address)
    }

    pub fn find_by_host_id(&self, host_id: HostId) -> Option<&Peer> {
        self.peers.values().find(|p| p.host_id() == host_id)
    }

    /// Whether a peer is already known at this address. An address on
    /// the loopback interface also matches a known peer on the same
    /// port, since a locally hosted server sees its own clients both
    /// ways.
    pub fn peer_exists(&self, address: &SocketAddr) -> bool {
        self.peers.values().any(|p| {
            p.address() == *address
                || ((p.address().ip().is_loopback() || address.ip().is_loopback())
                    && p.address().port() == address.port())
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Evicts every peer still in quarantine after [`TOKEN_GRACE_PERIOD`]
    /// and returns them, so the host can report the disconnects.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<Peer> {
        let stale: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|p| {
                !p.is_validated() && now.duration_since(p.connected_at()) >= TOKEN_GRACE_PERIOD
            })
            .map(|p| p.address())
            .collect();
        stale
            .into_iter()
            .filter_map(|addr| {
                info!("evicting peer {} with unset token", addr);
                self.peers.remove(&addr)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn quarantine_until_token_set() {
        let mut peer = Peer::new(addr(4000), 1, Instant::now());
        assert!(!peer.is_validated());
        assert!(!peer.accepts_token(0));
        peer.set_token(0xDEAD_BEEF);
        assert!(peer.is_validated());
        assert!(peer.accepts_token(0xDEAD_BEEF));
        assert!(!peer.accepts_token(0xBAD));
    }

    #[test]
    fn loopback_aliases_match_on_port() {
        let mut registry = PeerRegistry::new();
        registry.insert(Peer::new(addr(4000), 1, Instant::now()));
        assert!(registry.peer_exists(&addr(4000)));
        assert!(registry.peer_exists(&"127.0.0.1:4000".parse().unwrap()));
        assert!(!registry.peer_exists(&"127.0.0.1:4001".parse().unwrap()));
    }

    #[test]
    fn stale_unvalidated_peers_are_evicted() {
        let start = Instant::now();
        let mut registry = PeerRegistry::new();
        registry.insert(Peer::new(addr(4000), 1, start));
        let mut validated = Peer::new(addr(4001), 2, start);
        validated.set_token(7);
        registry.insert(validated);

        assert!(registry.evict_stale(start).is_empty());
        let evicted = registry.evict_stale(start + TOKEN_GRACE_PERIOD);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].address(), addr(4000));
        assert_eq!(registry.len(), 1);
    }
}
