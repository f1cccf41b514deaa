//! The UDP transport host: peer lifecycle, token handshake, reliable and
//! unreliable delivery, LAN discovery and the background receive loop.
//!
//! One host is created per process, as either the server or a client.
//! All inbound traffic is converted into [`TransportEvent`]s drained by
//! the simulation thread once per tick; the receive loop never touches
//! game state directly.

use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    game_setup::GameSetup,
    packet::envelope::{
        is_connection_request, Envelope, ProtocolId, CONNECTION_ACCEPTED, CONNECTION_CLOSED,
        CONNECTION_REFUSED, CONNECTION_REQUESTED,
    },
    transport::{
        discovery::{read_command, DiscoveryResponse, DISCOVERY_COMMAND, PORT_COMMAND},
        error::TransportError,
        event::{DisconnectReason, TransportEvent},
        peer::{Peer, PeerRegistry},
        stun,
    },
    types::{HostId, HostType, SessionToken},
};

/// One-byte datagram kind that wraps every envelope on the wire.
/// Reliability is a property of the framing, not of the envelope.
pub const FRAME_UNRELIABLE: u8 = 0;
/// Reliable framing: `[kind:1][message_index:2][envelope...]`.
pub const FRAME_RELIABLE: u8 = 1;
/// Acknowledgement framing: `[kind:1][message_index:2]`.
pub const FRAME_ACK: u8 = 2;

/// How often an unanswered connection request is resent.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Contains all transport-level configuration for a [`TransportHost`].
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Whether this host accepts connections or initiates one.
    pub host_type: HostType,
    /// Address the game socket binds to. Port 0 picks an ephemeral port.
    pub bind_address: SocketAddr,
    /// Maximum simultaneously connected peers (server only). The server
    /// always keeps enough headroom to answer one more connect with a
    /// rejection instead of silence.
    pub max_players: u8,
    /// Upper bound on how long the receive loop blocks on the socket,
    /// which also bounds shutdown latency.
    pub poll_interval: Duration,
    /// Grace period granted to in-flight disconnect notifications when a
    /// soft shutdown is requested.
    pub shutdown_grace: Duration,
    /// Port of the direct discovery socket (server only). `None`
    /// disables LAN discovery.
    pub discovery_port: Option<u16>,
    /// Candidate STUN servers for public address discovery, tried in
    /// shuffled order at startup. Empty skips NAT traversal entirely.
    pub stun_servers: Vec<String>,
}

impl HostConfig {
    pub fn server(bind_address: SocketAddr, max_players: u8) -> Self {
        Self {
            host_type: HostType::Server,
            bind_address,
            max_players,
            ..Self::default()
        }
    }

    pub fn client() -> Self {
        Self::default()
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_type: HostType::Client,
            bind_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            max_players: 8,
            poll_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(2),
            discovery_port: None,
            stun_servers: Vec::new(),
        }
    }
}

/// Cooperative shutdown request shared with the receive loop.
struct ShutdownSignal {
    abort: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl ShutdownSignal {
    fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            deadline: Mutex::new(None),
        }
    }

    fn request(&self, grace: Duration) {
        let mut deadline = self.deadline.lock().unwrap();
        if deadline.is_none() {
            *deadline = Some(Instant::now() + grace);
        }
    }

    fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    fn should_exit(&self, now: Instant) -> bool {
        if self.abort.load(Ordering::Relaxed) {
            return true;
        }
        matches!(*self.deadline.lock().unwrap(), Some(deadline) if now >= deadline)
    }
}

/// A UDP endpoint with peer management, a token handshake and two
/// delivery channels per peer: ordered-exactly-once and best-effort.
pub struct TransportHost {
    socket: UdpSocket,
    local_addr: SocketAddr,
    host_type: HostType,
    public_address: Option<SocketAddrV4>,
    peers: Arc<Mutex<PeerRegistry>>,
    setup: Arc<Mutex<GameSetup>>,
    event_tx: Sender<TransportEvent>,
    event_rx: Receiver<TransportEvent>,
    shutdown: Arc<ShutdownSignal>,
    shutdown_grace: Duration,
    receive_thread: Option<JoinHandle<()>>,
}

impl TransportHost {
    /// Binds the game socket (and the discovery socket for a server) and
    /// starts the background receive loop. Transport cannot run degraded,
    /// so a bind failure is an error the caller should treat as fatal.
    pub fn new(config: HostConfig, setup: GameSetup) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.bind_address).map_err(|source| {
            TransportError::BindFailed {
                addr: config.bind_address,
                source,
            }
        })?;
        let local_addr = socket.local_addr()?;
        info!("{:?} transport bound to {}", config.host_type, local_addr);

        // Run NAT traversal before the receive loop owns the socket, so
        // the binding response cannot race with game traffic.
        let public_address = if config.stun_servers.is_empty() {
            None
        } else {
            match stun::resolve_public_address(&socket, &config.stun_servers) {
                Ok(address) => {
                    info!("public address is {}", address);
                    Some(address)
                }
                Err(e) => {
                    warn!("no public address determined, LAN only: {}", e);
                    None
                }
            }
        };

        let discovery = match (config.host_type, config.discovery_port) {
            (HostType::Server, Some(port)) => {
                let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
                let socket = UdpSocket::bind(addr)
                    .map_err(|source| TransportError::BindFailed { addr, source })?;
                socket.set_nonblocking(true)?;
                info!("lan discovery listening on {}", addr);
                Some(socket)
            }
            _ => None,
        };

        socket.set_read_timeout(Some(config.poll_interval))?;

        let peers = Arc::new(Mutex::new(PeerRegistry::new()));
        let setup = Arc::new(Mutex::new(setup));
        let shutdown = Arc::new(ShutdownSignal::new());
        let (event_tx, event_rx) = mpsc::channel();

        let mut receive_loop = ReceiveLoop {
            socket: socket.try_clone()?,
            discovery,
            host_type: config.host_type,
            max_players: config.max_players,
            game_port: local_addr.port(),
            peers: Arc::clone(&peers),
            setup: Arc::clone(&setup),
            events: event_tx.clone(),
            shutdown: Arc::clone(&shutdown),
            next_host_id: 1,
            connect_retries: HashMap::new(),
        };
        let receive_thread = thread::Builder::new()
            .name("raceline-network".to_string())
            .spawn(move || receive_loop.run())?;

        Ok(Self {
            socket,
            local_addr,
            host_type: config.host_type,
            public_address,
            peers,
            setup,
            event_tx,
            event_rx,
            shutdown,
            shutdown_grace: config.shutdown_grace,
            receive_thread: Some(receive_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Public address determined via STUN at startup, if any.
    pub fn public_address(&self) -> Option<SocketAddrV4> {
        self.public_address
    }

    pub fn game_setup(&self) -> Arc<Mutex<GameSetup>> {
        Arc::clone(&self.setup)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Initiates a connection attempt to a server. Does not block: the
    /// outcome arrives later as a [`TransportEvent::Connected`] or
    /// [`TransportEvent::ConnectionRejected`]. Calling it again for an
    /// address already known (including its loopback alias) is a no-op.
    pub fn connect(&self, address: SocketAddr) -> bool {
        let mut peers = self.peers.lock().unwrap();
        if peers.peer_exists(&address) {
            return true;
        }
        peers.insert(Peer::new(address, 0, Instant::now()));
        drop(peers);

        let request = Envelope::new(ProtocolId::Lobby, 0, vec![CONNECTION_REQUESTED]);
        let datagram = frame_unreliable(&request.encode());
        match self.socket.send_to(&datagram, address) {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to send connection request to {}: {}", address, e);
                self.peers.lock().unwrap().remove(&address);
                false
            }
        }
    }

    /// Sends one message to a connected peer. Reliable sends are
    /// delivered exactly once and in order relative to each other;
    /// unreliable sends may be dropped or reordered.
    pub fn send(
        &self,
        address: SocketAddr,
        protocol: ProtocolId,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), TransportError> {
        let mut peers = self.peers.lock().unwrap();
        let peer = peers
            .get_mut(&address)
            .ok_or(TransportError::UnknownPeer { addr: address })?;
        send_to_peer(&self.socket, peer, protocol, payload, reliable)
    }

    /// Sends one message to every validated peer. A send failure is
    /// scoped to that peer: it is logged and the remaining peers still
    /// get the message.
    pub fn broadcast(&self, protocol: ProtocolId, payload: &[u8], reliable: bool) {
        self.broadcast_filtered(None, protocol, payload, reliable)
    }

    pub fn broadcast_except(
        &self,
        excluded: SocketAddr,
        protocol: ProtocolId,
        payload: &[u8],
        reliable: bool,
    ) {
        self.broadcast_filtered(Some(excluded), protocol, payload, reliable)
    }

    fn broadcast_filtered(
        &self,
        excluded: Option<SocketAddr>,
        protocol: ProtocolId,
        payload: &[u8],
        reliable: bool,
    ) {
        let mut peers = self.peers.lock().unwrap();
        for peer in peers.iter_mut() {
            if Some(peer.address()) == excluded || !peer.is_validated() {
                continue;
            }
            if let Err(e) = send_to_peer(&self.socket, peer, protocol, payload, reliable) {
                warn!("broadcast to {} failed: {}", peer.address(), e);
            }
        }
    }

    /// Kicks a peer: notifies it, removes it and reports the disconnect
    /// as an event.
    pub fn disconnect(&self, address: SocketAddr) -> Result<(), TransportError> {
        let mut peers = self.peers.lock().unwrap();
        let peer = peers
            .remove(&address)
            .ok_or(TransportError::UnknownPeer { addr: address })?;
        let notice = Envelope::new(
            ProtocolId::Lobby,
            peer.token().unwrap_or(0),
            vec![CONNECTION_CLOSED],
        );
        // Best effort: the peer also times out on its own.
        if let Err(e) = self.socket.send_to(&frame_unreliable(&notice.encode()), address) {
            debug!("disconnect notice to {} failed: {}", address, e);
        }
        let _ = self.event_tx.send(TransportEvent::Disconnected {
            peer: address,
            host_id: peer.host_id(),
            reason: DisconnectReason::Kicked,
        });
        Ok(())
    }

    /// Next inbound event, if any. FIFO: events are observed in the
    /// order the receive loop produced them.
    pub fn poll_event(&self) -> Option<TransportEvent> {
        match self.event_rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Requests a soft shutdown: the receive loop keeps running for the
    /// configured grace period so in-flight disconnect notifications can
    /// still be observed, then exits.
    pub fn request_shutdown(&self) {
        self.shutdown.request(self.shutdown_grace);
    }

    /// Stops the receive loop immediately and joins it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.abort();
        if let Some(handle) = self.receive_thread.take() {
            if handle.join().is_err() {
                error!("network receive thread panicked");
            }
        }
    }

    pub fn is_server(&self) -> bool {
        self.host_type.is_server()
    }
}

impl Drop for TransportHost {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_to_peer(
    socket: &UdpSocket,
    peer: &mut Peer,
    protocol: ProtocolId,
    payload: &[u8],
    reliable: bool,
) -> Result<(), TransportError> {
    let envelope = Envelope::new(protocol, peer.token().unwrap_or(0), payload.to_vec());
    let encoded = envelope.encode();
    if reliable {
        peer.reliable_out.queue(encoded);
        for (index, pending) in peer.reliable_out.take_due(Instant::now()) {
            socket.send_to(&frame_reliable(index, &pending), peer.address())?;
        }
    } else {
        socket.send_to(&frame_unreliable(&encoded), peer.address())?;
    }
    Ok(())
}

fn frame_unreliable(envelope: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(1 + envelope.len());
    datagram.push(FRAME_UNRELIABLE);
    datagram.extend_from_slice(envelope);
    datagram
}

fn frame_reliable(index: u16, envelope: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(3 + envelope.len());
    datagram.push(FRAME_RELIABLE);
    datagram.extend_from_slice(&index.to_be_bytes());
    datagram.extend_from_slice(envelope);
    datagram
}

fn frame_ack(index: u16) -> [u8; 3] {
    let bytes = index.to_be_bytes();
    [FRAME_ACK, bytes[0], bytes[1]]
}

/// State owned by the background receive thread.
struct ReceiveLoop {
    socket: UdpSocket,
    discovery: Option<UdpSocket>,
    host_type: HostType,
    max_players: u8,
    game_port: u16,
    peers: Arc<Mutex<PeerRegistry>>,
    setup: Arc<Mutex<GameSetup>>,
    events: Sender<TransportEvent>,
    shutdown: Arc<ShutdownSignal>,
    next_host_id: HostId,
    connect_retries: HashMap<SocketAddr, Instant>,
}

impl ReceiveLoop {
    fn run(&mut self) {
        let mut buffer = [0u8; 2048];
        loop {
            if self.shutdown.should_exit(Instant::now()) {
                break;
            }
            // Blocks for at most the configured poll interval.
            match self.socket.recv_from(&mut buffer) {
                Ok((len, from)) => self.handle_datagram(&buffer[..len], from),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => error!("receive loop socket error: {}", e),
            }
            self.service_discovery();
            self.service_peers(Instant::now());
        }
        debug!("receive loop exits");
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let Some((&kind, rest)) = data.split_first() else {
            return;
        };
        match kind {
            FRAME_UNRELIABLE => self.process_envelope(rest, from),
            FRAME_RELIABLE if rest.len() > 2 => {
                let index = u16::from_be_bytes([rest[0], rest[1]]);
                let envelope = &rest[2..];
                // Authenticate before the receiver sees the frame: a
                // forged index would otherwise occupy the slot and the
                // genuine message at that index would be dropped as a
                // duplicate.
                let token = match Envelope::decode(envelope) {
                    Ok(decoded) => decoded.token,
                    Err(e) => {
                        debug!("undecodable reliable envelope from {}: {}", from, e);
                        return;
                    }
                };
                let mut peers = self.peers.lock().unwrap();
                let Some(peer) = peers.get_mut(&from) else {
                    debug!("reliable frame from unknown peer {}", from);
                    return;
                };
                if !peer.is_validated() || !peer.accepts_token(token) {
                    warn!(
                        "token mismatch on reliable frame from {}: got {:#010x}, dropping packet",
                        from, token
                    );
                    return;
                }
                // Ack duplicates too, or the sender keeps retrying.
                if let Err(e) = self.socket.send_to(&frame_ack(index), from) {
                    debug!("ack to {} failed: {}", from, e);
                }
                let delivered = peer.reliable_in.receive(index, envelope.to_vec());
                drop(peers);
                for envelope in delivered {
                    self.process_envelope(&envelope, from);
                }
            }
            FRAME_ACK if rest.len() == 2 => {
                let index = u16::from_be_bytes([rest[0], rest[1]]);
                if let Some(peer) = self.peers.lock().unwrap().get_mut(&from) {
                    peer.reliable_out.ack(index);
                }
            }
            _ => debug!("dropping malformed datagram from {}", from),
        }
    }

    fn process_envelope(&mut self, data: &[u8], from: SocketAddr) {
        if is_connection_request(data) {
            self.handle_connection_request(from);
            return;
        }
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("undecodable envelope from {}: {}", from, e);
                return;
            }
        };

        let mut peers = self.peers.lock().unwrap();
        let Some(peer) = peers.get_mut(&from) else {
            warn!("dropping {:?} envelope from unknown peer {}", envelope.protocol, from);
            return;
        };

        // Handshake replies arrive before the peer knows its token, so
        // they are the one other thing exempt from token validation.
        if !peer.is_validated() {
            if envelope.protocol == ProtocolId::Lobby {
                drop(peers);
                self.handle_handshake_reply(&envelope, from);
            } else {
                debug!("dropping {:?} envelope from quarantined peer {}", envelope.protocol, from);
            }
            return;
        }
        if !peer.accepts_token(envelope.token) {
            warn!(
                "token mismatch from {}: got {:#010x}, dropping packet",
                from, envelope.token
            );
            return;
        }

        if envelope.protocol == ProtocolId::Lobby
            && envelope.payload.first() == Some(&CONNECTION_CLOSED)
        {
            let host_id = peer.host_id();
            peers.remove(&from);
            drop(peers);
            info!("peer {} disconnected", from);
            let _ = self.events.send(TransportEvent::Disconnected {
                peer: from,
                host_id,
                reason: DisconnectReason::Normal,
            });
            return;
        }

        let host_id = peer.host_id();
        drop(peers);
        let _ = self.events.send(TransportEvent::Message {
            peer: from,
            host_id,
            protocol: envelope.protocol,
            payload: envelope.payload,
        });
    }

    /// Server side of the handshake. Assigns a host id and a session
    /// token, or rejects the connect when the server is full. Duplicate
    /// requests just get the acceptance resent, making the client's
    /// retried `connect` idempotent.
    fn handle_connection_request(&mut self, from: SocketAddr) {
        if !self.host_type.is_server() {
            debug!("ignoring connection request sent to a client, from {}", from);
            return;
        }
        let mut peers = self.peers.lock().unwrap();
        if let Some(peer) = peers.get(&from) {
            if let Some(token) = peer.token() {
                let host_id = peer.host_id();
                drop(peers);
                self.send_acceptance(from, host_id, token);
            }
            return;
        }
        if peers.len() >= self.max_players as usize {
            drop(peers);
            info!("rejecting connection from {}: server is full", from);
            let refuse = Envelope::new(ProtocolId::Lobby, 0, vec![CONNECTION_REFUSED]);
            if let Err(e) = self.socket.send_to(&frame_unreliable(&refuse.encode()), from) {
                debug!("rejection notice to {} failed: {}", from, e);
            }
            let _ = self
                .events
                .send(TransportEvent::ConnectionRejected { peer: from });
            return;
        }

        let host_id = self.next_host_id;
        self.next_host_id += 1;
        let token = loop {
            // Zero is reserved for pre-handshake envelopes.
            let candidate: SessionToken = fastrand::u32(..);
            if candidate != 0 {
                break candidate;
            }
        };
        let mut peer = Peer::new(from, host_id, Instant::now());
        peer.set_token(token);
        peers.insert(peer);
        drop(peers);

        info!("peer {} connected as host {}", from, host_id);
        self.send_acceptance(from, host_id, token);
        let _ = self.events.send(TransportEvent::Connected {
            peer: from,
            host_id,
            token,
        });
    }

    fn send_acceptance(&self, to: SocketAddr, host_id: HostId, token: SessionToken) {
        let mut payload = Vec::with_capacity(9);
        payload.push(CONNECTION_ACCEPTED);
        payload.extend_from_slice(&host_id.to_be_bytes());
        payload.extend_from_slice(&token.to_be_bytes());
        let accept = Envelope::new(ProtocolId::Lobby, token, payload);
        if let Err(e) = self.socket.send_to(&frame_unreliable(&accept.encode()), to) {
            warn!("acceptance to {} failed: {}", to, e);
        }
    }

    /// Client side of the handshake: the server either accepted (and the
    /// reply carries our host id and session token) or refused.
    fn handle_handshake_reply(&mut self, envelope: &Envelope, from: SocketAddr) {
        match envelope.payload.first() {
            Some(&CONNECTION_ACCEPTED) if envelope.payload.len() == 9 => {
                let host_id = HostId::from_be_bytes(envelope.payload[1..5].try_into().unwrap());
                let token =
                    SessionToken::from_be_bytes(envelope.payload[5..9].try_into().unwrap());
                let mut peers = self.peers.lock().unwrap();
                if let Some(peer) = peers.get_mut(&from) {
                    if peer.is_validated() {
                        return; // duplicate acceptance
                    }
                    peer.set_token(token);
                }
                drop(peers);
                self.connect_retries.remove(&from);
                info!("connected to {} as host {}", from, host_id);
                let _ = self.events.send(TransportEvent::Connected {
                    peer: from,
                    host_id,
                    token,
                });
            }
            Some(&CONNECTION_REFUSED) => {
                self.peers.lock().unwrap().remove(&from);
                self.connect_retries.remove(&from);
                info!("connection refused by {}", from);
                let _ = self
                    .events
                    .send(TransportEvent::ConnectionRejected { peer: from });
            }
            _ => debug!("unexpected lobby envelope from quarantined peer {}", from),
        }
    }

    /// Answers LAN discovery probes on the direct socket, outside the
    /// reliable layer.
    fn service_discovery(&mut self) {
        let Some(discovery) = &self.discovery else {
            return;
        };
        let mut buffer = [0u8; 2048];
        loop {
            let (len, from) = match discovery.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("discovery socket error: {}", e);
                    return;
                }
            };
            let command = match read_command(&buffer[..len]) {
                Ok(command) => command,
                Err(e) => {
                    debug!("malformed discovery datagram from {}: {}", from, e);
                    continue;
                }
            };
            match command.as_str() {
                DISCOVERY_COMMAND => {
                    debug!("lan server query from {}", from);
                    let response = {
                        let setup = self.setup.lock().unwrap();
                        DiscoveryResponse::from_setup(&setup, self.game_port).encode()
                    };
                    if let Err(e) = discovery.send_to(&response, from) {
                        debug!("discovery response to {} failed: {}", from, e);
                    }
                }
                PORT_COMMAND => {
                    if let Err(e) = discovery.send_to(&self.game_port.to_be_bytes(), from) {
                        debug!("port response to {} failed: {}", from, e);
                    }
                }
                other => info!("unknown discovery command '{}' from {}", other, from),
            }
        }
    }

    /// Periodic per-peer work: reliable resends, connection request
    /// retries, and eviction of peers that never finished the handshake.
    fn service_peers(&mut self, now: Instant) {
        let mut peers = self.peers.lock().unwrap();

        for peer in peers.evict_stale(now) {
            self.connect_retries.remove(&peer.address());
            let _ = self.events.send(TransportEvent::Disconnected {
                peer: peer.address(),
                host_id: peer.host_id(),
                reason: DisconnectReason::Timeout,
            });
        }

        for peer in peers.iter_mut() {
            if peer.is_validated() {
                for (index, pending) in peer.reliable_out.take_due(now) {
                    if let Err(e) = self
                        .socket
                        .send_to(&frame_reliable(index, &pending), peer.address())
                    {
                        debug!("reliable resend to {} failed: {}", peer.address(), e);
                    }
                }
            } else if !self.host_type.is_server() {
                let due = match self.connect_retries.get(&peer.address()) {
                    Some(last) => now.duration_since(*last) >= CONNECT_RETRY_INTERVAL,
                    None => false,
                };
                let first = !self.connect_retries.contains_key(&peer.address());
                if first || due {
                    self.connect_retries.insert(peer.address(), now);
                    if !first {
                        let request =
                            Envelope::new(ProtocolId::Lobby, 0, vec![CONNECTION_REQUESTED]);
                        if let Err(e) = self
                            .socket
                            .send_to(&frame_unreliable(&request.encode()), peer.address())
                        {
                            debug!("connect retry to {} failed: {}", peer.address(), e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_have_one_byte_headers() {
        assert_eq!(frame_unreliable(&[9, 9]), vec![FRAME_UNRELIABLE, 9, 9]);
        assert_eq!(
            frame_reliable(0x0102, &[7]),
            vec![FRAME_RELIABLE, 0x01, 0x02, 7]
        );
        assert_eq!(frame_ack(0x0304), [FRAME_ACK, 0x03, 0x04]);
    }

    #[test]
    fn shutdown_signal_honors_grace_then_deadline() {
        let signal = ShutdownSignal::new();
        assert!(!signal.should_exit(Instant::now()));
        signal.request(Duration::from_secs(60));
        assert!(!signal.should_exit(Instant::now()));
        assert!(signal.should_exit(Instant::now() + Duration::from_secs(61)));
        // An explicit abort wins regardless of the deadline.
        signal.abort();
        assert!(signal.should_exit(Instant::now()));
    }

    #[test]
    fn server_config_keeps_client_defaults_elsewhere() {
        let config = HostConfig::server("0.0.0.0:2759".parse().unwrap(), 10);
        assert!(config.host_type.is_server());
        assert_eq!(config.max_players, 10);
        assert_eq!(config.poll_interval, HostConfig::default().poll_interval);
        assert!(config.stun_servers.is_empty());
    }

    #[test]
    fn broadcast_continues_past_a_failing_peer() {
        let config = HostConfig::server("127.0.0.1:0".parse().unwrap(), 8);
        let host = TransportHost::new(config, GameSetup::new("loop", 8)).unwrap();
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        {
            let mut peers = host.peers.lock().unwrap();
            // Sends to port 0 fail, which must not cut the broadcast
            // short for the peers after it.
            let mut broken = Peer::new("127.0.0.1:0".parse().unwrap(), 1, Instant::now());
            broken.set_token(7);
            peers.insert(broken);
            let mut reachable = Peer::new(listener.local_addr().unwrap(), 2, Instant::now());
            reachable.set_token(8);
            peers.insert(reachable);
        }
        host.broadcast(ProtocolId::GameState, b"go", false);

        let mut buffer = [0u8; 64];
        let (len, _) = listener.recv_from(&mut buffer).unwrap();
        assert_eq!(buffer[0], FRAME_UNRELIABLE);
        assert!(len > 1);
    }
}
