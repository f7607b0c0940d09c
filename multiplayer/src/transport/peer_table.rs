//! Server-side bookkeeping of connected peers for the UDP host.
//!
//! Tracks which socket address belongs to which peer id, when each peer was
//! last heard from, and enforces the admission rules for new peers.

use log::info;
use shared::{PeerId, SERVER_PEER_ID};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connected client as seen by the server socket
///
/// Holds the id the client offered when it connected and the address its
/// datagrams come from. The address is the only way incoming datagrams are
/// matched back to a peer.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Last time we received any datagram from this peer
    pub last_seen: Instant,
}

impl Peer {
    /// Creates a peer record that counts as heard from right now
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    /// Records that a datagram just arrived from this peer
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Checks if the peer has been silent for longer than `timeout`
    ///
    /// Heartbeats count as traffic, so a live client never times out while
    /// its heartbeat interval is shorter than the timeout.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Why a connection attempt was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    Closed,
    Full,
    ReservedId(PeerId),
    DuplicateId(PeerId),
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::Closed => write!(f, "server is refusing connections"),
            Refusal::Full => write!(f, "server is full"),
            Refusal::ReservedId(id) => write!(f, "peer id {} is reserved", id),
            Refusal::DuplicateId(id) => write!(f, "peer id {} is already connected", id),
        }
    }
}

/// All peers admitted by a server socket
///
/// The table decides admission (capacity, reserved and duplicate ids, the
/// refuse switch) and answers the address lookups the receiver task needs
/// for every datagram. Only the server's network tasks touch it, through a
/// shared `RwLock`.
pub struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    max_peers: usize,
    refuse_connections: bool,
}

impl PeerTable {
    /// Creates an empty table
    ///
    /// At most `max_peers` clients are admitted at once. With
    /// `refuse_connections` set every new connection is refused while
    /// already admitted peers keep working.
    pub fn new(max_peers: usize, refuse_connections: bool) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            refuse_connections,
        }
    }

    /// Admits `id` from `addr`
    ///
    /// Returns `Ok(true)` for a new peer. A retransmitted connect from the
    /// address already holding `id` returns `Ok(false)` and changes nothing
    /// except the last-seen time.
    ///
    /// # Errors
    /// The `Refusal` to send back to the client: the id is taken by another
    /// address, the table is refusing connections, the id is 0 or the
    /// server's own, or the table is full.
    pub fn admit(&mut self, id: PeerId, addr: SocketAddr) -> Result<bool, Refusal> {
        if let Some(existing) = self.peers.get_mut(&id) {
            if existing.addr == addr {
                existing.touch();
                return Ok(false);
            }
            return Err(Refusal::DuplicateId(id));
        }
        if self.refuse_connections {
            return Err(Refusal::Closed);
        }
        if id <= SERVER_PEER_ID {
            return Err(Refusal::ReservedId(id));
        }
        if self.peers.len() >= self.max_peers {
            return Err(Refusal::Full);
        }

        info!("Peer {} connected from {}", id, addr);
        self.peers.insert(id, Peer::new(id, addr));
        Ok(true)
    }

    /// Removes a peer by id
    ///
    /// Returns the removed record, or `None` if the id was not connected.
    /// Logs the disconnect for server monitoring.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        info!("Peer {} disconnected", peer.id);
        Some(peer)
    }

    /// Finds which peer owns a socket address
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .values()
            .find(|peer| peer.addr == addr)
            .map(|peer| peer.id)
    }

    /// Returns where datagrams for `id` are sent
    pub fn addr_of(&self, id: PeerId) -> Option<SocketAddr> {
        self.peers.get(&id).map(|peer| peer.addr)
    }

    /// Marks the peer at `addr` as alive and returns its id.
    pub fn touch_addr(&mut self, addr: SocketAddr) -> Option<PeerId> {
        let peer = self.peers.values_mut().find(|peer| peer.addr == addr)?;
        peer.touch();
        Some(peer.id)
    }

    /// Removes and returns every peer silent for longer than `timeout`.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<PeerId> {
        let timed_out: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(timeout))
            .map(|peer| peer.id)
            .collect();

        for id in &timed_out {
            self.remove(*id);
        }

        timed_out
    }

    /// Snapshot of every peer's id and address, for broadcasts
    pub fn addrs(&self) -> Vec<(PeerId, SocketAddr)> {
        self.peers.values().map(|peer| (peer.id, peer.addr)).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
