//! Path compression state.
//!
//! The receive side maps `(peer, cache id) → path` for ids other peers have
//! announced to us. The send side remembers, per path we address, the id we
//! picked and which peers have been offered and have confirmed it.
//!
//! Only the coordinator task owns a `PathCache`, so there is no locking here.

use log::debug;
use shared::{PeerId, ProtocolError, RoutingTarget};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// How long an unanswered SimplifyPath waits before it is offered again.
pub const DEFAULT_REOFFER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum Offer {
    Pending { sent_at: Instant },
    Confirmed,
}

#[derive(Debug)]
struct SentPath {
    id: u32,
    /// Peers a SimplifyPath was sent to.
    peers: HashMap<PeerId, Offer>,
}

/// Result of checking whether a path may be sent compactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationStatus {
    pub cache_id: u32,
    /// Every eligible peer has confirmed the id.
    pub all_confirmed: bool,
    /// Eligible peers that must be sent a SimplifyPath now: never offered,
    /// or offered longer than the re-offer interval ago without answering.
    /// They are recorded as pending from this moment.
    pub needs_simplify: Vec<PeerId>,
}

#[derive(Debug)]
pub struct PathCache {
    received: HashMap<PeerId, HashMap<u32, String>>,
    sent: HashMap<String, SentPath>,
    last_sent_id: u32,
    reoffer_interval: Duration,
}

impl Default for PathCache {
    fn default() -> Self {
        Self::with_reoffer_interval(DEFAULT_REOFFER_INTERVAL)
    }
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache that re-offers unconfirmed paths after
    /// `reoffer_interval`.
    ///
    /// The transport may lose a SimplifyPath or its ConfirmPath. Without a
    /// second offer the path would stay in literal mode for that peer for
    /// as long as the connection lives.
    pub fn with_reoffer_interval(reoffer_interval: Duration) -> Self {
        Self {
            received: HashMap::new(),
            sent: HashMap::new(),
            last_sent_id: 0,
            reoffer_interval,
        }
    }

    /// Creates the empty receive bucket for a freshly connected peer.
    pub fn add_peer(&mut self, peer: PeerId) {
        self.received.entry(peer).or_default();
    }

    /// Stores a path announced by `source` through SimplifyPath.
    ///
    /// A later announcement of the same id from the same peer replaces the
    /// earlier path. Ids are scoped per peer, so two peers may use the same
    /// id for different paths.
    pub fn record_received(&mut self, source: PeerId, id: u32, path: String) {
        debug!("Peer {} cached {:?} as {}", source, path, id);
        self.received.entry(source).or_default().insert(id, path);
    }

    /// Looks up the path `source` announced under `id`.
    ///
    /// # Errors
    /// `UnknownPeerCache` when nothing is known about `source`, and
    /// `UnknownCacheId` when the peer never announced `id`.
    pub fn resolve_received(&self, source: PeerId, id: u32) -> Result<&str, ProtocolError> {
        let bucket = self
            .received
            .get(&source)
            .ok_or(ProtocolError::UnknownPeerCache(source))?;
        bucket
            .get(&id)
            .map(String::as_str)
            .ok_or(ProtocolError::UnknownCacheId { peer: source, id })
    }

    /// Returns the id this side uses for `path`, allocating the next one on
    /// first use.
    ///
    /// Ids only grow and are never handed out twice, even after every peer
    /// that knew a path has gone.
    pub fn get_or_create_sent(&mut self, path: &str) -> u32 {
        self.sent_entry(path).id
    }

    fn sent_entry(&mut self, path: &str) -> &mut SentPath {
        let last_sent_id = &mut self.last_sent_id;
        self.sent.entry(path.to_owned()).or_insert_with(|| {
            *last_sent_id += 1;
            SentPath {
                id: *last_sent_id,
                peers: HashMap::new(),
            }
        })
    }

    /// Checks the connected peers selected by `target` against the
    /// confirmations recorded for `path`, creating the send entry on first
    /// use.
    pub fn confirmation_status(
        &mut self,
        path: &str,
        target: RoutingTarget,
        connected: &BTreeSet<PeerId>,
    ) -> ConfirmationStatus {
        let now = Instant::now();
        let reoffer_interval = self.reoffer_interval;
        let entry = self.sent_entry(path);
        let cache_id = entry.id;

        let mut all_confirmed = true;
        let mut needs_simplify = Vec::new();
        for &peer in connected.iter().filter(|&&peer| target.admits(peer)) {
            match entry.peers.get(&peer).copied() {
                Some(Offer::Confirmed) => {}
                Some(Offer::Pending { sent_at }) if now.duration_since(sent_at) < reoffer_interval => {
                    all_confirmed = false;
                }
                _ => {
                    entry.peers.insert(peer, Offer::Pending { sent_at: now });
                    needs_simplify.push(peer);
                    all_confirmed = false;
                }
            }
        }

        ConfirmationStatus {
            cache_id,
            all_confirmed,
            needs_simplify,
        }
    }

    /// Records that `peer` answered our SimplifyPath for `path`.
    ///
    /// Confirming twice is harmless.
    ///
    /// # Errors
    /// `UntrackedPath` when we never addressed `path`, and
    /// `UnexpectedConfirmation` when `peer` was never offered it.
    pub fn mark_confirmed(&mut self, path: &str, peer: PeerId) -> Result<(), ProtocolError> {
        let entry = self
            .sent
            .get_mut(path)
            .ok_or_else(|| ProtocolError::UntrackedPath(path.to_owned()))?;
        let offer = entry
            .peers
            .get_mut(&peer)
            .ok_or_else(|| ProtocolError::UnexpectedConfirmation {
                path: path.to_owned(),
                peer,
            })?;
        *offer = Offer::Confirmed;
        Ok(())
    }

    /// Whether `peer` has confirmed our id for `path`.
    pub fn is_confirmed(&self, path: &str, peer: PeerId) -> bool {
        matches!(
            self.sent.get(path).and_then(|entry| entry.peers.get(&peer)),
            Some(Offer::Confirmed)
        )
    }

    /// Whether `peer` currently has a receive bucket.
    pub fn has_peer(&self, peer: PeerId) -> bool {
        self.received.contains_key(&peer)
    }

    /// Forgets everything tied to `peer`.
    ///
    /// Its announced paths are discarded and it is removed from every
    /// confirmation set, so a peer reusing the id starts unconfirmed.
    pub fn drop_peer(&mut self, peer: PeerId) {
        self.received.remove(&peer);
        for entry in self.sent.values_mut() {
            entry.peers.remove(&peer);
        }
    }
}
