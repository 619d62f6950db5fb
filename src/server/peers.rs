//! Manage announced peers for info_hashes

use std::{
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use rand::{seq::IteratorRandom, Rng};

use crate::common::Id;

use lru::LruCache;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Reasons an announced peer wasn't stored.
pub enum StoreError {
    /// Too many distinct info hashes are already stored.
    #[error("Too many info hashes stored")]
    ContentLimitExceeded,
    /// Too many peers are already stored for this info hash.
    #[error("Too many peers stored for this info hash")]
    PeerLimitExceeded,
}

#[derive(Debug)]
/// Peers announced per info hash, with the time of their latest announce.
///
/// Both the number of info hashes and the number of peers per info hash are bounded.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
pub struct PeersStore {
    info_hashes: LruCache<Id, LruCache<SocketAddrV4, Instant>>,
    max_info_hashes: usize,
    max_peers: usize,
}

impl PeersStore {
    pub fn new(max_info_hashes: usize, max_peers: usize) -> Self {
        Self {
            info_hashes: LruCache::unbounded(),
            max_info_hashes,
            max_peers,
        }
    }

    // === Getters ===

    /// Number of info hashes with at least one peer.
    pub fn len(&self) -> usize {
        self.info_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info_hashes.is_empty()
    }

    /// Number of peers stored for `info_hash`.
    pub fn peers_count(&self, info_hash: &Id) -> usize {
        self.info_hashes.peek(info_hash).map_or(0, |peers| peers.len())
    }

    // === Public Methods ===

    /// Store or refresh a peer, announcing again only updates its timestamp.
    pub fn store(&mut self, info_hash: Id, peer: SocketAddrV4) -> Result<(), StoreError> {
        if let Some(peers) = self.info_hashes.get_mut(&info_hash) {
            if !peers.contains(&peer) && peers.len() >= self.max_peers {
                return Err(StoreError::PeerLimitExceeded);
            }

            peers.put(peer, Instant::now());

            return Ok(());
        }

        if self.info_hashes.len() >= self.max_info_hashes {
            return Err(StoreError::ContentLimitExceeded);
        }
        if self.max_peers == 0 {
            return Err(StoreError::PeerLimitExceeded);
        }

        let mut peers = LruCache::unbounded();
        peers.put(peer, Instant::now());
        self.info_hashes.put(info_hash, peers);

        Ok(())
    }

    /// All peers stored for `info_hash`, most recently announced first.
    pub fn get_peers(&self, info_hash: &Id) -> Vec<SocketAddrV4> {
        self.info_hashes
            .peek(info_hash)
            .map(|peers| peers.iter().map(|(peer, _)| *peer).collect())
            .unwrap_or_default()
    }

    /// Up to `max` peers for `info_hash`, sampled uniformly when there are more.
    pub fn get_random_peers<R: Rng + ?Sized>(
        &self,
        info_hash: &Id,
        max: usize,
        rng: &mut R,
    ) -> Option<Vec<SocketAddrV4>> {
        let peers = self.info_hashes.peek(info_hash)?;

        if peers.is_empty() {
            return None;
        }
        if peers.len() <= max {
            return Some(peers.iter().map(|(peer, _)| *peer).collect());
        }

        Some(
            peers
                .iter()
                .map(|(peer, _)| *peer)
                .choose_multiple(rng, max),
        )
    }

    /// Remove peers announced more than `max_age` ago, and info hashes left without peers.
    ///
    /// Returns the number of removed peers.
    pub fn sweep(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for (_, peers) in self.info_hashes.iter_mut() {
            // Least recently announced peers sit at the back of the lru.
            while let Some((_, announced)) = peers.peek_lru() {
                if now.saturating_duration_since(*announced) <= max_age {
                    break;
                }

                peers.pop_lru();
                removed += 1;
            }
        }

        let empty: Vec<Id> = self
            .info_hashes
            .iter()
            .filter(|(_, peers)| peers.is_empty())
            .map(|(info_hash, _)| *info_hash)
            .collect();

        for info_hash in empty {
            self.info_hashes.pop(&info_hash);
        }

        removed
    }
}
