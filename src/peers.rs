//! Known-peer table with per-entry liveness.
//!
//! Entries live in a `DashMap`, so concurrent upserts from the handshake,
//! gossip and discovery paths only contend when they touch the same peer.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::identity::PeerInfo;

/// Reachability of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Learned from another peer, never contacted.
    Discovered,
    /// Recently in contact.
    Live,
    /// Last contact attempt failed or the connection dropped.
    Unreachable,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Live => write!(f, "live"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A remote node as tracked by this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(flatten)]
    pub info: PeerInfo,
    /// Milliseconds since UNIX epoch of the last successful contact, or of
    /// when the peer was learned if it was never contacted.
    pub last_seen: u64,
    pub liveness: Liveness,
}

impl Peer {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Live and contacted within `timeout` of `now_ms`.
    pub fn is_live_at(&self, now_ms: u64, timeout: Duration) -> bool {
        self.liveness == Liveness::Live
            && now_ms.saturating_sub(self.last_seen) <= timeout.as_millis() as u64
    }
}

/// Current time in milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Table size past which second-hand peers are ignored.
pub const DEFAULT_MAX_PEERS: usize = 1024;

/// The table of known peers.
#[derive(Debug)]
pub struct PeerTable {
    local_id: String,
    peers: DashMap<String, Peer>,
    liveness_timeout: Duration,
    max_peers: usize,
}

impl PeerTable {
    /// Create a table for the node `local_id`, which is never stored in it.
    pub fn new(local_id: impl Into<String>, liveness_timeout: Duration) -> Self {
        Self::with_max_peers(local_id, liveness_timeout, DEFAULT_MAX_PEERS)
    }

    /// Like [`Self::new`], but [`Self::discover`] stops adding entries once
    /// the table holds `max_peers`. Peers we are in contact with are always
    /// recorded.
    pub fn with_max_peers(
        local_id: impl Into<String>,
        liveness_timeout: Duration,
        max_peers: usize,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            peers: DashMap::new(),
            liveness_timeout,
            max_peers,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Record a successful contact with `info` now.
    pub fn upsert(&self, info: PeerInfo) {
        self.upsert_at(info, now_millis());
    }

    /// Record a successful contact with `info` at `seen_ms`.
    pub fn upsert_at(&self, info: PeerInfo, seen_ms: u64) {
        if info.id == self.local_id {
            return;
        }
        self.peers
            .entry(info.id.clone())
            .and_modify(|peer| {
                peer.info = info.clone();
                peer.last_seen = peer.last_seen.max(seen_ms);
                peer.liveness = Liveness::Live;
            })
            .or_insert_with(|| Peer {
                info,
                last_seen: seen_ms,
                liveness: Liveness::Live,
            });
    }

    /// Refresh `last_seen` for a peer we just heard from.
    pub fn touch(&self, id: &str) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.last_seen = now_millis();
            peer.liveness = Liveness::Live;
        }
    }

    /// Add a peer learned second-hand. Returns `true` if it was unknown and
    /// the table had room for it.
    pub fn discover(&self, info: PeerInfo) -> bool {
        self.discover_at(info, now_millis())
    }

    /// Add a peer learned second-hand at `learned_ms`. It ages out like a
    /// peer last seen at that time unless a contact succeeds first.
    pub fn discover_at(&self, info: PeerInfo, learned_ms: u64) -> bool {
        if info.id == self.local_id || self.peers.contains_key(&info.id) {
            return false;
        }
        if self.peers.len() >= self.max_peers {
            tracing::debug!(peer = %info.id, max = self.max_peers, "peer table full, ignoring");
            return false;
        }
        tracing::debug!(peer = %info.id, addr = %info.dial_addr(), "discovered peer");
        self.peers.insert(
            info.id.clone(),
            Peer {
                info,
                last_seen: learned_ms,
                liveness: Liveness::Discovered,
            },
        );
        true
    }

    /// Demote a peer without forgetting it.
    pub fn mark_unreachable(&self, id: &str) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            if peer.liveness != Liveness::Unreachable {
                tracing::debug!(peer = %id, "peer marked unreachable");
            }
            peer.liveness = Liveness::Unreachable;
        }
    }

    /// Forget a peer.
    pub fn evict(&self, id: &str) -> Option<Peer> {
        self.peers.remove(id).map(|(_, peer)| peer)
    }

    /// Demote live peers past the liveness timeout, then evict every peer
    /// that is not live and was not seen (or learned) within `evict_after`.
    /// Returns the evicted IDs.
    pub fn expire(&self, now_ms: u64, evict_after: Duration) -> Vec<String> {
        let timeout_ms = self.liveness_timeout.as_millis() as u64;
        let evict_ms = evict_after.as_millis() as u64;
        let mut evicted = Vec::new();

        for mut peer in self.peers.iter_mut() {
            let idle = now_ms.saturating_sub(peer.last_seen);
            if peer.liveness == Liveness::Live && idle > timeout_ms {
                peer.liveness = Liveness::Unreachable;
            }
            if peer.liveness != Liveness::Live && idle > evict_ms {
                evicted.push(peer.key().clone());
            }
        }

        for id in &evicted {
            self.peers.remove(id);
            tracing::info!(peer = %id, "evicted stale peer");
        }
        evicted
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).map(|p| p.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Snapshot of every known peer regardless of liveness.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        peers
    }

    /// Descriptors of up to `n` random known peers, for discovery messages.
    pub fn sample_infos(&self, n: usize) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.iter().map(|p| p.info.clone()).collect();
        infos.shuffle(&mut rand::thread_rng());
        infos.truncate(n);
        infos
    }

    /// Up to `n` distinct live peers chosen at random, skipping `exclude`.
    pub fn sample_fanout_targets(&self, n: usize, exclude: &[&str]) -> Vec<Peer> {
        self.sample_fanout_targets_at(n, exclude, now_millis())
    }

    pub fn sample_fanout_targets_at(&self, n: usize, exclude: &[&str], now_ms: u64) -> Vec<Peer> {
        let live: Vec<Peer> = self
            .peers
            .iter()
            .filter(|p| p.is_live_at(now_ms, self.liveness_timeout))
            .filter(|p| !exclude.contains(&p.info.id.as_str()))
            .map(|p| p.value().clone())
            .collect();
        live.choose_multiple(&mut rand::thread_rng(), n)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
