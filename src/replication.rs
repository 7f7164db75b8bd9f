//! Gossip replication of committed triples.
//!
//! The engine sits between the [`TripleStore`] and the [`ConnectionManager`]:
//! local inserts are committed and then pushed to a random fan-out of live
//! peers; received inserts are committed and relayed one hop further while
//! their TTL lasts. A [`SeenCache`] keeps a node from relaying the same batch
//! twice, but correctness never depends on it since store inserts are
//! idempotent.
//!
//! A periodic maintenance pass ages the peer table, redials known peers with
//! exponential [`Backoff`], and spreads a sample of known peers to every
//! connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use crate::error::NetworkError;
use crate::identity::{Identity, PeerInfo};
use crate::network::{BroadcastReport, ConnectionManager, InsertMessage, Message, MessageId, NetworkEvent};
use crate::peers::{now_millis, PeerTable};
use crate::store::{InsertOutcome, StoreResult, TripleStore};
use crate::triple::{Triple, TripleId};

/// Gossip and maintenance tunables.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Peers each insert is pushed to per hop.
    pub fanout: usize,
    /// Hop budget given to locally originated inserts.
    pub max_hops: u8,
    pub seen_ttl: Duration,
    pub seen_capacity: usize,
    pub maintenance_interval: Duration,
    /// Peers advertised per discovery message.
    pub peer_sample_size: usize,
    /// Exchange digests after each handshake.
    pub reconcile_on_connect: bool,
    /// Frame limit gossip and reconciliation batches are split to.
    pub max_frame_bytes: usize,
    /// `host:port` addresses dialed at startup and whenever no peer is known.
    pub seeds: Vec<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            fanout: 4,
            max_hops: 6,
            seen_ttl: Duration::from_secs(120),
            seen_capacity: 10_000,
            maintenance_interval: Duration::from_secs(5),
            peer_sample_size: 8,
            reconcile_on_connect: true,
            max_frame_bytes: 16 * 1024 * 1024,
            seeds: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Seen-set
// ---------------------------------------------------------------------------

/// Recently handled gossip payloads.
#[derive(Debug)]
pub struct SeenCache {
    entries: DashMap<MessageId, Instant>,
    ttl: Duration,
    capacity: usize,
}

impl SeenCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns `false` if it was already recorded and unexpired.
    pub fn insert(&self, id: MessageId) -> bool {
        self.insert_at(id, Instant::now())
    }

    pub fn insert_at(&self, id: MessageId, now: Instant) -> bool {
        let fresh = match self.entries.get(&id) {
            Some(seen) => now.saturating_duration_since(*seen) > self.ttl,
            None => true,
        };
        if !fresh {
            return false;
        }
        if self.entries.len() >= self.capacity {
            self.prune(now);
        }
        self.entries.insert(id, now);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether `id` was recorded less than the TTL before `now`.
    pub fn is_fresh(&self, id: &MessageId, now: Instant) -> bool {
        self.entries
            .get(id)
            .is_some_and(|seen| now.saturating_duration_since(*seen) <= self.ttl)
    }

    /// Drop expired entries, then the oldest ones while over capacity.
    pub fn prune(&self, now: Instant) {
        self.entries
            .retain(|_, seen| now.saturating_duration_since(*seen) <= self.ttl);
        if self.entries.len() < self.capacity {
            return;
        }
        let mut by_age: Vec<(MessageId, Instant)> =
            self.entries.iter().map(|e| (*e.key(), *e.value())).collect();
        by_age.sort_by_key(|(_, seen)| *seen);
        let excess = self.entries.len() + 1 - self.capacity;
        for (id, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Redial backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Attempt {
    failures: u32,
    next_attempt: Instant,
    in_flight: bool,
}

/// Exponential redial backoff keyed by peer ID or seed address.
#[derive(Debug)]
pub struct Backoff {
    attempts: DashMap<String, Attempt>,
    base: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempts: DashMap::new(),
            base,
            cap,
        }
    }

    /// Delay after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (failures - 1).min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Claim a dial attempt for `key` if its window has passed and no other
    /// attempt is running.
    pub fn try_begin(&self, key: &str, now: Instant) -> bool {
        let mut entry = self.attempts.entry(key.to_string()).or_insert(Attempt {
            failures: 0,
            next_attempt: now,
            in_flight: false,
        });
        if entry.in_flight || now < entry.next_attempt {
            return false;
        }
        entry.in_flight = true;
        true
    }

    /// Record a failed attempt; returns the wait before the next one.
    pub fn record_failure(&self, key: &str, now: Instant) -> Duration {
        let mut entry = self.attempts.entry(key.to_string()).or_insert(Attempt {
            failures: 0,
            next_attempt: now,
            in_flight: false,
        });
        entry.failures = entry.failures.saturating_add(1);
        let delay = self.delay(entry.failures);
        entry.next_attempt = now + delay;
        entry.in_flight = false;
        delay
    }

    pub fn record_success(&self, key: &str) {
        self.forget(key);
    }

    /// Drop all state for `key`.
    pub fn forget(&self, key: &str) {
        self.attempts.remove(key);
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.attempts.get(key).map(|a| a.failures).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives insert propagation, reconciliation and peer maintenance.
pub struct ReplicationEngine {
    identity: Arc<Identity>,
    store: Arc<TripleStore>,
    peers: Arc<PeerTable>,
    connections: Arc<ConnectionManager>,
    config: ReplicationConfig,
    seen: SeenCache,
    backoff: Backoff,
    /// Digest frames received so far, per peer, until the last one arrives.
    digests: DashMap<String, HashSet<TripleId>>,
}

impl ReplicationEngine {
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<TripleStore>,
        peers: Arc<PeerTable>,
        connections: Arc<ConnectionManager>,
        config: ReplicationConfig,
    ) -> Self {
        let seen = SeenCache::new(config.seen_ttl, config.seen_capacity);
        Self {
            identity,
            store,
            peers,
            connections,
            config,
            seen,
            backoff: Backoff::default(),
            digests: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Commit triples from a local client and push the new ones to peers.
    ///
    /// Unsigned triples are signed with the node key. Triples that already
    /// carry a signer must verify as-is. A failed fan-out never undoes the
    /// local commit.
    pub fn insert_local(&self, triples: Vec<Triple>) -> StoreResult<InsertOutcome> {
        let prepared: Vec<Triple> = triples
            .into_iter()
            .map(|t| if t.is_signed() { t } else { t.signed_by(&self.identity) })
            .collect();
        let outcome = self.store.insert(&prepared)?;
        tracing::info!(
            inserted = outcome.count(),
            duplicates = outcome.duplicates,
            rejected = outcome.rejected,
            "local insert"
        );

        if !outcome.inserted.is_empty() {
            let message = InsertMessage::new(
                self.identity.id(),
                self.config.max_hops,
                outcome.inserted.clone(),
            );
            for batch in message.split_to_fit(self.config.max_frame_bytes) {
                self.seen.insert(batch.message_id());
                self.fan_out(batch, &[]);
            }
        }
        Ok(outcome)
    }

    /// Push an insert to a fresh sample of live peers.
    fn fan_out(&self, message: InsertMessage, exclude: &[&str]) -> BroadcastReport {
        let targets = self.peers.sample_fanout_targets(self.config.fanout, exclude);
        if targets.is_empty() {
            tracing::debug!(triples = message.triples.len(), "no live peers to gossip to");
            return BroadcastReport::default();
        }
        let ttl = message.ttl;
        let count = message.triples.len();
        let report = self.connections.broadcast(
            targets.iter().map(|p| p.id()),
            &Message::Insert(message),
        );
        self.demote_failed(&report);
        tracing::debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            triples = count,
            ttl,
            "gossiped insert"
        );
        report
    }

    fn demote_failed(&self, report: &BroadcastReport) {
        for (peer, error) in &report.failed {
            if matches!(error, NetworkError::NotConnected { .. }) {
                self.peers.mark_unreachable(peer);
            }
        }
    }

    /// Dispatch one transport event.
    ///
    /// Store commits run on the blocking pool. Bulk reconciliation transfers
    /// run on their own tasks, so a slow peer only holds up its own transfer.
    pub async fn handle_event(self: &Arc<Self>, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected { peer, known_peers } => {
                self.backoff.record_success(&peer.id);
                self.learn_peers(known_peers);
                self.digests.remove(&peer.id);
                if self.config.reconcile_on_connect {
                    let frames = Message::digests(self.store.ids(), self.config.max_frame_bytes);
                    self.spawn_transfer(peer.id, frames);
                }
            }
            NetworkEvent::Disconnected { peer } => {
                self.digests.remove(&peer);
                tracing::debug!(peer = %peer, "peer disconnected");
            }
            NetworkEvent::Received { from, message } => self.handle_message(from, message).await,
        }
    }

    async fn handle_message(self: &Arc<Self>, from: String, message: Message) {
        match message {
            Message::Insert(insert) => {
                let engine = Arc::clone(self);
                let sender = from.clone();
                let accepted =
                    tokio::task::spawn_blocking(move || engine.accept_insert(&sender, insert)).await;
                match accepted {
                    Ok(Some(relay)) => {
                        let origin = relay.origin.clone();
                        self.fan_out(relay, &[from.as_str(), origin.as_str()]);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!(peer = %from, error = %e, "insert task failed"),
                }
            }
            Message::Peers { peers } => self.learn_peers(peers),
            Message::Digest { ids, complete } => {
                if let Some(missing) = self.collect_digest(&from, ids, complete) {
                    tracing::debug!(peer = %from, triples = missing.len(), "reconciling peer");
                    let frames = InsertMessage::new(self.identity.id(), 0, missing)
                        .split_to_fit(self.config.max_frame_bytes)
                        .into_iter()
                        .map(Message::Insert)
                        .collect();
                    self.spawn_transfer(from, frames);
                }
            }
            other @ (Message::Hello { .. } | Message::Proof { .. }) => {
                tracing::warn!(peer = %from, kind = other.kind(), "handshake frame on established connection");
            }
        }
    }

    /// Commit a received insert and decide whether to relay it.
    ///
    /// Returns the message to relay: only the newly stored triples, one hop
    /// further along, or `None` when the batch was seen before, added
    /// nothing, or its TTL is spent.
    pub fn accept_insert(&self, from: &str, message: InsertMessage) -> Option<InsertMessage> {
        self.accept_insert_with(from, message, |triples| self.store.insert(triples))
    }

    /// [`Self::accept_insert`] with the commit step supplied by the caller.
    ///
    /// The batch only enters the seen-set once `commit` succeeds, so a
    /// retransmission after a failed commit is tried again.
    fn accept_insert_with<F>(&self, from: &str, message: InsertMessage, commit: F) -> Option<InsertMessage>
    where
        F: FnOnce(&[Triple]) -> StoreResult<InsertOutcome>,
    {
        let id = message.message_id();
        if self.seen.is_fresh(&id, Instant::now()) {
            tracing::debug!(peer = %from, origin = %message.origin, "insert already seen");
            return None;
        }

        let outcome = match commit(&message.triples) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(peer = %from, error = %e, "failed to commit gossiped triples");
                return None;
            }
        };
        self.seen.insert(id);
        if outcome.rejected > 0 {
            tracing::warn!(
                peer = %from,
                rejected = outcome.rejected,
                "dropped gossiped triples with invalid signatures"
            );
        }
        if outcome.inserted.is_empty() {
            return None;
        }
        tracing::debug!(
            peer = %from,
            inserted = outcome.count(),
            ttl = message.ttl,
            "committed gossiped triples"
        );

        let relay = message.relayed(outcome.inserted)?;
        self.seen.insert(relay.message_id());
        Some(relay)
    }

    /// Add one digest frame from `from`. Once the last frame is in, returns
    /// the stored triples the peer lacks, if any.
    pub fn collect_digest(&self, from: &str, ids: Vec<TripleId>, complete: bool) -> Option<Vec<Triple>> {
        {
            let mut pending = self.digests.entry(from.to_string()).or_default();
            pending.extend(ids);
            if !complete {
                return None;
            }
        }
        let known = self
            .digests
            .remove(from)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        let missing = self.store.missing_from(&known);
        (!missing.is_empty()).then_some(missing)
    }

    /// Send `frames` to `peer` in order on a separate task, waiting for
    /// queue room rather than dropping frames.
    fn spawn_transfer(self: &Arc<Self>, peer: String, frames: Vec<Message>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let total = frames.len();
            for (sent, frame) in frames.into_iter().enumerate() {
                let kind = frame.kind();
                if let Err(e) = engine.connections.send_queued(&peer, frame).await {
                    tracing::warn!(peer = %peer, error = %e, kind, sent, total, "transfer aborted");
                    return;
                }
            }
            tracing::debug!(peer = %peer, frames = total, "transfer complete");
        });
    }

    fn learn_peers(&self, infos: Vec<PeerInfo>) {
        let learned = infos
            .into_iter()
            .filter(|info| info.public_key().is_ok())
            .filter(|info| self.peers.discover(info.clone()))
            .count();
        if learned > 0 {
            tracing::debug!(learned, known = self.peers.len(), "learned peers");
        }
    }

    /// Consume transport events until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<NetworkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("replication engine stopped");
    }

    /// Run [`Self::maintain`] every `maintenance_interval` until shutdown.
    pub async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.maintain(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("maintenance loop stopped");
    }

    /// One maintenance pass: age peers, redial, advertise, prune.
    pub fn maintain(self: &Arc<Self>) {
        let evict_after = self.peers.liveness_timeout().saturating_mul(2);
        for id in self.peers.expire(now_millis(), evict_after) {
            self.backoff.forget(&id);
            self.digests.remove(&id);
            self.connections.close(&id);
        }

        let now = Instant::now();
        for peer in self.peers.list() {
            if self.connections.is_connected(peer.id()) || !self.backoff.try_begin(peer.id(), now) {
                continue;
            }
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.dial_peer(peer.info).await });
        }

        if self.peers.is_empty() && self.connections.connection_count() == 0 {
            self.dial_seeds();
        }

        let connected = self.connections.connected_peers();
        if !connected.is_empty() {
            let sample = self.peers.sample_infos(self.config.peer_sample_size);
            if !sample.is_empty() {
                let report = self
                    .connections
                    .broadcast(connected.iter().map(String::as_str), &Message::Peers { peers: sample });
                self.demote_failed(&report);
            }
        }

        self.seen.prune(now);
    }

    /// Dial every configured seed whose backoff window has passed.
    pub fn dial_seeds(self: &Arc<Self>) {
        let now = Instant::now();
        for seed in &self.config.seeds {
            if !self.backoff.try_begin(seed, now) {
                continue;
            }
            let engine = Arc::clone(self);
            let seed = seed.clone();
            tokio::spawn(async move {
                match engine.connections.dial_addr(&seed, None).await {
                    Ok(peer) => {
                        engine.backoff.record_success(&seed);
                        tracing::info!(%seed, peer = %peer.id, "connected to seed");
                    }
                    Err(e) => {
                        let retry = engine.backoff.record_failure(&seed, Instant::now());
                        tracing::warn!(%seed, error = %e, ?retry, "seed dial failed");
                    }
                }
            });
        }
    }

    async fn dial_peer(&self, info: PeerInfo) {
        match self.connections.dial(&info).await {
            Ok(_) => self.backoff.record_success(&info.id),
            Err(e) if !self.peers.contains(&info.id) => {
                self.backoff.forget(&info.id);
                tracing::debug!(peer = %info.id, error = %e, "dial to evicted peer failed");
            }
            Err(e) => {
                let retry = self.backoff.record_failure(&info.id, Instant::now());
                self.peers.mark_unreachable(&info.id);
                tracing::debug!(peer = %info.id, error = %e, ?retry, "redial failed");
            }
        }
    }
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("node", &self.identity.id())
            .field("fanout", &self.config.fanout)
            .field("max_hops", &self.config.max_hops)
            .field("seen", &self.seen.len())
            .finish()
    }
}
