//! The connection manager: owns the listener and every live peer link.
//!
//! Each established connection is served by one task running a read loop and
//! a write loop side by side. Outbound messages go through a bounded queue per
//! connection, so [`ConnectionManager::send`] never waits on a slow peer: a
//! full queue is reported as backpressure for that peer alone.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::error::NetworkError;
use crate::identity::{Identity, PeerInfo};
use crate::network::handshake::{ConnectionState, Handshake, HandshakeOutcome};
use crate::network::message::{read_frame, write_frame, Message};
use crate::network::{NetworkConfig, NetworkEvent, NetworkResult};
use crate::peers::PeerTable;

struct ConnectionHandle {
    conn_id: u64,
    outbound: bool,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<Message>,
}

/// Per-peer result of [`ConnectionManager::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, NetworkError)>,
}

impl BroadcastReport {
    /// Whether every target accepted the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Listens for, dials, and tracks connections to peers.
pub struct ConnectionManager {
    identity: Arc<Identity>,
    local: PeerInfo,
    peers: Arc<PeerTable>,
    config: NetworkConfig,
    connections: DashMap<String, ConnectionHandle>,
    events: mpsc::Sender<NetworkEvent>,
    shutdown: watch::Receiver<bool>,
    next_conn_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        identity: Arc<Identity>,
        local: PeerInfo,
        peers: Arc<PeerTable>,
        config: NetworkConfig,
        events: mpsc::Sender<NetworkEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            identity,
            local,
            peers,
            config,
            connections: DashMap::new(),
            events,
            shutdown,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// The descriptor this node presents in handshakes.
    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    /// Accept inbound connections until shutdown.
    ///
    /// Each accepted socket is handshaken on its own task; a failed handshake
    /// is logged and the socket dropped without affecting the listener.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        tracing::info!(addr = ?listener.local_addr().ok(), peer = %self.local.id, "listening for peers");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let manager = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = manager.accept(stream, addr).await {
                                tracing::warn!(%addr, error = %e, "inbound connection rejected");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("listener stopped");
    }

    async fn accept(self: &Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> NetworkResult<PeerInfo> {
        let mut state = ConnectionState::Idle;
        state.advance(ConnectionState::Handshaking);
        let outcome = self.handshake(&mut stream, addr, None).await?;
        state.advance(ConnectionState::Established);
        Ok(self.establish(stream, addr, outcome, false).await)
    }

    /// Connect to a known peer, verifying it is who the table says it is.
    pub async fn dial(self: &Arc<Self>, peer: &PeerInfo) -> NetworkResult<PeerInfo> {
        self.dial_addr(&peer.dial_addr(), Some(peer.id.as_str())).await
    }

    /// Connect to `addr`; with `expected = None` any valid identity is accepted.
    ///
    /// Failures are returned to the caller; there is no internal retry.
    pub async fn dial_addr(self: &Arc<Self>, addr: &str, expected: Option<&str>) -> NetworkResult<PeerInfo> {
        let mut state = ConnectionState::Idle;
        state.advance(ConnectionState::Dialing);
        tracing::debug!(%addr, %state, "dialing peer");

        let mut stream = match timeout(self.config.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::DialFailure {
                    addr: addr.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(NetworkError::DialFailure {
                    addr: addr.to_string(),
                    message: format!("timed out after {:?}", self.config.dial_timeout),
                });
            }
        };
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;

        state.advance(ConnectionState::Handshaking);
        let outcome = self.handshake(&mut stream, remote_addr, expected).await?;
        state.advance(ConnectionState::Established);
        Ok(self.establish(stream, remote_addr, outcome, true).await)
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        addr: SocketAddr,
        expected: Option<&str>,
    ) -> NetworkResult<HandshakeOutcome> {
        let handshake = Handshake {
            identity: &self.identity,
            local: &self.local,
            known_peers: self.peers.sample_infos(self.config.peer_sample_size),
            expected,
            max_frame_bytes: self.config.max_frame_bytes,
            addr: addr.to_string(),
        };
        match timeout(self.config.handshake_timeout, handshake.run(stream)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::HandshakeTimeout {
                addr: addr.to_string(),
            }),
        }
    }

    /// Admit a handshaken connection into the active set and start serving it.
    async fn establish(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        outcome: HandshakeOutcome,
        outbound: bool,
    ) -> PeerInfo {
        let HandshakeOutcome {
            remote: mut peer,
            known_peers,
        } = outcome;
        if is_unspecified(&peer.address) {
            peer.address = addr.ip().to_string();
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.outbound_queue);
        let handle = ConnectionHandle {
            conn_id,
            outbound,
            remote_addr: addr,
            tx,
        };

        let local_is_lower = self.local.id < peer.id;
        let admitted = match self.connections.entry(peer.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
            Entry::Occupied(mut slot) => {
                if prefer_new(slot.get().outbound, outbound, local_is_lower) {
                    slot.insert(handle);
                    true
                } else {
                    false
                }
            }
        };
        if !admitted {
            tracing::debug!(peer = %peer.id, %addr, "duplicate connection dropped");
            return peer;
        }

        self.peers.upsert(peer.clone());
        tracing::info!(peer = %peer.id, %addr, outbound, "connection established");

        let _ = self
            .events
            .send(NetworkEvent::Connected {
                peer: peer.clone(),
                known_peers,
            })
            .await;

        let manager = Arc::clone(self);
        let peer_id = peer.id.clone();
        tokio::spawn(async move { manager.serve(peer_id, conn_id, stream, rx).await });
        peer
    }

    async fn serve(
        self: Arc<Self>,
        peer_id: String,
        conn_id: u64,
        stream: TcpStream,
        mut rx: mpsc::Receiver<Message>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let mut shutdown = self.shutdown.clone();
        let max_frame_bytes = self.config.max_frame_bytes;

        let read_loop = async {
            loop {
                let message = read_frame(&mut reader, max_frame_bytes).await?;
                self.peers.touch(&peer_id);
                tracing::debug!(peer = %peer_id, kind = message.kind(), "received message");
                let event = NetworkEvent::Received {
                    from: peer_id.clone(),
                    message,
                };
                if self.events.send(event).await.is_err() {
                    return Ok::<(), NetworkError>(());
                }
            }
        };
        let write_loop = async {
            while let Some(message) = rx.recv().await {
                write_frame(&mut writer, &message).await?;
            }
            Ok::<(), NetworkError>(())
        };

        let reason = tokio::select! {
            result = read_loop => match result {
                Ok(()) => "event channel closed".to_string(),
                Err(e) => e.to_string(),
            },
            result = write_loop => match result {
                Ok(()) => "closed locally".to_string(),
                Err(e) => e.to_string(),
            },
            _ = shutdown.changed() => "shutdown".to_string(),
        };

        let mut state = ConnectionState::Established;
        state.advance(ConnectionState::Closed);
        let removed = self
            .connections
            .remove_if(&peer_id, |_, handle| handle.conn_id == conn_id)
            .is_some();
        if removed {
            self.peers.mark_unreachable(&peer_id);
            let _ = self
                .events
                .send(NetworkEvent::Disconnected {
                    peer: peer_id.clone(),
                })
                .await;
        }
        tracing::info!(peer = %peer_id, conn_id, %state, %reason, "connection closed");
    }

    /// Queue one message for `peer_id`.
    ///
    /// Fails with [`NetworkError::NotConnected`] if there is no established
    /// connection, or [`NetworkError::Backpressure`] if its queue is full.
    pub fn send(&self, peer_id: &str, message: Message) -> NetworkResult<()> {
        let handle = self
            .connections
            .get(peer_id)
            .ok_or_else(|| NetworkError::NotConnected {
                peer: peer_id.to_string(),
            })?;
        handle.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => NetworkError::Backpressure {
                peer: peer_id.to_string(),
            },
            TrySendError::Closed(_) => NetworkError::NotConnected {
                peer: peer_id.to_string(),
            },
        })
    }

    /// Queue one message for `peer_id`, waiting up to the configured send
    /// timeout for room in its queue.
    ///
    /// For bulk transfers that must not be dropped on a momentarily full
    /// queue. Only the calling task waits; other peers are unaffected.
    pub async fn send_queued(&self, peer_id: &str, message: Message) -> NetworkResult<()> {
        let tx = self
            .connections
            .get(peer_id)
            .map(|handle| handle.tx.clone())
            .ok_or_else(|| NetworkError::NotConnected {
                peer: peer_id.to_string(),
            })?;
        tx.send_timeout(message, self.config.send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => NetworkError::Backpressure {
                    peer: peer_id.to_string(),
                },
                SendTimeoutError::Closed(_) => NetworkError::NotConnected {
                    peer: peer_id.to_string(),
                },
            })
    }

    /// Send to each target independently, reporting failures per peer.
    pub fn broadcast<'a, I>(&self, peer_ids: I, message: &Message) -> BroadcastReport
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut report = BroadcastReport::default();
        for peer_id in peer_ids {
            match self.send(peer_id, message.clone()) {
                Ok(()) => report.delivered.push(peer_id.to_string()),
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, kind = message.kind(), "send failed");
                    report.failed.push((peer_id.to_string(), e));
                }
            }
        }
        report
    }

    /// Drop the connection to `peer_id` and demote the peer.
    pub fn close(&self, peer_id: &str) -> bool {
        let closed = self.connections.remove(peer_id).is_some();
        if closed {
            self.peers.mark_unreachable(peer_id);
            tracing::debug!(peer = %peer_id, "closing connection");
        }
        closed
    }

    /// Drop every connection.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connections.contains_key(peer_id)
    }

    /// IDs of every peer with an established connection.
    pub fn connected_peers(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    /// Transport address of the connection to `peer_id`.
    pub fn remote_addr(&self, peer_id: &str) -> Option<SocketAddr> {
        self.connections.get(peer_id).map(|c| c.remote_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.local.id)
            .field("connections", &self.connections.len())
            .finish()
    }
}

/// Decide which of two connections to the same peer survives.
///
/// Same direction: the newer one (the older is likely stale). Opposite
/// directions (simultaneous dial): the one dialed by the lower peer ID, so
/// both ends keep the same socket.
fn prefer_new(existing_outbound: bool, new_outbound: bool, local_is_lower: bool) -> bool {
    if existing_outbound == new_outbound {
        return true;
    }
    new_outbound == local_is_lower
}

fn is_unspecified(address: &str) -> bool {
    match address.parse::<IpAddr>() {
        Ok(ip) => ip.is_unspecified(),
        Err(_) => address.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simultaneous_dial_keeps_lower_ids_connection() {
        // Local is lower: keep our outbound, whichever arrived first.
        assert!(prefer_new(false, true, true));
        assert!(!prefer_new(true, false, true));
        // Local is higher: keep the remote's dial, i.e. our inbound.
        assert!(prefer_new(true, false, false));
        assert!(!prefer_new(false, true, false));
    }

    #[test]
    fn reconnect_in_same_direction_replaces() {
        assert!(prefer_new(true, true, true));
        assert!(prefer_new(false, false, false));
    }

    #[test]
    fn unspecified_addresses() {
        assert!(is_unspecified("0.0.0.0"));
        assert!(is_unspecified("::"));
        assert!(is_unspecified(""));
        assert!(!is_unspecified("127.0.0.1"));
        assert!(!is_unspecified("node.example"));
    }
}
