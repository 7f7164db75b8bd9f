//! Node facade: top-level API for a degdb peer.
//!
//! The `Node` owns every subsystem, runs the listener, replication and
//! maintenance tasks, and exposes the operations the control surface needs.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::error::{DegResult, NetworkError, StoreError};
use crate::identity::{Identity, PeerInfo};
use crate::network::ConnectionManager;
use crate::peers::{Peer, PeerTable};
use crate::replication::ReplicationEngine;
use crate::store::{InsertOutcome, StoreStats, TripleStore};
use crate::triple::{Triple, TriplePattern};

/// Transport events buffered between connections and the engine.
const EVENT_QUEUE: usize = 1024;

/// A running degdb node.
pub struct Node {
    config: NodeConfig,
    identity: Arc<Identity>,
    local: PeerInfo,
    listen_addr: SocketAddr,
    store: Arc<TripleStore>,
    peers: Arc<PeerTable>,
    connections: Arc<ConnectionManager>,
    engine: Arc<ReplicationEngine>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind the peer listener, load identity and store, and start gossiping.
    ///
    /// Fails on an invalid config, an unbindable address, or a key or
    /// database file that cannot be opened. Unreachable seeds are not an
    /// error; they are retried by the maintenance loop.
    pub async fn start(config: NodeConfig) -> DegResult<Self> {
        config.validate()?;

        let listener = TcpListener::bind((config.listen_addr.as_str(), config.port))
            .await
            .map_err(NetworkError::from)?;
        let listen_addr = listener.local_addr().map_err(NetworkError::from)?;
        let port = listen_addr.port();
        if config.paths_follow_ephemeral_port() {
            tracing::warn!(
                port,
                key = %config.key_path(port).display(),
                database = %config.database_path(port).display(),
                "no fixed port configured; key and database paths will differ on the next start"
            );
        }

        let (identity, store) = if config.in_memory {
            (Identity::generate(), TripleStore::memory_only())
        } else {
            let identity = Identity::generate_or_load(&config.key_path(port))?;
            let store = TripleStore::open(&config.database_path(port))?;
            (identity, store)
        };
        let identity = Arc::new(identity);
        let store = Arc::new(store);
        let local = identity.local_peer(config.listen_addr.clone(), port, config.disk_allocated);

        tracing::info!(
            peer = %local.id,
            addr = %listen_addr,
            triples = store.len(),
            persistent = store.is_persistent(),
            "starting degdb node"
        );

        let peers = Arc::new(PeerTable::with_max_peers(
            identity.id(),
            config.liveness_timeout(),
            config.max_peers,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&identity),
            local.clone(),
            Arc::clone(&peers),
            config.network_config(),
            events_tx,
            shutdown_rx.clone(),
        ));
        let engine = Arc::new(ReplicationEngine::new(
            Arc::clone(&identity),
            Arc::clone(&store),
            Arc::clone(&peers),
            Arc::clone(&connections),
            config.replication_config(),
        ));

        let tasks = vec![
            tokio::spawn(Arc::clone(&connections).listen(listener)),
            tokio::spawn(Arc::clone(&engine).run(events_rx, shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&engine).maintenance_loop(shutdown_rx)),
        ];
        engine.dial_seeds();

        Ok(Self {
            config,
            identity,
            local,
            listen_addr,
            store,
            peers,
            connections,
            engine,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// The descriptor this node advertises.
    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn id(&self) -> &str {
        self.identity.id()
    }

    /// The bound peer listener address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// An address other local processes can dial, substituting loopback
    /// for an unspecified bind address.
    pub fn dial_addr(&self) -> String {
        let ip = if self.listen_addr.ip().is_unspecified() {
            match self.listen_addr {
                SocketAddr::V4(_) => "127.0.0.1".to_string(),
                SocketAddr::V6(_) => "[::1]".to_string(),
            }
        } else {
            match self.listen_addr {
                SocketAddr::V4(a) => a.ip().to_string(),
                SocketAddr::V6(a) => format!("[{}]", a.ip()),
            }
        };
        format!("{ip}:{}", self.listen_addr.port())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Every stored triple.
    pub fn triples(&self) -> Vec<Triple> {
        self.store.all()
    }

    /// Every known peer, whatever its liveness.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.list()
    }

    /// IDs of peers with an established connection.
    pub fn connected_peers(&self) -> Vec<String> {
        self.connections.connected_peers()
    }

    /// Commit triples and gossip them; returns how many were new.
    pub fn insert(&self, triples: Vec<Triple>) -> DegResult<usize> {
        Ok(self.insert_detailed(triples)?.count())
    }

    /// Like [`Self::insert`], reporting duplicates and rejections too.
    pub fn insert_detailed(&self, triples: Vec<Triple>) -> DegResult<InsertOutcome> {
        Ok(self.engine.insert_local(triples)?)
    }

    /// [`Self::insert_detailed`] on the blocking pool, for async callers.
    ///
    /// The store commit syncs to disk, which must not run on a runtime
    /// worker shared with connection tasks.
    pub async fn insert_async(&self, triples: Vec<Triple>) -> DegResult<InsertOutcome> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.insert_local(triples))
            .await
            .map_err(|e| StoreError::Task {
                message: e.to_string(),
            })?
            .map_err(Into::into)
    }

    pub fn query(&self, pattern: &TriplePattern) -> Vec<Triple> {
        self.store.query(pattern)
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Dial a peer by address and wait for the handshake.
    pub async fn connect(&self, addr: &str) -> DegResult<PeerInfo> {
        Ok(self.connections.dial_addr(addr, None).await?)
    }

    /// Summary of the node's state.
    pub fn info(&self) -> NodeInfo {
        let stats = self.stats();
        NodeInfo {
            peer: self.local.clone(),
            listen_addr: self.listen_addr,
            triples: stats.triples,
            disk_used: stats.bytes,
            known_peers: self.peers.len(),
            connected_peers: self.connections.connection_count(),
            persistent: self.store.is_persistent(),
        }
    }

    /// Stop every task and close all connections.
    pub async fn shutdown(self) {
        tracing::info!(peer = %self.local.id, "shutting down degdb node");
        let _ = self.shutdown.send(true);
        self.connections.close_all();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "node task ended abnormally");
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.local.id)
            .field("listen_addr", &self.listen_addr)
            .field("store", &self.store)
            .field("engine", &self.engine)
            .finish()
    }
}

/// Summary information about a node.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeInfo {
    pub peer: PeerInfo,
    pub listen_addr: SocketAddr,
    pub triples: usize,
    pub disk_used: u64,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub persistent: bool,
}

impl std::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "degdb node {}", self.peer.id)?;
        writeln!(f, "  listening:    {}", self.listen_addr)?;
        writeln!(f, "  triples:      {}", self.triples)?;
        writeln!(
            f,
            "  disk:         {} / {} bytes",
            self.disk_used, self.peer.disk_allocated
        )?;
        writeln!(
            f,
            "  peers:        {} known, {} connected",
            self.known_peers, self.connected_peers
        )?;
        writeln!(f, "  persistent:   {}", self.persistent)?;
        Ok(())
    }
}
