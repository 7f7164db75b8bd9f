//! Peer-to-peer transport: framing, handshake and connection management.
//!
//! - [`message`] — the closed [`Message`] enum and length-prefixed framing
//! - [`handshake`] — per-connection state machine and identity exchange
//! - [`connection`] — [`ConnectionManager`]: listen, dial, send, broadcast

pub mod connection;
pub mod handshake;
pub mod message;

use std::time::Duration;

use crate::error::NetworkError;
use crate::identity::PeerInfo;

pub use connection::{BroadcastReport, ConnectionManager};
pub use handshake::ConnectionState;
pub use message::{InsertMessage, Message, MessageId};

/// Wire protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Result type for network operations.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Transport tunables.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Bounded outbound queue per connection.
    pub outbound_queue: usize,
    /// How long [`ConnectionManager::send_queued`] waits for queue room.
    pub send_timeout: Duration,
    pub max_frame_bytes: usize,
    /// Known peers piggybacked on each handshake.
    pub peer_sample_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            outbound_queue: 256,
            send_timeout: Duration::from_secs(5),
            max_frame_bytes: 16 * 1024 * 1024,
            peer_sample_size: 8,
        }
    }
}

/// What the transport reports to the replication engine.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A handshake completed and the connection is in the active set.
    Connected {
        peer: PeerInfo,
        known_peers: Vec<PeerInfo>,
    },
    /// A frame arrived on an established connection.
    Received { from: String, message: Message },
    /// An established connection closed.
    Disconnected { peer: String },
}
