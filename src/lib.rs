// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # degdb
//!
//! A peer-to-peer store of signed subject-predicate-object triples. Every node
//! holds a durable, indexed copy of the triples it has seen and gossips newly
//! committed ones to its peers until the network converges.
//!
//! ## Architecture
//!
//! - **Identity** (`identity`): ed25519 keypair; the peer ID is the hex public key
//! - **Triples** (`triple`): canonical encoding, content identity, signatures
//! - **Store** (`store`): verified, deduplicated, indexed set backed by redb
//! - **Peers** (`peers`): known-peer table with liveness tracking
//! - **Network** (`network`): framed messages, handshake, connection manager
//! - **Replication** (`replication`): TTL-bounded gossip, seen-set, reconciliation
//! - **Node** (`node`): owns the above and exposes the control-surface operations
//!
//! ## Library usage
//!
//! ```no_run
//! use degdb::config::NodeConfig;
//! use degdb::node::Node;
//! use degdb::triple::{Triple, TriplePattern};
//!
//! # async fn demo() -> degdb::error::DegResult<()> {
//! let node = Node::start(NodeConfig::memory_only()).await?;
//! node.insert(vec![Triple::new("/m/02mjmr", "/type/object/name", "Barack Obama")])?;
//! let about = node.query(&TriplePattern::any().with_subject("/m/02mjmr"));
//! assert_eq!(about.len(), 1);
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod network;
pub mod node;
pub mod peers;
pub mod replication;
pub mod store;
pub mod triple;
