//! Durable, indexed triple storage.
//!
//! Two tiers serve different needs:
//!
//! - [`TripleIndex`] — the hot primary set with subject/predicate/object indices
//! - [`DurableTriples`] — the redb database file every insert is committed to
//!
//! [`TripleStore`] composes them. Readers share an `RwLock` over the index;
//! writers serialize on a separate mutex that is held across the durable
//! commit, so a writer waits behind other writers but never behind readers,
//! and the index is only updated once the batch is on disk.

pub mod durable;
pub mod index;

use std::collections::HashSet;
use std::path::Path;

use parking_lot::{Mutex, RwLock};

use crate::error::StoreError;
use crate::triple::{Triple, TripleId, TriplePattern};

pub use durable::DurableTriples;
pub use index::TripleIndex;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What happened to a batch passed to [`TripleStore::insert`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Triples newly persisted by this call, in input order.
    pub inserted: Vec<Triple>,
    /// Valid triples that were already stored (or repeated in the batch).
    pub duplicates: usize,
    /// Triples dropped because their signature did not verify.
    pub rejected: usize,
}

impl InsertOutcome {
    /// Number of newly persisted triples.
    pub fn count(&self) -> usize {
        self.inserted.len()
    }
}

/// Size figures for capacity accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub triples: usize,
    pub bytes: u64,
}

/// The node's set of verified triples.
pub struct TripleStore {
    index: RwLock<TripleIndex>,
    writer: Mutex<()>,
    durable: Option<DurableTriples>,
}

impl TripleStore {
    /// A store with no database file; contents are lost on drop.
    pub fn memory_only() -> Self {
        Self {
            index: RwLock::new(TripleIndex::new()),
            writer: Mutex::new(()),
            durable: None,
        }
    }

    /// Open the database file at `path`, rebuilding the indices from it.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let durable = DurableTriples::open(path)?;
        let mut index = TripleIndex::new();
        for (id, triple) in durable.load_all()? {
            index.insert(id, triple);
        }
        tracing::info!(
            path = %path.display(),
            triples = index.len(),
            "opened triple store"
        );
        Ok(Self {
            index: RwLock::new(index),
            writer: Mutex::new(()),
            durable: Some(durable),
        })
    }

    /// Verify and persist `triples`.
    ///
    /// Triples whose signature fails are dropped and counted in
    /// [`InsertOutcome::rejected`]. Inserting an already-stored triple is a
    /// no-op. Fails only if the durable commit fails, in which case nothing
    /// from the batch becomes visible.
    pub fn insert(&self, triples: &[Triple]) -> StoreResult<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        let mut verified = Vec::with_capacity(triples.len());
        for triple in triples {
            match triple.verify() {
                Ok(()) => verified.push((triple.id(), triple)),
                Err(e) => {
                    tracing::warn!(error = %e, subject = %triple.subject, "rejecting triple");
                    outcome.rejected += 1;
                }
            }
        }

        let _write = self.writer.lock();

        let mut seen = HashSet::with_capacity(verified.len());
        let fresh: Vec<(TripleId, &Triple)> = {
            let index = self.index.read();
            verified
                .into_iter()
                .filter(|(id, _)| !index.contains(id) && seen.insert(*id))
                .collect()
        };
        outcome.duplicates = triples.len() - outcome.rejected - fresh.len();

        if fresh.is_empty() {
            return Ok(outcome);
        }

        if let Some(durable) = &self.durable {
            durable.put_batch(&fresh)?;
        }

        let mut index = self.index.write();
        for (id, triple) in fresh {
            index.insert(id, triple.clone());
            outcome.inserted.push(triple.clone());
        }
        drop(index);

        tracing::debug!(
            inserted = outcome.count(),
            duplicates = outcome.duplicates,
            rejected = outcome.rejected,
            "committed triples"
        );
        Ok(outcome)
    }

    /// Pattern lookup; `None` positions are wildcards.
    pub fn query(&self, pattern: &TriplePattern) -> Vec<Triple> {
        self.index.read().query(pattern)
    }

    /// Every stored triple.
    pub fn all(&self) -> Vec<Triple> {
        self.index.read().all()
    }

    /// Membership by triple identity.
    pub fn contains(&self, id: &TripleId) -> bool {
        self.index.read().contains(id)
    }

    /// Identities of every stored triple.
    pub fn ids(&self) -> Vec<TripleId> {
        self.index.read().ids()
    }

    /// Stored triples whose identity is not in `known`.
    pub fn missing_from(&self, known: &HashSet<TripleId>) -> Vec<Triple> {
        let index = self.index.read();
        index
            .ids()
            .into_iter()
            .filter(|id| !known.contains(id))
            .filter_map(|id| index.get(&id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        StoreStats {
            triples: index.len(),
            bytes: index.bytes(),
        }
    }

    /// Whether inserts are written to a database file.
    pub fn is_persistent(&self) -> bool {
        self.durable.is_some()
    }
}

impl std::fmt::Debug for TripleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripleStore")
            .field("triples", &self.len())
            .field("durable", &self.durable)
            .finish()
    }
}
