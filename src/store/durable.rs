//! ACID-durable triple table backed by redb.
//!
//! Each node owns one database file. Every batch is written in a single write
//! transaction and committed with redb's default `Durability::Immediate`, so
//! a batch is fsynced before [`DurableTriples::put_batch`] returns.

use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::StoreResult;
use crate::triple::{Triple, TripleId};

/// Triple ID (32 bytes) → bincode-encoded [`Triple`].
const TRIPLES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("triples");

/// The on-disk tier of a [`crate::store::TripleStore`].
pub struct DurableTriples {
    db: Database,
    path: PathBuf,
}

impl DurableTriples {
    /// Open or create the database file at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io { source: e })?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", path.display()),
        })?;

        // Create the table up front so read transactions never see it missing.
        let txn = db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        txn.open_table(TRIPLES_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Write a batch of triples in one transaction.
    pub fn put_batch(&self, entries: &[(TripleId, &Triple)]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let mut table = txn.open_table(TRIPLES_TABLE).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            for (id, triple) in entries {
                let encoded =
                    bincode::serialize(triple).map_err(|e| StoreError::Serialization {
                        message: format!("failed to serialize triple {id}: {e}"),
                    })?;
                table
                    .insert(id.as_bytes().as_slice(), encoded.as_slice())
                    .map_err(|e| StoreError::Redb {
                        message: format!("insert failed: {e}"),
                    })?;
            }
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(())
    }

    /// Read every stored triple with its key.
    pub fn load_all(&self) -> StoreResult<Vec<(TripleId, Triple)>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = txn.open_table(TRIPLES_TABLE).map_err(|e| StoreError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        let iter = table.iter().map_err(|e| StoreError::Redb {
            message: format!("iter failed: {e}"),
        })?;

        let mut out = Vec::new();
        for entry in iter {
            let (key, value) = entry.map_err(|e| StoreError::Redb {
                message: format!("read failed: {e}"),
            })?;
            let id = TripleId::from_slice(key.value()).ok_or_else(|| StoreError::Serialization {
                message: format!("stored key has {} bytes, expected 32", key.value().len()),
            })?;
            let triple: Triple =
                bincode::deserialize(value.value()).map_err(|e| StoreError::Serialization {
                    message: format!("failed to decode triple {id}: {e}"),
                })?;
            out.push((id, triple));
        }
        Ok(out)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for DurableTriples {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTriples")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use tempfile::TempDir;

    #[test]
    fn put_and_load() {
        let dir = TempDir::new().unwrap();
        let db = DurableTriples::open(&dir.path().join("node.db")).unwrap();
        let identity = Identity::generate();
        let triple = Triple::new("s", "p", "o").signed_by(&identity);

        db.put_batch(&[(triple.id(), &triple)]).unwrap();
        let loaded = db.load_all().unwrap();
        assert_eq!(loaded, vec![(triple.id(), triple)]);
    }

    #[test]
    fn empty_database_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let db = DurableTriples::open(&dir.path().join("node.db")).unwrap();
        assert!(db.load_all().unwrap().is_empty());
    }

    #[test]
    fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("node.db");
        let identity = Identity::generate();
        let triple = Triple::new("s", "p", "o").signed_by(&identity);

        {
            let db = DurableTriples::open(&path).unwrap();
            db.put_batch(&[(triple.id(), &triple)]).unwrap();
        }

        let db = DurableTriples::open(&path).unwrap();
        assert_eq!(db.load_all().unwrap().len(), 1);
    }
}
