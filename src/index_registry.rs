//! Per-container secondary index registry.
//!
//! Grounded on spec §4.3 and
//! `txpipe-dolos/crates/redb3/src/indexes/mod.rs`'s per-dimension table
//! dispatch pattern (one backing database per registered dimension,
//! driven from an in-memory catalog loaded at open time).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tagbase_core::{DbKey, KvStore, Overwrite, StorageError};

use crate::container::{DB_INDEX_REGISTRY_GLOBAL, DB_INDEX_REGISTRY_LOCAL};
use crate::error::EncodingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexValueType {
    Str,
    I64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub value_type: IndexValueType,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexRegistryError {
    #[error("index key `{0}` already registered")]
    DuplicateKey(String),
    #[error("too many indexes registered (max {0})")]
    TooMany(usize),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// An in-memory catalog of a container's secondary indexes, keyed by tag
/// name, mirrored to a durable registry database.
#[derive(Debug, Clone, Default)]
pub struct IndexRegistry {
    db: &'static str,
    entries: HashMap<String, IndexEntry>,
}

fn encode(entry: &IndexEntry) -> Result<Vec<u8>, EncodingError> {
    bincode::serialize(entry).map_err(|e| EncodingError::Serialize(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<IndexEntry, EncodingError> {
    bincode::deserialize(bytes).map_err(|e| EncodingError::Deserialize(e.to_string()))
}

impl IndexRegistry {
    /// Opens the system container's global registry, seeding it with
    /// `{key:"ts", type:i64}` on first initialization.
    pub fn open_global(env: &dyn KvStore) -> Result<Self, IndexRegistryError> {
        let mut registry = Self::load(env, DB_INDEX_REGISTRY_GLOBAL)?;
        if registry.entries.is_empty() {
            registry.insert(
                env,
                IndexEntry {
                    key: "ts".to_string(),
                    value_type: IndexValueType::I64,
                },
            )?;
        }
        Ok(registry)
    }

    /// Opens a user container's local registry, copying the global
    /// registry's entries into it on first open.
    pub fn open_local(env: &dyn KvStore, global: &IndexRegistry) -> Result<Self, IndexRegistryError> {
        let mut registry = Self::load(env, DB_INDEX_REGISTRY_LOCAL)?;
        if registry.entries.is_empty() {
            for entry in global.entries.values() {
                registry.insert(env, entry.clone())?;
            }
        }
        Ok(registry)
    }

    fn load(env: &dyn KvStore, db: &'static str) -> Result<Self, IndexRegistryError> {
        let tx = env.begin_read()?;
        let mut entries = HashMap::new();
        let mut cursor = tx.cursor(db)?;
        while let Some((_, value)) = cursor.next()? {
            let entry = decode(&value)?;
            entries.insert(entry.key.clone(), entry);
        }
        drop(cursor);
        tx.abort();
        Ok(Self { db, entries })
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Durably, atomically registers a new index, refusing duplicate
    /// keys.
    pub fn insert(&mut self, env: &dyn KvStore, entry: IndexEntry) -> Result<(), IndexRegistryError> {
        if self.entries.contains_key(&entry.key) {
            return Err(IndexRegistryError::DuplicateKey(entry.key));
        }
        if self.entries.len() >= crate::config::MAX_NUM_INDEXES {
            return Err(IndexRegistryError::TooMany(crate::config::MAX_NUM_INDEXES));
        }
        let bytes = encode(&entry)?;
        let mut tx = env.begin_write()?;
        let put = tx.put(self.db, &DbKey::Str(entry.key.clone()), &bytes, Overwrite::Refuse)?;
        if !put {
            tx.abort();
            return Err(IndexRegistryError::DuplicateKey(entry.key));
        }
        tx.commit()?;
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagbase_redb::RedbEnvironment;

    fn open_env() -> (tempfile::TempDir, RedbEnvironment) {
        let dir = tempfile::tempdir().unwrap();
        let env = RedbEnvironment::open(dir.path().join("env.redb")).unwrap();
        env.open_db(DB_INDEX_REGISTRY_GLOBAL, false).unwrap();
        env.open_db(DB_INDEX_REGISTRY_LOCAL, false).unwrap();
        (dir, env)
    }

    #[test]
    fn global_registry_seeds_ts_index() {
        let (_dir, env) = open_env();
        let registry = IndexRegistry::open_global(&env).unwrap();
        assert_eq!(registry.get("ts").unwrap().value_type, IndexValueType::I64);
    }

    #[test]
    fn local_registry_copies_global_entries() {
        let (_dir, env) = open_env();
        let global = IndexRegistry::open_global(&env).unwrap();
        let local = IndexRegistry::open_local(&env, &global).unwrap();
        assert_eq!(local.len(), global.len());
    }

    #[test]
    fn rejects_duplicate_index_key() {
        let (_dir, env) = open_env();
        let mut registry = IndexRegistry::open_global(&env).unwrap();
        let err = registry
            .insert(
                &env,
                IndexEntry {
                    key: "ts".to_string(),
                    value_type: IndexValueType::I64,
                },
            )
            .unwrap_err();
        assert!(matches!(err, IndexRegistryError::DuplicateKey(_)));
    }
}
