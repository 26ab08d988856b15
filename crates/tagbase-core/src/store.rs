//! Storage-agnostic contracts for the key/value substrate and the
//! growable mmap array. `tagbase-redb` provides the concrete
//! implementation; this crate only fixes the shape every backend must
//! honor so the pipeline stages never depend on `redb` directly.
//!
//! Grounded on `txpipe-dolos/crates/core/src/state.rs`'s trait-plus-value
//! pattern (`Entity` / `EntityValue` there correspond to `KvStore` /
//! opaque byte values here) and on `original_source/include/core/map.h`
//! plus `include/engine/container/container_db.h` for the exact
//! put/get/cursor contract.

use crate::error::StorageError;
use std::borrow::Cow;

/// A tagged-union key, mirroring `original_source`'s `map_key_t`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbKey {
    Str(String),
    U32(u32),
    I64(i64),
}

impl DbKey {
    /// Canonical byte encoding used for ordering and as a cache/routing
    /// key input. Strings are written verbatim (already ordered
    /// lexicographically); integers use big-endian so byte order matches
    /// numeric order.
    pub fn to_sort_bytes(&self) -> Vec<u8> {
        match self {
            DbKey::Str(s) => s.as_bytes().to_vec(),
            DbKey::U32(v) => v.to_be_bytes().to_vec(),
            DbKey::I64(v) => v.to_be_bytes().to_vec(),
        }
    }
}

impl From<&str> for DbKey {
    fn from(value: &str) -> Self {
        DbKey::Str(value.to_owned())
    }
}

impl From<String> for DbKey {
    fn from(value: String) -> Self {
        DbKey::Str(value)
    }
}

impl From<u32> for DbKey {
    fn from(value: u32) -> Self {
        DbKey::U32(value)
    }
}

impl From<i64> for DbKey {
    fn from(value: i64) -> Self {
        DbKey::I64(value)
    }
}

/// Whether a `put` should refuse to overwrite an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    Allow,
    Refuse,
}

/// A cursor over a named database's key/value pairs in key order.
pub trait Cursor {
    fn next(&mut self) -> Result<Option<(DbKey, Cow<'_, [u8]>)>, StorageError>;
}

/// A single read or write transaction against one container's
/// environment. Transactions are single-threaded: the backend is free to
/// assume no concurrent use of the same `Transaction` value.
pub trait Transaction {
    fn put(
        &mut self,
        db: &str,
        key: &DbKey,
        value: &[u8],
        overwrite: Overwrite,
    ) -> Result<bool, StorageError>;

    fn get(&self, db: &str, key: &DbKey) -> Result<Option<Vec<u8>>, StorageError>;

    fn delete(&mut self, db: &str, key: &DbKey) -> Result<bool, StorageError>;

    fn cursor(&self, db: &str) -> Result<Box<dyn Cursor + '_>, StorageError>;

    /// Cursor restricted to `start..end` in canonical sort-byte order
    /// (half-open, `end` exclusive when `Some`).
    fn range(
        &self,
        db: &str,
        start: Option<&DbKey>,
        end: Option<&DbKey>,
    ) -> Result<Box<dyn Cursor + '_>, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    fn abort(self: Box<Self>);
}

/// One environment (the unit the KV backend calls a "database" or
/// "store"), hosting several named sub-databases plus duplicate-key
/// databases for secondary indexes.
pub trait KvStore: Send + Sync {
    fn open_db(&self, name: &str, allow_duplicates: bool) -> Result<(), StorageError>;

    fn begin_read(&self) -> Result<Box<dyn Transaction>, StorageError>;

    fn begin_write(&self) -> Result<Box<dyn Transaction>, StorageError>;
}

/// A growable, fixed-stride, mmap-backed array. `get`
/// returns an owned copy rather than a raw pointer: the spec's "pointer
/// valid only while the read lock is held" constraint is expressed in
/// Rust as a borrow scoped to the call, which the backend already
/// releases before returning, so callers get a `Vec<u8>` instead of a
/// lifetime-bound slice. This keeps the trait object-safe while
/// preserving the documented hazard (the backend still takes its
/// internal read lock for the duration of the copy).
pub trait MmapArray: Send + Sync {
    fn item_size(&self) -> usize;

    fn get(&self, index: u32) -> Result<Option<Vec<u8>>, StorageError>;

    fn set(&self, index: u32, bytes: &[u8]) -> Result<(), StorageError>;

    fn capacity(&self) -> u64;
}
