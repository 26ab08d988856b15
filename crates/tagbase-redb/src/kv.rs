//! `redb`-backed implementation of [`tagbase_core::KvStore`] /
//! [`tagbase_core::Transaction`] / [`tagbase_core::Cursor`].
//!
//! Grounded on `txpipe-dolos/crates/redb3/src/lib.rs`'s `Table` enum
//! (`Value` vs `MultiValue`, dispatched by a runtime flag rather than by
//! type) and its boxed-large-variant `Error` pattern; the database-name
//! catalog (opened lazily, tracked per environment) mirrors
//! `original_source/src/engine/container/container_db.c`'s per-container
//! table bootstrap.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};
use redb::{Database, MultimapTableDefinition, ReadableTable, TableDefinition};

use tagbase_core::{Cursor, DbKey, KvStore, Overwrite, StorageError, Transaction};

#[derive(Debug, thiserror::Error)]
pub enum RedbError {
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    #[error(transparent)]
    Table(#[from] redb::TableError),

    #[error(transparent)]
    Commit(#[from] redb::CommitError),

    #[error(transparent)]
    Storage(#[from] redb::StorageError),

    #[error("database `{0}` was never opened")]
    UnknownDb(String),
}

impl From<redb::TransactionError> for RedbError {
    fn from(e: redb::TransactionError) -> Self {
        RedbError::Transaction(Box::new(e))
    }
}

impl From<RedbError> for StorageError {
    fn from(e: RedbError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// `redb`'s table definitions borrow their name for `'static`; this crate
/// opens a small, fixed set of database names per spec §6 (`metadata`,
/// `events`, `inverted_event_index_db`, one `index_<key>_db` per
/// registered index, ...), so each distinct name is leaked exactly once
/// into a process-wide intern table and reused from then on, rather than
/// re-leaked on every transaction.
fn static_name(name: &str) -> &'static str {
    static INTERNED: OnceLock<Mutex<HashMap<String, &'static str>>> = OnceLock::new();
    let table = INTERNED.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = table.lock();
    if let Some(s) = guard.get(name) {
        return s;
    }
    let leaked: &'static str = Box::leak(name.to_string().into_boxed_str());
    guard.insert(name.to_string(), leaked);
    leaked
}

fn value_table(name: &str) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    TableDefinition::new(static_name(name))
}

fn multimap_table(name: &str) -> MultimapTableDefinition<'static, &'static [u8], &'static [u8]> {
    MultimapTableDefinition::new(static_name(name))
}

/// The scalar type a range's keys decode back into. Inferred from
/// whichever of `start`/`end` is `Some` (its variant is canonical for the
/// whole scan); defaults to `Str` for an unbounded scan, which is the
/// only shape this crate ever unbounded-scans (the inverted-event-index
/// and the index registries, both string-keyed).
#[derive(Debug, Clone, Copy)]
enum DbKeyKind {
    Str,
    U32,
    I64,
}

impl DbKeyKind {
    fn of(key: &DbKey) -> Self {
        match key {
            DbKey::Str(_) => DbKeyKind::Str,
            DbKey::U32(_) => DbKeyKind::U32,
            DbKey::I64(_) => DbKeyKind::I64,
        }
    }

    fn infer(start: Option<&DbKey>, end: Option<&DbKey>) -> Self {
        start.or(end).map(DbKeyKind::of).unwrap_or(DbKeyKind::Str)
    }

    fn decode(self, bytes: &[u8]) -> DbKey {
        match self {
            DbKeyKind::Str => DbKey::Str(String::from_utf8_lossy(bytes).into_owned()),
            DbKeyKind::U32 => DbKey::U32(u32::from_be_bytes(bytes.try_into().unwrap_or([0; 4]))),
            DbKeyKind::I64 => DbKey::I64(i64::from_be_bytes(bytes.try_into().unwrap_or([0; 8]))),
        }
    }
}

/// Flattens a multimap table's `key -> {values}` range into `(key,
/// value)` pairs in key order, each key's duplicate values in their own
/// stored order (spec §4.1's "duplicate-key databases ... for secondary
/// indexes").
fn multimap_range_items<T>(
    table: &T,
    lo: &[u8],
    hi: Option<&[u8]>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, RedbError>
where
    T: redb::ReadableMultimapTable<&'static [u8], &'static [u8]>,
{
    let range = if let Some(hi) = hi {
        table.range(lo..hi)
    } else {
        table.range(lo..)
    }?;

    let mut out = Vec::new();
    for item in range {
        let (key, values) = item?;
        let key_bytes = key.value().to_vec();
        for value in values {
            let value = value?;
            out.push((key_bytes.clone(), value.value().to_vec()));
        }
    }
    Ok(out)
}

/// One container's `redb` environment: a single `Database` plus a
/// registry of the sub-databases opened against it (spec §4.1's
/// "environment ... max number of named sub-databases").
pub struct RedbEnvironment {
    db: Database,
    dbs: RwLock<HashMap<String, bool>>,
}

impl RedbEnvironment {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(RedbError::from)?;
        Ok(Self {
            db,
            dbs: RwLock::new(HashMap::new()),
        })
    }
}

impl KvStore for RedbEnvironment {
    fn open_db(&self, name: &str, allow_duplicates: bool) -> Result<(), StorageError> {
        {
            if let Some(existing) = self.dbs.read().get(name).copied() {
                if existing != allow_duplicates {
                    return Err(StorageError::Encoding(format!(
                        "database `{name}` reopened with a different duplicate-key flag"
                    )));
                }
                return Ok(());
            }
        }
        let wx = self.db.begin_write().map_err(RedbError::from)?;
        if allow_duplicates {
            let _ = wx.open_multimap_table(multimap_table(name)).map_err(RedbError::from)?;
        } else {
            let _ = wx.open_table(value_table(name)).map_err(RedbError::from)?;
        }
        wx.commit().map_err(RedbError::from)?;
        self.dbs.write().insert(name.to_string(), allow_duplicates);
        tracing::debug!(db = name, allow_duplicates, "opened database");
        Ok(())
    }

    fn begin_read(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let tx = self.db.begin_read().map_err(RedbError::from)?;
        Ok(Box::new(RedbReadTransaction {
            tx,
            dbs: self.dbs.read().clone(),
        }))
    }

    fn begin_write(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let tx = self.db.begin_write().map_err(RedbError::from)?;
        Ok(Box::new(RedbWriteTransaction {
            tx: Some(tx),
            dbs: self.dbs.read().clone(),
        }))
    }
}

struct RedbReadTransaction {
    tx: redb::ReadTransaction,
    dbs: HashMap<String, bool>,
}

struct RedbWriteTransaction {
    tx: Option<redb::WriteTransaction>,
    dbs: HashMap<String, bool>,
}

fn multi_mode(dbs: &HashMap<String, bool>, db: &str) -> Result<bool, StorageError> {
    dbs.get(db)
        .copied()
        .ok_or_else(|| RedbError::UnknownDb(db.to_string()).into())
}

impl Transaction for RedbReadTransaction {
    fn put(
        &mut self,
        _db: &str,
        _key: &DbKey,
        _value: &[u8],
        _overwrite: Overwrite,
    ) -> Result<bool, StorageError> {
        Err(StorageError::Backend("put on a read-only transaction".into()))
    }

    fn get(&self, db: &str, key: &DbKey) -> Result<Option<Vec<u8>>, StorageError> {
        if multi_mode(&self.dbs, db)? {
            return Err(StorageError::Backend(format!("{db} is a duplicate-key db; use range")));
        }
        let table = self
            .tx
            .open_table(value_table(db))
            .map_err(RedbError::from)?;
        let key_bytes = key.to_sort_bytes();
        let found = table.get(key_bytes.as_slice()).map_err(RedbError::from)?;
        Ok(found.map(|v| v.value().to_vec()))
    }

    fn delete(&mut self, _db: &str, _key: &DbKey) -> Result<bool, StorageError> {
        Err(StorageError::Backend("delete on a read-only transaction".into()))
    }

    fn cursor(&self, db: &str) -> Result<Box<dyn Cursor + '_>, StorageError> {
        self.range(db, None, None)
    }

    fn range(
        &self,
        db: &str,
        start: Option<&DbKey>,
        end: Option<&DbKey>,
    ) -> Result<Box<dyn Cursor + '_>, StorageError> {
        let kind = DbKeyKind::infer(start, end);
        let lo = start.map(|k| k.to_sort_bytes()).unwrap_or_default();
        let hi = end.map(|k| k.to_sort_bytes());

        let items = if multi_mode(&self.dbs, db)? {
            let table = self
                .tx
                .open_multimap_table(multimap_table(db))
                .map_err(RedbError::from)?;
            multimap_range_items(&table, &lo, hi.as_deref()).map_err(StorageError::from)?
        } else {
            let table = self
                .tx
                .open_table(value_table(db))
                .map_err(RedbError::from)?;
            let range = if let Some(hi) = &hi {
                table.range(lo.as_slice()..hi.as_slice())
            } else {
                table.range(lo.as_slice()..)
            }
            .map_err(RedbError::from)?;
            range
                .filter_map(|r| r.ok())
                .map(|(k, v)| (k.value().to_vec(), v.value().to_vec()))
                .collect()
        };

        Ok(Box::new(OwnedRange {
            kind,
            items: items.into_iter(),
        }))
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

impl Transaction for RedbWriteTransaction {
    fn put(
        &mut self,
        db: &str,
        key: &DbKey,
        value: &[u8],
        overwrite: Overwrite,
    ) -> Result<bool, StorageError> {
        let tx = self.tx.as_ref().expect("transaction already consumed");
        let is_multi = multi_mode(&self.dbs, db)?;
        let key_bytes = key.to_sort_bytes();
        if is_multi {
            let mut table = tx.open_multimap_table(multimap_table(db)).map_err(RedbError::from)?;
            table
                .insert(key_bytes.as_slice(), value)
                .map_err(RedbError::from)?;
            Ok(true)
        } else {
            let mut table = tx.open_table(value_table(db)).map_err(RedbError::from)?;
            if overwrite == Overwrite::Refuse {
                let exists = table.get(key_bytes.as_slice()).map_err(RedbError::from)?.is_some();
                if exists {
                    return Ok(false);
                }
            }
            table
                .insert(key_bytes.as_slice(), value)
                .map_err(RedbError::from)?;
            Ok(true)
        }
    }

    fn get(&self, db: &str, key: &DbKey) -> Result<Option<Vec<u8>>, StorageError> {
        let tx = self.tx.as_ref().expect("transaction already consumed");
        if multi_mode(&self.dbs, db)? {
            return Err(StorageError::Backend(format!("{db} is a duplicate-key db; use range")));
        }
        let table = tx.open_table(value_table(db)).map_err(RedbError::from)?;
        let key_bytes = key.to_sort_bytes();
        let found = table.get(key_bytes.as_slice()).map_err(RedbError::from)?;
        Ok(found.map(|v| v.value().to_vec()))
    }

    fn delete(&mut self, db: &str, key: &DbKey) -> Result<bool, StorageError> {
        let tx = self.tx.as_ref().expect("transaction already consumed");
        let is_multi = multi_mode(&self.dbs, db)?;
        let key_bytes = key.to_sort_bytes();
        if is_multi {
            let mut table = tx.open_multimap_table(multimap_table(db)).map_err(RedbError::from)?;
            let removed = table.remove_all(key_bytes.as_slice()).map_err(RedbError::from)?;
            Ok(removed.count() > 0)
        } else {
            let mut table = tx.open_table(value_table(db)).map_err(RedbError::from)?;
            let removed = table.remove(key_bytes.as_slice()).map_err(RedbError::from)?;
            Ok(removed.is_some())
        }
    }

    fn cursor(&self, db: &str) -> Result<Box<dyn Cursor + '_>, StorageError> {
        self.range(db, None, None)
    }

    fn range(
        &self,
        db: &str,
        start: Option<&DbKey>,
        end: Option<&DbKey>,
    ) -> Result<Box<dyn Cursor + '_>, StorageError> {
        let tx = self.tx.as_ref().expect("transaction already consumed");
        let kind = DbKeyKind::infer(start, end);
        let lo = start.map(|k| k.to_sort_bytes()).unwrap_or_default();
        let hi = end.map(|k| k.to_sort_bytes());

        let items = if multi_mode(&self.dbs, db)? {
            let table = tx.open_multimap_table(multimap_table(db)).map_err(RedbError::from)?;
            multimap_range_items(&table, &lo, hi.as_deref()).map_err(StorageError::from)?
        } else {
            let table = tx.open_table(value_table(db)).map_err(RedbError::from)?;
            let range = if let Some(hi) = &hi {
                table.range(lo.as_slice()..hi.as_slice())
            } else {
                table.range(lo.as_slice()..)
            }
            .map_err(RedbError::from)?;
            range
                .filter_map(|r| r.ok())
                .map(|(k, v)| (k.value().to_vec(), v.value().to_vec()))
                .collect()
        };

        Ok(Box::new(OwnedRange {
            kind,
            items: items.into_iter(),
        }))
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx = self.tx.take().expect("transaction already consumed");
        tx.commit().map_err(RedbError::from)?;
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        if let Some(tx) = self.tx.take() {
            drop(tx);
        }
    }
}

/// Byte-range cursor materialized eagerly from the underlying redb range
/// iterator so that its lifetime doesn't need to track the table guard.
struct OwnedRange {
    kind: DbKeyKind,
    items: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Cursor for OwnedRange {
    fn next(&mut self) -> Result<Option<(DbKey, Cow<'_, [u8]>)>, StorageError> {
        Ok(self.items.next().map(|(k, v)| (self.kind.decode(&k), Cow::Owned(v))))
    }
}
