//! Bidirectional entity string/id resolution with a writer-drained dirty
//! list.
//!
//! Grounded on `original_source/include/engine/entity_resolver/entity_resolver.h`'s
//! `resolve_id`/`resolve_string` pair; the original shares one intrusive
//! node list between both hash indexes, replaced here with two
//! independently-evicting `lru::LruCache` instances (a pragmatic
//! simplification recorded in `DESIGN.md` — the bijection invariant is
//! preserved by always inserting into both on the same call, it is just
//! not backed by a single physical list).

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use tagbase_core::{DbKey, EntityId, KvStore};

use crate::container::{DB_INT_TO_ENTITY_ID, DB_STR_TO_ENTITY_ID};
use crate::error::IdManagerError;
use crate::id_manager::EntityIdAllocator;

struct Inner {
    by_string: LruCache<String, u32>,
    by_id: HashMap<u32, String>,
    /// `(string, id)` pairs awaiting a durable write, drained by the
    /// writer via a lock-swap.
    dirty: Vec<(String, u32)>,
}

/// Resolves external entity strings to internal `u32` ids and back,
/// caching both directions and queuing new mappings for the writer.
pub struct EntityResolver {
    inner: Mutex<Inner>,
}

impl EntityResolver {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                by_string: LruCache::new(capacity),
                by_id: HashMap::new(),
                dirty: Vec::new(),
            }),
        }
    }

    /// Resolves `entity` to its internal id, consulting the cache, then
    /// the system container's `str→entity-id` database, then allocating a
    /// fresh id and queuing the mapping for durable persistence.
    pub fn resolve_id(
        &self,
        system_env: &dyn KvStore,
        allocator: &EntityIdAllocator,
        entity: &str,
    ) -> Result<EntityId, IdManagerError> {
        if let Some(&id) = self.inner.lock().by_string.peek(entity) {
            return Ok(EntityId(id));
        }

        let tx = system_env.begin_read()?;
        let existing = tx.get(DB_STR_TO_ENTITY_ID, &DbKey::Str(entity.to_string()))?;
        tx.abort();
        if let Some(bytes) = existing {
            let id = u32::from_le_bytes(bytes.try_into().unwrap_or([0; 4]));
            self.insert_resolved(entity, id);
            return Ok(EntityId(id));
        }

        let id = allocator.allocate()?;
        self.insert_resolved(entity, id.0);
        self.inner.lock().dirty.push((entity.to_string(), id.0));
        tracing::debug!(entity, id = id.0, "allocated new entity id");
        Ok(id)
    }

    /// Resolves an internal id back to its external string. An id with
    /// no matching mapping is a consistency fault — every id a
    /// worker hands out is always paired with a durable mapping before
    /// any event referencing it becomes visible to a query.
    pub fn resolve_string(
        &self,
        system_env: &dyn KvStore,
        id: u32,
    ) -> Result<String, IdManagerError> {
        if let Some(s) = self.inner.lock().by_id.get(&id) {
            return Ok(s.clone());
        }

        let tx = system_env.begin_read()?;
        let existing = tx.get(DB_INT_TO_ENTITY_ID, &DbKey::U32(id))?;
        tx.abort();
        match existing {
            Some(bytes) => {
                let s = String::from_utf8_lossy(&bytes).into_owned();
                self.insert_resolved(&s, id);
                Ok(s)
            }
            None => Err(IdManagerError::DanglingEntityId(id)),
        }
    }

    fn insert_resolved(&self, entity: &str, id: u32) {
        let mut inner = self.inner.lock();
        inner.by_string.put(entity.to_string(), id);
        inner.by_id.insert(id, entity.to_string());
    }

    /// Drains the dirty list for the writer to persist as two entries per
    /// mapping (`str→id`, `id→str`), both `NO_OVERWRITE` since a mapping
    /// is immutable once assigned.
    pub fn drain_dirty(&self) -> Vec<(String, u32)> {
        std::mem::take(&mut self.inner.lock().dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_manager::EntityIdAllocator;
    use tagbase_redb::RedbEnvironment;

    fn open_env() -> (tempfile::TempDir, RedbEnvironment) {
        let dir = tempfile::tempdir().unwrap();
        let env = RedbEnvironment::open(dir.path().join("env.redb")).unwrap();
        env.open_db(DB_STR_TO_ENTITY_ID, false).unwrap();
        env.open_db(DB_INT_TO_ENTITY_ID, false).unwrap();
        (dir, env)
    }

    #[test]
    fn resolve_id_allocates_once_and_caches() {
        let (_dir, env) = open_env();
        let allocator = EntityIdAllocator::seeded(0);
        let resolver = EntityResolver::new(16);
        let a = resolver.resolve_id(&env, &allocator, "user-1").unwrap();
        let b = resolver.resolve_id(&env, &allocator, "user-1").unwrap();
        assert_eq!(a.0, b.0);
        assert_eq!(resolver.drain_dirty(), vec![("user-1".to_string(), a.0)]);
    }

    #[test]
    fn resolve_string_fails_for_unknown_id() {
        let (_dir, env) = open_env();
        let resolver = EntityResolver::new(16);
        let err = resolver.resolve_string(&env, 999).unwrap_err();
        assert!(matches!(err, IdManagerError::DanglingEntityId(999)));
    }

    #[test]
    fn resolve_id_reuses_persisted_mapping_across_instances() {
        let (_dir, env) = open_env();
        let allocator = EntityIdAllocator::seeded(0);
        let id = {
            let resolver = EntityResolver::new(16);
            resolver.resolve_id(&env, &allocator, "user-1").unwrap()
        };

        let mut tx = env.begin_write().unwrap();
        tx.put(
            DB_STR_TO_ENTITY_ID,
            &DbKey::Str("user-1".to_string()),
            &id.0.to_le_bytes(),
            tagbase_core::Overwrite::Allow,
        )
        .unwrap();
        tx.commit().unwrap();

        let resolver2 = EntityResolver::new(16);
        let again = resolver2.resolve_id(&env, &allocator, "user-1").unwrap();
        assert_eq!(again.0, id.0);
        assert!(resolver2.drain_dirty().is_empty());
    }
}
