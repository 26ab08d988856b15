//! Container and container cache.
//!
//! A container bundles one KV environment, its named sub-databases, and
//! its mmap arrays. Grounded on
//! `original_source/src/engine/container/container.c` /
//! `container_cache.c` for the two-kind split and the LRU-with-refcount
//! discipline; the on-disk db/file names follow spec §6 exactly (not the
//! original's `eng_sys_dc_t`/`eng_user_dc_t` names, which predate the
//! additive-index design this spec keeps).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;
use tagbase_core::{KvStore, MmapArray};
use tagbase_redb::{MmapArrayFile, RedbEnvironment};

use crate::error::ContainerError;
use crate::index_registry::IndexRegistry;

pub const SYSTEM_CONTAINER_NAME: &str = "__system__";

pub const DB_METADATA: &str = "metadata";
pub const DB_EVENTS: &str = "events";
pub const DB_INVERTED_EVENT_INDEX: &str = "inverted_event_index_db";
pub const DB_INDEX_REGISTRY_LOCAL: &str = "index_registry_local_db";
pub const DB_STR_TO_ENTITY_ID: &str = "str_to_entity_id_db";
pub const DB_INT_TO_ENTITY_ID: &str = "int_to_entity_id_db";
pub const DB_INDEX_REGISTRY_GLOBAL: &str = "index_registry_global_db";

pub const META_NEXT_ENTITY_ID: &str = "next_ent_id";
pub const META_NEXT_EVENT_ID: &str = "next_event_id";

pub fn index_db_name(key: &str) -> String {
    format!("index_{key}_db")
}

/// Interns a database name into a process-wide `&'static str`, the same
/// bounded-leak trick `tagbase-redb` uses for `redb`'s `'static` table
/// definitions (spec bounds the index count at `MAX_NUM_INDEXES`, so the
/// leaked set stays small).
pub fn static_db_name(name: &str) -> &'static str {
    use std::collections::HashMap;
    use std::sync::OnceLock;
    static INTERNED: OnceLock<RwLock<HashMap<String, &'static str>>> = OnceLock::new();
    let table = INTERNED.get_or_init(|| RwLock::new(HashMap::new()));
    if let Some(s) = table.read().get(name) {
        return s;
    }
    let mut guard = table.write();
    if let Some(s) = guard.get(name) {
        return s;
    }
    let leaked: &'static str = Box::leak(name.to_string().into_boxed_str());
    guard.insert(name.to_string(), leaked);
    leaked
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    System,
    User,
}

/// Validates a container (or index-key) name against the filename
/// policy of spec §8: length ≤ 64, no leading/trailing `.`, every
/// character alphanumeric, `_`, or `-`.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name must not be empty");
    }
    if name.len() > crate::config::MAX_CONTAINER_NAME_LEN {
        return Err("name longer than 64 characters");
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err("name may not start or end with `.`");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("name must be alphanumeric, `_`, or `-`");
    }
    Ok(())
}

/// One open container: its environment, its mmap arrays, and its index
/// registry. Shared across threads via `Arc`; the container cache hands
/// out clones of this `Arc` plus a [`ContainerHandle`] that tracks the
/// refcount.
pub struct Container {
    pub name: String,
    pub kind: ContainerKind,
    pub env: Arc<RedbEnvironment>,
    /// `event-id -> entity-id` (user) or `entity-id -> external-id-string` (system).
    pub evt_ent: Arc<MmapArrayFile>,
    pub index_registry: RwLock<IndexRegistry>,
    refcount: AtomicU32,
}

impl Container {
    fn open_system(data_dir: &Path) -> Result<Self, ContainerError> {
        let dir = data_dir.join(SYSTEM_CONTAINER_NAME);
        std::fs::create_dir_all(&dir)?;
        let env = Arc::new(RedbEnvironment::open(dir.join("env.redb"))?);
        env.open_db(DB_METADATA, false)?;
        env.open_db(DB_STR_TO_ENTITY_ID, false)?;
        env.open_db(DB_INT_TO_ENTITY_ID, false)?;
        env.open_db(DB_INDEX_REGISTRY_GLOBAL, false)?;

        let evt_ent = Arc::new(MmapArrayFile::open(
            dir.join("system_ent.bin"),
            crate::config::SYSTEM_ENTITY_SLOT_SIZE,
            1024,
        )?);

        let registry = IndexRegistry::open_global(env.as_ref())?;

        Ok(Self {
            name: SYSTEM_CONTAINER_NAME.to_string(),
            kind: ContainerKind::System,
            env,
            evt_ent,
            index_registry: RwLock::new(registry),
            refcount: AtomicU32::new(0),
        })
    }

    fn open_user(
        data_dir: &Path,
        name: &str,
        global_registry: &IndexRegistry,
    ) -> Result<Self, ContainerError> {
        validate_name(name).map_err(|reason| ContainerError::InvalidName(name.to_string(), reason))?;
        let dir = data_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        let env = Arc::new(RedbEnvironment::open(dir.join("env.redb"))?);
        env.open_db(DB_METADATA, false)?;
        env.open_db(DB_EVENTS, false)?;
        env.open_db(DB_INVERTED_EVENT_INDEX, false)?;
        env.open_db(DB_INDEX_REGISTRY_LOCAL, false)?;

        // Opening a new user container copies the global index registry's
        // bytes into the local registry, then opens the listed secondary
        // index databases.
        let registry = IndexRegistry::open_local(env.as_ref(), global_registry)?;
        for entry in registry.entries() {
            env.open_db(&index_db_name(&entry.key), true)?;
        }

        let evt_ent = Arc::new(MmapArrayFile::open(dir.join("evt_ent.bin"), 4, 1024)?);

        Ok(Self {
            name: name.to_string(),
            kind: ContainerKind::User,
            env,
            evt_ent,
            index_registry: RwLock::new(registry),
            refcount: AtomicU32::new(0),
        })
    }

    pub fn max_event_id(&self) -> Result<u32, ContainerError> {
        let tx = self.env.begin_read()?;
        let value = tx.get(DB_METADATA, &META_NEXT_EVENT_ID.into())?;
        tx.abort();
        Ok(value
            .map(|bytes| u32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])))
            .unwrap_or(1))
    }
}

impl From<std::io::Error> for ContainerError {
    fn from(e: std::io::Error) -> Self {
        ContainerError::Storage(tagbase_core::StorageError::Io(e))
    }
}

impl From<crate::index_registry::IndexRegistryError> for ContainerError {
    fn from(e: crate::index_registry::IndexRegistryError) -> Self {
        use crate::index_registry::IndexRegistryError as E;
        match e {
            E::Storage(s) => ContainerError::Storage(s),
            other => ContainerError::Storage(tagbase_core::StorageError::Encoding(other.to_string())),
        }
    }
}

/// A scoped handle to a container: increments the refcount on creation,
/// decrements it on drop (spec §9's "manual refcount" -> "scoped handle
/// with deterministic release" re-architecture).
pub struct ContainerHandle {
    container: Arc<Container>,
}

impl std::ops::Deref for ContainerHandle {
    type Target = Container;
    fn deref(&self) -> &Container {
        &self.container
    }
}

impl Clone for ContainerHandle {
    fn clone(&self) -> Self {
        self.container.refcount.fetch_add(1, Ordering::SeqCst);
        Self {
            container: self.container.clone(),
        }
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        self.container.refcount.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Slot {
    container: Arc<Container>,
}

/// LRU cache of open containers keyed by name. Monitor-style
/// rwlock: reads for the common-case hit path, briefly upgraded for LRU
/// bookkeeping and for misses.
pub struct ContainerCache {
    data_dir: PathBuf,
    inner: RwLock<LruCache<String, Slot>>,
    system: Arc<Container>,
}

impl ContainerCache {
    pub fn open(data_dir: impl Into<PathBuf>, capacity: usize) -> Result<Self, ContainerError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let system = Arc::new(Container::open_system(&data_dir)?);
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Ok(Self {
            data_dir,
            inner: RwLock::new(LruCache::new(capacity)),
            system,
        })
    }

    pub fn system(&self) -> ContainerHandle {
        self.system.refcount.fetch_add(1, Ordering::SeqCst);
        ContainerHandle {
            container: self.system.clone(),
        }
    }

    /// Get-or-open a user container by name, moving it to the LRU head.
    pub fn get(&self, name: &str) -> Result<ContainerHandle, ContainerError> {
        {
            let mut guard = self.inner.write();
            if let Some(slot) = guard.get(name) {
                slot.container.refcount.fetch_add(1, Ordering::SeqCst);
                return Ok(ContainerHandle {
                    container: slot.container.clone(),
                });
            }
        }

        let registry_snapshot = self.system.index_registry.read().clone();
        let container = Arc::new(Container::open_user(&self.data_dir, name, &registry_snapshot)?);

        let mut guard = self.inner.write();
        if let Some(slot) = guard.get(name) {
            slot.container.refcount.fetch_add(1, Ordering::SeqCst);
            return Ok(ContainerHandle {
                container: slot.container.clone(),
            });
        }
        if guard.len() >= guard.cap().get() {
            self.evict_one(&mut guard);
        }
        container.refcount.fetch_add(1, Ordering::SeqCst);
        let handle = ContainerHandle {
            container: container.clone(),
        };
        guard.put(name.to_string(), Slot { container });
        tracing::info!(container = name, "opened container");
        Ok(handle)
    }

    fn evict_one(&self, guard: &mut LruCache<String, Slot>) {
        // Walk from least-recently-used toward most-recent, evicting the
        // first entry whose refcount is zero.
        let candidates: Vec<String> = guard
            .iter()
            .rev()
            .map(|(k, _)| k.clone())
            .collect();
        for name in candidates {
            if let Some(slot) = guard.peek(&name) {
                if slot.container.refcount.load(Ordering::SeqCst) == 0 {
                    guard.pop(&name);
                    tracing::debug!(container = %name, "evicted idle container from cache");
                    return;
                }
            }
        }
        tracing::warn!("container cache full and every entry has outstanding references");
    }

    /// Callers must have joined all consumers and workers before calling
    /// this.
    pub fn destroy(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_bad_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("trailing.").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
        assert!(validate_name("metrics-v2_prod").is_ok());
    }

    #[test]
    fn opens_and_reuses_user_container() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContainerCache::open(dir.path(), 4).unwrap();
        let a = cache.get("metrics").unwrap();
        let b = cache.get("metrics").unwrap();
        assert_eq!(a.name, b.name);
    }

    #[test]
    fn evicts_idle_containers_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContainerCache::open(dir.path(), 1).unwrap();
        {
            let _a = cache.get("one").unwrap();
        }
        let _b = cache.get("two").unwrap();
        assert_eq!(cache.inner.read().len(), 1);
    }
}
