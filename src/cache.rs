//! The sharded, EBR-protected bitmap cache, consumer-local per
//! the decision in `DESIGN.md` (open question #1): each consumer owns its
//! own set of shards, one per op-queue it drains, so "sharded" and
//! "consumer-local" collapse into a single structure.
//!
//! Grounded on `original_source/src/engine/consumer/consumer.c`'s cache
//! entry lifecycle (copy-on-write on a cache hit, atomic swap, EBR
//! retirement of the old pointer, dirty-list linking) and
//! `include/core/ebr.h`'s epoch-section API, expressed here with
//! `crossbeam_epoch` instead of the original's `ck_epoch`. The raw
//! intrusive pointer lists from the source are replaced here with a
//! `HashMap` (the hash index) plus a
//! `VecDeque` (LRU order) and a `HashSet` (dirty set) keyed by the same
//! small `String` handle — no raw pointers, no double-intrusion.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use tagbase_core::{Bitmap, FlushVersionHandle};

/// One cache entry: an epoch-guarded pointer to the current bitmap plus
/// version bookkeeping.
pub struct CacheEntry {
    bitmap: Atomic<Bitmap>,
    pub version: AtomicU64,
    pub flush_version: FlushVersionHandle,
    refcount: AtomicU32,
}

impl CacheEntry {
    pub fn new(bitmap: Bitmap) -> Arc<Self> {
        Arc::new(Self {
            bitmap: Atomic::new(bitmap),
            version: AtomicU64::new(0),
            flush_version: Arc::new(AtomicU64::new(0)),
            refcount: AtomicU32::new(0),
        })
    }

    /// Dirty iff `version > flush_version`.
    pub fn is_dirty(&self) -> bool {
        self.version.load(Ordering::Acquire) > self.flush_version.load(Ordering::Acquire)
    }

    /// Borrow the current bitmap inside an EBR section. The returned
    /// reference must not outlive `guard`.
    pub fn read<'g>(&self, guard: &'g epoch::Guard) -> &'g Bitmap {
        let shared = self.bitmap.load(Ordering::Acquire, guard);
        // Safety: entries always hold a non-null bitmap; a null entry
        // would be a consistency fault this type's invariants never produce.
        unsafe { shared.as_ref() }.expect("cache entry holds a null bitmap")
    }

    /// Copy-on-write swap: the caller already cloned the bitmap read via
    /// [`CacheEntry::read`], mutated the clone, and hands it back here.
    /// The old pointer is retired into the epoch's garbage list rather
    /// than freed immediately, so any reader still inside the EBR section
    /// that observed it stays valid.
    pub fn swap(&self, new_bitmap: Bitmap, guard: &epoch::Guard) {
        let new = Owned::new(new_bitmap);
        let old = self.bitmap.swap(new, Ordering::AcqRel, guard);
        self.version.fetch_add(1, Ordering::AcqRel);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
    }

    fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.refcount.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_idle(&self) -> bool {
        self.refcount.load(Ordering::SeqCst) == 0
    }
}

struct Shard {
    map: HashMap<String, Arc<CacheEntry>>,
    lru: VecDeque<String>,
    dirty: HashSet<String>,
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            lru: VecDeque::new(),
            dirty: HashSet::new(),
            capacity,
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_front(key.to_string());
    }

    fn evict_if_full(&mut self) {
        while self.map.len() > self.capacity {
            let mut evicted = None;
            for key in self.lru.iter().rev() {
                if self
                    .map
                    .get(key)
                    .map(|e| e.is_idle())
                    .unwrap_or(true)
                {
                    evicted = Some(key.clone());
                    break;
                }
            }
            let Some(key) = evicted else {
                tracing::warn!("bitmap cache shard full and every entry has outstanding references");
                break;
            };
            self.map.remove(&key);
            self.dirty.remove(&key);
            self.lru.retain(|k| k != &key);
            tracing::debug!(key = %key, "evicted bitmap cache entry");
        }
    }
}

/// A sharded bitmap cache owned by exactly one consumer, upholding a
/// single-writer-per-shard invariant. `num_shards` must be a power of
/// two; shard selection is `hash(key) & (num_shards - 1)`.
pub struct BitmapCache {
    shards: Vec<Mutex<Shard>>,
}

impl BitmapCache {
    pub fn new(num_shards: usize, capacity_per_shard: usize) -> Self {
        assert!(num_shards.is_power_of_two(), "num_shards must be a power of two");
        let shards = (0..num_shards)
            .map(|_| Mutex::new(Shard::new(capacity_per_shard)))
            .collect();
        Self { shards }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(key: &str, num_shards: usize) -> usize {
        (xxh3_64(key.as_bytes()) as usize) & (num_shards - 1)
    }

    /// Read-path lookup: does not move LRU, to avoid contention on the
    /// concurrent query path.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let idx = Self::shard_index(key, self.shards.len());
        self.shards[idx].lock().map.get(key).cloned()
    }

    /// Write-path lookup: moves the entry to the LRU head.
    pub fn get_for_write(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let idx = Self::shard_index(key, self.shards.len());
        let mut shard = self.shards[idx].lock();
        let entry = shard.map.get(key).cloned();
        if entry.is_some() {
            shard.touch(key);
        }
        entry
    }

    /// Insert a freshly created entry at the LRU head, evicting the idle
    /// tail if the shard is at capacity.
    pub fn insert(&self, key: &str, entry: Arc<CacheEntry>) {
        let idx = Self::shard_index(key, self.shards.len());
        let mut shard = self.shards[idx].lock();
        shard.map.insert(key.to_string(), entry);
        shard.touch(key);
        shard.evict_if_full();
    }

    /// Link into the shard's dirty set if not already linked.
    pub fn mark_dirty(&self, key: &str) {
        let idx = Self::shard_index(key, self.shards.len());
        self.shards[idx].lock().dirty.insert(key.to_string());
    }

    /// Drain every shard's dirty set, returning `(key, entry)` pairs for
    /// the flush builder.
    pub fn drain_dirty(&self) -> Vec<(String, Arc<CacheEntry>)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            let keys: Vec<String> = shard.dirty.drain().collect();
            for key in keys {
                if let Some(entry) = shard.map.get(&key) {
                    out.push((key, entry.clone()));
                }
            }
        }
        out
    }

    pub fn acquire(&self, entry: &Arc<CacheEntry>) {
        entry.acquire();
    }

    pub fn release(&self, entry: &Arc<CacheEntry>) {
        entry.release();
    }
}

/// Drive a non-blocking EBR reclamation pass: pins the current thread's
/// epoch and flushes its local garbage bag, the Rust analogue of
/// `ebr_poll_nonblocking`.
pub fn poll() {
    let guard = epoch::pin();
    guard.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bm(values: &[u32]) -> Bitmap {
        values.iter().copied().collect()
    }

    #[test]
    fn insert_then_get_hits() {
        let cache = BitmapCache::new(4, 8);
        cache.insert("m|inverted_event_index_db|loc:ca", CacheEntry::new(bm(&[1, 2])));
        assert!(cache.get("m|inverted_event_index_db|loc:ca").is_some());
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn swap_bumps_version_and_is_visible_under_guard() {
        let entry = CacheEntry::new(bm(&[1]));
        assert!(!entry.is_dirty());
        let guard = epoch::pin();
        let mut updated = entry.read(&guard).clone();
        updated.add(2);
        entry.swap(updated, &guard);
        assert_eq!(entry.version.load(Ordering::Acquire), 1);
        assert!(entry.is_dirty());
        assert!(entry.read(&guard).contains(2));
    }

    #[test]
    fn eviction_skips_entries_with_outstanding_refcount() {
        let cache = BitmapCache::new(1, 1);
        let held = CacheEntry::new(bm(&[1]));
        cache.acquire(&held);
        cache.insert("held", held.clone());
        cache.insert("new", CacheEntry::new(bm(&[2])));
        // "held" survives because its refcount is nonzero; "new" may be
        // evicted instead, or the shard may simply exceed capacity by one
        // with a warning, since eviction only targets idle entries and no
        // eviction is forced when none qualify.
        assert!(cache.get("held").is_some());
    }

    #[test]
    fn mark_dirty_then_drain_returns_once() {
        let cache = BitmapCache::new(2, 8);
        cache.insert("k", CacheEntry::new(bm(&[1])));
        cache.mark_dirty("k");
        cache.mark_dirty("k");
        let drained = cache.drain_dirty();
        assert_eq!(drained.len(), 1);
        assert!(cache.drain_dirty().is_empty());
    }
}
