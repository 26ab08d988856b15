//! Consumer stage: applies batched ops to the bitmap cache under
//! copy-on-write, tracks dirty entries, and periodically builds flush
//! batches for the writer.
//!
//! Grounded on `original_source/src/engine/consumer/consumer.c`'s
//! `_process_cache_msgs` batch loop.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_epoch as epoch;
use tagbase_core::{Bitmap, DbKey, KvStore, Op, OpKind, WriteCondition, WriterEntry};

use crate::cache::{BitmapCache, CacheEntry};
use crate::container::ContainerCache;
use crate::error::{CacheError, ConsumerError};
use crate::queues::BoundedReceiver;

const MAX_BATCH: usize = 512;

/// One consumer: owns a slice of op-queues and its own bitmap cache.
/// Single-writer per cache shard.
pub struct Consumer {
    id: usize,
    containers: Arc<ContainerCache>,
    cache: Arc<BitmapCache>,
    queues: Vec<BoundedReceiver<Op>>,
    writer_tx: crate::queues::BoundedSender<WriterEntry>,
    flush_every_n_cycles: u32,
    cycles: u32,
    retired_since_reclaim: u32,
    reclaim_threshold: u32,
}

impl Consumer {
    pub fn new(
        id: usize,
        containers: Arc<ContainerCache>,
        num_shards: usize,
        cache_capacity_per_shard: usize,
        queues: Vec<BoundedReceiver<Op>>,
        writer_tx: crate::queues::BoundedSender<WriterEntry>,
        flush_every_n_cycles: u32,
    ) -> Self {
        Self {
            id,
            containers,
            cache: Arc::new(BitmapCache::new(num_shards, cache_capacity_per_shard)),
            queues,
            writer_tx,
            flush_every_n_cycles,
            cycles: 0,
            retired_since_reclaim: 0,
            reclaim_threshold: 64,
        }
    }

    /// Gives read access to this consumer's cache for the query evaluator
    /// to route cache lookups.
    pub fn cache(&self) -> &BitmapCache {
        &self.cache
    }

    /// A shared handle to this consumer's cache, cloned once at engine
    /// startup so the query evaluator can route lookups to the right
    /// consumer without needing a reference into the consumer thread
    /// itself.
    pub fn cache_handle(&self) -> Arc<BitmapCache> {
        self.cache.clone()
    }

    /// Runs one batch-drain-apply-flush cycle. Returns the number of ops
    /// applied, so the caller (the engine's consumer thread loop) can
    /// decide whether to spin or back off.
    pub fn run_once(&mut self) -> Result<usize, ConsumerError> {
        let mut batch: HashMap<String, HashMap<String, Vec<Op>>> = HashMap::new();
        let mut applied = 0;
        for queue in &self.queues {
            for op in queue.drain(MAX_BATCH) {
                applied += 1;
                batch
                    .entry(op.container.clone())
                    .or_default()
                    .entry(op.routing_key())
                    .or_default()
                    .push(op);
            }
        }

        for (container_name, by_key) in batch {
            if let Err(e) = self.apply_container_batch(&container_name, by_key) {
                tracing::warn!(container = %container_name, error = %e, "consumer failed to apply batch for container");
            }
        }

        self.cycles += 1;
        if self.cycles >= self.flush_every_n_cycles {
            self.cycles = 0;
            self.flush_dirty()?;
        }

        if self.retired_since_reclaim >= self.reclaim_threshold {
            self.retired_since_reclaim = 0;
            crate::cache::poll();
        }

        Ok(applied)
    }

    fn apply_container_batch(
        &mut self,
        container_name: &str,
        by_key: HashMap<String, Vec<Op>>,
    ) -> Result<(), ConsumerError> {
        let container = self.containers.get(container_name)?;
        let tx = container.env.begin_read()?;

        for (routing_key, ops) in by_key {
            let db = ops[0].db;
            let db_key = ops[0].db_key.clone();

            let (existing_entry, was_cached) = match self.cache.get_for_write(&routing_key) {
                Some(entry) => (Some(entry), true),
                None => (None, false),
            };

            let guard = epoch::pin();
            let base_bitmap = match &existing_entry {
                Some(entry) => entry.read(&guard).clone(),
                None => {
                    let bytes = tx.get(db, &db_key)?;
                    match bytes {
                        Some(bytes) => {
                            Bitmap::deserialize(&bytes).map_err(|e| ConsumerError::Cache(CacheError::from(e)))?
                        }
                        None => Bitmap::new(),
                    }
                }
            };

            let mut mutated = base_bitmap;
            let mut dirty = false;
            for op in &ops {
                match op.kind {
                    OpKind::BitmapAddValue => {
                        if mutated.add(op.value) {
                            dirty = true;
                        }
                    }
                }
            }

            let entry = match existing_entry {
                Some(entry) => {
                    if dirty {
                        entry.swap(mutated, &guard);
                        self.retired_since_reclaim += 1;
                    }
                    entry
                }
                None => {
                    let entry = CacheEntry::new(mutated);
                    entry.version.store(1, std::sync::atomic::Ordering::Release);
                    self.cache.insert(&routing_key, entry.clone());
                    entry
                }
            };
            drop(guard);

            if dirty || !was_cached {
                self.cache.mark_dirty(&routing_key);
            }
            let _ = entry;
        }

        tx.abort();
        Ok(())
    }

    fn flush_dirty(&self) -> Result<(), ConsumerError> {
        for (routing_key, entry) in self.cache.drain_dirty() {
            let guard = epoch::pin();
            let bytes = entry.read(&guard).serialize();
            drop(guard);
            let version = entry.version.load(std::sync::atomic::Ordering::Acquire);

            let Some((container, db, db_key)) = split_routing_key(&routing_key) else {
                tracing::warn!(routing_key, "malformed routing key in dirty set, dropping");
                continue;
            };

            let writer_entry = WriterEntry::new(container, db, db_key, bytes, WriteCondition::Always)
                .with_flush_version(entry.flush_version.clone(), version);
            if self.writer_tx.try_send(writer_entry).is_err() {
                tracing::warn!(consumer = self.id, routing_key, "writer queue full, dropping flush entry for this cycle");
            }
        }
        Ok(())
    }
}

/// Splits `"<container>|<db>|<key>"` back into its parts. The db
/// component is re-interned rather than reconstructed verbatim since
/// `WriterEntry::db` needs a `&'static str`.
fn split_routing_key(routing_key: &str) -> Option<(String, &'static str, DbKey)> {
    let mut parts = routing_key.splitn(3, '|');
    let container = parts.next()?.to_string();
    let db = parts.next()?;
    let key = parts.next()?;
    Some((
        container,
        crate::container::static_db_name(db),
        DbKey::Str(key.to_string()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::op_queue;

    #[test]
    fn applies_batched_adds_and_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let containers = Arc::new(ContainerCache::open(dir.path(), 4).unwrap());
        containers.get("metrics").unwrap().env.open_db(crate::container::DB_INVERTED_EVENT_INDEX, false).ok();

        let (op_tx, op_rx) = op_queue(16);
        let (writer_tx, writer_rx) = crate::queues::writer_queue(16);
        let mut consumer = Consumer::new(0, containers.clone(), 2, 8, vec![op_rx], writer_tx, 1);

        let op = Op {
            kind: OpKind::BitmapAddValue,
            container: "metrics".to_string(),
            db: crate::container::DB_INVERTED_EVENT_INDEX,
            db_key: DbKey::Str("loc:ca".to_string()),
            value: 7,
        };
        op_tx.try_send(op).unwrap();

        let applied = consumer.run_once().unwrap();
        assert_eq!(applied, 1);
        assert!(!writer_rx.is_empty());

        let entry = consumer.cache().get("metrics|inverted_event_index_db|loc:ca").unwrap();
        let guard = epoch::pin();
        assert!(entry.read(&guard).contains(7));
    }
}
