//! Writer stage: the single durable-commit sink.
//!
//! Grounded on `original_source/src/engine/engine_writer/engine_writer.c`'s
//! `_group_dirty_copies_by_container` / `_flush_dirty_snapshots_to_db`
//! batch loop: drain a bounded number of messages, group their entries by
//! container, open one write transaction per container, apply each entry
//! per its write condition, commit, then bump `flush_version` on every
//! entry that asked for it.

use std::collections::HashMap;

use tagbase_core::{DbKey, KvStore, Transaction, WriteCondition, WriterEntry};

use crate::container::ContainerCache;
use crate::error::WriterError;

const MAX_DEQUEUE: usize = 256;

/// The single writer. Owns no state between cycles beyond its container
/// handle cache's lifetime (borrowed from the shared [`ContainerCache`]).
pub struct Writer {
    containers: std::sync::Arc<ContainerCache>,
    queue: crate::queues::BoundedReceiver<WriterEntry>,
}

impl Writer {
    pub fn new(
        containers: std::sync::Arc<ContainerCache>,
        queue: crate::queues::BoundedReceiver<WriterEntry>,
    ) -> Self {
        Self { containers, queue }
    }

    /// Runs one drain-group-commit cycle. Returns the number of entries
    /// consumed (committed or dropped on error), so the caller can decide
    /// whether to spin or back off (spec §4.8/§5's backoff policy, shared
    /// with worker and consumer).
    pub fn run_once(&self) -> usize {
        let entries = self.queue.drain(MAX_DEQUEUE);
        if entries.is_empty() {
            return 0;
        }
        let consumed = entries.len();

        let mut by_container: HashMap<String, Vec<WriterEntry>> = HashMap::new();
        for entry in entries {
            by_container.entry(entry.container.clone()).or_default().push(entry);
        }

        for (container_name, entries) in by_container {
            if let Err(e) = self.commit_container_batch(&container_name, entries) {
                tracing::warn!(
                    container = %container_name,
                    error = %e,
                    "writer failed to commit batch for container; entries are lost this cycle"
                );
            }
        }

        consumed
    }

    fn commit_container_batch(
        &self,
        container_name: &str,
        entries: Vec<WriterEntry>,
    ) -> Result<(), WriterError> {
        let container = self.containers.get(container_name)?;
        let mut tx = container.env.begin_write()?;

        let mut committed: Vec<WriterEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match write_one(tx.as_mut(), &entry) {
                Ok(()) => committed.push(entry),
                Err(e) => {
                    tracing::warn!(
                        container = container_name,
                        db = entry.db,
                        error = %e,
                        "write failed mid-batch; aborting whole container batch"
                    );
                    tx.abort();
                    return Err(e);
                }
            }
        }

        tx.commit()?;

        for entry in &committed {
            if let Some((handle, version)) = &entry.flush_version {
                handle.store(*version, std::sync::atomic::Ordering::Release);
            }
        }

        Ok(())
    }
}

fn write_one(tx: &mut dyn Transaction, entry: &WriterEntry) -> Result<(), WriterError> {
    match entry.condition {
        WriteCondition::Always => {
            tx.put(entry.db, &entry.key, &entry.value, tagbase_core::Overwrite::Allow)?;
            Ok(())
        }
        WriteCondition::NoOverwrite => {
            tx.put(entry.db, &entry.key, &entry.value, tagbase_core::Overwrite::Refuse)?;
            Ok(())
        }
        WriteCondition::Int32GreaterThan => {
            let current = tx
                .get(entry.db, &entry.key)?
                .map(|b| u32::from_le_bytes(b.try_into().unwrap_or([0; 4])))
                .unwrap_or(0);
            let new_value = le_u32(&entry.value).unwrap_or(0);
            if new_value > current {
                tx.put(entry.db, &entry.key, &entry.value, tagbase_core::Overwrite::Allow)?;
            }
            Ok(())
        }
    }
}

fn le_u32(bytes: &[u8]) -> Option<u32> {
    bytes.get(..4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}
