//! Worker stage: resolves entity/event ids for an ingested event, writes
//! the event-id→entity-id mapping, and fans out durable writes plus
//! per-tag cache operations.
//!
//! Grounded on `original_source/src/engine/worker/worker.c`'s six-step
//! ingestion sequence; the cmd_queue/op_queue plumbing around it lives in
//! `crate::queues` and `crate::engine`, not here — this module is the
//! per-command logic a worker thread executes once it has dequeued a
//! command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use tagbase_core::{
    CommandKind, DbKey, EventId, KvStore, MmapArray, Op, OpKind, Response, ValidatedCommand,
    WriteCondition, WriterEntry,
};

use crate::container::{
    ContainerCache, ContainerHandle, DB_EVENTS, DB_INT_TO_ENTITY_ID, DB_METADATA,
    DB_STR_TO_ENTITY_ID, META_NEXT_ENTITY_ID, META_NEXT_EVENT_ID,
};
use crate::entity_resolver::EntityResolver;
use crate::error::WorkerError;
use crate::id_manager::{EntityIdAllocator, EventIdAllocator};
use crate::queues::BoundedSender;
use crate::record::EventRecord;

/// Shared, process-wide worker state. Every worker thread holds an `Arc`
/// to the same instance; the entity resolver and id allocators are
/// internally synchronized so concurrent workers never double-allocate
/// an id (a deliberate tightening of the spec's per-thread cache, noted
/// in `DESIGN.md`).
pub struct Worker {
    containers: Arc<ContainerCache>,
    entity_resolver: Arc<EntityResolver>,
    entity_allocator: Arc<EntityIdAllocator>,
    event_allocator: Arc<EventIdAllocator>,
    op_senders: Vec<Vec<BoundedSender<Op>>>,
    writer_tx: BoundedSender<WriterEntry>,
    sync_interval_events: u32,
    events_since_sync: Mutex<HashMap<String, u32>>,
    open_handles: Mutex<HashMap<String, ContainerHandle>>,
}

impl Worker {
    pub fn new(
        containers: Arc<ContainerCache>,
        entity_resolver: Arc<EntityResolver>,
        entity_allocator: Arc<EntityIdAllocator>,
        event_allocator: Arc<EventIdAllocator>,
        op_senders: Vec<Vec<BoundedSender<Op>>>,
        writer_tx: BoundedSender<WriterEntry>,
        sync_interval_events: u32,
    ) -> Self {
        Self {
            containers,
            entity_resolver,
            entity_allocator,
            event_allocator,
            op_senders,
            writer_tx,
            sync_interval_events,
            events_since_sync: Mutex::new(HashMap::new()),
            open_handles: Mutex::new(HashMap::new()),
        }
    }

    fn container_handle(&self, name: &str) -> Result<ContainerHandle, WorkerError> {
        let mut handles = self.open_handles.lock();
        if let Some(handle) = handles.get(name) {
            return Ok(handle.clone());
        }
        let handle = self.containers.get(name)?;
        handles.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn handle(&self, cmd: ValidatedCommand) -> Result<Response, WorkerError> {
        match cmd.kind {
            CommandKind::Event => self.handle_event(cmd),
            other => {
                tracing::error!(?other, "worker stage received a non-event command");
                Err(WorkerError::UnsupportedCommandKind(other))
            }
        }
    }

    fn handle_event(&self, cmd: ValidatedCommand) -> Result<Response, WorkerError> {
        let container_name = cmd.container.expect("validator guarantees `in` on an event");
        let entity = cmd.entity.expect("validator guarantees `entity` on an event");

        let system = self.container_handle(crate::container::SYSTEM_CONTAINER_NAME)?;
        let container = self.container_handle(&container_name)?;

        // Step 1: resolve the entity string to an id, queuing a durable
        // mapping write if this is a new entity.
        let entity_id = self
            .entity_resolver
            .resolve_id(system.env.as_ref(), &self.entity_allocator, &entity)
            .map_err(|e| match e {
                crate::error::IdManagerError::Id(id) => WorkerError::Id(id),
                crate::error::IdManagerError::Storage(s) => WorkerError::Storage(s),
                crate::error::IdManagerError::DanglingEntityId(_) => unreachable!(),
            })?;

        for (string, id) in self.entity_resolver.drain_dirty() {
            self.writer_tx
                .try_send(WriterEntry::new(
                    crate::container::SYSTEM_CONTAINER_NAME,
                    DB_STR_TO_ENTITY_ID,
                    DbKey::Str(string.clone()),
                    id.to_le_bytes().to_vec(),
                    WriteCondition::NoOverwrite,
                ))
                .map_err(WorkerError::Queue)?;
            self.writer_tx
                .try_send(WriterEntry::new(
                    crate::container::SYSTEM_CONTAINER_NAME,
                    DB_INT_TO_ENTITY_ID,
                    DbKey::U32(id),
                    string.into_bytes(),
                    WriteCondition::NoOverwrite,
                ))
                .map_err(WorkerError::Queue)?;
            self.writer_tx
                .try_send(WriterEntry::new(
                    crate::container::SYSTEM_CONTAINER_NAME,
                    DB_METADATA,
                    DbKey::Str(META_NEXT_ENTITY_ID.to_string()),
                    self.entity_allocator.current().to_le_bytes().to_vec(),
                    WriteCondition::Int32GreaterThan,
                ))
                .map_err(WorkerError::Queue)?;
        }

        // Step 2: allocate the next event id for this container.
        let container_for_read = container.clone();
        let event_id = self
            .event_allocator
            .allocate(&container_name, || {
                let tx = container_for_read
                    .env
                    .begin_read()
                    .map_err(tagbase_core::IdError::Storage)?;
                let value = tx
                    .get(DB_METADATA, &DbKey::Str(META_NEXT_EVENT_ID.to_string()))
                    .map_err(tagbase_core::IdError::Storage)?;
                tx.abort();
                Ok(value
                    .map(|b| u32::from_le_bytes(b.try_into().unwrap_or([0; 4])))
                    .unwrap_or(1))
            })
            .map_err(WorkerError::Id)?;

        // Step 3: persist event-id -> entity-id in the container's mmap array.
        container
            .evt_ent
            .set(event_id.0, &entity_id.0.to_le_bytes())
            .map_err(WorkerError::Storage)?;

        // Step 4: emit the serialized event record, periodically the
        // event-id counter, and one entry per matching secondary index.
        let record = EventRecord::new(event_id, container_name.clone(), entity.clone())
            .with_tags(cmd.tags.clone());
        let bytes = record.encode().map_err(WorkerError::Encoding)?;
        self.writer_tx
            .try_send(WriterEntry::new(
                container_name.clone(),
                DB_EVENTS,
                DbKey::U32(event_id.0),
                bytes,
                WriteCondition::NoOverwrite,
            ))
            .map_err(WorkerError::Queue)?;

        let mut counters = self.events_since_sync.lock();
        let counter = counters.entry(container_name.clone()).or_insert(0);
        *counter += 1;
        if *counter >= self.sync_interval_events {
            *counter = 0;
            if let Some(limit) = self.event_allocator.get_last_reserved(&container_name) {
                self.writer_tx
                    .try_send(WriterEntry::new(
                        container_name.clone(),
                        DB_METADATA,
                        DbKey::Str(META_NEXT_EVENT_ID.to_string()),
                        limit.to_le_bytes().to_vec(),
                        WriteCondition::Int32GreaterThan,
                    ))
                    .map_err(WorkerError::Queue)?;
            }
        }
        drop(counters);

        let registry = container.index_registry.read();
        for entry in registry.entries() {
            if let Some(value) = record.tag(&entry.key) {
                let db = crate::container::index_db_name(&entry.key);
                let key = match value {
                    crate::record::TagValue::Str(s) => DbKey::Str(s.clone()),
                    crate::record::TagValue::Int(i) => DbKey::I64(*i),
                };
                self.writer_tx
                    .try_send(WriterEntry::new(
                        container_name.clone(),
                        crate::container::static_db_name(&db),
                        key,
                        event_id.0.to_le_bytes().to_vec(),
                        WriteCondition::Always,
                    ))
                    .map_err(WorkerError::Queue)?;
            }
        }
        drop(registry);

        // Step 5: one op per custom tag, routed to a consumer by hashing
        // the canonical routing key. Every consumer owns the same number
        // of local queues (an invariant the engine enforces at startup).
        let queues_per_consumer = self.op_senders.first().map(|q| q.len()).unwrap_or(1);
        for (key, value) in &record.tags {
            let tag_string = crate::record::canonical_tag_string(key, value);
            let db_key = DbKey::Str(tag_string.clone());
            let op = Op {
                kind: OpKind::BitmapAddValue,
                container: container_name.clone(),
                db: crate::container::DB_INVERTED_EVENT_INDEX,
                db_key,
                value: event_id.0,
            };
            let (consumer_idx, local_idx) =
                crate::queues::route_op(&op.routing_key(), self.op_senders.len(), queues_per_consumer);
            self.op_senders[consumer_idx][local_idx]
                .try_send(op)
                .map_err(WorkerError::Queue)?;
        }

        Ok(Response::EventIds(vec![EventId(event_id.0)]))
    }
}
