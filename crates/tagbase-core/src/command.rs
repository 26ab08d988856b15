//! Types that flow between pipeline stages once the validator has
//! accepted a command: the validated command itself (input to the
//! worker), the per-tag operation message (worker → consumer), and the
//! writer entry (worker/consumer → writer).
//!
//! Grounded on `original_source/src/engine/cmd_queue/cmd_queue_msg.c`,
//! `src/engine/bitmap_cache/cache_queue_msg.c`, and
//! `include/engine/engine.h`'s writer-entry shape.

use crate::ast::{AstNode, CommandKind, Literal};
use crate::ids::{EntityId, EventId};
use crate::store::DbKey;
use std::sync::Arc;

/// The validator's output: an AST reduced to exactly the shape its
/// command kind allows, with no duplicate custom tags and a filename-safe
/// container name. Nothing downstream re-checks these invariants.
#[derive(Debug, Clone)]
pub struct ValidatedCommand {
    pub kind: CommandKind,
    /// Target container name (`in`); for `index` commands this is `None`
    /// since indexes are registered globally.
    pub container: Option<String>,
    /// `entity` (required for `event`).
    pub entity: Option<String>,
    /// `where` (required for `query`), already validated recursively: every
    /// leaf is a tag reference or a same-type literal comparison.
    pub filter: Option<AstNode>,
    /// `key` (required for `index`): the tag key the index covers.
    pub index_key: Option<String>,
    /// Custom tags in encounter order, deduplicated by the validator.
    pub tags: Vec<(String, Literal)>,
    /// `take`, if present on a `query`.
    pub take: Option<u32>,
}

/// The kind of mutation an [`Op`] performs against a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Add a `u32` value (an event id) to a bitmap entry.
    BitmapAddValue,
}

/// One mutation routed to exactly one consumer, keyed by its serialized
/// db-key (spec §4.6 step 5). Owned end-to-end by the queue between the
/// worker that created it and the consumer that applies it.
#[derive(Debug, Clone)]
pub struct Op {
    pub kind: OpKind,
    pub container: String,
    pub db: &'static str,
    pub db_key: DbKey,
    /// The value to apply — for `BitmapAddValue`, the event id.
    pub value: u32,
}

impl Op {
    /// The canonical routing key: `"<container>|<db-kind>|<tag-string>"`.
    pub fn routing_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.container,
            self.db,
            match &self.db_key {
                DbKey::Str(s) => s.clone(),
                DbKey::U32(v) => v.to_string(),
                DbKey::I64(v) => v.to_string(),
            }
        )
    }
}

/// How the writer should reconcile a durable put against the existing
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    Always,
    NoOverwrite,
    Int32GreaterThan,
}

/// A shared handle to a cache entry's `flush_version`, so the writer can
/// bump it after a successful commit without reaching back into the
/// cache. `Arc<AtomicU64>` stands in for the spec's raw
/// `*flush_version_ptr`.
pub type FlushVersionHandle = Arc<std::sync::atomic::AtomicU64>;

/// A durable write intent, created by a worker (event bodies, id
/// mappings, counters) or a consumer (flushed bitmaps), consumed by the
/// writer.
#[derive(Clone)]
pub struct WriterEntry {
    pub container: String,
    pub db: &'static str,
    pub key: DbKey,
    pub value: Vec<u8>,
    pub condition: WriteCondition,
    /// When set, the writer stores `version` into the pointee on commit.
    pub flush_version: Option<(FlushVersionHandle, u64)>,
}

impl std::fmt::Debug for WriterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterEntry")
            .field("container", &self.container)
            .field("db", &self.db)
            .field("key", &self.key)
            .field("value_len", &self.value.len())
            .field("condition", &self.condition)
            .field("bump_flush_version", &self.flush_version.is_some())
            .finish()
    }
}

impl WriterEntry {
    pub fn new(
        container: impl Into<String>,
        db: &'static str,
        key: DbKey,
        value: Vec<u8>,
        condition: WriteCondition,
    ) -> Self {
        Self {
            container: container.into(),
            db,
            key,
            value,
            condition,
            flush_version: None,
        }
    }

    pub fn with_flush_version(mut self, handle: FlushVersionHandle, version: u64) -> Self {
        self.flush_version = Some((handle, version));
        self
    }
}

/// The response carried back across the `execute` boundary.
#[derive(Debug, Clone)]
pub enum Response {
    Ack,
    EventIds(Vec<EventId>),
    Events {
        blobs: Vec<Vec<u8>>,
        cursor: Option<u32>,
    },
}

/// The entity/event id pair a worker resolves for an ingested event.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedEvent {
    pub entity_id: EntityId,
    pub event_id: EventId,
}
