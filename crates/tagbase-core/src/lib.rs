//! Domain types and storage-agnostic traits shared by the tagbase ingestion
//! and query core.
//!
//! This crate has no opinion about which key/value backend or mmap
//! implementation is used; it defines the contracts (`KvStore`, `Cursor`,
//! `MmapArray`) that a concrete backend crate (e.g. `tagbase-redb`)
//! implements, plus the value types that flow between pipeline stages.

pub mod ast;
pub mod bitmap;
pub mod command;
pub mod error;
pub mod ids;
pub mod store;

pub use ast::{
    AstNode, CommandKind, Comparison, CompareOp, Literal, LogicalOp, RawCommand, ReservedKey,
    TagValue,
};
pub use bitmap::Bitmap;
pub use command::{
    FlushVersionHandle, Op, OpKind, ResolvedEvent, Response, ValidatedCommand, WriteCondition,
    WriterEntry,
};
pub use error::{ConsistencyError, CoreError, IdError, QueueError, StorageError, ValidationError};
pub use ids::{EntityId, EventId};
pub use store::{Cursor, DbKey, KvStore, MmapArray, Overwrite, Transaction};
