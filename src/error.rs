//! Per-concern error enums that compose into the top-level
//! error returned by [`crate::engine::Engine::execute`].
//!
//! Grounded on `txpipe-dolos/crates/redb3/src/lib.rs`'s `Error` enum
//! shape: one `thiserror` enum per concern, `#[error(transparent)]` for
//! wrapped causes, boxed variants for anything larger than a pointer.

use thiserror::Error;

use tagbase_core::{ConsistencyError, IdError, QueueError, StorageError, ValidationError};

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("failed to serialize value: {0}")]
    Serialize(String),
    #[error("failed to deserialize value: {0}")]
    Deserialize(String),
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("invalid container name `{0}`: {1}")]
    InvalidName(String, &'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("container cache destroyed")]
    Destroyed,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("worker stage does not handle command kind {0:?}")]
    UnsupportedCommandKind(tagbase_core::CommandKind),
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("recursion depth exceeded")]
    RecursionLimitExceeded,
    #[error("missing operand for tag `{0}`")]
    MissingOperand(String),
    #[error("`{0}` is not yet supported")]
    NotYetSupported(&'static str),
    #[error("comparison on `{0}` requires a secondary index, none is registered for it")]
    UnindexedComparisonKey(String),
    #[error("comparison on `{key}` expected a {expected:?}-typed literal")]
    ComparisonTypeMismatch {
        key: String,
        expected: crate::index_registry::IndexValueType,
    },
}

#[derive(Debug, Error)]
pub enum IdManagerError {
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("entity id {0} has no matching string mapping")]
    DanglingEntityId(u32),
}

/// The top-level error the public `execute` entry point returns (spec §6/§4.11).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    IdManager(#[from] IdManagerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    IndexRegistry(#[from] crate::index_registry::IndexRegistryError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("shutdown in progress")]
    ShuttingDown,
}
