//! Error taxonomy shared across the core. Each concern gets its own
//! `thiserror` enum; [`CoreError`] is the sum type the public `execute`
//! entry point returns.

use thiserror::Error;

/// Errors surfaced by a concrete key/value or mmap-array backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("database not found: {0}")]
    DbNotFound(String),

    #[error("key already exists")]
    KeyExists,

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("mmap growth failed: {0}")]
    MmapGrowth(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Validation-stage rejections. None of these have any side effect.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("unknown command kind")]
    UnknownCommand,

    #[error("missing required tag: {0}")]
    MissingTag(&'static str),

    #[error("tag not permitted for this command: {0}")]
    UnexpectedTag(&'static str),

    #[error("duplicate custom tag: {0}")]
    DuplicateCustomTag(String),

    #[error("duplicate reserved tag: {0}")]
    DuplicateReservedTag(&'static str),

    #[error("invalid container name: {0}")]
    InvalidContainerName(String),

    #[error("entity identifier too long")]
    EntityTooLong,

    #[error("invalid where-expression: {0}")]
    InvalidWhereExpression(String),

    #[error("invalid comparison: the compared key must be non-empty")]
    InvalidComparison,

    #[error("take must be a positive integer")]
    InvalidTake,

    #[error("`{0}` is not yet supported")]
    NotYetSupported(&'static str),

    #[error("bare literal cannot stand as a where-expression leaf")]
    BareLiteral,
}

/// Consistency or corruption faults detected deep in the pipeline.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("entity id {0} has no matching string mapping")]
    DanglingEntityId(u32),

    #[error("cache entry for {0:?} held a null bitmap")]
    NullCachedBitmap(String),

    #[error("recursion depth exceeded while evaluating query")]
    RecursionLimitExceeded,

    #[error("bitmap deserialization failed: {0}")]
    CorruptBitmap(String),
}

/// Id allocation and resolution failures.
#[derive(Debug, Error)]
pub enum IdError {
    #[error("entity id space exhausted")]
    EntityIdSpaceExhausted,

    #[error("event id space exhausted for container {0}")]
    EventIdSpaceExhausted(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Queue-level failures (non-fatal; callers back off and retry).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

/// The top-level error returned by `execute`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("shutdown in progress")]
    ShuttingDown,
}
