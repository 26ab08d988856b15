//! `tagbase`: an embedded, event-oriented tagged-data store with a
//! boolean tag-expression query language.
//!
//! This crate is the ingestion/query core only: a caller hands a
//! validated command tree to [`Engine::execute`] and gets back an
//! acknowledgement, assigned event ids, or matching event bodies. Wire
//! protocol, parser, and CLI/config-file loading in front of this core
//! are out of scope and live in whatever embeds this crate.
//!
//! Grounded on `txpipe-dolos`'s crate-per-concern workspace shape
//! (`tagbase-core` mirrors its storage-agnostic `core` crate,
//! `tagbase-redb` its concrete backend crate); see `DESIGN.md` for the
//! full grounding ledger.

pub mod cache;
pub mod config;
pub mod consumer;
pub mod container;
pub mod engine;
pub mod entity_resolver;
pub mod error;
pub mod id_manager;
pub mod index_registry;
pub mod query;
pub mod queues;
pub mod record;
pub mod validator;
pub mod worker;
pub mod writer;

pub use config::Config;
pub use engine::Engine;
pub use error::CoreError;
pub use record::{canonical_tag_string, EventRecord, TagValue};

pub use tagbase_core::{AstNode, CommandKind, Comparison, CompareOp, Literal, LogicalOp, RawCommand, ReservedKey, Response};
