//! `redb`-backed key/value store and `memmap2`-backed growable array
//! implementing the storage-agnostic contracts from `tagbase-core`.
//!
//! Grounded on `txpipe-dolos/crates/redb3/src/lib.rs` (table wrapping,
//! error shape) and `original_source/src/core/mmap_array.c` (mmap array
//! resize semantics).

pub mod kv;
pub mod mmap;

pub use kv::{RedbEnvironment, RedbError};
pub use mmap::MmapArrayFile;
