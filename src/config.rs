//! The configuration surface: one `serde`-deserializable struct per
//! concern, `Default` impls matching the documented defaults, loaded
//! through the `config` crate's layered sources.
//!
//! Grounded on `txpipe-dolos/crates/core/src/config.rs`'s struct
//! conventions (plain `Serialize`/`Deserialize` structs with `#[serde(default)]`
//! fields and a hand-written `Default` impl) and on
//! `original_source/include/core/data_constants.h` for the numeric
//! defaults (max entity string length, max container size, ...).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `include/core/data_constants.h`'s `MAX_ENTITY_STR_LEN` (`SLOT_SIZE - TAG_UNION_SIZE - NULL_TERM_SIZE`, 64-1-1).
pub const MAX_ENTITY_STR_LEN: usize = 62;
/// `include/core/data_constants.h`'s `MAX_TEXT_VAL_LEN`.
pub const MAX_TEXT_VAL_LEN: usize = 128;
/// `include/core/data_constants.h`'s `MAX_CUSTOM_TAGS`.
pub const MAX_CUSTOM_TAGS: usize = 32;
/// `include/core/data_constants.h`'s `MAX_CONTAINER_PATH_LENGTH`, repurposed
/// here as the container-name length limit.
pub const MAX_CONTAINER_NAME_LEN: usize = 64;
/// `include/core/data_constants.h`'s `MAX_NUM_INDEXES`.
pub const MAX_NUM_INDEXES: usize = 32;
/// `include/core/data_constants.h`'s `ONE_GIBIBYTE` / `MAX_CONTAINER_SIZE`.
pub const ONE_GIBIBYTE: u64 = 1024 * 1024 * 1024;
/// Stride (bytes) of the system container's `entity-id -> external-id-string` array.
pub const SYSTEM_ENTITY_SLOT_SIZE: usize = 64;
/// The hard recursion-depth limit for query evaluation.
pub const QUERY_RECURSION_LIMIT: usize = 128;
/// Bounded intermediate-bitmap stack depth during query evaluation.
pub const QUERY_INTERMEDIATE_STACK: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{field}` must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: u32 },

    #[error("`{field}` must be non-zero")]
    Zero { field: &'static str },

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for all container files.
    pub data_dir: PathBuf,
    /// Max KV map size per container.
    pub container_initial_size: u64,
    pub num_workers: usize,
    pub num_consumers: usize,
    pub op_queues_per_consumer: usize,
    pub cmd_queue_capacity: usize,
    pub op_queue_capacity: usize,
    pub writer_queue_capacity: usize,
    pub cache_capacity_per_shard: usize,
    pub num_shards: usize,
    pub flush_every_n_cycles: u32,
    pub event_id_reservation_block_size: u32,
    pub sync_interval_events: u32,
    pub spin_limit: u32,
    pub max_sleep_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            container_initial_size: ONE_GIBIBYTE,
            num_workers: 4,
            num_consumers: 4,
            op_queues_per_consumer: 2,
            cmd_queue_capacity: 1024,
            op_queue_capacity: 1024,
            writer_queue_capacity: 1024,
            cache_capacity_per_shard: 4096,
            num_shards: 16,
            flush_every_n_cycles: 16,
            event_id_reservation_block_size: 256,
            sync_interval_events: 1000,
            spin_limit: 1000,
            max_sleep_ms: 64,
        }
    }
}

impl Config {
    /// Load layered config (defaults -> file -> environment), then validate.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&defaults).map_err(ConfigError::Load)?,
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("TAGBASE").separator("__"));
        let raw: Self = builder.build()?.try_deserialize()?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_pow2("num_shards", self.num_shards as u32)?;
        check_pow2("cmd_queue_capacity", self.cmd_queue_capacity as u32)?;
        check_pow2("op_queue_capacity", self.op_queue_capacity as u32)?;
        check_pow2("writer_queue_capacity", self.writer_queue_capacity as u32)?;
        // A consumer's bitmap cache is sharded `op_queues_per_consumer`-way
        // and indexed with the same low-bits mask `route_op` uses to pick a
        // local queue, so the two must agree on being a power of two or a
        // key could shard to a cache bucket that doesn't match its queue.
        // `route_op` also masks the combined `num_consumers *
        // op_queues_per_consumer` space, so `num_consumers` needs the same
        // treatment for that mask to land uniformly in range.
        check_pow2("op_queues_per_consumer", self.op_queues_per_consumer as u32)?;
        check_pow2("num_consumers", self.num_consumers as u32)?;
        // `route_cmd` masks `hash & (num_workers - 1)` the same way
        // `route_op` masks its queue space, so `num_workers` needs the
        // same power-of-two treatment or that mask skips cmd_sender
        // indices and can return one past the end of the slice.
        check_pow2("num_workers", self.num_workers as u32)?;
        Ok(())
    }

    pub fn total_op_queues(&self) -> usize {
        self.num_consumers * self.op_queues_per_consumer
    }
}

fn check_pow2(field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    if value & (value - 1) != 0 {
        return Err(ConfigError::NotPowerOfTwo { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_shard_count() {
        let mut cfg = Config::default();
        cfg.num_shards = 10;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NotPowerOfTwo { field: "num_shards", .. })
        ));
    }

    #[test]
    fn rejects_zero_workers() {
        let mut cfg = Config::default();
        cfg.num_workers = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Zero { field: "num_workers" })));
    }
}
