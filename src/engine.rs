//! The assembled ingestion/query core: wires every stage of §2's pipeline
//! together behind the single synchronous entry point of spec §6,
//! `execute(ast) -> response`.
//!
//! Grounded on `original_source/include/engine/engine.h`'s top-level
//! `engine_t` (one writer thread, `W` worker threads, `C` consumer
//! threads, all started from a single init call) and on spec §9's
//! "group globals into an explicit core-context value" redesign note —
//! there is no process-wide static here, every stage holds only the
//! `Arc`s it needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;

use tagbase_core::{
    CommandKind, DbKey, KvStore, Op, QueueError, RawCommand, Response, ValidatedCommand,
};

use crate::config::Config;
use crate::consumer::Consumer;
use crate::container::{ContainerCache, DB_METADATA, META_NEXT_ENTITY_ID};
use crate::entity_resolver::EntityResolver;
use crate::error::CoreError;
use crate::id_manager::{EntityIdAllocator, EventIdAllocator};
use crate::index_registry::{IndexEntry, IndexValueType};
use crate::queues::{self, BoundedReceiver, BoundedSender};
use crate::query::QueryEngine;
use crate::worker::Worker;
use crate::writer::Writer;

/// One in-flight `event` command plus the channel its worker answers on.
/// Stands in for the out-of-scope TCP front end's per-connection response
/// path: whatever called `Engine::execute` blocks on `resp` until the
/// worker that drew this command (by `route_cmd` affinity) replies.
#[derive(Clone)]
struct CmdEnvelope {
    cmd: ValidatedCommand,
    resp: crossbeam_channel::Sender<Result<Response, CoreError>>,
}

/// The spin-then-sleep backoff every background stage applies when it
/// finds no work (spec §4.6: "spin-yield up to `SPIN_LIMIT` iterations,
/// then sleep with exponential backoff capped at a ceiling").
struct Backoff {
    spin_limit: u32,
    max_sleep_ms: u64,
    spins: u32,
    sleep_ms: u64,
}

impl Backoff {
    fn new(spin_limit: u32, max_sleep_ms: u64) -> Self {
        Self {
            spin_limit,
            max_sleep_ms: max_sleep_ms.max(1),
            spins: 0,
            sleep_ms: 1,
        }
    }

    fn idle(&mut self) {
        if self.spins < self.spin_limit {
            self.spins += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_millis(self.sleep_ms));
            self.sleep_ms = (self.sleep_ms * 2).min(self.max_sleep_ms);
        }
    }

    fn reset(&mut self) {
        self.spins = 0;
        self.sleep_ms = 1;
    }
}

/// Reads the system container's persisted `next_ent_id` counter, or `1`
/// if this is a fresh data directory (entity id `0` is never assigned,
/// mirroring event ids — spec §3's "Entity-id: `u32 > 0`").
fn seed_entity_id(containers: &ContainerCache) -> Result<u32, CoreError> {
    let system = containers.system();
    let tx = system.env.begin_read()?;
    let value = tx.get(DB_METADATA, &DbKey::Str(META_NEXT_ENTITY_ID.to_string()))?;
    tx.abort();
    Ok(value
        .map(|b| u32::from_le_bytes(b.try_into().unwrap_or([0; 4])))
        .unwrap_or(1))
}

/// The assembled core. Owns every background thread; dropping it without
/// calling [`Engine::shutdown`] leaves those threads running (they hold
/// only `Arc`s, not the `Engine` itself, so this is safe but leaks
/// threads for the life of the process — callers should shut down
/// explicitly).
pub struct Engine {
    config: Config,
    containers: Arc<ContainerCache>,
    cmd_senders: Vec<BoundedSender<CmdEnvelope>>,
    query_engine: QueryEngine,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Opens (or creates) the data directory at `config.data_dir` and
    /// starts every background stage: `num_consumers` consumer threads,
    /// one writer thread, `num_workers` worker threads.
    pub fn open(config: Config) -> Result<Self, CoreError> {
        config.validate()?;
        let containers = Arc::new(ContainerCache::open(&config.data_dir, 64)?);

        let entity_allocator = Arc::new(EntityIdAllocator::seeded(seed_entity_id(&containers)?));
        let event_allocator = Arc::new(EventIdAllocator::new(config.event_id_reservation_block_size));
        let entity_resolver = Arc::new(EntityResolver::new(config.cache_capacity_per_shard.max(1024)));

        let (writer_tx, writer_rx) = queues::writer_queue(config.writer_queue_capacity);

        let mut op_senders: Vec<Vec<BoundedSender<Op>>> = Vec::with_capacity(config.num_consumers);
        let mut op_receivers: Vec<Vec<BoundedReceiver<Op>>> = Vec::with_capacity(config.num_consumers);
        for _ in 0..config.num_consumers {
            let mut senders = Vec::with_capacity(config.op_queues_per_consumer);
            let mut receivers = Vec::with_capacity(config.op_queues_per_consumer);
            for _ in 0..config.op_queues_per_consumer {
                let (tx, rx) = queues::op_queue(config.op_queue_capacity);
                senders.push(tx);
                receivers.push(rx);
            }
            op_senders.push(senders);
            op_receivers.push(receivers);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();
        let mut consumer_caches = Vec::with_capacity(config.num_consumers);

        for (idx, queues_rx) in op_receivers.into_iter().enumerate() {
            let mut consumer = Consumer::new(
                idx,
                containers.clone(),
                config.num_shards,
                config.cache_capacity_per_shard,
                queues_rx,
                writer_tx.clone(),
                config.flush_every_n_cycles,
            );
            consumer_caches.push(consumer.cache_handle());
            let stop = stop.clone();
            let (spin_limit, max_sleep_ms) = (config.spin_limit, config.max_sleep_ms);
            threads.push(std::thread::spawn(move || {
                let mut backoff = Backoff::new(spin_limit, max_sleep_ms);
                while !stop.load(Ordering::Relaxed) {
                    match consumer.run_once() {
                        Ok(0) => backoff.idle(),
                        Ok(_) => backoff.reset(),
                        Err(e) => {
                            tracing::warn!(consumer = idx, error = %e, "consumer cycle failed");
                            backoff.idle();
                        }
                    }
                }
            }));
        }

        {
            let writer = Writer::new(containers.clone(), writer_rx);
            let stop = stop.clone();
            let (spin_limit, max_sleep_ms) = (config.spin_limit, config.max_sleep_ms);
            threads.push(std::thread::spawn(move || {
                let mut backoff = Backoff::new(spin_limit, max_sleep_ms);
                while !stop.load(Ordering::Relaxed) {
                    if writer.run_once() == 0 {
                        backoff.idle();
                    } else {
                        backoff.reset();
                    }
                }
            }));
        }

        let worker = Arc::new(Worker::new(
            containers.clone(),
            entity_resolver,
            entity_allocator,
            event_allocator,
            op_senders,
            writer_tx,
            config.sync_interval_events,
        ));

        let mut cmd_senders = Vec::with_capacity(config.num_workers);
        for worker_idx in 0..config.num_workers {
            let (tx, rx) = queues::bounded_pair::<CmdEnvelope>(config.cmd_queue_capacity);
            cmd_senders.push(tx);
            let worker = worker.clone();
            let stop = stop.clone();
            let (spin_limit, max_sleep_ms) = (config.spin_limit, config.max_sleep_ms);
            threads.push(std::thread::spawn(move || {
                let mut backoff = Backoff::new(spin_limit, max_sleep_ms);
                while !stop.load(Ordering::Relaxed) {
                    let batch = rx.drain(64);
                    if batch.is_empty() {
                        backoff.idle();
                        continue;
                    }
                    backoff.reset();
                    for envelope in batch {
                        let result = worker.handle(envelope.cmd).map_err(CoreError::from);
                        if result.is_err() {
                            tracing::warn!(worker = worker_idx, "command failed in worker stage");
                        }
                        let _ = envelope.resp.send(result);
                    }
                }
            }));
        }

        let query_engine = QueryEngine::new(
            containers.clone(),
            consumer_caches,
            config.op_queues_per_consumer,
            crate::config::QUERY_RECURSION_LIMIT,
        );

        Ok(Self {
            config,
            containers,
            cmd_senders,
            query_engine,
            stop,
            threads: Mutex::new(threads),
        })
    }

    /// The one synchronous entry point. Ownership of `raw` is
    /// consumed here, matching the spec's "ownership of the AST is
    /// transferred to the core on entry."
    pub fn execute(&self, raw: RawCommand) -> Result<Response, CoreError> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(CoreError::ShuttingDown);
        }
        let validated = crate::validator::validate(raw)?;
        match validated.kind {
            CommandKind::Event => self.execute_event(validated),
            CommandKind::Query => self.query_engine.execute(validated).map_err(CoreError::from),
            CommandKind::Index => self.execute_index(validated),
        }
    }

    /// Routes the command to a worker by hashing its `entity` tag — the
    /// in-scope substitute for the out-of-scope front end's connection id
    /// (spec §4.5: "producers route by hash of an affinity key (e.g.,
    /// connection id) so commands for the same connection are
    /// serialized"; here, commands for the same entity serialize
    /// instead) — then blocks for that worker's reply.
    fn execute_event(&self, cmd: ValidatedCommand) -> Result<Response, CoreError> {
        let affinity_key = cmd.entity.clone().unwrap_or_default();
        let worker_idx = crate::queues::route_cmd(&affinity_key, self.cmd_senders.len());
        let (resp_tx, resp_rx) = bounded(1);
        let envelope = CmdEnvelope { cmd, resp: resp_tx };

        let mut backoff = Backoff::new(self.config.spin_limit, self.config.max_sleep_ms);
        loop {
            match self.cmd_senders[worker_idx].try_send(envelope.clone()) {
                Ok(()) => break,
                Err(QueueError::Closed) => return Err(CoreError::ShuttingDown),
                Err(QueueError::Full) => backoff.idle(),
            }
        }

        match resp_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(CoreError::ShuttingDown),
        }
    }

    /// Registers a new secondary index in the system container's global
    /// registry. New user containers pick it up the next time
    /// they're opened; already-open containers keep their existing local
    /// registry, per spec §4.3's "additive only" and §4.2's "copies the
    /// global index registry's bytes into the local registry" happening
    /// only at open time.
    fn execute_index(&self, cmd: ValidatedCommand) -> Result<Response, CoreError> {
        let key = cmd.index_key.expect("validator guarantees `key` on an index command");
        let system = self.containers.system();
        let mut registry = system.index_registry.write();
        // The original only ever registers int64-typed indexes through
        // this path (`original_source/src/engine/index/index.c`'s
        // `init_user_indexes`: "setting int_only_keys to true since we
        // only support int64 index for now"); `ts` stays the sole
        // pre-seeded exception.
        registry.insert(
            system.env.as_ref(),
            IndexEntry {
                key,
                value_type: IndexValueType::I64,
            },
        )?;
        Ok(Response::Ack)
    }

    /// Signals every background stage to stop, waits for each to drain
    /// its inbox and exit, then closes every open container (spec §4.2:
    /// "callers must have joined all consumers and workers first").
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.containers.destroy();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagbase_core::{AstNode, CommandKind as Kind, Literal, ReservedKey, TagValue};
    use std::collections::HashMap;

    fn event_cmd(container: &str, entity: &str, tags: &[(&str, Literal)]) -> RawCommand {
        let mut reserved = HashMap::new();
        reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String(container.to_string())));
        reserved.insert(ReservedKey::Entity, TagValue::Literal(Literal::String(entity.to_string())));
        RawCommand {
            kind: Kind::Event,
            reserved,
            custom: tags.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn query_cmd(container: &str, expr: AstNode) -> RawCommand {
        let mut reserved = HashMap::new();
        reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String(container.to_string())));
        reserved.insert(ReservedKey::Where, TagValue::Expression(Box::new(expr)));
        RawCommand {
            kind: Kind::Query,
            reserved,
            custom: Vec::new(),
        }
    }

    fn tag(key: &str, value: Literal) -> AstNode {
        AstNode::Tag {
            key: key.to_string(),
            value: TagValue::Literal(value),
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.data_dir = dir.to_path_buf();
        cfg.num_workers = 2;
        cfg.num_consumers = 2;
        cfg.op_queues_per_consumer = 2;
        cfg.flush_every_n_cycles = 1;
        cfg.spin_limit = 4;
        cfg.max_sleep_ms = 4;
        cfg
    }

    fn wait_for_flush() {
        std::thread::sleep(Duration::from_millis(150));
    }

    #[test]
    fn single_event_then_query_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();

        let ack = engine
            .execute(event_cmd("metrics", "u-1", &[("loc", Literal::String("ca".into()))]))
            .unwrap();
        assert!(matches!(ack, Response::EventIds(ids) if ids == vec![tagbase_core::EventId(1)]));

        wait_for_flush();

        let result = engine
            .execute(query_cmd("metrics", tag("loc", Literal::String("ca".into()))))
            .unwrap();
        match result {
            Response::Events { blobs, .. } => assert_eq!(blobs.len(), 1),
            other => panic!("expected Events, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_custom_tag_is_rejected_before_any_disk_effect() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();

        let cmd = event_cmd(
            "m",
            "u-1",
            &[("loc", Literal::String("ca".into())), ("loc", Literal::String("ny".into()))],
        );
        let err = engine.execute(cmd).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn index_command_registers_new_secondary_index() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();

        let mut reserved = HashMap::new();
        reserved.insert(ReservedKey::Key, TagValue::Literal(Literal::String("region".into())));
        let cmd = RawCommand {
            kind: Kind::Index,
            reserved,
            custom: Vec::new(),
        };
        let resp = engine.execute(cmd).unwrap();
        assert!(matches!(resp, Response::Ack));
    }
}
