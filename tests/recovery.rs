//! Durable replay: a clean shutdown followed by reopening the same data
//! directory must return the same query results.

use std::collections::HashMap;
use std::time::Duration;

use tagbase::{CommandKind, Config, Engine, Literal, RawCommand, ReservedKey, Response};
use tagbase_core::ast::{AstNode, TagValue};

fn config(dir: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.data_dir = dir.to_path_buf();
    cfg.num_workers = 2;
    cfg.num_consumers = 2;
    cfg.op_queues_per_consumer = 2;
    cfg.flush_every_n_cycles = 1;
    cfg.spin_limit = 4;
    cfg.max_sleep_ms = 4;
    // Force the event-id counter to persist after every event so a
    // restart never re-reserves an id already on disk.
    cfg.sync_interval_events = 1;
    cfg
}

fn event(container: &str, entity: &str, tags: &[(&str, Literal)]) -> RawCommand {
    let mut reserved = HashMap::new();
    reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String(container.to_string())));
    reserved.insert(ReservedKey::Entity, TagValue::Literal(Literal::String(entity.to_string())));
    RawCommand {
        kind: CommandKind::Event,
        reserved,
        custom: tags.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
    }
}

fn query(container: &str, filter: AstNode) -> RawCommand {
    let mut reserved = HashMap::new();
    reserved.insert(ReservedKey::In, TagValue::Literal(Literal::String(container.to_string())));
    reserved.insert(ReservedKey::Where, TagValue::Expression(Box::new(filter)));
    RawCommand {
        kind: CommandKind::Query,
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

fn ids_of(resp: Response) -> Vec<u32> {
    match resp {
        Response::Events { blobs, .. } => {
            let mut ids: Vec<u32> = blobs
                .iter()
                .map(|b| tagbase::EventRecord::decode(b).unwrap().id)
                .collect();
            ids.sort();
            ids
        }
        other => panic!("expected Events, got {other:?}"),
    }
}

#[test]
fn closing_and_reopening_yields_identical_query_results() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .execute(event("metrics", "u-1", &[("loc", Literal::String("ca".into()))]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        engine.shutdown();
    }

    let engine = Engine::open(config(dir.path())).unwrap();
    let resp = engine
        .execute(query("metrics", tag("loc", Literal::String("ca".into()))))
        .unwrap();
    assert_eq!(ids_of(resp), vec![1]);
}

#[test]
fn entity_ids_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = Engine::open(config(dir.path())).unwrap();
        engine
            .execute(event("metrics", "u-1", &[("loc", Literal::String("ca".into()))]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        engine.shutdown();
    }

    let engine = Engine::open(config(dir.path())).unwrap();
    let ack = engine
        .execute(event("metrics", "u-2", &[("loc", Literal::String("ny".into()))]))
        .unwrap();
    match ack {
        Response::EventIds(ids) => assert_eq!(ids[0].0, 2),
        other => panic!("expected EventIds, got {other:?}"),
    }

    std::thread::sleep(Duration::from_millis(150));
    let resp = engine
        .execute(query("metrics", tag("loc", Literal::String("ca".into()))))
        .unwrap();
    assert_eq!(ids_of(resp), vec![1]);
}
