use std::collections::HashSet;
use std::sync::Arc;

use chunklog::index::{build_chunk_indexes, IndexConfig};
use chunklog::query::{
    parse_query, Direction, Query, QueryEngine, QueryHit, ResumeToken, StepAction,
};
use chunklog::store::{ChunkStore, Record, StoreConfig};
use chunklog::StoreError;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn record(ts: i64, service: &str, raw: &[u8]) -> Record {
    Record::new(raw)
        .with_ingest_ts(ts)
        .with_write_ts(ts)
        .with_attr("service", service)
}

fn open_store(dir: &std::path::Path) -> Arc<ChunkStore> {
    ChunkStore::open(dir, StoreConfig::default()).unwrap()
}

fn seal_and_index(store: &ChunkStore) {
    let meta = store.seal_active().unwrap().unwrap();
    build_chunk_indexes(store, meta.id, &IndexConfig::default()).unwrap();
}

fn collect(engine: &QueryEngine, query: Query) -> Vec<QueryHit> {
    engine
        .query(query)
        .unwrap()
        .map(|hit| hit.unwrap())
        .collect()
}

fn seed_mixed(store: &ChunkStore) {
    // 5 "error from api" / 5 "info from web", interleaved
    for i in 0..10i64 {
        let rec = if i % 2 == 0 {
            record(i + 1, "api", b"error from api")
        } else {
            record(i + 1, "web", b"info from web")
        };
        store.append_preserved(&rec).unwrap();
    }
}

#[test]
fn token_query_over_indexed_chunk() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    seed_mixed(&store);
    seal_and_index(&store);

    let engine = QueryEngine::new(store, "main");
    let hits = collect(&engine, Query::new().with_text("error").unwrap());

    assert_eq!(hits.len(), 5);
    // ingest order, all from the api service
    let ingests: Vec<i64> = hits.iter().map(|h| h.record.ingest_ts).collect();
    assert_eq!(ingests, vec![1, 3, 5, 7, 9]);
    assert!(hits
        .iter()
        .all(|h| h.record.attrs.get("service").map(String::as_str) == Some("api")));
}

#[test]
fn indexed_and_runtime_scans_agree() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    seed_mixed(&store);

    let engine = QueryEngine::new(store.clone(), "main");
    let query = || Query::new().with_text("error OR service=web").unwrap();

    // active chunk: pure runtime scan
    let runtime: Vec<u64> = collect(&engine, query()).iter().map(|h| h.rref.position).collect();
    assert_eq!(runtime.len(), 10);

    // sealed and indexed: posting-list accelerated
    seal_and_index(&store);
    let indexed: Vec<u64> = collect(&engine, query()).iter().map(|h| h.rref.position).collect();
    assert_eq!(runtime, indexed);
}

#[test]
fn dnf_with_negation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let lines: &[&[u8]] = &[
        b"error here",
        b"warn there",
        b"debug noise",
        b"warn and debug",
        b"plain",
    ];
    for (i, line) in lines.iter().enumerate() {
        store
            .append_preserved(&record(i as i64 + 1, "svc", line))
            .unwrap();
    }
    seal_and_index(&store);

    let engine = QueryEngine::new(store, "main");
    let hits = collect(
        &engine,
        Query::new()
            .with_text("(error OR warn) AND NOT debug")
            .unwrap(),
    );

    let raws: Vec<&[u8]> = hits.iter().map(|h| h.record.raw.as_slice()).collect();
    assert_eq!(raws, vec![&b"error here"[..], &b"warn there"[..]]);
}

#[test]
fn kv_queries_cover_attrs_and_extracted_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    store
        .append_preserved(&record(1, "api", b"login ok user=alice"))
        .unwrap();
    store
        .append_preserved(&record(2, "web", b"login ok user=bob"))
        .unwrap();
    seal_and_index(&store);

    let engine = QueryEngine::new(store, "main");

    // attribute match
    let hits = collect(&engine, Query::new().with_text("service=api").unwrap());
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.ingest_ts, 1);

    // extracted-pair match
    let hits = collect(&engine, Query::new().with_text("user=bob").unwrap());
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.ingest_ts, 2);

    // existence forms
    assert_eq!(
        collect(&engine, Query::new().with_text("user=*").unwrap()).len(),
        2
    );
    assert_eq!(
        collect(&engine, Query::new().with_text("*=alice").unwrap()).len(),
        1
    );
}

#[test]
fn write_bounds_are_inclusive_and_select_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    for ts in 1..=5i64 {
        store
            .append_preserved(&record(ts, "svc", b"tick"))
            .unwrap();
    }
    seal_and_index(&store);

    let engine = QueryEngine::new(store, "main");
    let hits = collect(&engine, Query::new().with_write_bounds(Some(2), Some(4)));
    let stamps: Vec<i64> = hits.iter().map(|h| h.record.write_ts).collect();
    assert_eq!(stamps, vec![2, 3, 4]);
}

#[test]
fn reverse_direction_reverses_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    seed_mixed(&store);
    seal_and_index(&store);

    let engine = QueryEngine::new(store, "main");
    let hits = collect(
        &engine,
        Query::new()
            .with_text("error")
            .unwrap()
            .with_direction(Direction::Reverse),
    );
    let ingests: Vec<i64> = hits.iter().map(|h| h.record.ingest_ts).collect();
    assert_eq!(ingests, vec![9, 7, 5, 3, 1]);
}

#[test]
fn limit_and_resume_paginate_without_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    // five matching records spread over multiple chunks
    for i in 0..5i64 {
        store
            .append_preserved(&record(i + 1, "svc", b"match me"))
            .unwrap();
        if i % 2 == 1 {
            seal_and_index(&store);
        }
    }

    let engine = QueryEngine::new(store, "main");
    let make_query = || Query::new().with_text("match").unwrap();

    let first_page = collect(&engine, make_query().with_limit(2));
    assert_eq!(first_page.len(), 2);

    // the token round-trips through its wire form
    let token = ResumeToken::decode(&first_page[1].resume.encode()).unwrap();

    let rest = collect(&engine, make_query().with_resume(token));
    let mut seen: Vec<i64> = first_page
        .iter()
        .chain(rest.iter())
        .map(|h| h.record.ingest_ts)
        .collect();
    assert_eq!(seen.len(), 5, "no gaps");
    let unique: HashSet<i64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 5, "no duplicates");
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[test]
fn unknown_resume_chunk_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    store
        .append_preserved(&record(1, "svc", b"x"))
        .unwrap();

    let engine = QueryEngine::new(store, "main");
    let token = ResumeToken {
        chunk_id: uuid::Uuid::now_v7(),
        position: 0,
    };
    let err = engine.query(Query::new().with_resume(token)).unwrap_err();
    assert!(matches!(
        StoreError::from_err(&err),
        Some(StoreError::InvalidResumeToken)
    ));
}

#[test]
fn store_filter_gates_execution() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    store.append_preserved(&record(1, "svc", b"x")).unwrap();

    let engine = QueryEngine::new(store, "main");

    let mut query = Query::new();
    query.store = Some("other".to_string());
    assert_eq!(engine.query(query).unwrap().count(), 0);

    let mut query = Query::new();
    query.store = Some("main".to_string());
    assert_eq!(engine.query(query).unwrap().count(), 1);
}

#[test]
fn plan_reports_indexed_and_runtime_steps() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    seed_mixed(&store);
    seal_and_index(&store);

    let engine = QueryEngine::new(store, "main");

    // "error" is indexable, "12345" is numeric and must fall back
    let query = Query {
        expr: Some(parse_query("error 12345").unwrap()),
        ..Query::default()
    };
    let plan = engine.plan(&query).unwrap();
    assert_eq!(plan.chunks.len(), 1);

    let steps = &plan.chunks[0].branches[0].steps;
    let actions: Vec<StepAction> = steps.iter().map(|s| s.action).collect();
    assert!(actions.contains(&StepAction::Indexed));
    assert!(actions.contains(&StepAction::Runtime));

    // a token that hits nothing skips the branch and the chunk
    let query = Query {
        expr: Some(parse_query("error nonexistenttoken").unwrap()),
        ..Query::default()
    };
    let plan = engine.plan(&query).unwrap();
    assert!(plan.chunks[0].branches[0].skipped);
    assert!(plan.chunks[0].empty);
}

#[test]
fn cancellation_ends_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    for i in 0..100i64 {
        store
            .append_preserved(&record(i + 1, "svc", b"payload"))
            .unwrap();
    }

    let engine = QueryEngine::new(store, "main").with_capacity(1);
    let mut stream = engine.query(Query::new()).unwrap();

    let first = stream.next().unwrap().unwrap();
    assert_eq!(first.rref.position, 0);

    stream.cancel_token().cancel();
    // bounded channel: at most a handful of already-queued records
    // drain, then the stream terminates
    let drained = stream.count();
    assert!(drained <= 2, "drained {} records after cancel", drained);
}

#[test]
fn follow_mode_sees_new_records_and_rotation() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let engine = QueryEngine::new(store.clone(), "main");
    let mut stream = engine.follow(Query::new().with_text("tail").unwrap());

    store
        .append_preserved(&record(1, "svc", b"tail one"))
        .unwrap();
    store
        .append_preserved(&record(2, "svc", b"nothing here"))
        .unwrap();
    store
        .append_preserved(&record(3, "svc", b"tail two"))
        .unwrap();

    let first = stream.next().unwrap().unwrap();
    assert_eq!(first.record.raw, b"tail one");

    // rotation: the follower drains the sealed chunk and moves on
    store.seal_active().unwrap();
    store
        .append_preserved(&record(4, "svc", b"tail three"))
        .unwrap();

    let second = stream.next().unwrap().unwrap();
    assert_eq!(second.record.raw, b"tail two");
    let third = stream.next().unwrap().unwrap();
    assert_eq!(third.record.raw, b"tail three");
    assert_ne!(first.rref.chunk_id, third.rref.chunk_id);

    stream.cancel_token().cancel();
    assert!(stream.all(|hit| hit.is_ok()));
}
