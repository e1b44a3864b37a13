// crates/engine/tests/engine_test.rs
// Orchestrator scenarios: window splitting, placeholder substitution,
// short-circuits, graceful degradation, strategy equivalence, ingest.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use tally_core::config::{EngineConfig, PlannerConfig, StrategyConfig};
use tally_core::counter::CounterSpec;
use tally_core::fact::{Fact, IndexDescriptor, IndexEntry};
use tally_core::value::Value;
use tally_engine::{ComputeOptions, Engine};
use tally_store::Store;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

fn descriptor(name: &str, index_type: i32) -> IndexDescriptor {
    IndexDescriptor {
        field_name: name.to_string(),
        date_name: "createdAt".into(),
        index_type,
        index_encoding: 1,
        index_type_name: name.to_string(),
        limit: 1000,
    }
}

fn counter(name: &str, index: &str, from_ms: i64, attributes: serde_json::Value) -> CounterSpec {
    CounterSpec {
        name: name.into(),
        index_type_name: index.into(),
        computation_conditions: None,
        evaluation_conditions: None,
        attributes,
        from_time_ms: from_ms,
        to_time_ms: 0,
        max_evaluated_records: 0,
        max_matching_records: 0,
    }
}

fn fact_at(id: &str, minutes_ago: i64, amount: i64, channel: &str) -> Fact {
    Fact {
        id: id.into(),
        fact_type: 1,
        created_at: Utc::now() - Duration::minutes(minutes_ago),
        data: BTreeMap::from([
            ("amount".to_string(), Value::Int(amount)),
            ("channel".to_string(), Value::Text(channel.into())),
        ]),
    }
}

fn entry_for(fact: &Fact, index_type: i32, hash: &str) -> IndexEntry {
    IndexEntry {
        hash: hash.into(),
        fact_id: fact.id.clone(),
        fact_time: fact.created_at,
        created_at: Utc::now(),
        index_type,
        index_encoding: 1,
        field_value: Some(hash.into()),
        data: Some(fact.data.clone()),
    }
}

fn base_config(counters: Vec<CounterSpec>) -> EngineConfig {
    EngineConfig {
        indexes: vec![descriptor("k1", 1), descriptor("k2", 2)],
        counters,
        ..EngineConfig::default()
    }
}

/// Store seeded with two historical facts, indexed under both k1 and k2.
async fn seeded_store() -> Store {
    let store = Store::open_in_memory().await.expect("store");
    for fact in [
        fact_at("f-recent", 30, 10, "web"),
        fact_at("f-old", 300, 20, "pos"),
    ] {
        store.save_fact(&fact).await.expect("save fact");
        store
            .save_index_entries(
                &[entry_for(&fact, 1, "h-k1"), entry_for(&fact, 2, "h-k2")],
                true,
            )
            .await
            .expect("save entries");
    }
    store
}

/// The fact being ingested now, with fresh entries for both indexes.
fn incoming() -> (Fact, Vec<IndexEntry>) {
    let fact = fact_at("f-new", 0, 99, "web");
    let entries = vec![entry_for(&fact, 1, "h-k1"), entry_for(&fact, 2, "h-k2")];
    (fact, entries)
}

#[tokio::test]
async fn test_two_window_groups_produce_all_counters() {
    let mut config = base_config(vec![
        counter("cA", "k1", HOUR_MS, serde_json::json!({"total": {"$sum": "$amount"}})),
        counter("cB", "k1", DAY_MS, serde_json::json!({"total": {"$sum": "$amount"}})),
        counter("cC", "k2", HOUR_MS, serde_json::json!({"cnt": {"$count": {}}})),
        counter("cD", "k2", DAY_MS, serde_json::json!({"cnt": {"$count": {}}})),
    ]);
    config.planner = PlannerConfig {
        max_counters_per_request: 2,
        split_intervals: Some(vec![HOUR_MS, DAY_MS]),
        ..PlannerConfig::default()
    };

    let engine = Engine::with_store(config, seeded_store().await).expect("engine");
    let (fact, entries) = incoming();
    let outcome = engine
        .compute_counters(&fact, &entries, &ComputeOptions::default())
        .await
        .expect("compute");

    assert!(outcome.metrics.errors.is_empty(), "{:?}", outcome.metrics.errors);
    assert_eq!(outcome.metrics.group_count, 4);
    assert_eq!(outcome.metrics.relevant_index_count, 2);

    let names: Vec<&str> = outcome.counters.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["cA", "cB", "cC", "cD"]);

    // One-hour window sees only the 30-minute-old fact; the day window
    // sees both.
    assert_eq!(outcome.counters["cA"], Value::Int(10));
    assert_eq!(outcome.counters["cB"], Value::Int(30));
    assert_eq!(outcome.counters["cC"], Value::Int(1));
    assert_eq!(outcome.counters["cD"], Value::Int(2));
}

#[tokio::test]
async fn test_placeholder_substitution_reaches_storage() {
    let mut with_placeholder = counter(
        "c-sub",
        "k1",
        0,
        serde_json::json!({"total": {"$sum": "$$amount"}}),
    );
    with_placeholder.evaluation_conditions =
        Some(serde_json::json!({"createdAt": {"$lte": "$$NOW"}}));
    let config = base_config(vec![with_placeholder]);

    let engine = Engine::with_store(config, seeded_store().await).expect("engine");
    let (fact, entries) = incoming();
    let outcome = engine
        .compute_counters(&fact, &entries, &ComputeOptions::default())
        .await
        .expect("compute");

    // fact.data.amount = 99 substituted as a constant: sum over the two
    // historical records is 2 * 99.
    assert_eq!(outcome.counters["c-sub"], Value::Int(198));
}

#[tokio::test]
async fn test_no_counters_short_circuit() {
    let engine = Engine::with_store(base_config(Vec::new()), seeded_store().await).expect("engine");
    let (fact, entries) = incoming();
    let outcome = engine
        .compute_counters(&fact, &entries, &ComputeOptions::default())
        .await
        .expect("compute");
    assert!(outcome.counters.is_empty());
    assert_eq!(outcome.metrics.reason.as_deref(), Some("no-counters"));
}

#[tokio::test]
async fn test_no_index_short_circuit() {
    let config = base_config(vec![counter(
        "c",
        "k1",
        0,
        serde_json::json!({"cnt": {"$count": {}}}),
    )]);
    let engine = Engine::with_store(config, seeded_store().await).expect("engine");
    let (fact, _) = incoming();
    let outcome = engine
        .compute_counters(&fact, &[], &ComputeOptions::default())
        .await
        .expect("compute");
    assert!(outcome.counters.is_empty());
    assert_eq!(outcome.metrics.reason.as_deref(), Some("no-index"));
}

#[tokio::test]
async fn test_input_invariants_are_enforced() {
    let config = base_config(Vec::new());
    let engine = Engine::with_store(config, seeded_store().await).expect("engine");
    let (mut fact, entries) = incoming();
    fact.id.clear();
    let err = engine
        .compute_counters(&fact, &entries, &ComputeOptions::default())
        .await;
    assert!(matches!(
        err,
        Err(tally_core::error::EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_single_group_failure_degrades_gracefully() {
    // The second counter's attribute path breaks the rendered SQL, failing
    // only its own group; k1's counter must still come back.
    let config = base_config(vec![
        counter("c-good", "k1", 0, serde_json::json!({"total": {"$sum": "$amount"}})),
        counter("c-bad", "k2", 0, serde_json::json!({"total": {"$sum": "$bad'field"}})),
    ]);
    let engine = Engine::with_store(config, seeded_store().await).expect("engine");
    let (fact, entries) = incoming();
    let outcome = engine
        .compute_counters(&fact, &entries, &ComputeOptions::default())
        .await
        .expect("compute");

    assert_eq!(outcome.counters["c-good"], Value::Int(30));
    assert!(!outcome.counters.contains_key("c-bad"));
    assert_eq!(outcome.metrics.errors.len(), 1);
}

#[tokio::test]
async fn test_allow_list_restricts_counters() {
    let config = base_config(vec![
        counter("c1", "k1", 0, serde_json::json!({"cnt": {"$count": {}}})),
        counter("c2", "k1", 0, serde_json::json!({"cnt": {"$count": {}}})),
    ]);
    let engine = Engine::with_store(config, seeded_store().await).expect("engine");
    let (fact, entries) = incoming();
    let opts = ComputeOptions {
        allowed_counters: Some(std::collections::HashSet::from(["c2".to_string()])),
        ..ComputeOptions::default()
    };
    let outcome = engine
        .compute_counters(&fact, &entries, &opts)
        .await
        .expect("compute");
    assert_eq!(
        outcome.counters.keys().collect::<Vec<_>>(),
        vec![&"c2".to_string()]
    );
}

#[tokio::test]
async fn test_strategies_agree_on_counter_values() {
    let counters = vec![
        counter("sum-day", "k1", DAY_MS, serde_json::json!({"total": {"$sum": "$amount"}})),
        counter(
            "channels",
            "k1",
            0,
            serde_json::json!({"uniq": {"$addToSet": "$channel"}}),
        ),
    ];
    let store = seeded_store().await;
    let (fact, entries) = incoming();

    let mut maps = Vec::new();
    for strategy in [
        StrategyConfig::default(), // facts
        StrategyConfig {
            embed_fact_data_in_index: true,
            join_facts_from_index: false,
        },
        StrategyConfig {
            embed_fact_data_in_index: false,
            join_facts_from_index: true,
        },
    ] {
        let mut config = base_config(counters.clone());
        config.strategy = strategy;
        let engine = Engine::with_store(config, store.clone()).expect("engine");
        let outcome = engine
            .compute_counters(&fact, &entries, &ComputeOptions::default())
            .await
            .expect("compute");
        assert!(outcome.metrics.errors.is_empty(), "{:?}", outcome.metrics.errors);
        maps.push(outcome.counters);
    }

    assert_eq!(maps[0], maps[1]);
    assert_eq!(maps[0], maps[2]);
    assert_eq!(maps[0]["sum-day"], Value::Int(30));
    assert_eq!(maps[0]["channels"], Value::Int(2));
}

/// The query worker built by the pool crate, when it is present in the
/// workspace target directory.
fn worker_bin() -> Option<std::path::PathBuf> {
    let target = std::env::var_os("CARGO_TARGET_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target"));
    let path = target.join("debug").join("tally-query-worker");
    path.exists().then_some(path)
}

#[tokio::test]
async fn test_pool_routing_matches_local_results() {
    let Some(worker) = worker_bin() else {
        eprintln!("tally-query-worker not built; skipping pool routing test");
        return;
    };

    let dir = tempfile::tempdir().expect("tempdir");
    let counters = vec![
        counter("sum-day", "k1", DAY_MS, serde_json::json!({"total": {"$sum": "$amount"}})),
        counter("cnt", "k2", 0, serde_json::json!({"cnt": {"$count": {}}})),
    ];

    let mut config = base_config(counters.clone());
    config.database.path = dir.path().join("tally.db").display().to_string();
    config.pool.worker_count = 2;
    config.pool.min_workers = 2;
    config.pool.worker_command = Some(worker);

    let engine = Engine::new(config).await.expect("engine");
    for fact in [
        fact_at("f-recent", 30, 10, "web"),
        fact_at("f-old", 300, 20, "pos"),
    ] {
        engine.store().save_fact(&fact).await.expect("save fact");
        engine
            .store()
            .save_index_entries(
                &[entry_for(&fact, 1, "h-k1"), entry_for(&fact, 2, "h-k2")],
                true,
            )
            .await
            .expect("save entries");
    }

    let (fact, entries) = incoming();
    let outcome = engine
        .compute_counters(&fact, &entries, &ComputeOptions::default())
        .await
        .expect("compute");
    assert!(outcome.metrics.errors.is_empty(), "{:?}", outcome.metrics.errors);
    assert_eq!(outcome.counters["sum-day"], Value::Int(30));
    assert_eq!(outcome.counters["cnt"], Value::Int(2));
    assert_eq!(outcome.metrics.aggregate_count, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_ingest_message_roundtrip() {
    let config = base_config(vec![counter(
        "seen",
        "k1",
        0,
        serde_json::json!({"cnt": {"$count": {}}}),
    )]);
    let engine = Engine::with_store(config, seeded_store().await).expect("engine");
    let (fact, entries) = incoming();

    let outcome = engine
        .ingest_message(&fact, &entries, &ComputeOptions::default())
        .await
        .expect("ingest");
    assert_eq!(outcome.fact_id, "f-new");
    assert_eq!(outcome.save_kind, tally_store::SaveKind::Inserted);
    assert_eq!(outcome.entries_inserted, 2);
    assert!(outcome.counters.contains_key("seen"));

    // Retrying the same logical event is idempotent at the fact level.
    let retry = engine
        .ingest_message(&fact, &entries, &ComputeOptions::default())
        .await
        .expect("retry");
    assert_eq!(retry.save_kind, tally_store::SaveKind::Ignored);
    assert_eq!(retry.entries_duplicates, 2);
}
