// crates/pool/tests/worker_pool_test.rs
// Integration tests against real worker processes: submission order,
// timestamp fidelity through both codecs, worker death, and timeout
// containment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;

use tally_core::config::{DatabaseConfig, PoolSettings};
use tally_core::error::QueryErrorKind;
use tally_core::pipeline::{Accumulator, Collection, Expr, Stage};
use tally_core::predicate::{CmpOp, Predicate};
use tally_core::value::Value;
use tally_pool::{QueryDispatcher, QueryRequest, WorkerInit};
use tally_store::Store;

fn worker_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tally-query-worker"))
}

fn settings(workers: u32) -> PoolSettings {
    PoolSettings {
        worker_count: workers,
        min_workers: 2,
        worker_init_timeout_ms: 15_000,
        default_timeout_ms: 60_000,
        max_wait_for_workers_ms: 5_000,
        binary_codec: false,
        worker_command: Some(worker_bin()),
    }
}

fn init_for(store: &Store) -> WorkerInit {
    WorkerInit {
        connection_string: store.path().to_string(),
        database_name: "tally".into(),
        database_options: None,
    }
}

/// Seed `n` facts (created_at = i * 1000 ms, amount = i) plus one index
/// entry each under hash "h-1", with raw SQL for speed.
async fn seeded_store(dir: &tempfile::TempDir, n: i64) -> Store {
    let config = DatabaseConfig {
        path: dir.path().join("tally.db").display().to_string(),
        ..DatabaseConfig::default()
    };
    let store = Store::open(&config).await.expect("open store");

    let mut tx = store.write_pool().begin().await.expect("begin");
    for i in 0..n {
        sqlx::query(r#"INSERT INTO facts (id, "type", created_at, data) VALUES (?1, 1, ?2, ?3)"#)
            .bind(format!("f-{i}"))
            .bind(i * 1000)
            .bind(format!(r#"{{"amount":{i},"channel":"web"}}"#))
            .execute(&mut *tx)
            .await
            .expect("insert fact");
        sqlx::query(
            r#"INSERT INTO index_entries
               (hash, fact_id, fact_time, created_at, index_type, index_encoding, field_value, data)
               VALUES ('h-1', ?1, ?2, ?2, 1, 1, 'h-1', ?3)"#,
        )
        .bind(format!("f-{i}"))
        .bind(i * 1000)
        .bind(format!(r#"{{"amount":{i},"channel":"web"}}"#))
        .execute(&mut *tx)
        .await
        .expect("insert entry");
    }
    tx.commit().await.expect("commit");
    store
}

fn count_request(id: &str) -> QueryRequest {
    QueryRequest {
        id: id.into(),
        pipeline: vec![Stage::Facet(BTreeMap::from([(
            "c".to_string(),
            vec![Stage::Group {
                accumulators: BTreeMap::from([("cnt".to_string(), Accumulator::Count)]),
            }],
        )]))],
        collection_name: Collection::Facts,
        options: None,
    }
}

/// A deliberately expensive request: hundreds of facet arms, each scanning
/// the whole index collection through json_extract.
fn heavy_request(id: &str, arms: usize) -> QueryRequest {
    let mut facets = BTreeMap::new();
    for i in 0..arms {
        facets.insert(
            format!("arm-{i}"),
            vec![
                Stage::Match(Predicate::Cmp {
                    field: "amount".into(),
                    op: CmpOp::Gte,
                    value: Value::Int(0),
                }),
                Stage::Group {
                    accumulators: BTreeMap::from([
                        (
                            "mean".to_string(),
                            Accumulator::Avg(Expr::Field("amount".into())),
                        ),
                        (
                            "total".to_string(),
                            Accumulator::Sum(Expr::Field("amount".into())),
                        ),
                    ]),
                },
            ],
        );
    }
    QueryRequest {
        id: id.into(),
        pipeline: vec![Stage::Facet(facets)],
        collection_name: Collection::IndexEntries,
        options: None,
    }
}

fn arm_value(result: &tally_pool::QueryResult, arm: &str, attr: &str) -> Value {
    let Value::Object(doc) = &result.rows[0] else {
        panic!("row must be an object");
    };
    let Value::Object(arm_doc) = &doc[arm] else {
        panic!("arm must be an object");
    };
    arm_doc[attr].clone()
}

#[tokio::test]
async fn test_dispatcher_preserves_submission_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(&dir, 10).await;
    let dispatcher = QueryDispatcher::new(settings(2), init_for(&store)).expect("dispatcher");

    let requests: Vec<QueryRequest> = (0..5).map(|i| count_request(&format!("q{i}"))).collect();
    let outcome = dispatcher.execute_queries(requests).await;

    let ids: Vec<&str> = outcome.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["q0", "q1", "q2", "q3", "q4"]);
    assert_eq!(outcome.summary.total_queries, 5);
    assert_eq!(outcome.summary.batches, 2);
    for result in &outcome.results {
        assert!(result.error.is_none(), "{:?}", result.error);
        assert_eq!(arm_value(result, "c", "cnt"), Value::Int(10));
        assert!(result.metrics.pipeline_bytes > 0);
        assert!(result.metrics.result_bytes > 0);
    }
    assert_eq!(dispatcher.totals().total_queries, 5);

    dispatcher.shutdown().await;
}

async fn timestamp_fidelity(binary_codec: bool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(&dir, 10).await;
    let mut s = settings(1);
    s.binary_codec = binary_codec;
    let dispatcher = QueryDispatcher::new(s, init_for(&store)).expect("dispatcher");

    // fact_time >= 6000 ms keeps facts 6..9 — but only if the worker sees
    // the bound as a timestamp, not as an ISO string.
    let cutoff = chrono::DateTime::from_timestamp_millis(6_000).expect("ms");
    let request = QueryRequest {
        id: "q-time".into(),
        pipeline: vec![
            Stage::Match(Predicate::Cmp {
                field: "factTime".into(),
                op: CmpOp::Gte,
                value: Value::Time(cutoff),
            }),
            Stage::Facet(BTreeMap::from([(
                "c".to_string(),
                vec![Stage::Group {
                    accumulators: BTreeMap::from([("cnt".to_string(), Accumulator::Count)]),
                }],
            )])),
        ],
        collection_name: Collection::IndexEntries,
        options: None,
    };

    let outcome = dispatcher.execute_queries(vec![request]).await;
    let result = &outcome.results[0];
    assert!(result.error.is_none(), "{:?}", result.error);
    assert_eq!(arm_value(result, "c", "cnt"), Value::Int(4));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_timestamp_fidelity_text_codec() {
    timestamp_fidelity(false).await;
}

#[tokio::test]
async fn test_timestamp_fidelity_binary_codec() {
    timestamp_fidelity(true).await;
}

#[tokio::test]
async fn test_worker_death_mid_batch_then_recovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(&dir, 10_000).await;
    let dispatcher = std::sync::Arc::new(
        QueryDispatcher::new(settings(1), init_for(&store)).expect("dispatcher"),
    );

    // Pay pool initialization up front so the heavy batch dispatches
    // immediately on submit.
    let warmup = dispatcher.execute_queries(vec![count_request("warmup")]).await;
    assert!(warmup.results[0].error.is_none());

    let heavy_dispatcher = std::sync::Arc::clone(&dispatcher);
    let heavy = tokio::spawn(async move {
        heavy_dispatcher
            .execute_queries(vec![heavy_request("q-heavy", 300)])
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(dispatcher.pool().kill_worker(0).await, "worker should be killable");

    let outcome = heavy.await.expect("join");
    let error = outcome.results[0].error.as_ref().expect("batch must fail");
    assert_eq!(error.kind, QueryErrorKind::WorkerDied);

    // The manager respawns the worker; subsequent calls succeed.
    let after = dispatcher.execute_queries(vec![count_request("q-after")]).await;
    assert!(after.results[0].error.is_none(), "{:?}", after.results[0].error);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_batch_timeout_affects_only_its_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(&dir, 10_000).await;
    let mut s = settings(2);
    s.default_timeout_ms = 60;
    let dispatcher = QueryDispatcher::new(s, init_for(&store)).expect("dispatcher");

    // Two requests fan out to two single-request batches on two workers:
    // the heavy one exceeds the deadline, the light one is untouched.
    let outcome = dispatcher
        .execute_queries(vec![heavy_request("q-heavy", 300), count_request("q-light")])
        .await;

    assert_eq!(outcome.results[0].id, "q-heavy");
    assert_eq!(
        outcome.results[0].error.as_ref().expect("timeout").kind,
        QueryErrorKind::BatchTimeout
    );
    assert_eq!(outcome.results[1].id, "q-light");
    assert!(outcome.results[1].error.is_none(), "{:?}", outcome.results[1].error);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_no_ready_workers_fails_fast() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(&dir, 10_000).await;
    let mut s = settings(1);
    s.max_wait_for_workers_ms = 60;
    let dispatcher = QueryDispatcher::new(s, init_for(&store)).expect("dispatcher");

    // One worker, two batches: the second cannot be admitted while the
    // heavy batch occupies the only worker.
    let outcome = dispatcher
        .execute_queries(vec![heavy_request("q-heavy", 300), count_request("q-light")])
        .await;

    assert!(outcome.results[0].error.is_none(), "{:?}", outcome.results[0].error);
    assert_eq!(
        outcome.results[1].error.as_ref().expect("admission failure").kind,
        QueryErrorKind::NoReadyWorkers
    );

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_invalid_request_is_a_per_request_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = seeded_store(&dir, 5).await;
    let mut s = settings(1);
    s.min_workers = 1; // both requests ride in one batch
    let dispatcher = QueryDispatcher::new(s, init_for(&store)).expect("dispatcher");

    let invalid = QueryRequest {
        id: "q-bad".into(),
        pipeline: vec![Stage::Limit(1)], // no facet stage
        collection_name: Collection::Facts,
        options: None,
    };
    let outcome = dispatcher
        .execute_queries(vec![count_request("q-good"), invalid])
        .await;

    assert!(outcome.results[0].error.is_none());
    assert_eq!(
        outcome.results[1].error.as_ref().expect("render failure").kind,
        QueryErrorKind::Storage
    );

    dispatcher.shutdown().await;
}
