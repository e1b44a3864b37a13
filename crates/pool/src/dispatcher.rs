// crates/pool/src/dispatcher.rs
//! Query dispatcher: partitions request batches across the worker pool,
//! restores submission order, and attributes per-request metrics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

use tally_core::config::PoolSettings;
use tally_core::error::{EngineResult, QueryError, QueryErrorKind};

use crate::manager::{Batch, WorkerInit, WorkerPool};
use crate::protocol::{QueryRequest, QueryResult};

/// Rolling totals across all `execute_queries` calls.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherTotals {
    pub total_queries: u64,
    pub total_batches: u64,
    pub total_query_time_ms: u64,
    pub total_result_bytes: u64,
    pub total_errors: u64,
}

/// Per-call timing summary.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSummary {
    pub total_queries: u64,
    pub batches: u32,
    /// Pool initialization cost, paid once by the first call.
    pub pool_init_ms: u64,
    /// Time this call spent waiting for the pool to become ready.
    pub wait_ms: u64,
    pub prep_ms: u64,
    pub exec_ms: u64,
    pub transform_ms: u64,
    pub total_query_time_ms: u64,
    pub total_result_bytes: u64,
}

#[derive(Debug)]
pub struct ExecuteOutcome {
    /// One result per request, in submission order.
    pub results: Vec<QueryResult>,
    pub summary: ExecuteSummary,
}

pub struct QueryDispatcher {
    pool: WorkerPool,
    settings: PoolSettings,
    pool_init: OnceCell<Duration>,
    totals: Mutex<DispatcherTotals>,
}

impl QueryDispatcher {
    /// Create the dispatcher and spawn its worker pool eagerly.
    pub fn new(settings: PoolSettings, init: WorkerInit) -> EngineResult<Self> {
        let pool = WorkerPool::spawn(&settings, init)?;
        Ok(Self {
            pool,
            settings,
            pool_init: OnceCell::new(),
            totals: Mutex::new(DispatcherTotals::default()),
        })
    }

    pub fn worker_count(&self) -> u32 {
        self.pool.worker_count()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Execute a batch of aggregation requests across the pool.
    ///
    /// Requests without an id get one assigned. The returned results array
    /// restores submission order even though batches complete out of order;
    /// requests whose batch failed (or whose reply was missing) carry a
    /// structured error instead of hanging.
    pub async fn execute_queries(&self, mut requests: Vec<QueryRequest>) -> ExecuteOutcome {
        if requests.is_empty() {
            return ExecuteOutcome {
                results: Vec::new(),
                summary: ExecuteSummary::default(),
            };
        }

        let prep_started = Instant::now();
        for request in &mut requests {
            if request.id.is_empty() {
                request.id = Uuid::new_v4().to_string();
            }
        }
        let submission_order: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();

        // First call pays pool initialization; subsequent calls don't wait.
        // The wait is bounded: a pool whose workers all fail INIT must not
        // hang the caller.
        let init_budget =
            Duration::from_millis(self.settings.worker_init_timeout_ms.saturating_mul(2).max(1));
        let wait_started = Instant::now();
        let init = self
            .pool_init
            .get_or_try_init(|| async {
                let started = Instant::now();
                tokio::time::timeout(init_budget, self.pool.wait_ready())
                    .await
                    .map_err(|_| {
                        tally_core::error::EngineError::Fatal(
                            "worker pool failed to initialize in time".into(),
                        )
                    })??;
                Ok::<_, tally_core::error::EngineError>(started.elapsed())
            })
            .await;
        let wait_ms = wait_started.elapsed().as_millis() as u64;

        let (pool_init_ms, pool_alive) = match init {
            Ok(d) => (d.as_millis() as u64, true),
            Err(_) => (0, false),
        };
        if !pool_alive {
            let results = submission_order
                .iter()
                .map(|id| {
                    QueryResult::failed(
                        id.clone(),
                        QueryError::new(QueryErrorKind::NoReadyWorkers, "worker pool never became ready"),
                    )
                })
                .collect();
            return self.finish(results, ExecuteSummary {
                total_queries: submission_order.len() as u64,
                wait_ms,
                ..ExecuteSummary::default()
            });
        }

        // B = min(minWorkers, requestCount) batches of consecutive requests.
        let fanout = (self.settings.min_workers.max(1) as usize).min(requests.len());
        let chunk_size = requests.len().div_ceil(fanout);
        let batches: Vec<Batch> = requests
            .chunks(chunk_size)
            .map(|chunk| Batch::new(chunk.to_vec()))
            .collect();
        let batch_request_ids: Vec<Vec<String>> = batches
            .iter()
            .map(|b| b.requests.iter().map(|r| r.id.clone()).collect())
            .collect();
        let batch_count = batches.len() as u32;
        let prep_ms = prep_started.elapsed().as_millis() as u64;

        let exec_started = Instant::now();
        let outcomes = self
            .pool
            .execute_batches(
                batches,
                self.settings.default_timeout_ms,
                self.settings.max_wait_for_workers_ms,
            )
            .await;
        let exec_ms = exec_started.elapsed().as_millis() as u64;

        // Restore submission order from per-batch outcomes.
        let transform_started = Instant::now();
        let mut by_id: HashMap<String, QueryResult> = HashMap::with_capacity(requests.len());
        for (ids, outcome) in batch_request_ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(results) => {
                    for result in results {
                        by_id.insert(result.id.clone(), result);
                    }
                }
                Err(error) => {
                    debug!(error = %error, affected = ids.len(), "batch failed");
                    for id in ids {
                        by_id.insert(id.clone(), QueryResult::failed(id, error.clone()));
                    }
                }
            }
        }
        let results: Vec<QueryResult> = submission_order
            .into_iter()
            .map(|id| {
                by_id.remove(&id).unwrap_or_else(|| {
                    QueryResult::failed(
                        id.clone(),
                        QueryError::new(QueryErrorKind::MissingResult, "missing result"),
                    )
                })
            })
            .collect();
        let transform_ms = transform_started.elapsed().as_millis() as u64;

        let summary = ExecuteSummary {
            total_queries: results.len() as u64,
            batches: batch_count,
            pool_init_ms,
            wait_ms,
            prep_ms,
            exec_ms,
            transform_ms,
            total_query_time_ms: results.iter().map(|r| r.metrics.exec_time).sum(),
            total_result_bytes: results.iter().map(|r| r.metrics.result_bytes).sum(),
        };
        self.finish(results, summary)
    }

    fn finish(&self, results: Vec<QueryResult>, summary: ExecuteSummary) -> ExecuteOutcome {
        if let Ok(mut totals) = self.totals.lock() {
            totals.total_queries += summary.total_queries;
            totals.total_batches += summary.batches as u64;
            totals.total_query_time_ms += summary.total_query_time_ms;
            totals.total_result_bytes += summary.total_result_bytes;
            totals.total_errors += results.iter().filter(|r| r.error.is_some()).count() as u64;
        }
        ExecuteOutcome { results, summary }
    }

    /// Snapshot of the rolling totals.
    pub fn totals(&self) -> DispatcherTotals {
        self.totals.lock().map(|t| *t).unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
