// crates/engine/src/orchestrator.rs
//! `compute_counters`: resolve applicable counters, plan groups, fan the
//! aggregations out (locally or across the worker pool), and merge the
//! per-group results into one counter map with a metrics envelope.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use tally_core::config::Strategy;
use tally_core::error::EngineResult;
use tally_core::fact::{Fact, IndexEntry};
use tally_core::pipeline::{facts_aggregation, index_aggregation, Collection, Stage};
use tally_core::planner::{build_plan, CounterPlan, PlanGroup};
use tally_core::predicate::{CmpOp, Predicate};
use tally_core::value::Value;
use tally_pool::QueryRequest;
use tally_store::IndexLookup;

use crate::metrics::record_compute;
use crate::Engine;

/// Per-call options of the public entry point.
#[derive(Debug, Clone, Default)]
pub struct ComputeOptions {
    /// Record budget for groups whose counters carry none
    /// (0 = the configured default).
    pub depth_limit: u32,
    /// Additional lower bound intersected into every group window.
    pub depth_from_date: Option<DateTime<Utc>>,
    /// Optional allow-list of counter names.
    pub allowed_counters: Option<HashSet<String>>,
    /// Include the full metrics envelope in debug logging.
    pub debug: bool,
}

/// The debug/metrics envelope returned beside the counter map.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeMetrics {
    /// Set when the computation short-circuited (`no-index`, `no-counters`).
    pub reason: Option<String>,
    pub index_count: usize,
    pub fact_counters_count: usize,
    pub evaluation_counters_count: usize,
    pub group_count: usize,
    pub relevant_index_count: usize,
    pub lookup_bytes: u64,
    pub lookup_latency_max_ms: u64,
    pub aggregate_bytes: u64,
    pub aggregate_latency_max_ms: u64,
    pub aggregate_count: usize,
    pub result_counters_count: usize,
    pub wait_latency_ms: u64,
    pub pool_init_latency_ms: u64,
    pub batch_prep_latency_ms: u64,
    pub batch_exec_latency_ms: u64,
    pub result_merge_latency_ms: u64,
    pub batch_transform_latency_ms: u64,
    /// Degraded groups, one entry each. Never escalates.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ComputeOutcome {
    pub counters: BTreeMap<String, Value>,
    pub metrics: ComputeMetrics,
}

impl ComputeOutcome {
    fn short_circuit(reason: &str, metrics: ComputeMetrics) -> Self {
        let mut metrics = metrics;
        metrics.reason = Some(reason.to_string());
        record_compute(&metrics);
        Self {
            counters: BTreeMap::new(),
            metrics,
        }
    }
}

/// One group's aggregation, ready to run locally or on a worker.
struct GroupWork {
    key: String,
    collection: Collection,
    pipeline: Vec<Stage>,
}

impl Engine {
    /// Compute the counter map for one fact and its derived index entries.
    ///
    /// Only input-invariant violations and fatal misconfiguration escalate;
    /// per-group failures are folded into `metrics.errors` and their
    /// counters are simply absent from the output map.
    pub async fn compute_counters(
        &self,
        fact: &Fact,
        entries: &[IndexEntry],
        opts: &ComputeOptions,
    ) -> EngineResult<ComputeOutcome> {
        fact.validate()?;
        for entry in entries {
            entry.validate()?;
        }

        let mut metrics = ComputeMetrics {
            index_count: entries.len(),
            ..ComputeMetrics::default()
        };
        if entries.is_empty() {
            return Ok(ComputeOutcome::short_circuit("no-index", metrics));
        }

        let applicable = self
            .catalog
            .applicable_counters(fact, opts.allowed_counters.as_ref());
        metrics.fact_counters_count = applicable.applied.len();
        metrics.evaluation_counters_count = applicable.evaluation_touched;
        if applicable.applied.is_empty() {
            return Ok(ComputeOutcome::short_circuit("no-counters", metrics));
        }

        let strategy = self.config.strategy.resolve();
        let depth_limit = if opts.depth_limit > 0 {
            opts.depth_limit
        } else {
            self.config.ingest.depth_limit
        };
        let plan = build_plan(
            &applicable.applied,
            fact,
            strategy.time_field(),
            &self.config.planner,
            depth_limit,
        );
        metrics.group_count = plan.groups.len();

        // Resolve each index type named by the plan to one of the fact's
        // index entries; unresolvable groups are skipped with a warning.
        let entry_for = self.resolve_entries(&plan, entries);
        metrics.relevant_index_count = entry_for.len();

        let attr_counts: HashMap<&str, usize> = applicable
            .applied
            .iter()
            .map(|c| (c.name.as_str(), c.attributes.len()))
            .collect();

        let works = match strategy {
            Strategy::Facts => {
                self.facts_strategy_work(&plan, &entry_for, opts, &mut metrics)
                    .await
            }
            Strategy::Lookup | Strategy::Embedded => index_strategy_work(
                &plan,
                &entry_for,
                opts,
                strategy == Strategy::Lookup,
                &mut metrics,
            ),
        };
        metrics.aggregate_count = works.len();

        let group_rows = self.run_group_works(works, &mut metrics).await;

        // Merge: group counter names are disjoint by construction, so the
        // merge is a plain insert per counter.
        let merge_started = std::time::Instant::now();
        let mut counters = BTreeMap::new();
        for row in group_rows {
            let Value::Object(arms) = row else {
                continue;
            };
            for (name, arm_value) in arms {
                let attr_count = attr_counts.get(name.as_str()).copied().unwrap_or(1);
                counters.insert(name, flatten_counter(arm_value, attr_count, plan.splitting));
            }
        }
        metrics.result_counters_count = counters.len();
        metrics.result_merge_latency_ms = merge_started.elapsed().as_millis() as u64;

        record_compute(&metrics);
        if opts.debug {
            debug!(metrics = ?metrics, "counter computation finished");
        }
        Ok(ComputeOutcome { counters, metrics })
    }

    fn resolve_entries<'e>(
        &self,
        plan: &CounterPlan,
        entries: &'e [IndexEntry],
    ) -> HashMap<String, &'e IndexEntry> {
        let mut resolved = HashMap::new();
        for group in plan.groups.values() {
            if resolved.contains_key(&group.index_type_name) {
                continue;
            }
            let Some(descriptor) = self.config.index_by_type_name(&group.index_type_name) else {
                warn!(
                    index = %group.index_type_name,
                    "counter group names an index with no configured descriptor"
                );
                continue;
            };
            match entries.iter().find(|e| e.index_type == descriptor.index_type) {
                Some(entry) => {
                    resolved.insert(group.index_type_name.clone(), entry);
                }
                None => warn!(
                    index = %group.index_type_name,
                    "fact has no index entry for this counter group"
                ),
            }
        }
        resolved
    }

    /// Facts strategy: one index lookup per index type (parallel), then one
    /// fact aggregation per group over the collected ids.
    async fn facts_strategy_work(
        &self,
        plan: &CounterPlan,
        entry_for: &HashMap<String, &IndexEntry>,
        opts: &ComputeOptions,
        metrics: &mut ComputeMetrics,
    ) -> Vec<GroupWork> {
        // Union the groups' budgets per index type so one lookup covers all
        // of its groups.
        let mut budgets: HashMap<&str, (Option<i64>, Option<i64>, Option<u32>)> = HashMap::new();
        for group in plan.groups.values() {
            if !entry_for.contains_key(&group.index_type_name) {
                continue;
            }
            let (from, to, depth) = budgets
                .entry(group.index_type_name.as_str())
                .or_insert((Some(0), Some(0), Some(0)));
            *from = merge_bound(*from, group.limits.from_time_ms, i64::max);
            *to = merge_bound(*to, group.limits.to_time_ms, i64::min);
            *depth = merge_depth(*depth, group.limits.max_evaluated_records);
        }

        let lookups = budgets.iter().map(|(index, (from, to, depth))| {
            let entry = entry_for[*index];
            let lookup = IndexLookup {
                hash: entry.hash.clone(),
                from: intersect_from(
                    bound_to_time(plan.planned_at, *from),
                    opts.depth_from_date,
                ),
                to: bound_to_time(plan.planned_at, *to),
                // A `None` union means some group needs an unbounded
                // lookup; 0 is "no limit" to the gateway.
                depth: depth.unwrap_or(0),
            };
            let index = index.to_string();
            async move { (index, self.store.lookup_index(&lookup).await) }
        });

        let mut ids_for: HashMap<String, Vec<String>> = HashMap::new();
        for (index, outcome) in join_all(lookups).await {
            match outcome {
                Ok(found) => {
                    metrics.lookup_latency_max_ms = metrics
                        .lookup_latency_max_ms
                        .max(found.latency.as_millis() as u64);
                    metrics.lookup_bytes += found
                        .fact_ids
                        .iter()
                        .map(|id| id.len() as u64)
                        .sum::<u64>();
                    ids_for.insert(index, found.fact_ids);
                }
                Err(e) => {
                    metrics.errors.push(format!("lookup {index}: {e}"));
                }
            }
        }

        plan.groups
            .values()
            .filter_map(|group| {
                let ids = ids_for.get(&group.index_type_name)?;
                Some(GroupWork {
                    key: group_key(group),
                    collection: Collection::Facts,
                    pipeline: facts_aggregation(ids, group.facets.clone()),
                })
            })
            .collect()
    }

    async fn run_group_works(
        &self,
        works: Vec<GroupWork>,
        metrics: &mut ComputeMetrics,
    ) -> Vec<Value> {
        if works.is_empty() {
            return Vec::new();
        }

        // Route through the dispatcher only when a pool with real
        // parallelism is configured; otherwise run on the local gateway.
        if let Some(dispatcher) = self.dispatcher.as_ref().filter(|d| d.worker_count() > 1) {
            let requests: Vec<QueryRequest> = works
                .iter()
                .map(|w| QueryRequest {
                    id: w.key.clone(),
                    pipeline: w.pipeline.clone(),
                    collection_name: w.collection,
                    options: None,
                })
                .collect();
            let outcome = dispatcher.execute_queries(requests).await;

            metrics.wait_latency_ms = outcome.summary.wait_ms;
            metrics.pool_init_latency_ms = outcome.summary.pool_init_ms;
            metrics.batch_prep_latency_ms = outcome.summary.prep_ms;
            metrics.batch_exec_latency_ms = outcome.summary.exec_ms;
            metrics.batch_transform_latency_ms = outcome.summary.transform_ms;
            metrics.aggregate_bytes = outcome.summary.total_result_bytes;

            let mut rows = Vec::with_capacity(outcome.results.len());
            for result in outcome.results {
                metrics.aggregate_latency_max_ms =
                    metrics.aggregate_latency_max_ms.max(result.metrics.exec_time);
                match result.error {
                    Some(error) => metrics.errors.push(format!("group {}: {error}", result.id)),
                    None => rows.extend(result.rows),
                }
            }
            return rows;
        }

        let outcomes = join_all(works.iter().map(|w| async {
            (
                w.key.clone(),
                self.store.aggregate_pipeline(w.collection, &w.pipeline).await,
            )
        }))
        .await;

        let mut rows = Vec::with_capacity(outcomes.len());
        for (key, outcome) in outcomes {
            metrics.aggregate_latency_max_ms = metrics
                .aggregate_latency_max_ms
                .max(outcome.latency.as_millis() as u64);
            match (outcome.counters, outcome.error) {
                (Some(row), None) => {
                    metrics.aggregate_bytes += row.to_json().to_string().len() as u64;
                    rows.push(row);
                }
                (_, Some(error)) => metrics.errors.push(format!("group {key}: {error}")),
                (None, None) => {}
            }
        }
        rows
    }
}

/// Index strategies: one pipeline per group against the index collection.
fn index_strategy_work(
    plan: &CounterPlan,
    entry_for: &HashMap<String, &IndexEntry>,
    opts: &ComputeOptions,
    join_facts: bool,
    _metrics: &mut ComputeMetrics,
) -> Vec<GroupWork> {
    plan.groups
        .values()
        .filter_map(|group| {
            let entry = entry_for.get(&group.index_type_name)?;
            let mut parts = vec![Predicate::Cmp {
                field: "hash".into(),
                op: CmpOp::Eq,
                value: Value::Text(entry.hash.clone()),
            }];
            let from = intersect_from(
                window_edge(plan.planned_at, group.limits.from_time_ms),
                opts.depth_from_date,
            );
            if let Some(from) = from {
                parts.push(Predicate::Cmp {
                    field: "factTime".into(),
                    op: CmpOp::Gte,
                    value: Value::Time(from),
                });
            }
            if let Some(to) = window_edge(plan.planned_at, group.limits.to_time_ms) {
                parts.push(Predicate::Cmp {
                    field: "factTime".into(),
                    op: CmpOp::Lt,
                    value: Value::Time(to),
                });
            }
            Some(GroupWork {
                key: group_key(group),
                collection: Collection::IndexEntries,
                pipeline: index_aggregation(
                    Predicate::and(parts),
                    group.limits.max_evaluated_records,
                    join_facts,
                    group.facets.clone(),
                ),
            })
        })
        .collect()
}

fn group_key(group: &PlanGroup) -> String {
    tally_core::planner::group_key(&group.index_type_name, group.group_number)
}

/// `offset_ms` of 0 means "no bound on this edge".
fn window_edge(now: DateTime<Utc>, offset_ms: i64) -> Option<DateTime<Utc>> {
    (offset_ms > 0).then(|| now - TimeDelta::milliseconds(offset_ms))
}

fn bound_to_time(now: DateTime<Utc>, bound: Option<i64>) -> Option<DateTime<Utc>> {
    bound.and_then(|ms| window_edge(now, ms))
}

/// Merge a per-group bound into a per-index one; 0 (unbounded) wins.
fn merge_bound(
    acc: Option<i64>,
    group_ms: i64,
    pick: impl Fn(i64, i64) -> i64,
) -> Option<i64> {
    match acc {
        None => None,
        Some(_) if group_ms == 0 => None,
        Some(0) => Some(group_ms),
        Some(prev) => Some(pick(prev, group_ms)),
    }
}

/// Merge a per-group record budget into the per-index lookup budget.
/// A group with no budget (0) makes the whole lookup unbounded (`None`).
fn merge_depth(acc: Option<u32>, group_records: u32) -> Option<u32> {
    match (acc, group_records) {
        (None, _) | (_, 0) => None,
        (Some(0), d) => Some(d),
        (Some(prev), d) => Some(prev.max(d)),
    }
}

/// The later of the plan window's lower edge and `depth_from_date`.
fn intersect_from(
    window_from: Option<DateTime<Utc>>,
    depth_from: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (window_from, depth_from) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Collapse one arm document into the counter's public value: a scalar for
/// single-attribute counters, a sub-object otherwise. Under interval
/// splitting, raw distinct sets reduce to their cardinality here.
fn flatten_counter(arm: Value, attr_count: usize, splitting: bool) -> Value {
    let reduce = |v: Value| {
        if splitting {
            if let Value::Array(items) = v {
                return Value::Int(items.len() as i64);
            }
        }
        v
    };
    match arm {
        Value::Object(attrs) if attr_count == 1 => attrs
            .into_iter()
            .next()
            .map(|(_, v)| reduce(v))
            .unwrap_or(Value::Null),
        Value::Object(attrs) => Value::Object(
            attrs
                .into_iter()
                .map(|(k, v)| (k, reduce(v)))
                .collect(),
        ),
        other => other,
    }
}
