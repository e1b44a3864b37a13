// crates/core/src/planner.rs
//! Counter planner: expands applicable counters into grouped per-index
//! aggregation stages, splitting by a per-request budget and by disjoint
//! look-back windows, then substitutes fact-field placeholders.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::counter::CounterDefinition;
use crate::fact::Fact;
use crate::pipeline::{substitute_stages, Accumulator, ProjectPick, Stage};
use crate::predicate::{CmpOp, Predicate};
use crate::value::Value;

/// Planner policy knobs. All caps use 0 for "unlimited".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlannerConfig {
    /// Global cap on counters expanded per request.
    pub max_counters_processing: u32,
    /// Per-group counter cap.
    pub max_counters_per_request: u32,
    /// Upper bound for any per-group record budget.
    pub max_depth_limit: u32,
    /// Ascending look-back window boundaries in ms. When set, counters with
    /// different windows land in different groups.
    pub split_intervals: Option<Vec<i64>>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_counters_processing: 0,
            max_counters_per_request: 0,
            max_depth_limit: 0,
            split_intervals: None,
        }
    }
}

/// Which timestamp the aggregation filters on: `createdAt` when running
/// over facts, `factTime` when running over index entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeField {
    CreatedAt,
    FactTime,
}

impl TimeField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeField::CreatedAt => "createdAt",
            TimeField::FactTime => "factTime",
        }
    }
}

/// Union of the record/time budgets of one group's member counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLimits {
    /// Record budget for the group's lookup (0 = unlimited).
    pub max_evaluated_records: u32,
    /// Widest member look-back in ms (0 = unbounded).
    pub from_time_ms: i64,
    /// Most inclusive member recent edge in ms (0 = unbounded).
    pub to_time_ms: i64,
}

/// One dispatch unit: counters sharing an index type and a split window.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanGroup {
    pub index_type_name: String,
    pub group_number: u32,
    /// Counter name → minimal stage list producing one group document.
    pub facets: BTreeMap<String, Vec<Stage>>,
    pub limits: GroupLimits,
    /// Split window this group was assigned (ms; `i64::MAX` = open-ended).
    pub window_from_ms: i64,
    pub window_to_ms: i64,
}

/// The planner's output: groups keyed by `indexTypeName#groupNumber`.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterPlan {
    pub groups: BTreeMap<String, PlanGroup>,
    /// Wall clock captured once at plan time; `$$NOW` resolves to this.
    pub planned_at: DateTime<Utc>,
    /// Whether interval splitting was active (affects set reduction).
    pub splitting: bool,
    /// True when `max_counters_processing` stopped expansion.
    pub truncated: bool,
    pub missing_placeholders: Vec<String>,
}

impl CounterPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn counter_count(&self) -> usize {
        self.groups.values().map(|g| g.facets.len()).sum()
    }
}

pub fn group_key(index_type_name: &str, group_number: u32) -> String {
    format!("{index_type_name}#{group_number}")
}

struct IndexState {
    count_in_group: u32,
    group_number: u32,
    interval_idx: usize,
    window_from: i64,
    window_to: i64,
}

/// Expand `applied` (already sorted oldest-window-first by the catalog)
/// into a grouped plan. `depth_limit` is the caller-supplied default record
/// budget for groups whose members carry none.
pub fn build_plan(
    applied: &[Arc<CounterDefinition>],
    fact: &Fact,
    time_field: TimeField,
    config: &PlannerConfig,
    depth_limit: u32,
) -> CounterPlan {
    let now = Utc::now();
    let splitting = config
        .split_intervals
        .as_ref()
        .map_or(false, |s| !s.is_empty());

    let mut groups: BTreeMap<String, PlanGroup> = BTreeMap::new();
    let mut states: HashMap<String, IndexState> = HashMap::new();
    let mut total = 0u32;
    let mut truncated = false;

    for counter in applied {
        if config.max_counters_processing > 0 && total + 1 > config.max_counters_processing {
            warn!(
                cap = config.max_counters_processing,
                "counter expansion stopped at maxCountersProcessing"
            );
            truncated = true;
            break;
        }
        total += 1;

        let state = states
            .entry(counter.index_type_name.clone())
            .or_insert_with(|| IndexState {
                count_in_group: 0,
                group_number: 0,
                interval_idx: 0,
                window_from: config
                    .split_intervals
                    .as_ref()
                    .and_then(|s| s.first().copied())
                    .unwrap_or(i64::MAX),
                window_to: 0,
            });

        state.count_in_group += 1;
        let mut bumped = false;
        if config.max_counters_per_request > 0
            && state.count_in_group > config.max_counters_per_request
        {
            state.group_number += 1;
            state.count_in_group = 1;
            bumped = true;
        }

        if let Some(split) = &config.split_intervals {
            if counter.from_time_ms > state.window_from {
                if !bumped {
                    state.group_number += 1;
                    state.count_in_group = 1;
                }
                while counter.from_time_ms > state.window_from {
                    state.interval_idx += 1;
                    state.window_to = state.window_from;
                    state.window_from = split
                        .get(state.interval_idx)
                        .copied()
                        .unwrap_or(i64::MAX);
                }
            }
        }

        let key = group_key(&counter.index_type_name, state.group_number);
        let group = groups.entry(key).or_insert_with(|| PlanGroup {
            index_type_name: counter.index_type_name.clone(),
            group_number: state.group_number,
            facets: BTreeMap::new(),
            limits: GroupLimits {
                max_evaluated_records: 0,
                from_time_ms: 0,
                to_time_ms: 0,
            },
            window_from_ms: state.window_from,
            window_to_ms: state.window_to,
        });

        group
            .facets
            .insert(counter.name.clone(), counter_stages(counter, time_field, now, splitting));
        merge_limits(&mut group.limits, group.facets.len(), counter);
    }

    for group in groups.values_mut() {
        group.limits.max_evaluated_records = clamp_depth(
            group.limits.max_evaluated_records,
            depth_limit,
            config.max_depth_limit,
        );
    }

    // The per-counter stage lists cloned above are already a snapshot of the
    // compiled definitions; substitution mutates only the snapshot.
    let mut missing_placeholders = Vec::new();
    for group in groups.values_mut() {
        for stages in group.facets.values_mut() {
            missing_placeholders.extend(substitute_stages(stages, &fact.data, now));
        }
    }
    if !missing_placeholders.is_empty() {
        warn!(
            placeholders = ?missing_placeholders,
            fact_id = %fact.id,
            "placeholders without a matching fact field were left unsubstituted"
        );
    }

    CounterPlan {
        groups,
        planned_at: now,
        splitting,
        truncated,
        missing_placeholders,
    }
}

/// The minimal stage list producing one group document for a counter.
fn counter_stages(
    counter: &CounterDefinition,
    time_field: TimeField,
    now: DateTime<Utc>,
    splitting: bool,
) -> Vec<Stage> {
    let mut stages = Vec::with_capacity(4);

    let mut predicate_parts = vec![counter.evaluation_conditions.clone()];
    if counter.from_time_ms > 0 {
        predicate_parts.push(Predicate::Cmp {
            field: time_field.as_str().to_string(),
            op: CmpOp::Gte,
            value: Value::Time(now - Duration::milliseconds(counter.from_time_ms)),
        });
    }
    if counter.to_time_ms > 0 {
        predicate_parts.push(Predicate::Cmp {
            field: time_field.as_str().to_string(),
            op: CmpOp::Lt,
            value: Value::Time(now - Duration::milliseconds(counter.to_time_ms)),
        });
    }
    let merged = Predicate::and(predicate_parts);
    if merged != Predicate::All {
        stages.push(Stage::Match(merged));
    }

    if let Some(budget) = counter.record_budget() {
        stages.push(Stage::Limit(budget));
    }

    stages.push(Stage::Group {
        accumulators: counter.attributes.clone(),
    });

    // Outside interval splitting, collected sets reduce to their
    // cardinality right in the pipeline; with splitting the raw set is
    // returned for the merge step to reduce.
    if !splitting && counter.attributes.values().any(Accumulator::is_set) {
        let picks = counter
            .attributes
            .iter()
            .map(|(name, acc)| {
                let pick = if acc.is_set() {
                    ProjectPick::SetSize(name.clone())
                } else {
                    ProjectPick::Keep(name.clone())
                };
                (name.clone(), pick)
            })
            .collect();
        stages.push(Stage::Project { picks });
    }

    stages
}

fn merge_limits(limits: &mut GroupLimits, members_after_insert: usize, counter: &CounterDefinition) {
    let first = members_after_insert == 1;
    limits.max_evaluated_records = if first {
        counter.max_evaluated_records
    } else if limits.max_evaluated_records == 0 || counter.max_evaluated_records == 0 {
        0
    } else {
        limits.max_evaluated_records.max(counter.max_evaluated_records)
    };
    limits.from_time_ms = if first {
        counter.from_time_ms
    } else if limits.from_time_ms == 0 || counter.from_time_ms == 0 {
        0
    } else {
        limits.from_time_ms.max(counter.from_time_ms)
    };
    limits.to_time_ms = if first {
        counter.to_time_ms
    } else if limits.to_time_ms == 0 || counter.to_time_ms == 0 {
        0
    } else {
        limits.to_time_ms.min(counter.to_time_ms)
    };
}

fn clamp_depth(group_budget: u32, call_depth: u32, max_depth: u32) -> u32 {
    let mut depth = if group_budget > 0 { group_budget } else { call_depth };
    if max_depth > 0 {
        depth = if depth == 0 { max_depth } else { depth.min(max_depth) };
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterCatalog, CounterSpec};
    use crate::pipeline::collect_placeholders;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn spec(name: &str, index: &str, from_ms: i64) -> CounterSpec {
        CounterSpec {
            name: name.into(),
            index_type_name: index.into(),
            computation_conditions: None,
            evaluation_conditions: None,
            attributes: serde_json::json!({"total": {"$sum": "$amount"}}),
            from_time_ms: from_ms,
            to_time_ms: 0,
            max_evaluated_records: 0,
            max_matching_records: 0,
        }
    }

    fn fact() -> Fact {
        Fact {
            id: "f-1".into(),
            fact_type: 1,
            created_at: Utc::now(),
            data: BTreeMap::from([("amount".to_string(), Value::Int(42))]),
        }
    }

    fn plan_for(specs: Vec<CounterSpec>, config: &PlannerConfig) -> CounterPlan {
        let catalog = CounterCatalog::compile(&specs).expect("compile");
        let applied = catalog.applicable_counters(&fact(), None).applied;
        build_plan(&applied, &fact(), TimeField::FactTime, config, 0)
    }

    #[test]
    fn test_two_windows_two_groups_per_index() {
        // Four counters over two indexes, split at 1h and 24h: each index
        // type must produce exactly two groups, one per window.
        let config = PlannerConfig {
            max_counters_per_request: 2,
            split_intervals: Some(vec![3_600_000, 86_400_000]),
            ..PlannerConfig::default()
        };
        let plan = plan_for(
            vec![
                spec("cA", "k1", 3_600_000),
                spec("cB", "k1", 86_400_000),
                spec("cC", "k2", 3_600_000),
                spec("cD", "k2", 86_400_000),
            ],
            &config,
        );

        let keys: Vec<&str> = plan.groups.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["k1#0", "k1#1", "k2#0", "k2#1"]);

        let mut names: Vec<&str> = plan
            .groups
            .values()
            .flat_map(|g| g.facets.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["cA", "cB", "cC", "cD"]);

        assert_eq!(plan.groups["k1#0"].window_from_ms, 3_600_000);
        assert_eq!(plan.groups["k1#1"].window_from_ms, 86_400_000);
        assert_eq!(plan.groups["k1#1"].window_to_ms, 3_600_000);
    }

    #[test]
    fn test_per_request_cap_splits_groups() {
        let config = PlannerConfig {
            max_counters_per_request: 2,
            ..PlannerConfig::default()
        };
        let plan = plan_for(
            vec![
                spec("c1", "k1", 0),
                spec("c2", "k1", 0),
                spec("c3", "k1", 0),
            ],
            &config,
        );
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups["k1#0"].facets.len(), 2);
        assert_eq!(plan.groups["k1#1"].facets.len(), 1);
    }

    #[test]
    fn test_global_cap_truncates() {
        let config = PlannerConfig {
            max_counters_processing: 2,
            ..PlannerConfig::default()
        };
        let plan = plan_for(
            vec![
                spec("c1", "k1", 0),
                spec("c2", "k1", 0),
                spec("c3", "k1", 0),
            ],
            &config,
        );
        assert!(plan.truncated);
        assert_eq!(plan.counter_count(), 2);
    }

    #[test]
    fn test_placeholder_substitution_total_on_survivors() {
        let mut with_placeholder = spec("c1", "k1", 0);
        with_placeholder.attributes = serde_json::json!({"total": {"$sum": "$$amount"}});
        let plan = plan_for(vec![with_placeholder], &PlannerConfig::default());

        assert!(plan.missing_placeholders.is_empty());
        let stages = &plan.groups["k1#0"].facets["c1"];
        assert!(collect_placeholders(stages).is_empty());
        assert!(stages.iter().any(|s| matches!(
            s,
            Stage::Group { accumulators }
                if accumulators["total"] == Accumulator::Sum(crate::pipeline::Expr::Const(Value::Int(42)))
        )));
    }

    #[test]
    fn test_now_placeholder_resolves_to_plan_time() {
        let mut with_now = spec("c1", "k1", 0);
        with_now.evaluation_conditions =
            Some(serde_json::json!({"createdAt": {"$lte": "$$NOW"}}));
        let plan = plan_for(vec![with_now], &PlannerConfig::default());

        let stages = &plan.groups["k1#0"].facets["c1"];
        let Some(Stage::Match(Predicate::Cmp { value, .. })) = stages.first() else {
            panic!("expected leading match stage");
        };
        assert_eq!(value, &Value::Time(plan.planned_at));
    }

    #[test]
    fn test_window_predicate_and_budget_stages() {
        let mut c = spec("c1", "k1", 3_600_000);
        c.to_time_ms = 60_000;
        c.max_evaluated_records = 500;
        c.max_matching_records = 200;
        let plan = plan_for(vec![c], &PlannerConfig::default());
        let stages = &plan.groups["k1#0"].facets["c1"];

        let Stage::Match(Predicate::And(parts)) = &stages[0] else {
            panic!("expected match with two window bounds");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(stages[1], Stage::Limit(200));
        assert!(matches!(stages[2], Stage::Group { .. }));
    }

    #[test]
    fn test_set_reduction_only_without_splitting() {
        let mut c = spec("c1", "k1", 0);
        c.attributes = serde_json::json!({"uniq": {"$addToSet": "$channel"}});
        let plan = plan_for(vec![c.clone()], &PlannerConfig::default());
        let stages = &plan.groups["k1#0"].facets["c1"];
        assert!(matches!(stages.last(), Some(Stage::Project { .. })));

        let split_config = PlannerConfig {
            split_intervals: Some(vec![3_600_000]),
            ..PlannerConfig::default()
        };
        let plan = plan_for(vec![c], &split_config);
        let stages = &plan.groups["k1#0"].facets["c1"];
        assert!(!matches!(stages.last(), Some(Stage::Project { .. })));
    }

    #[test]
    fn test_group_limits_union() {
        let mut a = spec("a", "k1", 3_600_000);
        a.max_evaluated_records = 100;
        a.to_time_ms = 60_000;
        let mut b = spec("b", "k1", 7_200_000);
        b.max_evaluated_records = 300;
        b.to_time_ms = 30_000;
        let plan = plan_for(vec![a, b], &PlannerConfig::default());
        let limits = plan.groups["k1#0"].limits;
        assert_eq!(limits.max_evaluated_records, 300);
        assert_eq!(limits.from_time_ms, 7_200_000);
        assert_eq!(limits.to_time_ms, 30_000);
    }

    #[test]
    fn test_depth_clamping() {
        let mut a = spec("a", "k1", 0);
        a.max_evaluated_records = 500;
        let config = PlannerConfig {
            max_depth_limit: 200,
            ..PlannerConfig::default()
        };
        let plan = plan_for(vec![a], &config);
        assert_eq!(plan.groups["k1#0"].limits.max_evaluated_records, 200);

        // No member budget: the per-call depth applies, still clamped.
        let catalog = CounterCatalog::compile(&[spec("b", "k1", 0)]).expect("compile");
        let applied = catalog.applicable_counters(&fact(), None).applied;
        let plan = build_plan(&applied, &fact(), TimeField::FactTime, &config, 1000);
        assert_eq!(plan.groups["k1#0"].limits.max_evaluated_records, 200);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Properties over arbitrary catalogs: counter names are disjoint
        /// across groups, caps hold, and every member's window fits the
        /// group's split window.
        #[test]
        fn prop_plan_invariants(
            windows in proptest::collection::vec(
                proptest::sample::select(vec![0i64, 3_600_000, 7_200_000, 86_400_000, 604_800_000]),
                1..12,
            ),
            per_request in 0u32..4,
            processing in 0u32..8,
            max_depth in proptest::sample::select(vec![0u32, 50, 500]),
            split in proptest::bool::ANY,
        ) {
            let specs: Vec<CounterSpec> = windows
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    let index = if i % 2 == 0 { "k1" } else { "k2" };
                    let mut s = spec(&format!("c{i}"), index, *w);
                    s.max_evaluated_records = (i as u32 % 3) * 100;
                    s
                })
                .collect();
            let config = PlannerConfig {
                max_counters_processing: processing,
                max_counters_per_request: per_request,
                max_depth_limit: max_depth,
                split_intervals: split.then(|| vec![3_600_000, 86_400_000]),
            };
            let plan = plan_for(specs, &config);

            // Group disjointness.
            let mut seen = std::collections::HashSet::new();
            for group in plan.groups.values() {
                for name in group.facets.keys() {
                    prop_assert!(seen.insert(name.clone()), "counter {name} in two groups");
                }
            }

            // Budget caps.
            if processing > 0 {
                prop_assert!(plan.counter_count() <= processing as usize);
            }
            for group in plan.groups.values() {
                if per_request > 0 {
                    prop_assert!(group.facets.len() <= per_request as usize);
                }
                if max_depth > 0 {
                    prop_assert!(group.limits.max_evaluated_records <= max_depth);
                    prop_assert!(group.limits.max_evaluated_records > 0);
                }
            }

            // Window monotonicity: every member's non-zero look-back bound
            // fits inside its group's split window.
            for group in plan.groups.values() {
                for name in group.facets.keys() {
                    let i: usize = name[1..].parse().expect("counter name suffix");
                    if windows[i] > 0 {
                        prop_assert!(windows[i] <= group.window_from_ms);
                    }
                }
            }
        }
    }
}
