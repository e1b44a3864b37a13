// crates/core/src/counter.rs
//! Counter definitions and the compiled catalog (decides which counters
//! apply to a given fact).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::fact::Fact;
use crate::pipeline::Accumulator;
use crate::predicate::Predicate;
use crate::value::Value;

/// Configuration shape of one counter, as written in the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSpec {
    pub name: String,
    /// Binds the counter to an index via `IndexDescriptor::index_type_name`.
    pub index_type_name: String,
    /// Predicate on the current fact deciding whether the counter applies.
    #[serde(default)]
    pub computation_conditions: Option<serde_json::Value>,
    /// Predicate applied inside the aggregation to filter historical records.
    #[serde(default)]
    pub evaluation_conditions: Option<serde_json::Value>,
    /// Grouping operators keyed by output name.
    pub attributes: serde_json::Value,
    /// Look-back bound in ms (0 = unbounded).
    #[serde(default)]
    pub from_time_ms: i64,
    /// Recent-edge bound in ms (0 = unbounded).
    #[serde(default)]
    pub to_time_ms: i64,
    #[serde(default)]
    pub max_evaluated_records: u32,
    #[serde(default)]
    pub max_matching_records: u32,
}

/// A compiled counter definition.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterDefinition {
    pub name: String,
    pub index_type_name: String,
    pub computation_conditions: Predicate,
    pub evaluation_conditions: Predicate,
    pub attributes: BTreeMap<String, Accumulator>,
    pub from_time_ms: i64,
    pub to_time_ms: i64,
    pub max_evaluated_records: u32,
    pub max_matching_records: u32,
}

impl CounterDefinition {
    pub fn compile(spec: &CounterSpec) -> Result<Self, ConfigError> {
        let bad = |message: String| ConfigError::BadCounter {
            name: spec.name.clone(),
            message,
        };
        if spec.name.is_empty() {
            return Err(ConfigError::BadCounter {
                name: "<unnamed>".into(),
                message: "counter name is empty".into(),
            });
        }
        if spec.index_type_name.is_empty() {
            return Err(bad("indexTypeName is empty".into()));
        }

        let parse_conditions = |raw: &Option<serde_json::Value>| -> Result<Predicate, ConfigError> {
            match raw {
                None => Ok(Predicate::All),
                Some(raw) => Predicate::parse(&Value::from_json(raw.clone())).map_err(|e| bad(e)),
            }
        };
        let computation_conditions = parse_conditions(&spec.computation_conditions)?;
        let evaluation_conditions = parse_conditions(&spec.evaluation_conditions)?;

        let Value::Object(attr_fields) = Value::from_json(spec.attributes.clone()) else {
            return Err(bad("attributes must be an object".into()));
        };
        if attr_fields.is_empty() {
            return Err(bad("attributes must name at least one output".into()));
        }
        let mut attributes = BTreeMap::new();
        for (out_name, raw) in &attr_fields {
            let acc = Accumulator::parse(raw).map_err(|e| bad(format!("attribute '{out_name}': {e}")))?;
            attributes.insert(out_name.clone(), acc);
        }

        if spec.from_time_ms < 0 || spec.to_time_ms < 0 {
            return Err(bad("time-window bounds must be >= 0".into()));
        }

        Ok(Self {
            name: spec.name.clone(),
            index_type_name: spec.index_type_name.clone(),
            computation_conditions,
            evaluation_conditions,
            attributes,
            from_time_ms: spec.from_time_ms,
            to_time_ms: spec.to_time_ms,
            max_evaluated_records: spec.max_evaluated_records,
            max_matching_records: spec.max_matching_records,
        })
    }

    /// Effective per-counter record budget: `min` of the two caps, with 0
    /// meaning "unset" on either side. `None` when both are unset.
    pub fn record_budget(&self) -> Option<u32> {
        match (self.max_evaluated_records, self.max_matching_records) {
            (0, 0) => None,
            (n, 0) | (0, n) => Some(n),
            (a, b) => Some(a.min(b)),
        }
    }
}

/// Result of resolving the catalog against one fact.
#[derive(Debug, Clone, Default)]
pub struct ApplicableCounters {
    /// Counters whose computation conditions match, oldest-window-first.
    pub applied: Vec<Arc<CounterDefinition>>,
    /// Counters whose evaluation conditions could be affected by this fact.
    /// Reported for metrics only; does not gate execution.
    pub evaluation_touched: usize,
}

/// Holds compiled counter definitions; resolves which apply to a fact.
#[derive(Debug, Clone, Default)]
pub struct CounterCatalog {
    counters: Vec<Arc<CounterDefinition>>,
}

impl CounterCatalog {
    pub fn new(counters: Vec<CounterDefinition>) -> Self {
        Self {
            counters: counters.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn compile(specs: &[CounterSpec]) -> Result<Self, ConfigError> {
        let counters = specs
            .iter()
            .map(CounterDefinition::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(counters))
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Resolve the counters applying to `fact`, sorted by ascending
    /// `from_time_ms`. `allow` restricts by counter name when present.
    ///
    /// An empty catalog is success with an empty result, not an error.
    pub fn applicable_counters(
        &self,
        fact: &Fact,
        allow: Option<&HashSet<String>>,
    ) -> ApplicableCounters {
        if self.counters.is_empty() {
            warn!("counter catalog is empty; returning no applicable counters");
            return ApplicableCounters::default();
        }

        let mut applied: Vec<Arc<CounterDefinition>> = self
            .counters
            .iter()
            .filter(|c| allow.map_or(true, |names| names.contains(&c.name)))
            .filter(|c| c.computation_conditions.matches(fact))
            .cloned()
            .collect();
        applied.sort_by_key(|c| c.from_time_ms);

        let evaluation_touched = self
            .counters
            .iter()
            .filter(|c| c.evaluation_conditions.matches(fact))
            .count();

        ApplicableCounters {
            applied,
            evaluation_touched,
        }
    }
}
