// crates/core/src/pipeline.rs
//! Closed aggregation-pipeline algebra.
//!
//! The planner emits values in this type; the storage gateway and the query
//! workers render it to the backend's wire form. Nothing outside this
//! vocabulary can be expressed, which keeps placeholder substitution a
//! total, typed tree walk instead of a serialize/parse/walk round trip.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::predicate::Predicate;
use crate::value::Value;

/// Target collection of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Facts,
    IndexEntries,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Facts => "facts",
            Collection::IndexEntries => "index_entries",
        }
    }
}

/// A value-producing operand inside an accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Logical field path (`factTime`, `createdAt`, `type`, `id`, `hash`
    /// address meta columns; anything else addresses the data payload).
    Field(String),
    Const(Value),
}

impl Expr {
    /// Parse the configuration shape: `"$path"` is a field reference,
    /// `"$$name"` a placeholder constant, anything else a literal.
    pub fn parse(raw: &Value) -> Expr {
        match raw {
            Value::Placeholder(_) => Expr::Const(raw.clone()),
            Value::Text(s) => match s.strip_prefix('$') {
                Some(path) => Expr::Field(path.to_string()),
                None => Expr::Const(raw.clone()),
            },
            other => Expr::Const(other.clone()),
        }
    }
}

/// Named accumulator inside a group stage (`_id` is always null).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Accumulator {
    Sum(Expr),
    Count,
    Min(Expr),
    Max(Expr),
    Avg(Expr),
    AddToSet(Expr),
}

impl Accumulator {
    /// Parse one attribute of a counter definition, e.g.
    /// `{"$sum": "$amount"}` or `{"$addToSet": "$$channel"}`.
    pub fn parse(raw: &Value) -> Result<Accumulator, String> {
        let Value::Object(fields) = raw else {
            return Err(format!(
                "attribute must be an operator object, got {}",
                raw.type_name()
            ));
        };
        let mut ops = fields.iter();
        let (Some((op, operand)), None) = (ops.next(), ops.next()) else {
            return Err("attribute must contain exactly one operator".to_string());
        };
        match op.as_str() {
            "$sum" => Ok(Accumulator::Sum(Expr::parse(operand))),
            "$count" => Ok(Accumulator::Count),
            "$min" => Ok(Accumulator::Min(Expr::parse(operand))),
            "$max" => Ok(Accumulator::Max(Expr::parse(operand))),
            "$avg" => Ok(Accumulator::Avg(Expr::parse(operand))),
            "$addToSet" => Ok(Accumulator::AddToSet(Expr::parse(operand))),
            other => Err(format!("unknown grouping operator '{other}'")),
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Accumulator::AddToSet(_))
    }
}

/// Post-group projection picks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProjectPick {
    Keep(String),
    /// Cardinality of a collected set — the planner's rewrite of
    /// `AddToSet` when interval splitting is not active.
    SetSize(String),
}

/// One aggregation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Match(Predicate),
    Sort { field: String, descending: bool },
    Limit(u32),
    Group {
        accumulators: BTreeMap<String, Accumulator>,
    },
    Project {
        picks: BTreeMap<String, ProjectPick>,
    },
    Facet(BTreeMap<String, Vec<Stage>>),
    /// Left-join each index entry to its parent fact.
    LookupFacts,
    /// Flatten the joined fact array (always paired with `LookupFacts`).
    Unwind,
}

/// Substitute `$$name` placeholders across a stage list.
///
/// `$$NOW` (case-insensitive) resolves to `now`; `$$d.name` and `$$name`
/// both resolve against `data`. Returns the names of placeholders that had
/// no substitution; those are left in place, not treated as fatal.
pub fn substitute_stages(
    stages: &mut [Stage],
    data: &BTreeMap<String, Value>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut missing = Vec::new();
    for stage in stages {
        visit_stage_values(stage, &mut |v| substitute_value(v, data, now, &mut missing));
    }
    missing
}

/// Visit every top-level value position of a stage (match operands and
/// accumulator constants), recursing into facet arms. The callback owns any
/// recursion into `Array`/`Object` values.
pub fn visit_stage_values<F: FnMut(&mut Value)>(stage: &mut Stage, f: &mut F) {
    match stage {
        Stage::Match(pred) => pred.visit_values_mut(f),
        Stage::Group { accumulators } => {
            for acc in accumulators.values_mut() {
                if let Accumulator::Sum(Expr::Const(v))
                | Accumulator::Min(Expr::Const(v))
                | Accumulator::Max(Expr::Const(v))
                | Accumulator::Avg(Expr::Const(v))
                | Accumulator::AddToSet(Expr::Const(v)) = acc
                {
                    f(v);
                }
            }
        }
        Stage::Facet(arms) => {
            for arm in arms.values_mut() {
                for s in arm {
                    visit_stage_values(s, f);
                }
            }
        }
        Stage::Sort { .. }
        | Stage::Limit(_)
        | Stage::Project { .. }
        | Stage::LookupFacts
        | Stage::Unwind => {}
    }
}

/// Re-inflate RFC-3339 text leaves into timestamps across a stage list
/// (undoes the text-codec round trip before a pipeline executes).
pub fn reinflate_stage_timestamps(stages: &mut [Stage]) {
    for stage in stages {
        visit_stage_values(stage, &mut Value::reinflate_timestamps);
    }
}

fn substitute_value(
    value: &mut Value,
    data: &BTreeMap<String, Value>,
    now: DateTime<Utc>,
    missing: &mut Vec<String>,
) {
    match value {
        Value::Placeholder(name) => {
            if name.eq_ignore_ascii_case("now") {
                *value = Value::Time(now);
                return;
            }
            let key = name.strip_prefix("d.").unwrap_or(name);
            match data.get(key) {
                Some(v) => *value = v.clone(),
                None => missing.push(name.clone()),
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, data, now, missing);
            }
        }
        Value::Object(fields) => {
            for v in fields.values_mut() {
                substitute_value(v, data, now, missing);
            }
        }
        _ => {}
    }
}

/// Pipeline over the fact collection: id-in-set match plus one facet arm
/// per counter. The "facts" strategy runs this after its index lookups.
pub fn facts_aggregation(
    fact_ids: &[String],
    facets: BTreeMap<String, Vec<Stage>>,
) -> Vec<Stage> {
    vec![
        Stage::Match(crate::predicate::Predicate::In {
            field: "id".into(),
            values: fact_ids.iter().map(|id| Value::Text(id.clone())).collect(),
            negated: false,
        }),
        Stage::Facet(facets),
    ]
}

/// Pipeline over the index collection: base predicate, newest-first sort,
/// depth budget, optional fact join, then the facet.
pub fn index_aggregation(
    base: crate::predicate::Predicate,
    depth: u32,
    join_facts: bool,
    facets: BTreeMap<String, Vec<Stage>>,
) -> Vec<Stage> {
    let mut stages = vec![
        Stage::Match(base),
        Stage::Sort {
            field: "factTime".into(),
            descending: true,
        },
    ];
    if depth > 0 {
        stages.push(Stage::Limit(depth));
    }
    if join_facts {
        stages.push(Stage::LookupFacts);
        stages.push(Stage::Unwind);
    }
    stages.push(Stage::Facet(facets));
    stages
}

/// Collect the names of all placeholders still present in a stage list.
pub fn collect_placeholders(stages: &[Stage]) -> Vec<String> {
    let mut stages = stages.to_vec();
    let mut found = Vec::new();
    for stage in &mut stages {
        visit_stage_values(stage, &mut |v| collect_value(v, &mut found));
    }
    found
}

fn collect_value(value: &mut Value, found: &mut Vec<String>) {
    match value {
        Value::Placeholder(name) => found.push(name.clone()),
        Value::Array(items) => {
            for item in items {
                collect_value(item, found);
            }
        }
        Value::Object(fields) => {
            for v in fields.values_mut() {
                collect_value(v, found);
            }
        }
        _ => {}
    }
}
