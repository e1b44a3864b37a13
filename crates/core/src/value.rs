// crates/core/src/value.rs
//! Tagged value tree shared by facts, predicates and pipeline stages.
//!
//! Two wire shapes, selected by `Serializer::is_human_readable`:
//!
//! - JSON (text codec, config files): the plain structural shape. `Time`
//!   serializes as an RFC-3339 UTC string and comes back as `Text` until an
//!   explicit [`Value::reinflate_timestamps`] walk restores it; strings
//!   beginning with `$$` parse as [`Value::Placeholder`].
//! - bincode (binary codec): a type-tagged encoding, timestamps survive
//!   structurally and need no reinflation.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single value position in a fact payload or aggregation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// An unsubstituted `$$name` token. Resolved against the current fact's
    /// data (or the plan-time clock for `$$NOW`) before dispatch.
    Placeholder(String),
}

/// Mirror with derived (externally tagged) serde, used for compact codecs.
#[derive(Serialize, Deserialize)]
enum TaggedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Placeholder(String),
}

impl From<&Value> for TaggedValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => TaggedValue::Null,
            Value::Bool(b) => TaggedValue::Bool(*b),
            Value::Int(i) => TaggedValue::Int(*i),
            Value::Float(f) => TaggedValue::Float(*f),
            Value::Text(s) => TaggedValue::Text(s.clone()),
            Value::Time(t) => TaggedValue::Time(*t),
            Value::Array(items) => TaggedValue::Array(items.clone()),
            Value::Object(fields) => TaggedValue::Object(fields.clone()),
            Value::Placeholder(name) => TaggedValue::Placeholder(name.clone()),
        }
    }
}

impl From<TaggedValue> for Value {
    fn from(v: TaggedValue) -> Self {
        match v {
            TaggedValue::Null => Value::Null,
            TaggedValue::Bool(b) => Value::Bool(b),
            TaggedValue::Int(i) => Value::Int(i),
            TaggedValue::Float(f) => Value::Float(f),
            TaggedValue::Text(s) => Value::Text(s),
            TaggedValue::Time(t) => Value::Time(t),
            TaggedValue::Array(items) => Value::Array(items),
            TaggedValue::Object(fields) => Value::Object(fields),
            TaggedValue::Placeholder(name) => Value::Placeholder(name),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            match self {
                Value::Null => serializer.serialize_unit(),
                Value::Bool(b) => serializer.serialize_bool(*b),
                Value::Int(i) => serializer.serialize_i64(*i),
                Value::Float(f) => serializer.serialize_f64(*f),
                Value::Text(s) => serializer.serialize_str(s),
                Value::Time(t) => serializer.serialize_str(&format_timestamp(t)),
                Value::Array(items) => serializer.collect_seq(items),
                Value::Object(fields) => serializer.collect_map(fields),
                Value::Placeholder(name) => serializer.collect_str(&format_args!("$${name}")),
            }
        } else {
            TaggedValue::from(self).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let raw = serde_json::Value::deserialize(deserializer)?;
            Ok(Value::from_json(raw))
        } else {
            TaggedValue::deserialize(deserializer).map(Value::from)
        }
    }
}

/// RFC-3339 UTC with millisecond precision, the text-codec wire shape.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Strict RFC-3339 parse used by timestamp reinflation.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl Value {
    /// Convert a `serde_json::Value`. Strings beginning with `$$` become
    /// placeholders; timestamps stay `Text` (see [`Value::reinflate_timestamps`]).
    pub fn from_json(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => match s.strip_prefix("$$") {
                Some(name) => Value::Placeholder(name.to_string()),
                None => Value::Text(s),
            },
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render to the plain JSON shape (`Time` → RFC-3339, placeholder → `$$name`).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Time(t) => serde_json::Value::String(format_timestamp(t)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Placeholder(name) => serde_json::Value::String(format!("$${name}")),
        }
    }

    /// Undo the text-codec round trip: every `Text` leaf holding a strict
    /// RFC-3339 string becomes `Time` again. Applied by the worker before
    /// executing a pipeline and by the pool manager on replies.
    pub fn reinflate_timestamps(&mut self) {
        match self {
            Value::Text(s) => {
                if let Some(t) = parse_timestamp(s) {
                    *self = Value::Time(t);
                }
            }
            Value::Array(items) => {
                for item in items {
                    item.reinflate_timestamps();
                }
            }
            Value::Object(fields) => {
                for v in fields.values_mut() {
                    v.reinflate_timestamps();
                }
            }
            _ => {}
        }
    }

    /// Ordering used by in-process predicate evaluation. Numeric types
    /// compare across `Int`/`Float`; `Time` compares against RFC-3339 text.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Text(b)) => parse_timestamp(b).map(|b| a.cmp(&b)),
            (Value::Text(a), Value::Time(b)) => parse_timestamp(a).map(|a| a.cmp(b)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Short type label for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Time(_) => "time",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Placeholder(_) => "placeholder",
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}
