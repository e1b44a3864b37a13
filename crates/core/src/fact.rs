// crates/core/src/fact.rs
//! Canonical fact and index-entry records plus their input invariants.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::value::Value;

/// A canonicalized, deduplicated record of an ingested business event.
///
/// `id` is a deterministic hash of business content owned by the external
/// ingest path; it is stable across retries of the same logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    pub id: String,
    #[serde(rename = "type")]
    pub fact_type: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl Fact {
    /// Check the invariants the engine requires before any computation.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.is_empty() {
            return Err(EngineError::InvalidInput("fact.id is empty".into()));
        }
        if self.fact_type < 1 {
            return Err(EngineError::InvalidInput(format!(
                "fact.type must be >= 1, got {}",
                self.fact_type
            )));
        }
        Ok(())
    }

    /// Resolve a logical field path against this fact. Meta fields (`id`,
    /// `type`, `createdAt`) shadow data fields of the same name.
    pub fn field(&self, path: &str) -> Option<Value> {
        match path {
            "id" => Some(Value::Text(self.id.clone())),
            "type" => Some(Value::Int(self.fact_type as i64)),
            "createdAt" => Some(Value::Time(self.created_at)),
            _ => {
                let path = path.strip_prefix("data.").unwrap_or(path);
                self.data.get(path).cloned()
            }
        }
    }
}

/// A secondary lookup row derived from a fact.
///
/// `hash` encodes `(index_type, field value)` as a single key; `(hash,
/// fact_id)` is unique. Written by the external indexer, read here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub hash: String,
    pub fact_id: String,
    pub fact_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub index_type: i32,
    pub index_encoding: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_value: Option<String>,
    /// Embedded fact data, present only under the embedded strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, Value>>,
}

impl IndexEntry {
    pub fn validate(&self) -> EngineResult<()> {
        if self.hash.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "index entry for fact '{}' has an empty hash",
                self.fact_id
            )));
        }
        if self.fact_id.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "index entry '{}' has an empty factId",
                self.hash
            )));
        }
        Ok(())
    }
}

/// Immutable per-index configuration binding counters to index entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub field_name: String,
    pub date_name: String,
    pub index_type: i32,
    pub index_encoding: i32,
    /// Human/programmatic handle used to bind counters to this index.
    pub index_type_name: String,
    /// Default per-lookup record budget.
    #[serde(default)]
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact() -> Fact {
        Fact {
            id: "f-1".into(),
            fact_type: 3,
            created_at: Utc::now(),
            data: BTreeMap::from([
                ("amount".to_string(), Value::Int(42)),
                ("channel".to_string(), Value::Text("web".into())),
            ]),
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(fact().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let mut f = fact();
        f.id.clear();
        assert!(matches!(f.validate(), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_bad_type() {
        let mut f = fact();
        f.fact_type = 0;
        assert!(matches!(f.validate(), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_field_resolution() {
        let f = fact();
        assert_eq!(f.field("amount"), Some(Value::Int(42)));
        assert_eq!(f.field("data.amount"), Some(Value::Int(42)));
        assert_eq!(f.field("type"), Some(Value::Int(3)));
        assert_eq!(f.field("missing"), None);
    }

    #[test]
    fn test_entry_validate() {
        let entry = IndexEntry {
            hash: String::new(),
            fact_id: "f-1".into(),
            fact_time: Utc::now(),
            created_at: Utc::now(),
            index_type: 1,
            index_encoding: 1,
            field_value: None,
            data: None,
        };
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_fact_wire_shape() {
        let f = fact();
        let json = serde_json::to_value(&f).expect("serialize");
        assert!(json.get("type").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
