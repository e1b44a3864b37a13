// crates/core/src/predicate.rs
//! Closed predicate algebra compiled from the condition vocabulary.
//!
//! Counter conditions are written in the storage backend's fixed operator
//! vocabulary (`$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`,
//! `$exists`, `$and`, `$or`). They compile once, at config load, into this
//! algebra — which both evaluates in-process against a fact
//! (computation conditions) and renders to SQL in the gateway
//! (evaluation conditions).

use serde::{Deserialize, Serialize};

use crate::fact::Fact;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Matches every record (empty condition object).
    All,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
        negated: bool,
    },
    Exists {
        field: String,
        exists: bool,
    },
}

impl Predicate {
    /// Compile a condition object. `Value::Object` maps field names (or
    /// `$and`/`$or`) to operators; a bare value means equality.
    pub fn parse(condition: &Value) -> Result<Predicate, String> {
        let Value::Object(fields) = condition else {
            return Err(format!(
                "condition must be an object, got {}",
                condition.type_name()
            ));
        };
        let mut parts = Vec::with_capacity(fields.len());
        for (key, val) in fields {
            match key.as_str() {
                "$and" | "$or" => {
                    let Value::Array(items) = val else {
                        return Err(format!("{key} expects an array of conditions"));
                    };
                    let subs = items
                        .iter()
                        .map(Predicate::parse)
                        .collect::<Result<Vec<_>, _>>()?;
                    parts.push(if key == "$and" {
                        Predicate::And(subs)
                    } else {
                        Predicate::Or(subs)
                    });
                }
                field if field.starts_with('$') => {
                    return Err(format!("unknown top-level operator '{field}'"));
                }
                field => parts.push(Self::parse_field(field, val)?),
            }
        }
        Ok(match parts.len() {
            0 => Predicate::All,
            1 => parts.pop().unwrap_or(Predicate::All),
            _ => Predicate::And(parts),
        })
    }

    fn parse_field(field: &str, val: &Value) -> Result<Predicate, String> {
        let Value::Object(ops) = val else {
            // Bare value: equality match.
            return Ok(Predicate::Cmp {
                field: field.to_string(),
                op: CmpOp::Eq,
                value: val.clone(),
            });
        };
        // Object value with no operator keys is a literal sub-document match.
        if !ops.keys().any(|k| k.starts_with('$')) {
            return Ok(Predicate::Cmp {
                field: field.to_string(),
                op: CmpOp::Eq,
                value: val.clone(),
            });
        }
        let mut parts = Vec::with_capacity(ops.len());
        for (op, operand) in ops {
            let pred = match op.as_str() {
                "$eq" => cmp(field, CmpOp::Eq, operand),
                "$ne" => cmp(field, CmpOp::Ne, operand),
                "$gt" => cmp(field, CmpOp::Gt, operand),
                "$gte" => cmp(field, CmpOp::Gte, operand),
                "$lt" => cmp(field, CmpOp::Lt, operand),
                "$lte" => cmp(field, CmpOp::Lte, operand),
                "$in" | "$nin" => {
                    let Value::Array(values) = operand else {
                        return Err(format!("{op} on '{field}' expects an array"));
                    };
                    Predicate::In {
                        field: field.to_string(),
                        values: values.clone(),
                        negated: op == "$nin",
                    }
                }
                "$exists" => Predicate::Exists {
                    field: field.to_string(),
                    exists: matches!(operand, Value::Bool(true)),
                },
                other => return Err(format!("unknown operator '{other}' on '{field}'")),
            };
            parts.push(pred);
        }
        Ok(match parts.len() {
            1 => parts.pop().unwrap_or(Predicate::All),
            _ => Predicate::And(parts),
        })
    }

    /// Evaluate against the current fact. Missing fields resolve to null.
    pub fn matches(&self, fact: &Fact) -> bool {
        match self {
            Predicate::All => true,
            Predicate::And(parts) => parts.iter().all(|p| p.matches(fact)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(fact)),
            Predicate::Cmp { field, op, value } => {
                let actual = fact.field(field).unwrap_or(Value::Null);
                compare_with(&actual, *op, value)
            }
            Predicate::In {
                field,
                values,
                negated,
            } => {
                let actual = fact.field(field).unwrap_or(Value::Null);
                let hit = values
                    .iter()
                    .any(|v| actual.compare(v) == Some(std::cmp::Ordering::Equal));
                hit != *negated
            }
            Predicate::Exists { field, exists } => fact.field(field).is_some() == *exists,
        }
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(parts: Vec<Predicate>) -> Predicate {
        let mut flat = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Predicate::All => {}
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::All,
            1 => flat.pop().unwrap_or(Predicate::All),
            _ => Predicate::And(flat),
        }
    }

    /// Visit every value position, mutably. Used by placeholder substitution.
    pub fn visit_values_mut<F: FnMut(&mut Value)>(&mut self, f: &mut F) {
        match self {
            Predicate::All | Predicate::Exists { .. } => {}
            Predicate::And(parts) | Predicate::Or(parts) => {
                for p in parts {
                    p.visit_values_mut(f);
                }
            }
            Predicate::Cmp { value, .. } => f(value),
            Predicate::In { values, .. } => {
                for v in values {
                    f(v);
                }
            }
        }
    }
}

fn cmp(field: &str, op: CmpOp, operand: &Value) -> Predicate {
    Predicate::Cmp {
        field: field.to_string(),
        op,
        value: operand.clone(),
    }
}

fn compare_with(actual: &Value, op: CmpOp, expected: &Value) -> bool {
    use std::cmp::Ordering::*;
    let ord = actual.compare(expected);
    match op {
        CmpOp::Eq => ord == Some(Equal),
        CmpOp::Ne => ord != Some(Equal),
        CmpOp::Gt => ord == Some(Greater),
        CmpOp::Gte => matches!(ord, Some(Greater | Equal)),
        CmpOp::Lt => ord == Some(Less),
        CmpOp::Lte => matches!(ord, Some(Less | Equal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn parse_json(json: &str) -> Predicate {
        let raw: serde_json::Value = serde_json::from_str(json).expect("valid json");
        Predicate::parse(&Value::from_json(raw)).expect("valid condition")
    }

    fn fact_with(data: &[(&str, Value)]) -> Fact {
        Fact {
            id: "f-1".into(),
            fact_type: 1,
            created_at: Utc::now(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_parse_bare_equality() {
        let p = parse_json(r#"{"channel":"web"}"#);
        assert_eq!(
            p,
            Predicate::Cmp {
                field: "channel".into(),
                op: CmpOp::Eq,
                value: Value::Text("web".into()),
            }
        );
    }

    #[test]
    fn test_parse_operators_and_multi_field() {
        let p = parse_json(r#"{"amount":{"$gte":10,"$lt":100},"channel":"web"}"#);
        let Predicate::And(parts) = p else { panic!("expected And") };
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_parse_or() {
        let p = parse_json(r#"{"$or":[{"channel":"web"},{"channel":"pos"}]}"#);
        assert!(matches!(p, Predicate::Or(ref parts) if parts.len() == 2));
    }

    #[test]
    fn test_parse_rejects_unknown_operator() {
        let raw: serde_json::Value =
            serde_json::from_str(r#"{"amount":{"$regex":"x"}}"#).expect("valid json");
        assert!(Predicate::parse(&Value::from_json(raw)).is_err());
    }

    #[test]
    fn test_empty_condition_matches_all() {
        let p = parse_json("{}");
        assert_eq!(p, Predicate::All);
        assert!(p.matches(&fact_with(&[])));
    }

    #[test]
    fn test_matches_range() {
        let p = parse_json(r#"{"amount":{"$gte":10,"$lt":100}}"#);
        assert!(p.matches(&fact_with(&[("amount", Value::Int(50))])));
        assert!(!p.matches(&fact_with(&[("amount", Value::Int(100))])));
        assert!(!p.matches(&fact_with(&[])));
    }

    #[test]
    fn test_matches_in_nin() {
        let p = parse_json(r#"{"channel":{"$in":["web","pos"]}}"#);
        assert!(p.matches(&fact_with(&[("channel", Value::Text("pos".into()))])));
        assert!(!p.matches(&fact_with(&[("channel", Value::Text("atm".into()))])));

        let n = parse_json(r#"{"channel":{"$nin":["web"]}}"#);
        assert!(n.matches(&fact_with(&[("channel", Value::Text("atm".into()))])));
    }

    #[test]
    fn test_matches_exists_and_meta_field() {
        let p = parse_json(r#"{"amount":{"$exists":true},"type":1}"#);
        assert!(p.matches(&fact_with(&[("amount", Value::Int(1))])));
        assert!(!p.matches(&fact_with(&[])));
    }

    #[test]
    fn test_ne_on_missing_field() {
        let p = parse_json(r#"{"channel":{"$ne":"web"}}"#);
        assert!(p.matches(&fact_with(&[])));
    }

    #[test]
    fn test_and_helper_flattens() {
        let merged = Predicate::and(vec![
            Predicate::All,
            Predicate::And(vec![
                Predicate::Exists {
                    field: "a".into(),
                    exists: true,
                },
                Predicate::Exists {
                    field: "b".into(),
                    exists: true,
                },
            ]),
        ]);
        assert!(matches!(merged, Predicate::And(ref parts) if parts.len() == 2));
    }
}
