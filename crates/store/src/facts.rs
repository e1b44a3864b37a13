// crates/store/src/facts.rs
//! Fact upserts and aggregation over the fact collection.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tally_core::error::QueryError;
use tally_core::fact::Fact;
use tally_core::pipeline::{facts_aggregation, Collection, Stage};
use tally_core::value::Value;

use crate::{Store, StoreResult};

/// What a fact upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SaveKind {
    Inserted,
    Updated,
    /// The stored document already equals the incoming one (retry of the
    /// same logical event).
    Ignored,
}

#[derive(Debug, Clone)]
pub struct SaveFactOutcome {
    pub kind: SaveKind,
    pub id: String,
    pub latency: Duration,
}

/// Result envelope of one aggregation; storage failures are data here,
/// never raised.
#[derive(Debug, Clone)]
pub struct AggregateOutcome {
    /// One document keyed by counter name (absent on error).
    pub counters: Option<Value>,
    pub latency: Duration,
    pub error: Option<QueryError>,
}

impl Store {
    /// Upsert a fact keyed on its id.
    ///
    /// The id is a deterministic content hash, so a conflicting row with
    /// identical content is a retry and reports `Ignored`.
    pub async fn save_fact(&self, fact: &Fact) -> StoreResult<SaveFactOutcome> {
        let started = Instant::now();
        let data = serde_json::to_string(&fact.data)?;
        let created_at = fact.created_at.timestamp_millis();

        let inserted = sqlx::query(
            r#"INSERT INTO facts (id, "type", created_at, data) VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(&fact.id)
        .bind(fact.fact_type as i64)
        .bind(created_at)
        .bind(&data)
        .execute(self.write_pool())
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(SaveFactOutcome {
                kind: SaveKind::Inserted,
                id: fact.id.clone(),
                latency: started.elapsed(),
            });
        }

        // Conflict: recover the stored document to tell a duplicate retry
        // from a genuine update.
        let (stored_type, stored_created, stored_data): (i64, i64, String) =
            sqlx::query_as(r#"SELECT "type", created_at, data FROM facts WHERE id = ?1"#)
                .bind(&fact.id)
                .fetch_one(self.write_pool())
                .await?;

        let kind = if stored_type == fact.fact_type as i64
            && stored_created == created_at
            && stored_data == data
        {
            SaveKind::Ignored
        } else {
            sqlx::query(
                r#"UPDATE facts SET "type" = ?2, created_at = ?3, data = ?4 WHERE id = ?1"#,
            )
            .bind(&fact.id)
            .bind(fact.fact_type as i64)
            .bind(created_at)
            .bind(&data)
            .execute(self.write_pool())
            .await?;
            SaveKind::Updated
        };

        debug!(fact_id = %fact.id, ?kind, "fact upsert resolved on conflict");
        Ok(SaveFactOutcome {
            kind,
            id: fact.id.clone(),
            latency: started.elapsed(),
        })
    }

    /// Read a fact back by id (tests and the ingest facade use this).
    pub async fn get_fact(&self, id: &str) -> StoreResult<Option<Fact>> {
        let row: Option<(i64, i64, String)> =
            sqlx::query_as(r#"SELECT "type", created_at, data FROM facts WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(self.read_pool())
                .await?;
        let Some((fact_type, created_at, data)) = row else {
            return Ok(None);
        };
        let data: BTreeMap<String, Value> = serde_json::from_str(&data)?;
        Ok(Some(Fact {
            id: id.to_string(),
            fact_type: fact_type as i32,
            created_at: chrono::DateTime::from_timestamp_millis(created_at)
                .unwrap_or_default(),
            data,
        }))
    }

    /// Aggregate facts by id-in-set with one facet arm per counter.
    pub async fn aggregate_facts(
        &self,
        fact_ids: &[String],
        facets: BTreeMap<String, Vec<Stage>>,
    ) -> AggregateOutcome {
        let stages = facts_aggregation(fact_ids, facets);
        self.aggregate_pipeline(Collection::Facts, &stages).await
    }

    /// Run a full pipeline, folding storage failures into the outcome.
    pub async fn aggregate_pipeline(
        &self,
        collection: Collection,
        stages: &[Stage],
    ) -> AggregateOutcome {
        let started = Instant::now();
        match self.run_pipeline(collection, stages).await {
            Ok(mut rows) => AggregateOutcome {
                counters: if rows.is_empty() { None } else { Some(rows.remove(0)) },
                latency: started.elapsed(),
                error: None,
            },
            Err(e) => AggregateOutcome {
                counters: None,
                latency: started.elapsed(),
                error: Some(QueryError::storage(e.to_string())),
            },
        }
    }
}
