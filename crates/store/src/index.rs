// crates/store/src/index.rs
//! Index-entry writes, ordered lookups, and aggregation over the index
//! collection.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::debug;

use tally_core::fact::IndexEntry;
use tally_core::pipeline::{Collection, Stage};

use crate::facts::AggregateOutcome;
use crate::{Store, StoreError, StoreResult};

/// Outcome of a `save_index_entries` call. Partial write errors are
/// reported, not raised.
#[derive(Debug, Clone, Default)]
pub struct SaveEntriesOutcome {
    pub inserted: u64,
    /// Existing `(hash, factId)` rows whose payload changed.
    pub updated: u64,
    /// Existing rows re-derived unchanged; only `created_at` refreshed.
    pub duplicates: u64,
    pub errors: Vec<String>,
    pub latency: Duration,
    /// Individual upsert latencies in per-entry mode.
    pub per_entry_latency: Option<Vec<Duration>>,
}

/// Parameters of one ordered index lookup.
#[derive(Debug, Clone)]
pub struct IndexLookup {
    pub hash: String,
    /// Inclusive lower `fact_time` bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper `fact_time` bound.
    pub to: Option<DateTime<Utc>>,
    /// Record budget (0 = unlimited).
    pub depth: u32,
}

#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub fact_ids: Vec<String>,
    pub matched_count: u64,
    pub latency: Duration,
}

enum UpsertKind {
    Inserted,
    Updated,
    Duplicate,
}

impl Store {
    /// Save derived index entries.
    ///
    /// `bulk` mode runs every upsert inside one transaction; per-entry mode
    /// runs them in parallel and reports individual latencies for
    /// diagnostics.
    pub async fn save_index_entries(
        &self,
        entries: &[IndexEntry],
        bulk: bool,
    ) -> StoreResult<SaveEntriesOutcome> {
        let started = Instant::now();
        let mut outcome = SaveEntriesOutcome::default();

        if entries.is_empty() {
            outcome.latency = started.elapsed();
            return Ok(outcome);
        }

        if bulk {
            let mut tx = self.write_pool().begin().await?;
            for entry in entries {
                match upsert_entry(&mut *tx, entry).await {
                    Ok(kind) => outcome.tally(kind),
                    Err(e) => outcome.errors.push(format!("{}/{}: {e}", entry.hash, entry.fact_id)),
                }
            }
            tx.commit().await?;
        } else {
            let upserts = entries.iter().map(|entry| async move {
                let entry_started = Instant::now();
                let result = async {
                    let mut conn = self.write_pool().acquire().await?;
                    upsert_entry(&mut *conn, entry).await
                }
                .await;
                (entry, result, entry_started.elapsed())
            });
            let mut latencies = Vec::with_capacity(entries.len());
            for (entry, result, latency) in join_all(upserts).await {
                match result {
                    Ok(kind) => outcome.tally(kind),
                    Err(e) => outcome.errors.push(format!("{}/{}: {e}", entry.hash, entry.fact_id)),
                }
                latencies.push(latency);
            }
            outcome.per_entry_latency = Some(latencies);
        }

        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            duplicates = outcome.duplicates,
            errors = outcome.errors.len(),
            "index entries saved"
        );
        outcome.latency = started.elapsed();
        Ok(outcome)
    }

    /// Find matching index entries by hash and fact-time window, newest
    /// first, projecting only the fact-id column.
    pub async fn lookup_index(&self, lookup: &IndexLookup) -> StoreResult<LookupOutcome> {
        let started = Instant::now();
        let mut sql = String::from(
            "SELECT fact_id FROM index_entries WHERE hash = ?1",
        );
        if lookup.from.is_some() {
            sql.push_str(" AND fact_time >= ?2");
        }
        if lookup.to.is_some() {
            sql.push_str(&format!(
                " AND fact_time < ?{}",
                if lookup.from.is_some() { 3 } else { 2 }
            ));
        }
        sql.push_str(" ORDER BY hash ASC, fact_time DESC");
        if lookup.depth > 0 {
            sql.push_str(&format!(" LIMIT {}", lookup.depth));
        }

        let mut query = sqlx::query_as::<_, (String,)>(&sql).bind(&lookup.hash);
        if let Some(from) = lookup.from {
            query = query.bind(from.timestamp_millis());
        }
        if let Some(to) = lookup.to {
            query = query.bind(to.timestamp_millis());
        }
        let rows = query.fetch_all(self.read_pool()).await?;

        let fact_ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        Ok(LookupOutcome {
            matched_count: fact_ids.len() as u64,
            fact_ids,
            latency: started.elapsed(),
        })
    }

    /// Run a full pipeline against the index collection; the pipeline may
    /// carry a fact join when the caller requested enrichment.
    pub async fn aggregate_index(&self, stages: &[Stage]) -> AggregateOutcome {
        self.aggregate_pipeline(Collection::IndexEntries, stages).await
    }
}

impl SaveEntriesOutcome {
    fn tally(&mut self, kind: UpsertKind) {
        match kind {
            UpsertKind::Inserted => self.inserted += 1,
            UpsertKind::Updated => self.updated += 1,
            UpsertKind::Duplicate => self.duplicates += 1,
        }
    }
}

/// Upsert one entry keyed by `(hash, fact_id)`.
///
/// An existing row with an unchanged payload only has `created_at`
/// refreshed (re-derivation); a changed payload is rewritten.
async fn upsert_entry(
    conn: &mut sqlx::SqliteConnection,
    entry: &IndexEntry,
) -> Result<UpsertKind, StoreError> {
    let fact_time = entry.fact_time.timestamp_millis();
    let created_at = entry.created_at.timestamp_millis();
    let data = match &entry.data {
        Some(data) => Some(serde_json::to_string(data)?),
        None => None,
    };

    let existing: Option<(i64, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT fact_time, field_value, data FROM index_entries WHERE hash = ?1 AND fact_id = ?2",
    )
    .bind(&entry.hash)
    .bind(&entry.fact_id)
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        None => {
            sqlx::query(
                r#"INSERT INTO index_entries
                   (hash, fact_id, fact_time, created_at, index_type, index_encoding, field_value, data)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                   ON CONFLICT(hash, fact_id) DO UPDATE SET created_at = excluded.created_at"#,
            )
            .bind(&entry.hash)
            .bind(&entry.fact_id)
            .bind(fact_time)
            .bind(created_at)
            .bind(entry.index_type as i64)
            .bind(entry.index_encoding as i64)
            .bind(&entry.field_value)
            .bind(&data)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertKind::Inserted)
        }
        Some((stored_time, stored_field, stored_data))
            if stored_time == fact_time
                && stored_field == entry.field_value
                && stored_data == data =>
        {
            sqlx::query(
                "UPDATE index_entries SET created_at = ?3 WHERE hash = ?1 AND fact_id = ?2",
            )
            .bind(&entry.hash)
            .bind(&entry.fact_id)
            .bind(created_at)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertKind::Duplicate)
        }
        Some(_) => {
            sqlx::query(
                r#"UPDATE index_entries
                   SET fact_time = ?3, created_at = ?4, index_type = ?5, index_encoding = ?6,
                       field_value = ?7, data = ?8
                   WHERE hash = ?1 AND fact_id = ?2"#,
            )
            .bind(&entry.hash)
            .bind(&entry.fact_id)
            .bind(fact_time)
            .bind(created_at)
            .bind(entry.index_type as i64)
            .bind(entry.index_encoding as i64)
            .bind(&entry.field_value)
            .bind(&data)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertKind::Updated)
        }
    }
}
