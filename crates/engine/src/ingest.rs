// crates/engine/src/ingest.rs
//! Ingest facade: the library boundary the (external) HTTP front-end
//! calls. Saves the fact and its derived index entries, computes counters,
//! and appends a best-effort log record.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use tally_core::error::{EngineError, EngineResult};
use tally_core::fact::{Fact, IndexEntry};
use tally_core::value::Value;
use tally_store::{LogRecord, SaveKind};

use crate::orchestrator::{ComputeMetrics, ComputeOptions};
use crate::Engine;

/// Response of one ingested message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub fact_id: String,
    pub save_kind: SaveKind,
    pub entries_inserted: u64,
    pub entries_updated: u64,
    pub entries_duplicates: u64,
    pub counters: BTreeMap<String, Value>,
    pub metrics: ComputeMetrics,
}

impl Engine {
    /// Validate, persist, and evaluate one message.
    ///
    /// Counters are computed against an eventually-consistent view: the
    /// just-saved fact need not appear in its own counter response.
    pub async fn ingest_message(
        &self,
        fact: &Fact,
        entries: &[IndexEntry],
        opts: &ComputeOptions,
    ) -> EngineResult<IngestOutcome> {
        fact.validate()?;
        for entry in entries {
            entry.validate()?;
        }

        let saved = self
            .store()
            .save_fact(fact)
            .await
            .map_err(|e| EngineError::Fatal(format!("fact save failed: {e}")))?;

        let entry_outcome = self
            .store()
            .save_index_entries(entries, self.config().ingest.bulk_index_writes)
            .await
            .map_err(|e| EngineError::Fatal(format!("index save failed: {e}")))?;

        let computed = self.compute_counters(fact, entries, opts).await?;

        info!(
            fact_id = %saved.id,
            save_kind = ?saved.kind,
            counters = computed.counters.len(),
            "message ingested"
        );
        self.store()
            .append_log(
                LogRecord::info("message ingested").with_context(Value::Object(BTreeMap::from([
                    ("factId".to_string(), Value::Text(saved.id.clone())),
                    (
                        "counters".to_string(),
                        Value::Int(computed.counters.len() as i64),
                    ),
                ]))),
            )
            .await;

        Ok(IngestOutcome {
            fact_id: saved.id,
            save_kind: saved.kind,
            entries_inserted: entry_outcome.inserted,
            entries_updated: entry_outcome.updated,
            entries_duplicates: entry_outcome.duplicates,
            counters: computed.counters,
            metrics: computed.metrics,
        })
    }
}
