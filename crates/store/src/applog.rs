// crates/store/src/applog.rs
//! Best-effort ingest log. Failures are logged and swallowed.

use chrono::Utc;
use tracing::warn;

use tally_core::value::Value;

use crate::Store;

/// One ingest-log row.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
    pub context: Option<Value>,
}

impl LogRecord {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: "info".into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl Store {
    /// Append a log record. Errors are logged but never propagated.
    pub async fn append_log(&self, record: LogRecord) {
        let context = record
            .context
            .as_ref()
            .map(|c| c.to_json().to_string());
        let result = sqlx::query(
            "INSERT INTO ingest_log (logged_at, level, message, context) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(&record.level)
        .bind(&record.message)
        .bind(context)
        .execute(self.write_pool())
        .await;

        if let Err(e) = result {
            warn!(error = %e, "failed to append ingest log record");
        }
    }
}
