// crates/store/src/lib.rs
// Storage gateway: two SQLite clients (write-tuned and read-preferred),
// fact/index upserts, ordered lookups, and pipeline aggregation.

pub mod applog;
pub mod facts;
pub mod index;
mod metrics;
mod migrations;
pub mod render;

pub use applog::LogRecord;
pub use facts::{AggregateOutcome, SaveFactOutcome, SaveKind};
pub use index::{IndexLookup, LookupOutcome, SaveEntriesOutcome};

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use tally_core::config::DatabaseConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("unsupported pipeline: {0}")]
    Render(String),

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage gateway over one SQLite database.
///
/// Both clients share the same connection string; writes go through
/// `write_pool`, lookups and locally-run aggregations through the larger
/// `read_pool` (the stand-in for a secondary-preferred replica client).
#[derive(Debug, Clone)]
pub struct Store {
    write_pool: SqlitePool,
    read_pool: SqlitePool,
    path: String,
}

impl Store {
    /// Open (or create) the database and run migrations.
    pub async fn open(config: &DatabaseConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let write_pool = pool_with_events("write", config.max_connections, options.clone()).await?;
        let read_pool = pool_with_events(
            "read",
            config.read_max_connections,
            options.read_only(false),
        )
        .await?;

        let store = Self {
            write_pool,
            read_pool,
            path: config.path.clone(),
        };
        store.run_migrations().await?;
        info!(path = %config.path, "store opened");
        Ok(store)
    }

    /// Open a read-only gateway (workers hold exactly one of these). The
    /// database is expected to exist and already be in WAL mode.
    pub async fn open_read_only(path: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .busy_timeout(Duration::from_secs(30))
            .read_only(true);
        let read_pool = pool_with_events("worker-read", max_connections, options).await?;
        Ok(Self {
            write_pool: read_pool.clone(),
            read_pool,
            path: path.to_string(),
        })
    }

    /// In-memory store for tests.
    ///
    /// Each instance gets its own named shared-cache database: the name
    /// makes both pools (and all their connections) see the same data,
    /// while keeping concurrently-running tests isolated from each other —
    /// a bare `:memory:?cache=shared` is one database per process.
    pub async fn open_in_memory() -> StoreResult<Self> {
        static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let name = format!(
            "tally-mem-{}",
            SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        );
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{name}?mode=memory&cache=shared"))?
                .busy_timeout(Duration::from_secs(5));
        let write_pool = pool_with_events("write", 2, options.clone()).await?;
        let read_pool = pool_with_events("read", 4, options).await?;
        let store = Self {
            write_pool,
            read_pool,
            path: ":memory:".into(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")
            .execute(&self.write_pool)
            .await?;

        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM _migrations")
            .fetch_one(&self.write_pool)
            .await?;
        let current_version = row.0 as usize;

        for (i, migration) in migrations::MIGRATIONS.iter().enumerate() {
            let version = i + 1;
            if version > current_version {
                sqlx::query(migration).execute(&self.write_pool).await?;
                sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
                    .bind(version as i64)
                    .execute(&self.write_pool)
                    .await?;
            }
        }
        Ok(())
    }

    pub fn write_pool(&self) -> &SqlitePool {
        &self.write_pool
    }

    pub fn read_pool(&self) -> &SqlitePool {
        &self.read_pool
    }

    /// Connection string handed to workers at INIT time.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Build a pool that forwards its client events to the metrics sink.
async fn pool_with_events(
    client: &'static str,
    max_connections: u32,
    options: SqliteConnectOptions,
) -> StoreResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .after_connect(move |_conn, _meta| {
            Box::pin(async move {
                metrics::record_pool_event(client, "connection-created");
                Ok(())
            })
        })
        .before_acquire(move |_conn, _meta| {
            Box::pin(async move {
                metrics::record_pool_event(client, "checkout-succeeded");
                Ok(true)
            })
        })
        .after_release(move |_conn, _meta| {
            Box::pin(async move {
                metrics::record_pool_event(client, "checked-in");
                Ok(true)
            })
        })
        .connect_with(options)
        .await
        .inspect_err(|_| metrics::record_pool_event(client, "checkout-failed"))?;
    metrics::record_pool_event(client, "ready");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_runs_migrations() {
        let store = Store::open_in_memory()
            .await
            .expect("should create in-memory store");

        for table in ["facts", "index_entries", "ingest_log"] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(store.read_pool())
                .await
                .unwrap_or_else(|_| panic!("{table} table should exist"));
            assert_eq!(count.0, 0);
        }
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let store = Store::open_in_memory().await.expect("first open");
        store
            .run_migrations()
            .await
            .expect("second migration run should succeed");
    }

    #[tokio::test]
    async fn test_open_file_backed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = DatabaseConfig {
            path: tmp.path().join("tally.db").display().to_string(),
            ..DatabaseConfig::default()
        };
        let store = Store::open(&config).await.expect("open");
        assert!(std::path::Path::new(store.path()).exists());
    }
}
