// crates/store/src/migrations.rs
// Inline schema migrations, applied in order and tracked by version in the
// `_migrations` table.

pub const MIGRATIONS: &[&str] = &[
    // v1: fact documents. `data` is the JSON payload written by the ingest
    // path and read back by counter aggregations.
    r#"CREATE TABLE IF NOT EXISTS facts (
        id TEXT PRIMARY KEY,
        type INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        data TEXT NOT NULL
    )"#,
    // v2: secondary lookup rows. (hash, fact_id) is the uniqueness key;
    // `data` optionally embeds fact fields under the embedded strategy.
    r#"CREATE TABLE IF NOT EXISTS index_entries (
        hash TEXT NOT NULL,
        fact_id TEXT NOT NULL,
        fact_time INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        index_type INTEGER NOT NULL,
        index_encoding INTEGER NOT NULL,
        field_value TEXT,
        data TEXT,
        PRIMARY KEY (hash, fact_id)
    )"#,
    // v3: lookup path — hash equality plus a fact_time window, newest first.
    "CREATE INDEX IF NOT EXISTS idx_entries_hash_time ON index_entries(hash, fact_time DESC)",
    // v4: best-effort ingest log.
    r#"CREATE TABLE IF NOT EXISTS ingest_log (
        id INTEGER PRIMARY KEY,
        logged_at INTEGER NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        context TEXT
    )"#,
    // v5: created_at ordering for facts aggregated directly.
    "CREATE INDEX IF NOT EXISTS idx_facts_created ON facts(created_at DESC)",
];
