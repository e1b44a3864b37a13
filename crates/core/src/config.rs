// crates/core/src/config.rs
//! Engine configuration: a TOML file for the service knobs plus an optional
//! JSON catalog file for counter definitions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::counter::{CounterCatalog, CounterSpec};
use crate::error::ConfigError;
use crate::fact::IndexDescriptor;
use crate::pipeline::Collection;
pub use crate::planner::PlannerConfig;
use crate::planner::TimeField;

/// Connection settings for the two storage clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// SQLite database path; `:memory:` is accepted for tests.
    pub path: String,
    /// Logical database name handed to workers at INIT time.
    pub database_name: String,
    /// Pool size of the write-tuned client.
    pub max_connections: u32,
    /// Pool size of the read-preferred client (shared by lookups and
    /// locally-run aggregations).
    pub read_max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "tally.db".into(),
            database_name: "tally".into(),
            max_connections: 4,
            read_max_connections: 8,
            busy_timeout_ms: 30_000,
        }
    }
}

/// The two booleans selecting the counter-evaluation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyConfig {
    pub embed_fact_data_in_index: bool,
    pub join_facts_from_index: bool,
}

/// The chosen execution shape for counter aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Lookup fact ids by index, then aggregate over the fact collection.
    Facts,
    /// Aggregate over index entries with a join to the parent facts.
    Lookup,
    /// Aggregate over index entries directly (fact data is embedded).
    Embedded,
}

impl StrategyConfig {
    pub fn resolve(&self) -> Strategy {
        match (self.embed_fact_data_in_index, self.join_facts_from_index) {
            (false, false) => Strategy::Facts,
            (false, true) => Strategy::Lookup,
            (true, false) => Strategy::Embedded,
            (true, true) => {
                warn!(
                    "embedFactDataInIndex and joinFactsFromIndex are both set; \
                     using the lookup strategy"
                );
                Strategy::Lookup
            }
        }
    }
}

impl Strategy {
    pub fn time_field(&self) -> TimeField {
        match self {
            Strategy::Facts => TimeField::CreatedAt,
            Strategy::Lookup | Strategy::Embedded => TimeField::FactTime,
        }
    }

    /// Collection the aggregation pipelines run against.
    pub fn collection(&self) -> Collection {
        match self {
            Strategy::Facts => Collection::Facts,
            Strategy::Lookup | Strategy::Embedded => Collection::IndexEntries,
        }
    }
}

/// Worker-pool sizing and IPC policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Number of subordinate query processes. 0 disables the pool.
    pub worker_count: u32,
    /// Batch fan-out per `execute_queries` call.
    pub min_workers: u32,
    pub worker_init_timeout_ms: u64,
    /// Per-batch deadline.
    pub default_timeout_ms: u64,
    /// Admission wait for a free worker.
    pub max_wait_for_workers_ms: u64,
    /// Compact binary IPC codec instead of the text codec.
    pub binary_codec: bool,
    /// Worker executable; defaults to `tally-query-worker` next to the
    /// current executable.
    pub worker_command: Option<PathBuf>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_count: 0,
            min_workers: 2,
            worker_init_timeout_ms: 10_000,
            default_timeout_ms: 60_000,
            max_wait_for_workers_ms: 5_000,
            binary_codec: false,
            worker_command: None,
        }
    }
}

/// Knobs of the ingest path itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestSettings {
    /// Single unordered bulk upsert for index entries (true) or parallel
    /// per-entry upserts with individual latencies (false).
    pub bulk_index_writes: bool,
    /// Default per-group record budget when counters carry none.
    pub depth_limit: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            bulk_index_writes: true,
            depth_limit: 1000,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub planner: PlannerConfig,
    pub strategy: StrategyConfig,
    pub pool: PoolSettings,
    pub ingest: IngestSettings,
    pub indexes: Vec<IndexDescriptor>,
    /// Inline counter definitions.
    pub counters: Vec<CounterSpec>,
    /// Additional counter definitions loaded from a JSON file.
    pub counters_file: Option<PathBuf>,
}

impl EngineConfig {
    /// Load the TOML config and fold in the JSON counter catalog when one
    /// is referenced.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: EngineConfig =
            toml::from_str(&text).map_err(|e| ConfigError::MalformedToml {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        if let Some(counters_file) = config.counters_file.clone() {
            let resolved = if counters_file.is_relative() {
                path.parent()
                    .map(|dir| dir.join(&counters_file))
                    .unwrap_or(counters_file)
            } else {
                counters_file
            };
            config.counters.extend(load_counters_json(&resolved)?);
        }
        Ok(config)
    }

    pub fn compile_catalog(&self) -> Result<CounterCatalog, ConfigError> {
        CounterCatalog::compile(&self.counters)
    }

    pub fn index_by_type_name(&self, index_type_name: &str) -> Option<&IndexDescriptor> {
        self.indexes
            .iter()
            .find(|d| d.index_type_name == index_type_name)
    }
}

/// Load counter definitions from a JSON array file.
pub fn load_counters_json(path: &Path) -> Result<Vec<CounterSpec>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::MalformedJson {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
