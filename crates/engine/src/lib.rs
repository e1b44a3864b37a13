// crates/engine/src/lib.rs
// Counter orchestrator: composes catalog, planner, gateway and worker pool
// into the public `compute_counters` / `ingest_message` entry points.

pub mod ingest;
pub mod metrics;
mod orchestrator;

pub use ingest::IngestOutcome;
pub use orchestrator::{ComputeMetrics, ComputeOptions, ComputeOutcome};

use tracing::info;

use tally_core::config::EngineConfig;
use tally_core::counter::CounterCatalog;
use tally_core::error::{EngineError, EngineResult};
use tally_pool::{QueryDispatcher, WorkerInit};
use tally_store::Store;

/// One engine instance per service process: owns the storage gateway, the
/// compiled catalog, and (when configured) the query worker pool.
pub struct Engine {
    config: EngineConfig,
    catalog: CounterCatalog,
    store: Store,
    dispatcher: Option<QueryDispatcher>,
}

impl Engine {
    /// Build the engine from configuration. Only misconfiguration and
    /// resource-creation failures escalate.
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        let store = Store::open(&config.database)
            .await
            .map_err(|e| EngineError::Fatal(format!("cannot open store: {e}")))?;
        Self::with_store(config, store)
    }

    /// Build the engine around an existing gateway (tests seed the store
    /// before handing it over).
    pub fn with_store(config: EngineConfig, store: Store) -> EngineResult<Self> {
        let catalog = config
            .compile_catalog()
            .map_err(|e| EngineError::Fatal(format!("counter catalog: {e}")))?;

        let dispatcher = if config.pool.worker_count > 0 {
            let init = WorkerInit {
                connection_string: config.database.path.clone(),
                database_name: config.database.database_name.clone(),
                database_options: None,
            };
            Some(QueryDispatcher::new(config.pool.clone(), init)?)
        } else {
            None
        };

        info!(
            counters = catalog.len(),
            indexes = config.indexes.len(),
            workers = config.pool.worker_count,
            strategy = ?config.strategy.resolve(),
            "engine ready"
        );
        Ok(Self {
            config,
            catalog,
            store,
            dispatcher,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn dispatcher(&self) -> Option<&QueryDispatcher> {
        self.dispatcher.as_ref()
    }

    pub async fn shutdown(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown().await;
        }
    }
}
