// crates/core/src/error.rs
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that escalate out of the engine.
///
/// Everything else (timeouts, dead workers, storage failures on a single
/// group) is carried as data inside result envelopes — see [`QueryError`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller handed us a fact or index entry that violates an input
    /// invariant. The computation is not attempted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Misconfiguration or resource-creation failure that makes the engine
    /// unusable (bad connection string, worker pool could not be created).
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while loading and compiling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed TOML in {path}: {message}")]
    MalformedToml { path: String, message: String },

    #[error("Malformed JSON in {path}: {message}")]
    MalformedJson { path: String, message: String },

    #[error("Counter '{name}': {message}")]
    BadCounter { name: String, message: String },

    #[error("Index descriptor '{name}': {message}")]
    BadIndex { name: String, message: String },
}

/// Classification of a degraded (non-escalating) query failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryErrorKind {
    /// A dispatched batch exceeded its deadline.
    BatchTimeout,
    /// No worker became free within the admission wait budget.
    NoReadyWorkers,
    /// The worker process assigned to the batch exited before replying.
    WorkerDied,
    /// The storage backend rejected or failed the query.
    Storage,
    /// The worker's reply did not contain a result for this request.
    MissingResult,
}

/// A per-request / per-group failure, carried in result envelopes and
/// enumerated in the metrics envelope. Never raised.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{kind:?}: {message}")]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Storage, message)
    }
}
