//! Error types for the orchestrator.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures resolving a worker plugin.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Worker module {module} is not registered")]
    NotFound { module: String },

    #[error("Failed to construct {module}.{class_name}: {source}")]
    ConstructionFailed {
        module: String,
        class_name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Typed failures of the worker configuration store.
#[derive(Debug, thiserror::Error)]
pub enum WorkerConfigError {
    #[error("Worker with id {worker_id} does not exist")]
    NotFound { worker_id: String },

    #[error("Worker with id {worker_id} already exists")]
    AlreadyExists { worker_id: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Executor scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor {slug} is full ({capacity} workers)")]
    CapacityExceeded { slug: String, capacity: usize },

    #[error("Worker {worker_id} is already scheduled on {slug}")]
    AlreadyScheduled { slug: String, worker_id: String },

    #[error("Worker {worker_id} is not scheduled on {slug}")]
    NotScheduled { slug: String, worker_id: String },

    #[error("Invalid interval {interval_seconds}s for worker {worker_id}")]
    InvalidInterval {
        worker_id: String,
        interval_seconds: i64,
    },
}

/// Failures raised by a worker's `pre_work`/`work`.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),

    #[error("Content store error: {0}")]
    Content(#[source] DatabaseError),

    #[error("Metadata error: {0}")]
    Metadata(#[source] DatabaseError),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    /// Shorthand for a plain failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        WorkerError::Failed(message.into())
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        WorkerError::Failed(format!("{err:#}"))
    }
}
