//! Desired worker configuration and its runtime counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace prepended to a plugin-supplied identity to form a `worker_id`.
pub const WORKER_ID_PREFIX: &str = "broccoli.worker.";

/// `error_resiliency` value meaning "report every failure".
pub const REPORT_EVERY_FAILURE: i64 = -1;

/// Slug of the unconstrained executor, the default owner of new workers.
pub const DEFAULT_EXECUTOR_SLUG: &str = "native";

/// Build the canonical worker id from a plugin's `id()`.
pub fn worker_id_for(plugin_id: &str) -> String {
    format!("{WORKER_ID_PREFIX}{plugin_id}")
}

/// What an operator wants running: which plugin, how often, how tolerant, and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub module: String,
    pub class_name: String,
    /// Passed verbatim to the plugin constructor.
    pub args: Vec<serde_json::Value>,
    pub interval_seconds: i64,
    pub error_resiliency: i64,
    pub executor_slug: String,
}

impl WorkerDefinition {
    /// A definition reporting every failure, owned by the default executor.
    pub fn new(
        module: impl Into<String>,
        class_name: impl Into<String>,
        args: Vec<serde_json::Value>,
        interval_seconds: i64,
    ) -> Self {
        Self {
            module: module.into(),
            class_name: class_name.into(),
            args,
            interval_seconds,
            error_resiliency: REPORT_EVERY_FAILURE,
            executor_slug: DEFAULT_EXECUTOR_SLUG.to_string(),
        }
    }

    pub fn with_error_resiliency(mut self, error_resiliency: i64) -> Self {
        self.error_resiliency = error_resiliency;
        self
    }

    pub fn with_executor_slug(mut self, slug: impl Into<String>) -> Self {
        self.executor_slug = slug.into();
        self
    }

    /// Whether a change from `other` requires building a fresh tick function.
    ///
    /// Interval and executor moves are handled by the executors themselves.
    pub fn needs_rewrap(&self, other: &WorkerDefinition) -> bool {
        self.module != other.module
            || self.class_name != other.class_name
            || self.args != other.args
            || self.error_resiliency != other.error_resiliency
    }
}

/// Runtime counters stored next to the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRuntimeState {
    /// Consecutive failures since the last success.
    pub error_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    /// Reserved per-worker state; not mutated by the orchestrator.
    pub state: serde_json::Value,
}

impl Default for WorkerRuntimeState {
    fn default() -> Self {
        Self {
            error_count: 0,
            last_executed_at: None,
            state: serde_json::json!({}),
        }
    }
}

/// A persisted worker document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub definition: WorkerDefinition,
    pub runtime: WorkerRuntimeState,
}
