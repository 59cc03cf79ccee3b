//! Operations exposed to an administrative surface (HTTP layer, CLI, ...).
//!
//! Every call returns `Result<_, String>` with a client-facing message so the
//! caller can render failures without inspecting error types.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Database;
use crate::worker::definition::{DEFAULT_EXECUTOR_SLUG, REPORT_EVERY_FAILURE};
use crate::worker::{PluginCache, WorkerConfigStore, WorkerDefinition, WorkerRecord};

/// Request to add a worker. Omitted fields take the defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AddWorkerRequest {
    pub module: String,
    pub class_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub interval_seconds: i64,
    #[serde(default)]
    pub error_resiliency: Option<i64>,
    #[serde(default)]
    pub executor_slug: Option<String>,
}

impl AddWorkerRequest {
    fn into_definition(self) -> WorkerDefinition {
        WorkerDefinition {
            module: self.module,
            class_name: self.class_name,
            args: self.args,
            interval_seconds: self.interval_seconds,
            error_resiliency: self.error_resiliency.unwrap_or(REPORT_EVERY_FAILURE),
            executor_slug: self
                .executor_slug
                .unwrap_or_else(|| DEFAULT_EXECUTOR_SLUG.to_string()),
        }
    }
}

/// One row of the worker listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub module: String,
    pub class_name: String,
    pub args: Vec<serde_json::Value>,
    pub interval_seconds: i64,
    pub error_resiliency: i64,
    pub executor_slug: String,
    pub error_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_executed_seconds_ago: Option<i64>,
}

impl WorkerSummary {
    fn from_record(record: WorkerRecord, now: DateTime<Utc>) -> Self {
        let last_executed_at = record.runtime.last_executed_at;
        Self {
            worker_id: record.worker_id,
            module: record.definition.module,
            class_name: record.definition.class_name,
            args: record.definition.args,
            interval_seconds: record.definition.interval_seconds,
            error_resiliency: record.definition.error_resiliency,
            executor_slug: record.definition.executor_slug,
            error_count: record.runtime.error_count,
            last_executed_at,
            last_executed_seconds_ago: last_executed_at.map(|at| (now - at).num_seconds()),
        }
    }
}

pub struct WorkerAdmin {
    store: Arc<WorkerConfigStore>,
    db: Arc<dyn Database>,
    plugins: Arc<PluginCache>,
    executor_slugs: Vec<String>,
    instance_title: String,
}

impl WorkerAdmin {
    pub fn new(
        store: Arc<WorkerConfigStore>,
        db: Arc<dyn Database>,
        plugins: Arc<PluginCache>,
        executor_slugs: Vec<String>,
        instance_title: impl Into<String>,
    ) -> Self {
        Self {
            store,
            db,
            plugins,
            executor_slugs,
            instance_title: instance_title.into(),
        }
    }

    pub fn instance_title(&self) -> &str {
        &self.instance_title
    }

    pub fn executor_slugs(&self) -> &[String] {
        &self.executor_slugs
    }

    pub async fn module_names(&self) -> Vec<String> {
        self.plugins.module_names().await
    }

    fn check_executor(&self, slug: &str) -> Result<(), String> {
        if self.executor_slugs.iter().any(|s| s == slug) {
            Ok(())
        } else {
            Err(format!("Executor {slug} does not exist"))
        }
    }

    /// Add a worker, returning its id.
    pub async fn add_worker(&self, request: AddWorkerRequest) -> Result<String, String> {
        let definition = request.into_definition();
        self.check_executor(&definition.executor_slug)?;
        self.store.add(definition).await.map_err(|e| e.to_string())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerSummary>, String> {
        let now = Utc::now();
        let records = self.store.list_records().await.map_err(|e| e.to_string())?;
        Ok(records
            .into_iter()
            .map(|record| WorkerSummary::from_record(record, now))
            .collect())
    }

    pub async fn remove_worker(&self, worker_id: &str) -> Result<(), String> {
        self.store.remove(worker_id).await.map_err(|e| e.to_string())
    }

    pub async fn update_interval_seconds(
        &self,
        worker_id: &str,
        interval_seconds: i64,
    ) -> Result<(), String> {
        self.store
            .update_interval_seconds(worker_id, interval_seconds)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn update_error_resiliency(
        &self,
        worker_id: &str,
        error_resiliency: i64,
    ) -> Result<(), String> {
        self.store
            .update_error_resiliency(worker_id, error_resiliency)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn update_executor_slug(
        &self,
        worker_id: &str,
        executor_slug: &str,
    ) -> Result<(), String> {
        self.check_executor(executor_slug)?;
        self.store
            .update_executor_slug(worker_id, executor_slug)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn get_error_count(&self, worker_id: &str) -> Result<i64, String> {
        self.store
            .get_error_count(worker_id)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn get_last_executed_at(
        &self,
        worker_id: &str,
    ) -> Result<Option<DateTime<Utc>>, String> {
        self.store
            .get_last_executed_at(worker_id)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn get_worker_metadata(
        &self,
        worker_id: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        self.store.get(worker_id).await.map_err(|e| e.to_string())?;
        self.db
            .list_worker_metadata(worker_id)
            .await
            .map_err(|e| format!("DB error: {e}"))
    }

    /// Replace the whole metadata map of a worker.
    pub async fn set_worker_metadata(
        &self,
        worker_id: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), String> {
        self.store.get(worker_id).await.map_err(|e| e.to_string())?;
        self.db
            .replace_worker_metadata(worker_id, &metadata)
            .await
            .map_err(|e| format!("DB error: {e}"))
    }
}
