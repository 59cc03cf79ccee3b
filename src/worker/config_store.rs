//! Durable store of desired worker definitions and their runtime counters.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::error::WorkerConfigError;
use crate::store::{Database, WorkerFieldUpdate};
use crate::worker::definition::{WorkerDefinition, WorkerRecord, WorkerRuntimeState};
use crate::worker::plugin::PluginCache;

/// Worker configuration store. All writes are last-writer-wins single-field updates.
pub struct WorkerConfigStore {
    db: Arc<dyn Database>,
    plugins: Arc<PluginCache>,
}

impl WorkerConfigStore {
    pub fn new(db: Arc<dyn Database>, plugins: Arc<PluginCache>) -> Self {
        Self { db, plugins }
    }

    /// Add a worker. The plugin is resolved first so bad configuration fails fast.
    ///
    /// Returns the derived `worker_id`.
    pub async fn add(&self, definition: WorkerDefinition) -> Result<String, WorkerConfigError> {
        let loaded = self
            .plugins
            .load(&definition.module, &definition.class_name, &definition.args)
            .await
            .map_err(|e| {
                error!(
                    module = %definition.module,
                    class_name = %definition.class_name,
                    args = ?definition.args,
                    "Fails to add worker: {e}"
                );
                e
            })?;

        let worker_id = loaded.worker_id();
        let record = WorkerRecord {
            worker_id: worker_id.clone(),
            definition,
            runtime: WorkerRuntimeState::default(),
        };
        if !self.db.insert_worker(&record).await? {
            return Err(WorkerConfigError::AlreadyExists { worker_id });
        }

        info!(worker_id = %worker_id, "Worker added");
        Ok(worker_id)
    }

    /// Desired state: every worker id mapped to its definition.
    pub async fn get_all(&self) -> Result<BTreeMap<String, WorkerDefinition>, WorkerConfigError> {
        Ok(self
            .db
            .list_workers()
            .await?
            .into_iter()
            .map(|record| (record.worker_id, record.definition))
            .collect())
    }

    /// Full documents, including runtime counters.
    pub async fn list_records(&self) -> Result<Vec<WorkerRecord>, WorkerConfigError> {
        Ok(self.db.list_workers().await?)
    }

    pub async fn get(&self, worker_id: &str) -> Result<WorkerRecord, WorkerConfigError> {
        self.db
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| not_found(worker_id))
    }

    pub async fn remove(&self, worker_id: &str) -> Result<(), WorkerConfigError> {
        if !self.db.delete_worker(worker_id).await? {
            return Err(not_found(worker_id));
        }
        info!(worker_id, "Worker removed");
        Ok(())
    }

    pub async fn update_interval_seconds(
        &self,
        worker_id: &str,
        interval_seconds: i64,
    ) -> Result<(), WorkerConfigError> {
        self.update(worker_id, WorkerFieldUpdate::IntervalSeconds(interval_seconds))
            .await
    }

    pub async fn update_error_resiliency(
        &self,
        worker_id: &str,
        error_resiliency: i64,
    ) -> Result<(), WorkerConfigError> {
        self.update(worker_id, WorkerFieldUpdate::ErrorResiliency(error_resiliency))
            .await
    }

    pub async fn update_executor_slug(
        &self,
        worker_id: &str,
        executor_slug: &str,
    ) -> Result<(), WorkerConfigError> {
        self.update(
            worker_id,
            WorkerFieldUpdate::ExecutorSlug(executor_slug.to_string()),
        )
        .await
    }

    pub async fn increment_error_count(&self, worker_id: &str) -> Result<(), WorkerConfigError> {
        self.update(worker_id, WorkerFieldUpdate::IncrementErrorCount)
            .await
    }

    pub async fn reset_error_count(&self, worker_id: &str) -> Result<(), WorkerConfigError> {
        self.update(worker_id, WorkerFieldUpdate::ResetErrorCount).await
    }

    pub async fn get_error_count(&self, worker_id: &str) -> Result<i64, WorkerConfigError> {
        Ok(self.get(worker_id).await?.runtime.error_count)
    }

    /// Record the start of a tick.
    pub async fn record_execution(
        &self,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), WorkerConfigError> {
        self.update(worker_id, WorkerFieldUpdate::LastExecutedAt(at))
            .await
    }

    pub async fn get_last_executed_at(
        &self,
        worker_id: &str,
    ) -> Result<Option<DateTime<Utc>>, WorkerConfigError> {
        Ok(self.get(worker_id).await?.runtime.last_executed_at)
    }

    async fn update(
        &self,
        worker_id: &str,
        update: WorkerFieldUpdate,
    ) -> Result<(), WorkerConfigError> {
        if self.db.update_worker(worker_id, update).await? {
            Ok(())
        } else {
            Err(not_found(worker_id))
        }
    }
}

fn not_found(worker_id: &str) -> WorkerConfigError {
    WorkerConfigError::NotFound {
        worker_id: worker_id.to_string(),
    }
}
