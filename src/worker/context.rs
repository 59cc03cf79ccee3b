//! Per-worker execution context handed to `pre_work` and `work`.

use std::sync::Arc;

use crate::content::{ContentItem, ContentStore};
use crate::error::WorkerError;
use crate::store::Database;

/// Key/value state namespaced to one worker, persisted between ticks.
#[derive(Clone)]
pub struct WorkerMetadata {
    worker_id: String,
    db: Arc<dyn Database>,
}

impl WorkerMetadata {
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, WorkerError> {
        self.db
            .get_worker_metadata(&self.worker_id, key)
            .await
            .map_err(WorkerError::Metadata)
    }

    pub async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), WorkerError> {
        self.db
            .set_worker_metadata(&self.worker_id, key, &value)
            .await
            .map_err(WorkerError::Metadata)
    }

    pub async fn get_all(&self) -> Result<serde_json::Map<String, serde_json::Value>, WorkerError> {
        self.db
            .list_worker_metadata(&self.worker_id)
            .await
            .map_err(WorkerError::Metadata)
    }
}

/// Everything a worker can touch during a tick.
#[derive(Clone)]
pub struct WorkContext {
    worker_id: String,
    content: Arc<dyn ContentStore>,
    metadata: WorkerMetadata,
    span: tracing::Span,
}

impl WorkContext {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub fn metadata(&self) -> &WorkerMetadata {
        &self.metadata
    }

    /// Span carrying `worker_id`; ticks run inside it.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Append items tagged with this worker as their source.
    pub async fn append_content(&self, items: Vec<ContentItem>) -> Result<usize, WorkerError> {
        let items: Vec<ContentItem> = items
            .into_iter()
            .map(|item| match item.source {
                Some(_) => item,
                None => item.with_source(self.worker_id.clone()),
            })
            .collect();
        self.content
            .append(&items)
            .await
            .map_err(WorkerError::Content)
    }
}

/// Builds `WorkContext`s. Construction never fails.
#[derive(Clone)]
pub struct WorkContextFactory {
    content: Arc<dyn ContentStore>,
    db: Arc<dyn Database>,
}

impl WorkContextFactory {
    pub fn new(content: Arc<dyn ContentStore>, db: Arc<dyn Database>) -> Self {
        Self { content, db }
    }

    pub fn build(&self, worker_id: &str) -> WorkContext {
        WorkContext {
            worker_id: worker_id.to_string(),
            content: Arc::clone(&self.content),
            metadata: WorkerMetadata {
                worker_id: worker_id.to_string(),
                db: Arc::clone(&self.db),
            },
            span: tracing::info_span!("worker", worker_id = %worker_id),
        }
    }
}
