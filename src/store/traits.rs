//! `Database` trait: single async interface for orchestrator persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::worker::definition::WorkerRecord;

/// A single-field update to a worker document.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerFieldUpdate {
    IntervalSeconds(i64),
    ErrorResiliency(i64),
    ExecutorSlug(String),
    IncrementErrorCount,
    ResetErrorCount,
    LastExecutedAt(DateTime<Utc>),
}

/// Backend-agnostic persistence for worker documents and worker metadata.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Insert a worker document. Returns `false` if the id is already taken.
    async fn insert_worker(&self, record: &WorkerRecord) -> Result<bool, DatabaseError>;

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError>;

    /// All worker documents, ordered by id.
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, DatabaseError>;

    /// Returns `false` if nothing was deleted.
    async fn delete_worker(&self, worker_id: &str) -> Result<bool, DatabaseError>;

    /// Apply one targeted field update. Returns `false` if the worker is absent.
    async fn update_worker(
        &self,
        worker_id: &str,
        update: WorkerFieldUpdate,
    ) -> Result<bool, DatabaseError>;

    // ── Worker metadata ─────────────────────────────────────────────

    async fn get_worker_metadata(
        &self,
        worker_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_worker_metadata(
        &self,
        worker_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Every metadata entry of a worker.
    async fn list_worker_metadata(
        &self,
        worker_id: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, DatabaseError>;

    /// Replace a worker's metadata wholesale.
    async fn replace_worker_metadata(
        &self,
        worker_id: &str,
        entries: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), DatabaseError>;
}
