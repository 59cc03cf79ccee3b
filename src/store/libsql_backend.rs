//! libSQL backend: async `Database` and `ContentStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::content::{ContentItem, ContentStore};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, WorkerFieldUpdate};
use crate::worker::definition::{WorkerDefinition, WorkerRecord, WorkerRuntimeState};

/// Worker, metadata and content storage on one libSQL connection.
pub struct LibSqlBackend {
    /// Keeps the database handle alive for the connection's lifetime.
    _db: LibSqlDatabase,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open or create the database file at `path`, creating parent directories.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("{}: {e}", parent.display()))
            })?;
        }
        let backend = Self::open(path).await?;
        info!(path = %path.display(), "Worker database ready");
        Ok(backend)
    }

    /// Private in-memory database, migrated and empty.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::open(Path::new(":memory:")).await
    }

    async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("open {}: {e}", path.display())))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("connect {}: {e}", path.display())))?;

        let backend = Self { _db: db, conn };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

/// Column order used by `row_to_worker`.
const WORKER_COLUMNS: &str = "worker_id, module, class_name, args, interval_seconds, error_resiliency, executor_slug, error_count, last_executed_at, state";

fn row_to_worker(row: &libsql::Row) -> Result<WorkerRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("worker row parse: {e}"));

    let worker_id: String = row.get(0).map_err(parse)?;
    let module: String = row.get(1).map_err(parse)?;
    let class_name: String = row.get(2).map_err(parse)?;
    let args_str: String = row.get(3).map_err(parse)?;
    let interval_seconds: i64 = row.get(4).map_err(parse)?;
    let error_resiliency: i64 = row.get(5).map_err(parse)?;
    let executor_slug: String = row.get(6).map_err(parse)?;
    let error_count: i64 = row.get(7).map_err(parse)?;
    let last_executed_str: Option<String> = row.get(8).ok();
    let state_str: String = row.get(9).unwrap_or_else(|_| "{}".to_string());

    let args: Vec<serde_json::Value> = serde_json::from_str(&args_str)
        .map_err(|e| DatabaseError::Serialization(format!("args of {worker_id}: {e}")))?;
    let state = serde_json::from_str(&state_str).unwrap_or_else(|_| serde_json::json!({}));

    Ok(WorkerRecord {
        worker_id,
        definition: WorkerDefinition {
            module,
            class_name,
            args,
            interval_seconds,
            error_resiliency,
            executor_slug,
        },
        runtime: WorkerRuntimeState {
            error_count,
            last_executed_at: last_executed_str.as_deref().map(parse_datetime),
            state,
        },
    })
}

/// SQL assignment and bound value for a single-field update.
fn update_assignment(update: &WorkerFieldUpdate) -> (&'static str, libsql::Value) {
    match update {
        WorkerFieldUpdate::IntervalSeconds(v) => ("interval_seconds = ?1", libsql::Value::Integer(*v)),
        WorkerFieldUpdate::ErrorResiliency(v) => ("error_resiliency = ?1", libsql::Value::Integer(*v)),
        WorkerFieldUpdate::ExecutorSlug(v) => ("executor_slug = ?1", libsql::Value::Text(v.clone())),
        WorkerFieldUpdate::IncrementErrorCount => {
            ("error_count = error_count + ?1", libsql::Value::Integer(1))
        }
        WorkerFieldUpdate::ResetErrorCount => ("error_count = ?1", libsql::Value::Integer(0)),
        WorkerFieldUpdate::LastExecutedAt(at) => {
            ("last_executed_at = ?1", libsql::Value::Text(at.to_rfc3339()))
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn insert_worker(&self, record: &WorkerRecord) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let def = &record.definition;
        let args = serde_json::to_string(&def.args)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let state = serde_json::to_string(&record.runtime.state)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let last_executed = record.runtime.last_executed_at.map(|dt| dt.to_rfc3339());

        let inserted = conn
            .execute(
                "INSERT INTO workers (worker_id, module, class_name, args, interval_seconds, error_resiliency, executor_slug, error_count, last_executed_at, state, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT (worker_id) DO NOTHING",
                params![
                    record.worker_id.clone(),
                    def.module.clone(),
                    def.class_name.clone(),
                    args,
                    def.interval_seconds,
                    def.error_resiliency,
                    def.executor_slug.clone(),
                    record.runtime.error_count,
                    opt_text(last_executed.as_deref()),
                    state,
                    now.clone(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_worker: {e}")))?;

        debug!(worker_id = %record.worker_id, inserted = inserted > 0, "Worker insert");
        Ok(inserted > 0)
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?1"),
                params![worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_worker: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_worker(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_worker: {e}"))),
        }
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY worker_id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?
        {
            match row_to_worker(&row) {
                Ok(w) => workers.push(w),
                Err(e) => tracing::warn!("Skipping worker row: {e}"),
            }
        }
        Ok(workers)
    }

    async fn delete_worker(&self, worker_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute("DELETE FROM workers WHERE worker_id = ?1", params![worker_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_worker: {e}")))?;
        Ok(count > 0)
    }

    async fn update_worker(
        &self,
        worker_id: &str,
        update: WorkerFieldUpdate,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let (assignment, value) = update_assignment(&update);
        let count = conn
            .execute(
                &format!("UPDATE workers SET {assignment}, updated_at = ?2 WHERE worker_id = ?3"),
                params![value, now, worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_worker: {e}")))?;

        debug!(worker_id, update = ?update, found = count > 0, "Worker updated");
        Ok(count > 0)
    }

    // ── Worker metadata ─────────────────────────────────────────────

    async fn get_worker_metadata(
        &self,
        worker_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT value FROM worker_metadata WHERE worker_id = ?1 AND key = ?2",
                params![worker_id, key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_worker_metadata: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_worker_metadata: {e}"))),
        }
    }

    async fn set_worker_metadata(
        &self,
        worker_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO worker_metadata (worker_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (worker_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
            params![worker_id, key, value_str, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_worker_metadata: {e}")))?;

        Ok(())
    }

    async fn list_worker_metadata(
        &self,
        worker_id: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT key, value FROM worker_metadata WHERE worker_id = ?1 ORDER BY key",
                params![worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_worker_metadata: {e}")))?;

        let mut entries = serde_json::Map::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_worker_metadata: {e}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_worker_metadata key: {e}")))?;
            let value_str: String = row.get(1).unwrap_or_else(|_| "null".to_string());
            let value = serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
            entries.insert(key, value);
        }
        Ok(entries)
    }

    async fn replace_worker_metadata(
        &self,
        worker_id: &str,
        entries: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_worker_metadata begin: {e}")))?;

        tx.execute(
            "DELETE FROM worker_metadata WHERE worker_id = ?1",
            params![worker_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("replace_worker_metadata delete: {e}")))?;

        for (key, value) in entries {
            let value_str = serde_json::to_string(value)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            tx.execute(
                "INSERT INTO worker_metadata (worker_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![worker_id, key.clone(), value_str, now.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_worker_metadata insert: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_worker_metadata commit: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for LibSqlBackend {
    async fn append(&self, items: &[ContentItem]) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let mut inserted = 0usize;
        for item in items {
            let data = serde_json::to_string(&item.data)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            let count = conn
                .execute(
                    "INSERT INTO content_items (idempotency_key, source, data, created_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (idempotency_key) DO NOTHING",
                    params![
                        item.idempotency_key.clone(),
                        opt_text(item.source.as_deref()),
                        data,
                        item.created_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("append_content: {e}")))?;
            inserted += count as usize;
        }
        debug!(submitted = items.len(), inserted, "Content appended");
        Ok(inserted)
    }

    async fn exists(&self, idempotency_key: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT 1 FROM content_items WHERE idempotency_key = ?1",
                params![idempotency_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("content_exists: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("content_exists: {e}"))),
        }
    }

    async fn count(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM content_items", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_content: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_content: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_record(id: &str) -> WorkerRecord {
        WorkerRecord {
            worker_id: id.to_string(),
            definition: WorkerDefinition::new("rss", "Feed", vec![serde_json::json!("https://a")], 60),
            runtime: WorkerRuntimeState::default(),
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let db = test_db().await;
        assert!(db.insert_worker(&make_record("w1")).await.unwrap());

        let fetched = db.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(fetched, make_record("w1"));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let db = test_db().await;
        assert!(db.insert_worker(&make_record("w1")).await.unwrap());

        let mut other = make_record("w1");
        other.definition.interval_seconds = 5;
        assert!(!db.insert_worker(&other).await.unwrap());

        let fetched = db.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(fetched.definition.interval_seconds, 60);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let db = test_db().await;
        assert!(db.get_worker("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_ordered() {
        let db = test_db().await;
        db.insert_worker(&make_record("b")).await.unwrap();
        db.insert_worker(&make_record("a")).await.unwrap();

        let ids: Vec<String> = db
            .list_workers()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.worker_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let db = test_db().await;
        db.insert_worker(&make_record("w1")).await.unwrap();
        assert!(db.delete_worker("w1").await.unwrap());
        assert!(!db.delete_worker("w1").await.unwrap());
    }

    #[tokio::test]
    async fn field_updates() {
        let db = test_db().await;
        db.insert_worker(&make_record("w1")).await.unwrap();

        assert!(db.update_worker("w1", WorkerFieldUpdate::IntervalSeconds(-5)).await.unwrap());
        assert!(db.update_worker("w1", WorkerFieldUpdate::ErrorResiliency(3)).await.unwrap());
        assert!(
            db.update_worker("w1", WorkerFieldUpdate::ExecutorSlug("reduced".into()))
                .await
                .unwrap()
        );

        let w = db.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(w.definition.interval_seconds, -5);
        assert_eq!(w.definition.error_resiliency, 3);
        assert_eq!(w.definition.executor_slug, "reduced");
    }

    #[tokio::test]
    async fn error_count_increment_and_reset() {
        let db = test_db().await;
        db.insert_worker(&make_record("w1")).await.unwrap();

        for _ in 0..3 {
            db.update_worker("w1", WorkerFieldUpdate::IncrementErrorCount).await.unwrap();
        }
        assert_eq!(db.get_worker("w1").await.unwrap().unwrap().runtime.error_count, 3);

        db.update_worker("w1", WorkerFieldUpdate::ResetErrorCount).await.unwrap();
        assert_eq!(db.get_worker("w1").await.unwrap().unwrap().runtime.error_count, 0);
    }

    #[tokio::test]
    async fn update_missing_reports_absent() {
        let db = test_db().await;
        assert!(!db.update_worker("nope", WorkerFieldUpdate::ResetErrorCount).await.unwrap());
    }

    #[tokio::test]
    async fn last_executed_roundtrip() {
        let db = test_db().await;
        db.insert_worker(&make_record("w1")).await.unwrap();
        let at = Utc::now();
        db.update_worker("w1", WorkerFieldUpdate::LastExecutedAt(at)).await.unwrap();

        let stored = db.get_worker("w1").await.unwrap().unwrap().runtime.last_executed_at.unwrap();
        assert_eq!(stored.timestamp(), at.timestamp());
    }

    #[tokio::test]
    async fn metadata_set_get_list() {
        let db = test_db().await;
        db.set_worker_metadata("w1", "cursor", &serde_json::json!(42)).await.unwrap();
        db.set_worker_metadata("w1", "cursor", &serde_json::json!(43)).await.unwrap();
        db.set_worker_metadata("w2", "cursor", &serde_json::json!(1)).await.unwrap();

        assert_eq!(
            db.get_worker_metadata("w1", "cursor").await.unwrap(),
            Some(serde_json::json!(43))
        );
        assert!(db.get_worker_metadata("w1", "missing").await.unwrap().is_none());
        assert_eq!(db.list_worker_metadata("w1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metadata_replace_is_wholesale() {
        let db = test_db().await;
        db.set_worker_metadata("w1", "old", &serde_json::json!(true)).await.unwrap();

        let mut entries = serde_json::Map::new();
        entries.insert("new".into(), serde_json::json!({"seen": ["a"]}));
        db.replace_worker_metadata("w1", &entries).await.unwrap();

        assert_eq!(db.list_worker_metadata("w1").await.unwrap(), entries);
    }

    #[tokio::test]
    async fn content_append_dedups() {
        let db = test_db().await;
        let items = vec![
            ContentItem::new("k1", serde_json::json!({"title": "a"})).with_source("w1"),
            ContentItem::new("k2", serde_json::json!({"title": "b"})),
        ];
        assert_eq!(db.append(&items).await.unwrap(), 2);
        assert_eq!(db.append(&items[..1]).await.unwrap(), 0);
        assert_eq!(db.count().await.unwrap(), 2);
        assert!(db.exists("k1").await.unwrap());
        assert!(!db.exists("k3").await.unwrap());
    }

    #[tokio::test]
    async fn file_backed_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("broccoli.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_worker(&make_record("w1")).await.unwrap();
            db.update_worker("w1", WorkerFieldUpdate::IncrementErrorCount).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let w = db.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(w.runtime.error_count, 1);
    }
}
