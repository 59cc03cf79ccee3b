//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "workers",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workers (
                worker_id TEXT PRIMARY KEY,
                module TEXT NOT NULL,
                class_name TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                interval_seconds INTEGER NOT NULL,
                error_resiliency INTEGER NOT NULL DEFAULT -1,
                executor_slug TEXT NOT NULL DEFAULT 'native',
                error_count INTEGER NOT NULL DEFAULT 0,
                last_executed_at TEXT,
                state TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_workers_executor ON workers(executor_slug);

            CREATE TABLE IF NOT EXISTS worker_metadata (
                worker_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (worker_id, key)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "content_items",
        sql: r#"
            CREATE TABLE IF NOT EXISTS content_items (
                idempotency_key TEXT PRIMARY KEY,
                source TEXT,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_content_items_created ON content_items(created_at);
        "#,
    },
];

/// Bring the schema up to the latest version.
///
/// Each step runs in its own transaction together with its `schema_versions` row.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_versions: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        apply(conn, migration).await?;
        tracing::info!(version = migration.version, name = migration.name, "Applied migration");
    }
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let fail = |e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {}: {e}", migration.version, migration.name))
    };
    let tx = conn.transaction().await.map_err(fail)?;
    tx.execute_batch(migration.sql).await.map_err(fail)?;
    tx.execute(
        "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(fail)?;
    tx.commit().await.map_err(fail)
}

/// Highest applied version, 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}
