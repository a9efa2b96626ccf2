//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_all()` checks the
//! current version and applies only the newer ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            backend TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ready',
            workspace_root TEXT NOT NULL,
            credentials_root TEXT,
            capabilities TEXT NOT NULL DEFAULT '[]',
            auth TEXT NOT NULL DEFAULT '{}',
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_workers_name ON workers(name);

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            worker_id TEXT NOT NULL,
            source TEXT NOT NULL,
            instruction TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            backend TEXT,
            result TEXT,
            result_summary TEXT,
            error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            events TEXT NOT NULL DEFAULT '[]',
            output TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
    "#,
}];

/// Apply all migrations newer than the recorded version.
pub async fn run_all(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Query(format!("failed to create _migrations: {e}")))?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
    let current: i64 = match rows.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
        Some(row) => row.get(0).map_err(|e| StoreError::Query(e.to_string()))?,
        None => 0,
    };

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| StoreError::Query(format!("migration {} failed: {e}", migration.name)))?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
    }

    Ok(())
}
