//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Scalar fields map to
//! columns; list/map fields (capabilities, auth, events, output) are stored
//! as JSON text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::Store;
use crate::worker::model::{Backend, Task, TaskSource, TaskStatus, Worker, WorkerStatus};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("failed to create db directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let conn = db.connect().map_err(|e| StoreError::Open(e.to_string()))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let conn = db.connect().map_err(|e| StoreError::Open(e.to_string()))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

fn q(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(s: Option<String>) -> T {
    s.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Column order: 0:id 1:name 2:backend 3:status 4:workspace_root
/// 5:credentials_root 6:capabilities 7:auth 8:last_error 9:created_at
/// 10:updated_at
fn row_to_worker(row: &libsql::Row) -> Result<Worker, StoreError> {
    let id_str: String = row.get(0).map_err(q)?;
    let backend_str: String = row.get(2).map_err(q)?;
    let status_str: String = row.get(3).map_err(q)?;
    let workspace: String = row.get(4).map_err(q)?;
    let created: String = row.get(9).map_err(q)?;
    let updated: String = row.get(10).map_err(q)?;

    Ok(Worker {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Serialization(format!("worker id: {e}")))?,
        name: row.get(1).map_err(q)?,
        backend: Backend::parse(&backend_str).unwrap_or(Backend::CoreAgent),
        status: if status_str == "busy" {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Ready
        },
        workspace_root: workspace.into(),
        credentials_root: row.get::<String>(5).ok().map(Into::into),
        capabilities: parse_json(row.get::<String>(6).ok()),
        auth: parse_json(row.get::<String>(7).ok()),
        last_error: row.get::<String>(8).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Column order: 0:id 1:worker_id 2:source 3:instruction 4:status 5:backend
/// 6:result 7:result_summary 8:error 9:retry_count 10:created_at
/// 11:started_at 12:ended_at 13:events 14:output
fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let id_str: String = row.get(0).map_err(q)?;
    let worker_str: String = row.get(1).map_err(q)?;
    let source_str: String = row.get(2).map_err(q)?;
    let status_str: String = row.get(4).map_err(q)?;
    let created: String = row.get(10).map_err(q)?;

    let source = match source_str.as_str() {
        "user_cmd" => TaskSource::UserCmd,
        "user_chat" => TaskSource::UserChat,
        "heartbeat" => TaskSource::Heartbeat,
        _ => TaskSource::System,
    };
    let status = match status_str.as_str() {
        "running" => TaskStatus::Running,
        "done" => TaskStatus::Done,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Queued,
    };

    Ok(Task {
        task_id: Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Serialization(format!("task id: {e}")))?,
        worker_id: Uuid::parse_str(&worker_str)
            .map_err(|e| StoreError::Serialization(format!("worker id: {e}")))?,
        source,
        instruction: row.get(3).map_err(q)?,
        status,
        backend: row.get::<String>(5).ok().and_then(|s| Backend::parse(&s)),
        result: row.get::<String>(6).ok(),
        result_summary: row.get::<String>(7).ok(),
        error: row.get::<String>(8).ok(),
        retry_count: row.get::<i64>(9).map_err(q)? as u32,
        created_at: parse_datetime(&created),
        started_at: row.get::<String>(11).ok().map(|s| parse_datetime(&s)),
        ended_at: row.get::<String>(12).ok().map(|s| parse_datetime(&s)),
        events: parse_json(row.get::<String>(13).ok()),
        output: row
            .get::<String>(14)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn source_to_str(source: TaskSource) -> &'static str {
    match source {
        TaskSource::UserCmd => "user_cmd",
        TaskSource::UserChat => "user_chat",
        TaskSource::Heartbeat => "heartbeat",
        TaskSource::System => "system",
    }
}

const WORKER_COLUMNS: &str = "id, name, backend, status, workspace_root, credentials_root, \
                              capabilities, auth, last_error, created_at, updated_at";

const TASK_COLUMNS: &str = "id, worker_id, source, instruction, status, backend, result, \
                            result_summary, error, retry_count, created_at, started_at, \
                            ended_at, events, output";

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_all(self.conn()).await
    }

    async fn insert_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO workers ({WORKER_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    worker.id.to_string(),
                    worker.name.clone(),
                    worker.backend.as_str(),
                    if worker.status == WorkerStatus::Busy {
                        "busy"
                    } else {
                        "ready"
                    },
                    worker.workspace_root.display().to_string(),
                    worker
                        .credentials_root
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    to_json(&worker.capabilities)?,
                    to_json(&worker.auth)?,
                    worker.last_error.clone(),
                    worker.created_at.to_rfc3339(),
                    worker.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_worker(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_worker_by_name(&self, name: &str) -> Result<Option<Worker>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_worker(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE workers SET name = ?2, backend = ?3, status = ?4, \
                 workspace_root = ?5, credentials_root = ?6, capabilities = ?7, \
                 auth = ?8, last_error = ?9, updated_at = ?10 WHERE id = ?1",
                params![
                    worker.id.to_string(),
                    worker.name.clone(),
                    worker.backend.as_str(),
                    if worker.status == WorkerStatus::Busy {
                        "busy"
                    } else {
                        "ready"
                    },
                    worker.workspace_root.display().to_string(),
                    worker
                        .credentials_root
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    to_json(&worker.capabilities)?,
                    to_json(&worker.auth)?,
                    worker.last_error.clone(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(q)?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "worker".to_string(),
                id: worker.id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_worker(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM workers WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY created_at"),
                (),
            )
            .await
            .map_err(q)?;
        let mut workers = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            workers.push(row_to_worker(&row)?);
        }
        Ok(workers)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    task.task_id.to_string(),
                    task.worker_id.to_string(),
                    source_to_str(task.source),
                    task.instruction.clone(),
                    task.status.as_str(),
                    task.backend.map(|b| b.as_str()),
                    task.result.clone(),
                    task.result_summary.clone(),
                    task.error.clone(),
                    task.retry_count as i64,
                    task.created_at.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.ended_at.map(|t| t.to_rfc3339()),
                    to_json(&task.events)?,
                    task.output.as_ref().map(to_json).transpose()?,
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?2, backend = ?3, result = ?4, \
                 result_summary = ?5, error = ?6, retry_count = ?7, started_at = ?8, \
                 ended_at = ?9, events = ?10, output = ?11 WHERE id = ?1",
                params![
                    task.task_id.to_string(),
                    task.status.as_str(),
                    task.backend.map(|b| b.as_str()),
                    task.result.clone(),
                    task.result_summary.clone(),
                    task.error.clone(),
                    task.retry_count as i64,
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.ended_at.map(|t| t.to_rfc3339()),
                    to_json(&task.events)?,
                    task.output.as_ref().map(to_json).transpose()?,
                ],
            )
            .await
            .map_err(q)?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "task".to_string(),
                id: task.task_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_tasks_for_worker(
        &self,
        worker_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE worker_id = ?1 \
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![worker_id.to_string(), limit as i64],
            )
            .await
            .map_err(q)?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}
