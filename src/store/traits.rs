//! Unified `Store` trait — single async interface for worker and task
//! persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::worker::model::{Task, Worker};

/// Backend-agnostic persistence for the worker registry and task ledger.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Workers ─────────────────────────────────────────────────────

    async fn insert_worker(&self, worker: &Worker) -> Result<(), StoreError>;

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError>;

    async fn get_worker_by_name(&self, name: &str) -> Result<Option<Worker>, StoreError>;

    /// Replace the stored record for this worker id.
    async fn update_worker(&self, worker: &Worker) -> Result<(), StoreError>;

    /// Remove the registry record. Workspace files are retained.
    async fn delete_worker(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Replace the stored record for this task id.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Most recent tasks for a worker, newest first.
    async fn list_tasks_for_worker(
        &self,
        worker_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;
}
