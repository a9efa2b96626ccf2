//! Worker registry — named execution identities backed by the store.
//!
//! Each worker owns a workspace directory under the configured workers root.
//! Registry writes are serialized through one mutex so status flips
//! (ready/busy) never interleave.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, StoreError};
use crate::store::Store;
use crate::worker::model::{Backend, Worker, WorkerStatus};

/// Name of the worker created on first startup.
pub const DEFAULT_WORKER_NAME: &str = "default";

pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    workers_root: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, workers_root: PathBuf) -> Self {
        Self {
            store,
            workers_root,
            write_lock: Mutex::new(()),
        }
    }

    /// Fetch the default worker, creating it if this is a fresh install.
    pub async fn ensure_default(&self, backend: Backend) -> Result<Worker, Error> {
        if let Some(worker) = self.store.get_worker_by_name(DEFAULT_WORKER_NAME).await? {
            return Ok(worker);
        }
        self.create(DEFAULT_WORKER_NAME, backend).await
    }

    /// Create a worker with a fresh workspace directory.
    pub async fn create(&self, name: &str, backend: Backend) -> Result<Worker, Error> {
        let _guard = self.write_lock.lock().await;

        if self.store.get_worker_by_name(name).await?.is_some() {
            return Err(StoreError::Query(format!("worker '{name}' already exists")).into());
        }

        let workspace = self.workers_root.join(name);
        std::fs::create_dir_all(&workspace)
            .map_err(|e| StoreError::Open(format!("failed to create workspace: {e}")))?;

        let worker = Worker::new(name, backend, workspace);
        self.store.insert_worker(&worker).await?;
        info!(worker = name, backend = %backend, "Worker created");
        Ok(worker)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Worker>, Error> {
        Ok(self.store.get_worker(id).await?)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Worker>, Error> {
        Ok(self.store.get_worker_by_name(name).await?)
    }

    pub async fn list(&self) -> Result<Vec<Worker>, Error> {
        Ok(self.store.list_workers().await?)
    }

    /// Persist a full worker record.
    pub async fn update(&self, worker: &Worker) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        self.store.update_worker(worker).await?;
        Ok(())
    }

    /// Flip availability. Read-modify-write under the registry lock.
    pub async fn set_status(&self, id: Uuid, status: WorkerStatus) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut worker = self.store.get_worker(id).await?.ok_or_else(|| {
            StoreError::NotFound {
                entity: "worker".to_string(),
                id: id.to_string(),
            }
        })?;
        worker.status = status;
        self.store.update_worker(&worker).await?;
        Ok(())
    }

    /// Record the last execution error on the worker record.
    pub async fn set_last_error(&self, id: Uuid, error: Option<String>) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut worker = self.store.get_worker(id).await?.ok_or_else(|| {
            StoreError::NotFound {
                entity: "worker".to_string(),
                id: id.to_string(),
            }
        })?;
        worker.last_error = error;
        self.store.update_worker(&worker).await?;
        Ok(())
    }

    /// Record the auth state for one provider (`authenticated`,
    /// `not_authenticated`, `pending`, `unknown`).
    pub async fn set_auth_state(
        &self,
        id: Uuid,
        provider: &str,
        state: &str,
    ) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut worker = self.store.get_worker(id).await?.ok_or_else(|| {
            StoreError::NotFound {
                entity: "worker".to_string(),
                id: id.to_string(),
            }
        })?;
        worker
            .auth
            .insert(provider.to_string(), state.to_string());
        self.store.update_worker(&worker).await?;
        Ok(())
    }

    /// Delete the registry record. The workspace directory is retained for
    /// inspection.
    pub async fn delete(&self, id: Uuid) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        if let Some(worker) = self.store.get_worker(id).await? {
            warn!(worker = %worker.name, "Deleting worker (workspace retained)");
        }
        self.store.delete_worker(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;

    async fn registry(root: &std::path::Path) -> WorkerRegistry {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        WorkerRegistry::new(store, root.to_path_buf())
    }

    #[tokio::test]
    async fn ensure_default_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;

        let first = reg.ensure_default(Backend::CoreAgent).await.unwrap();
        let second = reg.ensure_default(Backend::Shell).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.backend, Backend::CoreAgent);
        assert!(first.workspace_root.is_dir());
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;

        reg.create("builder", Backend::Codex).await.unwrap();
        assert!(reg.create("builder", Backend::Codex).await.is_err());
    }

    #[tokio::test]
    async fn status_and_auth_updates_persist() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;

        let worker = reg.create("w", Backend::Codex).await.unwrap();
        reg.set_status(worker.id, WorkerStatus::Busy).await.unwrap();
        reg.set_auth_state(worker.id, "codex", "authenticated")
            .await
            .unwrap();

        let loaded = reg.get(worker.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkerStatus::Busy);
        assert_eq!(loaded.auth.get("codex").unwrap(), "authenticated");
    }

    #[tokio::test]
    async fn delete_keeps_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).await;

        let worker = reg.create("gone", Backend::Shell).await.unwrap();
        let workspace = worker.workspace_root.clone();
        reg.delete(worker.id).await.unwrap();

        assert!(reg.get(worker.id).await.unwrap().is_none());
        assert!(workspace.is_dir());
    }
}
