//! Task ledger access — append, patch, and query task records.
//!
//! Status transitions are validated here so the monotonic lifecycle
//! (queued → running → done|failed) holds no matter who writes. Patches are
//! diffed into the append-only event trail, which is kept to a bounded tail.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, TaskError};
use crate::store::Store;
use crate::worker::model::{Backend, Task, TaskEvent, TaskOutput, TaskStatus};

/// A partial update to a task record. `None` fields are left untouched.
#[derive(Debug, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub backend: Option<Backend>,
    pub result: Option<String>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    pub retry_increment: u32,
    pub output: Option<TaskOutput>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }
}

/// Ledger wrapper over the store for task records.
pub struct WorkerTaskStore {
    store: Arc<dyn Store>,
    /// Event-trail tail length kept per task.
    max_events: usize,
}

impl WorkerTaskStore {
    pub fn new(store: Arc<dyn Store>, max_events: usize) -> Self {
        Self { store, max_events }
    }

    /// Record a new task in `queued` state.
    pub async fn append(&self, task: &Task) -> Result<(), Error> {
        self.store.insert_task(task).await?;
        debug!(task_id = %task.task_id, worker_id = %task.worker_id, "Task queued");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, Error> {
        Ok(self.store.get_task(id).await?)
    }

    pub async fn list_for_worker(&self, worker_id: Uuid, limit: usize) -> Result<Vec<Task>, Error> {
        Ok(self.store.list_tasks_for_worker(worker_id, limit).await?)
    }

    /// Apply a patch, validating the status transition and appending the
    /// change to the event trail. Returns the updated record.
    pub async fn patch(&self, id: Uuid, patch: TaskPatch) -> Result<Task, Error> {
        let mut task = self
            .store
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })?;

        let mut status_event = false;
        if let Some(target) = patch.status {
            if target != task.status {
                if !task.status.can_transition_to(target) {
                    return Err(TaskError::InvalidTransition {
                        id,
                        from: task.status.to_string(),
                        to: target.to_string(),
                    }
                    .into());
                }
                task.events
                    .push(TaskEvent::now(target.as_str(), patch.error.clone()));
                status_event = true;
                match target {
                    TaskStatus::Running => task.started_at = Some(Utc::now()),
                    TaskStatus::Done | TaskStatus::Failed => task.ended_at = Some(Utc::now()),
                    TaskStatus::Queued => {}
                }
                task.status = target;
            }
        }

        if patch.retry_increment > 0 {
            task.retry_count += patch.retry_increment;
            task.events.push(TaskEvent::now(
                "retry",
                Some(format!("attempt {}", task.retry_count + 1)),
            ));
        }

        if let Some(backend) = patch.backend {
            if task.backend != Some(backend) {
                task.events
                    .push(TaskEvent::now("backend_selected", Some(backend.to_string())));
                task.backend = Some(backend);
            }
        }
        if let Some(result) = patch.result {
            task.result = Some(result);
        }
        if let Some(summary) = patch.result_summary {
            task.result_summary = Some(summary);
        }
        if let Some(error) = patch.error {
            // Error changes ride along with a status event when there is one;
            // a standalone error update gets its own entry in the trail.
            if !status_event && task.error.as_deref() != Some(error.as_str()) {
                task.events
                    .push(TaskEvent::now("error", Some(error.clone())));
            }
            task.error = Some(error);
        }
        if let Some(output) = patch.output {
            task.output = Some(output);
        }

        // Keep only the newest events once the trail outgrows the cap.
        if task.events.len() > self.max_events {
            let drop = task.events.len() - self.max_events;
            task.events.drain(..drop);
        }

        self.store.update_task(&task).await?;
        Ok(task)
    }
}
