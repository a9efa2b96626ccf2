//! `dispatch_worker`: delegate an instruction to a worker.
//!
//! The extension tool the loop uses to hand heavier work to the worker
//! runtime. Waits for the task to finish and returns the dispatch
//! acknowledgement shape: `{ok, task_id, backend, summary, result, error?}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext, ToolKind, optional_str, require_str};
use crate::worker::model::{Backend, TaskSource, TaskStatus};
use crate::worker::runtime::{DispatchRequest, WorkerRuntime};

pub struct DispatchWorkerTool {
    runtime: Arc<WorkerRuntime>,
}

impl DispatchWorkerTool {
    pub fn new(runtime: Arc<WorkerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Tool for DispatchWorkerTool {
    fn name(&self) -> &str {
        "dispatch_worker"
    }

    fn description(&self) -> &str {
        "Delegate an instruction to a worker for isolated execution. The worker picks a \
         backend (in-process agent, shell, codex, or gemini-cli), runs the instruction in \
         its own workspace, and returns the result."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "instruction": {
                    "type": "string",
                    "description": "What the worker should do"
                },
                "worker_id": {
                    "type": "string",
                    "description": "Target worker UUID; omit for the default worker"
                },
                "backend": {
                    "type": "string",
                    "description": "Preferred backend: core-agent, shell, codex, or gemini-cli"
                }
            },
            "required": ["instruction"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Extension
    }

    /// Must outlive the runtime's own task deadline so timeouts are recorded
    /// on the task, not swallowed here.
    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(660)
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let instruction = require_str(&args, "instruction").map_err(|_| {
            ToolError::InvalidArgs {
                name: self.name().to_string(),
                reason: "missing required string argument 'instruction'".to_string(),
            }
        })?;

        let worker_id = match optional_str(&args, "worker_id") {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| ToolError::InvalidArgs {
                name: self.name().to_string(),
                reason: format!("'{raw}' is not a valid worker id"),
            })?),
            None => None,
        };

        let requested_backend = match optional_str(&args, "backend") {
            Some(raw) => Some(Backend::parse(raw).ok_or_else(|| ToolError::InvalidArgs {
                name: self.name().to_string(),
                reason: format!("unknown backend '{raw}'"),
            })?),
            None => None,
        };

        let req = DispatchRequest {
            worker_id,
            instruction: instruction.to_string(),
            source: TaskSource::UserChat,
            requested_backend,
            permit_fallback: false,
        };

        let task = self
            .runtime
            .execute(req)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        let ok = task.status == TaskStatus::Done;
        if ok {
            Ok(serde_json::json!({
                "ok": true,
                "task_id": task.task_id.to_string(),
                "backend": task.backend.map(|b| b.as_str()),
                "summary": task.result_summary,
                "result": task.result.clone(),
                "text": task.result.unwrap_or_default(),
            }))
        } else {
            // The task id must survive into the rendered failure, so it goes
            // in `message` (what render_for_model shows when ok=false).
            Ok(serde_json::json!({
                "ok": false,
                "task_id": task.task_id.to_string(),
                "backend": task.backend.map(|b| b.as_str()),
                "summary": task.result_summary.clone(),
                "error": task.error.clone(),
                "error_code": task.error.clone(),
                "message": format!(
                    "Task {} failed ({}): {}",
                    task.task_id,
                    task.error.as_deref().unwrap_or("unknown"),
                    task.result_summary.as_deref().unwrap_or("no detail")
                ),
            }))
        }
    }
}
