//! Worker runtime: backend selection, execution, supervision, fallback.
//!
//! A dispatched instruction becomes a ledger task driven through
//! `queued → running → {done|failed}`. Backend selection walks a
//! priority-ordered candidate list and takes the first one the worker's
//! policy allows. `core-agent` runs the tool loop in-process; the CLI
//! backends spawn supervised subprocesses through the [`Executor`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::engine::ToolLoopEngine;
use crate::error::{Error, ErrorCode, TaskError};
use crate::events::{EventSink, LifecycleEvent};
use crate::llm::ChatMessage;
use crate::surface::{ChatSurface, SilentSurface};
use crate::tools::policy::PolicyGate;
use crate::tools::tool::ToolContext;
use crate::worker::executor::{ExecOutcome, ExecRequest, ExecStatus, Executor};
use crate::worker::model::{Backend, Task, TaskOutput, TaskSource, TaskStatus, Worker, WorkerStatus};
use crate::worker::registry::WorkerRegistry;
use crate::worker::task_store::{TaskPatch, WorkerTaskStore};

/// The codex CLI rejects `--instruction` in some releases; this marker in
/// stderr triggers one retry with the simplified invocation.
const CODEX_ARG_ERROR: &str = "unexpected argument '--instruction'";

/// One dispatch request into the runtime.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Target worker; `None` uses the default worker.
    pub worker_id: Option<Uuid>,
    pub instruction: String,
    pub source: TaskSource,
    /// Preferred backend, tried before the worker's configured one.
    pub requested_backend: Option<Backend>,
    /// Caller opt-in: always allow core-agent fallback when a CLI backend
    /// cannot be prepared, not only for shell-looking instructions.
    pub permit_fallback: bool,
}

impl DispatchRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            worker_id: None,
            instruction: instruction.into(),
            source: TaskSource::UserChat,
            requested_backend: None,
            permit_fallback: false,
        }
    }
}

/// Selects backends and supervises task execution for workers.
pub struct WorkerRuntime {
    registry: Arc<WorkerRegistry>,
    tasks: Arc<WorkerTaskStore>,
    policy: Arc<PolicyGate>,
    engine: Arc<ToolLoopEngine>,
    executor: Executor,
    events: EventSink,
    surface: Arc<dyn ChatSurface>,
    cfg: RuntimeConfig,
    /// In-flight cancellation handles, keyed by task id.
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl WorkerRuntime {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        tasks: Arc<WorkerTaskStore>,
        policy: Arc<PolicyGate>,
        engine: Arc<ToolLoopEngine>,
        executor: Executor,
        events: EventSink,
        cfg: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            tasks,
            policy,
            engine,
            executor,
            events,
            surface: Arc::new(SilentSurface::new()),
            cfg,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a live chat surface for progress notes. Headless dispatches
    /// keep the default silent surface.
    pub fn with_surface(mut self, surface: Arc<dyn ChatSurface>) -> Self {
        self.surface = surface;
        self
    }

    /// Request cooperative cancellation of an in-flight task. Returns false
    /// when the task is not currently running.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let map = self.cancellations.lock().await;
        match map.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute one instruction to completion and return the final task
    /// record. All failures are recorded on the task; `Err` is reserved for
    /// infrastructure faults (store unavailable, unknown worker).
    pub async fn execute(&self, req: DispatchRequest) -> Result<Task, Error> {
        let worker = self.resolve_worker(req.worker_id).await?;

        let task = Task::new(worker.id, req.source, req.instruction.clone());
        self.tasks.append(&task).await?;
        self.emit_state(&task, None);
        let task_id = task.task_id;

        // Policy decides the backend before the worker is ever marked busy.
        let Some(backend) = self.select_backend(&worker, req.requested_backend).await else {
            let failed = self
                .tasks
                .patch(
                    task_id,
                    TaskPatch::status(TaskStatus::Failed)
                        .with_error(ErrorCode::PolicyBlocked.as_str()),
                )
                .await?;
            warn!(worker = %worker.name, "No backend allowed by policy");
            self.emit_state(&failed, Some("no backend allowed by policy".into()));
            return Ok(failed);
        };

        if worker.status == WorkerStatus::Busy {
            let failed = self
                .tasks
                .patch(
                    task_id,
                    TaskPatch::status(TaskStatus::Failed)
                        .with_error(ErrorCode::ExecutionError.as_str()),
                )
                .await?;
            self.emit_state(&failed, Some("worker is busy".into()));
            return Ok(failed);
        }

        // Register the cancellation handle before the ledger shows the task
        // as running, so a cancel() issued right after that read always lands.
        let cancel = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(task_id, cancel.clone());

        let started = async {
            self.registry.set_status(worker.id, WorkerStatus::Busy).await?;
            self.tasks
                .patch(
                    task_id,
                    TaskPatch::status(TaskStatus::Running).with_backend(backend),
                )
                .await
        }
        .await;
        let running = match started {
            Ok(running) => running,
            Err(e) => {
                self.cancellations.lock().await.remove(&task_id);
                return Err(e);
            }
        };
        self.emit_state(&running, Some(backend.to_string()));
        info!(task = %task_id, worker = %worker.name, backend = %backend, "Task started");
        if let Err(e) = self
            .surface
            .progress(&format!("Working on it ({backend})..."))
            .await
        {
            warn!("Progress note failed: {e}");
        }

        let result = self
            .run_backend(&worker, backend, &req, task_id, &cancel)
            .await;

        self.cancellations.lock().await.remove(&task_id);

        // The worker is always returned to ready, whatever happened.
        self.registry
            .set_status(worker.id, WorkerStatus::Ready)
            .await?;

        let finished = self.finalize(task_id, &worker, result).await?;
        self.emit_state(&finished, finished.error.clone());
        Ok(finished)
    }

    async fn resolve_worker(&self, worker_id: Option<Uuid>) -> Result<Worker, Error> {
        match worker_id {
            Some(id) => self
                .registry
                .get(id)
                .await?
                .ok_or_else(|| TaskError::NotFound { id }.into()),
            None => self.registry.ensure_default(Backend::CoreAgent).await,
        }
    }

    /// Priority order: requested, worker-configured, then the catch-alls.
    /// First policy-allowed candidate wins.
    async fn select_backend(
        &self,
        worker: &Worker,
        requested: Option<Backend>,
    ) -> Option<Backend> {
        let mut candidates: Vec<Backend> = Vec::with_capacity(6);
        if let Some(b) = requested {
            candidates.push(b);
        }
        candidates.push(worker.backend);
        candidates.extend(Backend::catch_alls());
        candidates.dedup_by(|a, b| a == b);

        let mut seen = Vec::new();
        for backend in candidates {
            if seen.contains(&backend) {
                continue;
            }
            seen.push(backend);
            if self.policy.allowed(Some(worker.id), backend.as_str()).await {
                return Some(backend);
            }
        }
        None
    }

    async fn run_backend(
        &self,
        worker: &Worker,
        backend: Backend,
        req: &DispatchRequest,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> BackendResult {
        match backend {
            Backend::CoreAgent => self.run_core_agent(worker, &req.instruction, cancel).await,
            Backend::Codex | Backend::GeminiCli | Backend::Shell => {
                self.run_subprocess(worker, backend, req, task_id, cancel)
                    .await
            }
        }
    }

    /// In-process execution: the tool loop runs rooted at the worker's
    /// workspace. Cancellation races the loop at its await points.
    async fn run_core_agent(
        &self,
        worker: &Worker,
        instruction: &str,
        cancel: &CancellationToken,
    ) -> BackendResult {
        let ctx = ToolContext {
            workspace_root: worker.workspace_root.clone(),
            worker_id: Some(worker.id),
        };
        let history = vec![
            ChatMessage::system(format!(
                "You are a worker agent. Your workspace is {}. Complete the instruction \
                 using the available tools, then answer with the outcome.",
                worker.workspace_root.display()
            )),
            ChatMessage::user(instruction),
        ];

        let deadline = tokio::time::sleep(self.cfg.task_timeout);
        tokio::select! {
            outcome = self.engine.run(history, &ctx) => match outcome {
                Ok(text) => BackendResult::done(Backend::CoreAgent, text),
                Err(e) => BackendResult::failed(
                    Backend::CoreAgent,
                    ErrorCode::ExecutionError,
                    e.to_string(),
                ),
            },
            _ = cancel.cancelled() => BackendResult::failed(
                Backend::CoreAgent,
                ErrorCode::CancelledByUser,
                "cancelled during in-process execution",
            ),
            _ = deadline => BackendResult::failed(
                Backend::CoreAgent,
                ErrorCode::ExecutionTimeout,
                format!("task exceeded {:?}", self.cfg.task_timeout),
            ),
        }
    }

    async fn run_subprocess(
        &self,
        worker: &Worker,
        backend: Backend,
        req: &DispatchRequest,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> BackendResult {
        let Some(invocation) = backend.cli_invocation() else {
            return BackendResult::failed(
                backend,
                ErrorCode::ExecPrepareFailed,
                "backend has no CLI invocation",
            );
        };
        let exec_req =
            ExecRequest::from_invocation(invocation, &req.instruction, &worker.workspace_root);

        let outcome = match self.supervise(&exec_req, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Preparation failure: CLI binary missing or not runnable.
                warn!(backend = %backend, "Subprocess preparation failed: {e}");
                if matches!(backend, Backend::Codex | Backend::GeminiCli)
                    && (req.permit_fallback || looks_like_shell_command(&req.instruction))
                {
                    info!(task = %task_id, "Falling back to core-agent");
                    if let Err(patch_err) = self
                        .tasks
                        .patch(
                            task_id,
                            TaskPatch {
                                retry_increment: 1,
                                backend: Some(Backend::CoreAgent),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        warn!("Failed to record fallback: {patch_err}");
                    }
                    return self
                        .run_core_agent(worker, &req.instruction, cancel)
                        .await;
                }
                return BackendResult::failed(backend, ErrorCode::ExecPrepareFailed, e.to_string());
            }
        };

        // Codex argument-shape failure: one retry with the simplified form.
        if backend == Backend::Codex
            && !outcome.success()
            && outcome.stderr.contains(CODEX_ARG_ERROR)
        {
            if let Some(simplified) = backend.simplified_cli_invocation() {
                info!(task = %task_id, "Retrying codex with simplified invocation");
                if let Err(patch_err) = self
                    .tasks
                    .patch(
                        task_id,
                        TaskPatch {
                            retry_increment: 1,
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!("Failed to record retry: {patch_err}");
                }
                let retry_req = ExecRequest::from_invocation(
                    simplified,
                    &req.instruction,
                    &worker.workspace_root,
                );
                match self.supervise(&retry_req, cancel).await {
                    Ok(retry_outcome) => return self.map_outcome(backend, retry_outcome),
                    Err(e) => {
                        return BackendResult::failed(
                            backend,
                            ErrorCode::ExecPrepareFailed,
                            e.to_string(),
                        );
                    }
                }
            }
        }

        self.map_outcome(backend, outcome)
    }

    async fn supervise(
        &self,
        req: &ExecRequest,
        cancel: &CancellationToken,
    ) -> std::io::Result<ExecOutcome> {
        self.executor
            .run(
                req,
                self.cfg.task_timeout,
                cancel,
                self.cfg.poll_interval,
                self.cfg.kill_grace,
            )
            .await
    }

    fn map_outcome(&self, backend: Backend, outcome: ExecOutcome) -> BackendResult {
        match outcome.status {
            ExecStatus::Exited(0) => {
                BackendResult::done(backend, outcome.primary_output().to_string())
            }
            ExecStatus::Exited(code) => BackendResult::failed(
                backend,
                ErrorCode::ExecutionError,
                format!("exit code {code}: {}", summarize(&outcome.stderr)),
            ),
            ExecStatus::TimedOut => BackendResult::failed(
                backend,
                ErrorCode::ExecutionTimeout,
                format!("subprocess killed after {:?}", self.cfg.task_timeout),
            ),
            ExecStatus::Cancelled => BackendResult::failed(
                backend,
                ErrorCode::CancelledByUser,
                "subprocess killed on cancellation",
            ),
        }
    }

    async fn finalize(
        &self,
        task_id: Uuid,
        worker: &Worker,
        result: BackendResult,
    ) -> Result<Task, Error> {
        match result {
            BackendResult::Done { backend, text } => {
                self.registry.set_last_error(worker.id, None).await?;
                let summary = summarize(&text);
                self.tasks
                    .patch(
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Done),
                            backend: Some(backend),
                            result: Some(text.clone()),
                            result_summary: Some(summary),
                            output: Some(TaskOutput {
                                text: Some(text),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    )
                    .await
            }
            BackendResult::Failed {
                backend,
                code,
                message,
            } => {
                self.registry
                    .set_last_error(worker.id, Some(format!("{code}: {message}")))
                    .await?;
                self.tasks
                    .patch(
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Failed),
                            backend: Some(backend),
                            error: Some(code.as_str().to_string()),
                            result_summary: Some(message.clone()),
                            output: Some(TaskOutput {
                                error: Some(message),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    )
                    .await
            }
        }
    }

    fn emit_state(&self, task: &Task, detail: Option<String>) {
        self.events.emit(LifecycleEvent::TaskStateChanged {
            task_id: task.task_id,
            worker_id: task.worker_id,
            status: task.status.to_string(),
            detail,
        });
    }
}

/// Result of one backend attempt (after any retries/fallbacks).
enum BackendResult {
    Done { backend: Backend, text: String },
    Failed {
        backend: Backend,
        code: ErrorCode,
        message: String,
    },
}

impl BackendResult {
    fn done(backend: Backend, text: String) -> Self {
        Self::Done { backend, text }
    }

    fn failed(backend: Backend, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Failed {
            backend,
            code,
            message: message.into(),
        }
    }
}

/// Heuristic used by the fallback path: does the instruction read like a
/// shell command rather than prose?
fn looks_like_shell_command(instruction: &str) -> bool {
    let trimmed = instruction.trim();
    if trimmed.contains("&&") || trimmed.contains(" | ") || trimmed.starts_with("./") {
        return true;
    }
    const COMMON_COMMANDS: &[&str] = &[
        "ls", "pwd", "cat", "echo", "grep", "find", "git", "cargo", "make", "python",
        "python3", "node", "npm", "curl", "wget", "mkdir", "cp", "mv", "rm", "touch", "sed",
        "awk", "tar", "docker",
    ];
    trimmed
        .split_whitespace()
        .next()
        .is_some_and(|first| COMMON_COMMANDS.contains(&first))
}

fn summarize(text: &str) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut end = first_line.len().min(200);
    while end > 0 && !first_line.is_char_boundary(end) {
        end -= 1;
    }
    first_line[..end].to_string()
}
