//! Worker runtime tests: backend selection, policy blocking, supervision
//! (timeout, cancellation), fallback, and the dispatch_worker tool contract.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::ScriptedProvider;
use foreman::config::{LoopConfig, RuntimeConfig};
use foreman::engine::ToolLoopEngine;
use foreman::events::EventSink;
use foreman::llm::LlmProvider;
use foreman::store::LibSqlStore;
use foreman::tools::builtin::{self, DispatchWorkerTool};
use foreman::tools::policy::{PolicyGate, ToolPolicy};
use foreman::tools::registry::ToolRegistry;
use foreman::tools::tool::{Tool, ToolContext};
use foreman::worker::executor::Executor;
use foreman::worker::model::{Backend, TaskSource, TaskStatus, Worker, WorkerStatus};
use foreman::worker::registry::WorkerRegistry;
use foreman::worker::runtime::{DispatchRequest, WorkerRuntime};
use foreman::worker::task_store::WorkerTaskStore;

struct Harness {
    runtime: Arc<WorkerRuntime>,
    workers: Arc<WorkerRegistry>,
    tasks: Arc<WorkerTaskStore>,
    policy: Arc<PolicyGate>,
    _workdir: tempfile::TempDir,
}

async fn harness(provider: Arc<dyn LlmProvider>, cfg: RuntimeConfig) -> Harness {
    let workdir = tempfile::tempdir().unwrap();
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let workers = Arc::new(WorkerRegistry::new(
        store.clone(),
        workdir.path().to_path_buf(),
    ));
    let tasks = Arc::new(WorkerTaskStore::new(store, cfg.max_task_events));
    let policy = Arc::new(PolicyGate::default());

    let tools = Arc::new(ToolRegistry::new());
    builtin::register_primitives(&tools).await;
    let engine = Arc::new(ToolLoopEngine::new(
        provider,
        tools,
        policy.clone(),
        EventSink::default(),
        LoopConfig::default(),
    ));

    let runtime = Arc::new(WorkerRuntime::new(
        workers.clone(),
        tasks.clone(),
        policy.clone(),
        engine,
        Executor::LocalSubprocess,
        EventSink::default(),
        cfg,
    ));

    Harness {
        runtime,
        workers,
        tasks,
        policy,
        _workdir: workdir,
    }
}

fn fast_cfg() -> RuntimeConfig {
    RuntimeConfig {
        task_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(20),
        kill_grace: Duration::from_secs(1),
        max_task_events: 50,
        container: None,
    }
}

async fn shell_worker(h: &Harness) -> Worker {
    h.workers.create("runner", Backend::Shell).await.unwrap()
}

fn request(worker: &Worker, instruction: &str, backend: Option<Backend>) -> DispatchRequest {
    DispatchRequest {
        worker_id: Some(worker.id),
        instruction: instruction.to_string(),
        source: TaskSource::UserCmd,
        requested_backend: backend,
        permit_fallback: false,
    }
}

#[tokio::test]
async fn shell_backend_runs_in_worker_workspace() {
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let worker = shell_worker(&h).await;

    let task = h
        .runtime
        .execute(request(&worker, "pwd", Some(Backend::Shell)))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.backend, Some(Backend::Shell));
    let canonical_ws = worker.workspace_root.canonicalize().unwrap();
    let printed = task.result.as_deref().unwrap().trim();
    assert_eq!(
        std::path::Path::new(printed).canonicalize().unwrap(),
        canonical_ws
    );

    let after = h.workers.get(worker.id).await.unwrap().unwrap();
    assert_eq!(after.status, WorkerStatus::Ready);
}

#[tokio::test]
async fn policy_denied_backends_fail_without_spawning() {
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let worker = shell_worker(&h).await;

    // Deny every backend candidate, so selection has nothing to pick.
    h.policy
        .set_policy(
            worker.id,
            ToolPolicy::deny_only(vec![
                "shell".into(),
                "core-agent".into(),
                "codex".into(),
                "gemini-cli".into(),
            ]),
        )
        .await;

    let task = h
        .runtime
        .execute(request(&worker, "pwd", Some(Backend::Shell)))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("policy_blocked"));
    assert!(task.backend.is_none());
    assert!(task.started_at.is_none(), "task never entered running");

    // The worker was never marked busy.
    let after = h.workers.get(worker.id).await.unwrap().unwrap();
    assert_eq!(after.status, WorkerStatus::Ready);
}

#[tokio::test]
async fn denied_requested_backend_falls_through_to_allowed_candidate() {
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let worker = shell_worker(&h).await;

    // codex denied; shell (the worker's configured backend) is next in line.
    h.policy
        .set_policy(
            worker.id,
            ToolPolicy::deny_only(vec!["codex".into(), "core-agent".into()]),
        )
        .await;

    let task = h
        .runtime
        .execute(request(&worker, "echo fallthrough", Some(Backend::Codex)))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.backend, Some(Backend::Shell));
    assert!(task.result.unwrap().contains("fallthrough"));
}

#[tokio::test]
async fn timed_out_subprocess_is_killed_and_worker_freed() {
    let cfg = RuntimeConfig {
        task_timeout: Duration::from_millis(200),
        ..fast_cfg()
    };
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), cfg).await;
    let worker = shell_worker(&h).await;

    let started = Instant::now();
    let task = h
        .runtime
        .execute(request(&worker, "sleep 30", Some(Backend::Shell)))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("execution_timeout"));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "subprocess must be force-killed, not awaited"
    );

    let after = h.workers.get(worker.id).await.unwrap().unwrap();
    assert_eq!(after.status, WorkerStatus::Ready);
    assert!(after.last_error.unwrap().contains("execution_timeout"));
}

#[tokio::test]
async fn cancellation_lands_within_one_poll_tick() {
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let worker = shell_worker(&h).await;

    let runtime = h.runtime.clone();
    let req = request(&worker, "sleep 30", Some(Backend::Shell));
    let handle = tokio::spawn(async move { runtime.execute(req).await });

    // Wait for the task to reach the ledger in running state.
    let task_id = loop {
        let running = h.tasks.list_for_worker(worker.id, 5).await.unwrap();
        if let Some(t) = running.iter().find(|t| t.status == TaskStatus::Running) {
            break t.task_id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let cancelled_at = Instant::now();
    assert!(h.runtime.cancel(task_id).await);

    let task = handle.await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("cancelled_by_user"));
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(5),
        "cancellation should land promptly"
    );

    // Worker is immediately free for new work.
    let after = h.workers.get(worker.id).await.unwrap().unwrap();
    assert_eq!(after.status, WorkerStatus::Ready);
    let next = h
        .runtime
        .execute(request(&worker, "echo next", Some(Backend::Shell)))
        .await
        .unwrap();
    assert_eq!(next.status, TaskStatus::Done);
}

#[tokio::test]
async fn cancelling_unknown_task_returns_false() {
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    assert!(!h.runtime.cancel(uuid::Uuid::new_v4()).await);
}

#[tokio::test]
async fn core_agent_backend_runs_loop_in_process() {
    let h = harness(
        Arc::new(ScriptedProvider::answering("hello from the worker loop")),
        fast_cfg(),
    )
    .await;
    let worker = h.workers.create("agent", Backend::CoreAgent).await.unwrap();

    let task = h
        .runtime
        .execute(request(&worker, "say hello", None))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.backend, Some(Backend::CoreAgent));
    assert_eq!(task.result.as_deref(), Some("hello from the worker loop"));
}

#[tokio::test]
async fn missing_cli_binary_falls_back_to_core_agent() {
    // Skip when a codex binary actually exists on this machine.
    if std::process::Command::new("codex")
        .arg("--version")
        .output()
        .is_ok()
    {
        return;
    }

    let h = harness(
        Arc::new(ScriptedProvider::answering("handled by core-agent")),
        fast_cfg(),
    )
    .await;
    let worker = h.workers.create("coder", Backend::Codex).await.unwrap();

    let mut req = request(&worker, "summarize the repo", Some(Backend::Codex));
    req.permit_fallback = true;
    let task = h.runtime.execute(req).await.unwrap();

    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.backend, Some(Backend::CoreAgent));
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.result.as_deref(), Some("handled by core-agent"));
}

#[tokio::test]
async fn missing_cli_binary_without_fallback_is_prepare_failure() {
    if std::process::Command::new("codex")
        .arg("--version")
        .output()
        .is_ok()
    {
        return;
    }

    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let worker = h.workers.create("coder", Backend::Codex).await.unwrap();

    // Prose instruction, fallback not permitted: surface the prepare failure.
    let task = h
        .runtime
        .execute(request(&worker, "summarize the repo", Some(Backend::Codex)))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("exec_prepare_failed"));
}

#[tokio::test]
async fn task_ledger_records_full_lifecycle() {
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let worker = shell_worker(&h).await;

    let task = h
        .runtime
        .execute(request(&worker, "echo hello", Some(Backend::Shell)))
        .await
        .unwrap();

    let stored = h.tasks.get(task.task_id).await.unwrap().unwrap();
    let kinds: Vec<&str> = stored.events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["queued", "running", "backend_selected", "done"]);
    assert!(stored.started_at.is_some());
    assert!(stored.ended_at.is_some());
    assert_eq!(stored.output.unwrap().text.unwrap().trim(), "hello");
}

#[tokio::test]
async fn dispatch_worker_tool_returns_acknowledgement() {
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let worker = shell_worker(&h).await;
    let tool = DispatchWorkerTool::new(h.runtime.clone());

    let ack = tool
        .execute(
            serde_json::json!({
                "instruction": "echo dispatched",
                "worker_id": worker.id.to_string(),
                "backend": "shell"
            }),
            &ToolContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(ack["ok"], true);
    assert_eq!(ack["backend"], "shell");
    assert!(ack["task_id"].as_str().is_some());
    assert!(ack["result"].as_str().unwrap().contains("dispatched"));
}

#[tokio::test]
async fn failed_dispatch_keeps_task_id_in_rendered_result() {
    use foreman::tools::tool::ToolCallResult;

    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let worker = shell_worker(&h).await;

    // Deny everything so the dispatch fails at backend selection.
    h.policy
        .set_policy(
            worker.id,
            ToolPolicy::deny_only(vec![
                "shell".into(),
                "core-agent".into(),
                "codex".into(),
                "gemini-cli".into(),
            ]),
        )
        .await;

    let tool = DispatchWorkerTool::new(h.runtime.clone());
    let ack = tool
        .execute(
            serde_json::json!({
                "instruction": "pwd",
                "worker_id": worker.id.to_string()
            }),
            &ToolContext::default(),
        )
        .await
        .unwrap();

    let task_id = ack["task_id"].as_str().unwrap().to_string();
    let result = ToolCallResult::from_value(ack);
    assert!(!result.ok);

    // What the model reads back must identify the failed task.
    let rendered = result.render_for_model();
    assert!(rendered.contains(&task_id), "task id lost: {rendered}");
    assert!(rendered.contains("policy_blocked"), "code lost: {rendered}");
}

#[tokio::test]
async fn dispatch_worker_tool_rejects_bad_backend() {
    let h = harness(Arc::new(ScriptedProvider::answering("unused")), fast_cfg()).await;
    let tool = DispatchWorkerTool::new(h.runtime.clone());

    let err = tool
        .execute(
            serde_json::json!({"instruction": "x", "backend": "punchcard"}),
            &ToolContext::default(),
        )
        .await;
    assert!(err.is_err());
}
