//! Worker and task data model.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tools::tool::UiActions;

/// Concrete execution mechanism a worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    #[serde(rename = "core-agent")]
    CoreAgent,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
    #[serde(rename = "shell")]
    Shell,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoreAgent => "core-agent",
            Self::Codex => "codex",
            Self::GeminiCli => "gemini-cli",
            Self::Shell => "shell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "core-agent" => Some(Self::CoreAgent),
            "codex" => Some(Self::Codex),
            "gemini-cli" => Some(Self::GeminiCli),
            "shell" => Some(Self::Shell),
            _ => None,
        }
    }

    /// Catch-all candidates appended to every backend selection, in priority
    /// order.
    pub fn catch_alls() -> [Backend; 4] {
        [Self::CoreAgent, Self::Shell, Self::Codex, Self::GeminiCli]
    }

    /// CLI invocation for subprocess backends: executable plus an argument
    /// template with a single `{instruction}` placeholder. `None` means the
    /// backend runs in-process.
    pub fn cli_invocation(&self) -> Option<CliInvocation> {
        match self {
            Self::CoreAgent => None,
            Self::Codex => Some(CliInvocation {
                program: "codex",
                template: "exec --instruction {instruction}",
            }),
            Self::GeminiCli => Some(CliInvocation {
                program: "gemini",
                template: "-p {instruction}",
            }),
            Self::Shell => Some(CliInvocation {
                program: "sh",
                template: "-c {instruction}",
            }),
        }
    }

    /// Simplified retry shape for the codex argument-format failure.
    pub fn simplified_cli_invocation(&self) -> Option<CliInvocation> {
        match self {
            Self::Codex => Some(CliInvocation {
                program: "codex",
                template: "exec {instruction}",
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executable name plus argument template for a CLI backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CliInvocation {
    pub program: &'static str,
    pub template: &'static str,
}

/// Worker availability. `Busy` is an exclusivity marker enforced by the
/// caller, not a lock primitive: a worker should have at most one in-flight
/// task at a time by convention at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Ready,
    Busy,
}

/// A named execution identity with its own workspace, backend, and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub backend: Backend,
    pub status: WorkerStatus,
    pub workspace_root: PathBuf,
    pub credentials_root: Option<PathBuf>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Auth provider → state string (`authenticated`, `not_authenticated`, ...).
    #[serde(default)]
    pub auth: HashMap<String, String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(name: impl Into<String>, backend: Backend, workspace_root: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            backend,
            status: WorkerStatus::Ready,
            workspace_root,
            credentials_root: None,
            capabilities: Vec::new(),
            auth: HashMap::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Where a task dispatch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    UserCmd,
    UserChat,
    Heartbeat,
    System,
}

/// Task lifecycle state. Transitions are monotonic: once terminal, a task
/// never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a task's append-only event trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub at: DateTime<Utc>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskEvent {
    pub fn now(kind: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            kind: kind.into(),
            detail,
        }
    }
}

/// Structured output of a finished task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiActions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A delegated unit of work, recorded in the task ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub worker_id: Uuid,
    pub source: TaskSource,
    pub instruction: String,
    pub status: TaskStatus,
    /// Backend that actually executed (after selection/fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
}

impl Task {
    pub fn new(worker_id: Uuid, source: TaskSource, instruction: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            worker_id,
            source,
            instruction: instruction.into(),
            status: TaskStatus::Queued,
            backend: None,
            result: None,
            result_summary: None,
            error: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            events: vec![TaskEvent::now("queued", None)],
            output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_roundtrip() {
        for b in [
            Backend::CoreAgent,
            Backend::Codex,
            Backend::GeminiCli,
            Backend::Shell,
        ] {
            assert_eq!(Backend::parse(b.as_str()), Some(b));
        }
        assert_eq!(Backend::parse("punchcard"), None);
    }

    #[test]
    fn cli_templates_have_one_placeholder() {
        for b in [Backend::Codex, Backend::GeminiCli, Backend::Shell] {
            let inv = b.cli_invocation().unwrap();
            assert_eq!(inv.template.matches("{instruction}").count(), 1);
        }
        assert!(Backend::CoreAgent.cli_invocation().is_none());
    }

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Done));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn new_task_starts_queued_with_event() {
        let t = Task::new(Uuid::new_v4(), TaskSource::UserCmd, "pwd");
        assert_eq!(t.status, TaskStatus::Queued);
        assert_eq!(t.events.len(), 1);
        assert_eq!(t.events[0].kind, "queued");
    }
}
