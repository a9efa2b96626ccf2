//! Tool abstraction and the uniform call-result contract.
//!
//! Tools are registered statically at startup (typed plugin registry, no
//! dynamic loading). A tool may return any JSON shape — plain string,
//! structured object, or a worker dispatch acknowledgement — and the
//! dispatcher normalizes it into [`ToolCallResult`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, FailureMode, ToolError};
use crate::llm::ToolDefinition;

/// Default per-call execution timeout.
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// How a tool is weighted by the guard machinery.
///
/// Primitives (read/write/edit/shell) are expected to be called repeatedly for
/// legitimate step-by-step work and are exempt from the per-tool call budget.
/// Extensions are heavier external capabilities and are budget-guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Primitive,
    Extension,
}

/// Execution context handed to every tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Workspace directory the call is rooted at.
    pub workspace_root: PathBuf,
    /// Owning worker, when the call runs inside a delegated task.
    pub worker_id: Option<Uuid>,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            worker_id: None,
        }
    }
}

impl ToolContext {
    pub fn rooted_at(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            worker_id: None,
        }
    }
}

/// A callable capability exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema-like object declaring the arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Primitive
    }

    fn execution_timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    /// Execute the tool. The return shape is tool-specific; the dispatcher
    /// normalizes it.
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;

    /// Declaration consumed by the turn generator.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// One row of inline UI buttons.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UiButton {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// UI action grid a tool may return for the chat surface to render.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UiActions {
    pub actions: Vec<Vec<UiButton>>,
}

/// Outcome a tool reports when it completes a whole task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Done,
    Partial,
    Failed,
}

/// Uniform result contract every tool call is normalized into.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolCallResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiActions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_outcome: Option<TaskOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<FailureMode>,
}

impl ToolCallResult {
    pub fn ok_text(text: impl Into<String>) -> Self {
        Self {
            ok: true,
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_code: Some(code),
            message: Some(message.into()),
            failure_mode: Some(code.failure_mode()),
            ..Default::default()
        }
    }

    /// Normalize a heterogeneous tool return into the uniform contract.
    ///
    /// A UI action list with no explicit status is an implicit completion
    /// signal: the tool has handed control to the user.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::ok_text(s),
            serde_json::Value::Object(ref map) if map.contains_key("ok") => {
                let mut result: Self =
                    serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
                        ok: false,
                        error_code: Some(ErrorCode::ExecutionError),
                        message: Some("tool returned a malformed result object".to_string()),
                        ..Default::default()
                    });
                result.derive_implicit_outcome();
                result
            }
            other => {
                let mut result = Self {
                    ok: true,
                    text: serde_json::to_string_pretty(&other).ok(),
                    ..Default::default()
                };
                if let Ok(ui) = serde_json::from_value::<UiActions>(other) {
                    if !ui.actions.is_empty() {
                        result.ui = Some(ui);
                    }
                }
                result.derive_implicit_outcome();
                result
            }
        }
    }

    fn derive_implicit_outcome(&mut self) {
        if self.task_outcome.is_none()
            && !self.terminal
            && self.ui.as_ref().is_some_and(|ui| !ui.actions.is_empty())
        {
            self.terminal = true;
            self.task_outcome = Some(TaskOutcome::Done);
        }
    }

    /// Text fed back to the model as the tool-result message.
    pub fn render_for_model(&self) -> String {
        if self.ok {
            self.text
                .clone()
                .unwrap_or_else(|| "(no output)".to_string())
        } else {
            format!(
                "Error ({}): {}",
                self.error_code
                    .map(|c| c.as_str())
                    .unwrap_or("execution_error"),
                self.message.as_deref().unwrap_or("unknown failure")
            )
        }
    }
}

// ── Argument helpers ────────────────────────────────────────────────

/// Extract a required string argument.
pub fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArgs {
            name: String::new(),
            reason: format!("missing required string argument '{key}'"),
        })
}

/// Extract an optional string argument.
pub fn optional_str<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_normalizes_to_ok_text() {
        let r = ToolCallResult::from_value(serde_json::json!("hello"));
        assert!(r.ok);
        assert_eq!(r.text.as_deref(), Some("hello"));
        assert!(!r.terminal);
    }

    #[test]
    fn structured_result_passes_through() {
        let r = ToolCallResult::from_value(serde_json::json!({
            "ok": false,
            "error_code": "invalid_args",
            "message": "missing url",
            "missing_fields": ["url"]
        }));
        assert!(!r.ok);
        assert_eq!(r.error_code, Some(ErrorCode::InvalidArgs));
        assert_eq!(r.missing_fields, vec!["url".to_string()]);
    }

    #[test]
    fn ui_actions_imply_terminal_done() {
        let r = ToolCallResult::from_value(serde_json::json!({
            "ok": true,
            "ui": {"actions": [[{"text": "Open", "url": "https://example.com"}]]}
        }));
        assert!(r.terminal);
        assert_eq!(r.task_outcome, Some(TaskOutcome::Done));
    }

    #[test]
    fn explicit_outcome_not_overridden_by_ui() {
        let r = ToolCallResult::from_value(serde_json::json!({
            "ok": true,
            "task_outcome": "partial",
            "ui": {"actions": [[{"text": "Retry", "callback_data": "retry"}]]}
        }));
        assert!(!r.terminal);
        assert_eq!(r.task_outcome, Some(TaskOutcome::Partial));
    }

    #[test]
    fn bare_object_becomes_pretty_text() {
        let r = ToolCallResult::from_value(serde_json::json!({"items": [1, 2, 3]}));
        assert!(r.ok);
        assert!(r.text.unwrap().contains("items"));
    }

    #[test]
    fn render_for_model_error_includes_code() {
        let r = ToolCallResult::error(ErrorCode::PolicyBlocked, "tool not available");
        let rendered = r.render_for_model();
        assert!(rendered.contains("policy_blocked"));
        assert!(rendered.contains("tool not available"));
    }
}
