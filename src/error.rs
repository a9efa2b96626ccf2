//! Error types for foreman.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type for the agent core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid arguments for tool {name}: {reason}")]
    InvalidArgs { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Tool {name} is not authorized: {reason}")]
    NotAuthorized { name: String, reason: String },
}

/// Tool policy errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Tool {tool} is blocked by policy for worker {worker}")]
    Blocked { worker: String, tool: String },

    #[error("No backend allowed by policy for worker {worker}")]
    NoBackendAllowed { worker: String },
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Task {id} was cancelled by user")]
    Cancelled { id: Uuid },

    #[error("Task {id} timed out after {timeout:?}")]
    Timeout { id: Uuid, timeout: Duration },

    #[error("Backend {backend} preparation failed: {reason}")]
    PrepareFailed { backend: String, reason: String },

    #[error("Task {id} execution failed: {reason}")]
    ExecutionFailed { id: Uuid, reason: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Wire-level error codes carried in tool call results and task records.
///
/// These are the stable strings a caller (or a human reading the task ledger)
/// keys on; the `thiserror` enums above are the in-process view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgs,
    SkillNotFound,
    EntrypointMissing,
    ExecutionTimeout,
    ExecutionError,
    PolicyBlocked,
    CancelledByUser,
    ExecPrepareFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgs => "invalid_args",
            Self::SkillNotFound => "skill_not_found",
            Self::EntrypointMissing => "entrypoint_missing",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ExecutionError => "execution_error",
            Self::PolicyBlocked => "policy_blocked",
            Self::CancelledByUser => "cancelled_by_user",
            Self::ExecPrepareFailed => "exec_prepare_failed",
        }
    }

    /// Every code in this taxonomy is recoverable. Fatal failures (no backend
    /// allowed at all) are surfaced verbatim as errors instead of a code.
    pub fn failure_mode(&self) -> FailureMode {
        FailureMode::Recoverable
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failure is worth retrying or needs an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    Recoverable,
    Fatal,
}

/// Result type alias for the agent core.
pub type Result<T> = std::result::Result<T, Error>;
