//! Backend auth flow for CLI backends.
//!
//! Interactive login cannot be automated across a process boundary, so
//! `start` only returns the literal command the operator must run. `status`
//! runs a non-interactive status check and classifies its output; the result
//! is recorded on the worker record.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Error;
use crate::worker::executor::{ExecRequest, Executor};
use crate::worker::model::Worker;
use crate::worker::registry::WorkerRegistry;

/// Deadline for a status-check subprocess.
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// CLI providers that require a login before the backend can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProvider {
    Codex,
    GeminiCli,
}

impl AuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::GeminiCli => "gemini-cli",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "codex" => Some(Self::Codex),
            "gemini-cli" => Some(Self::GeminiCli),
            _ => None,
        }
    }

    /// The command the operator runs by hand to log in.
    pub fn login_command(&self) -> &'static str {
        match self {
            Self::Codex => "codex login",
            Self::GeminiCli => "gemini auth login",
        }
    }

    /// Non-interactive status check: program plus argv.
    fn status_invocation(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Codex => ("codex", &["login", "status"]),
            Self::GeminiCli => ("gemini", &["auth", "status"]),
        }
    }
}

impl std::fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified auth state, stored as a string on the worker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Authenticated,
    NotAuthenticated,
    Unknown,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::NotAuthenticated => "not_authenticated",
            Self::Unknown => "unknown",
        }
    }
}

/// Auth operations against a worker's CLI backends.
pub struct AuthFlow {
    executor: Executor,
    registry: Arc<WorkerRegistry>,
}

impl AuthFlow {
    pub fn new(executor: Executor, registry: Arc<WorkerRegistry>) -> Self {
        Self { executor, registry }
    }

    /// Literal command the operator must run manually to authenticate.
    pub fn start(&self, provider: AuthProvider) -> String {
        provider.login_command().to_string()
    }

    /// Run the provider's status check in the worker's workspace, classify
    /// its output, and record the state on the worker.
    pub async fn status(
        &self,
        worker: &Worker,
        provider: AuthProvider,
    ) -> Result<AuthState, Error> {
        let (program, args) = provider.status_invocation();
        let req = ExecRequest {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            workdir: worker.workspace_root.clone(),
        };

        let state = match self
            .executor
            .run(
                &req,
                STATUS_TIMEOUT,
                &CancellationToken::new(),
                Duration::from_millis(200),
                Duration::from_secs(2),
            )
            .await
        {
            Ok(outcome) => {
                let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
                classify_output(&combined)
            }
            // Binary missing or not runnable: we genuinely do not know.
            Err(e) => {
                info!(provider = %provider, "Auth status check could not run: {e}");
                AuthState::Unknown
            }
        };

        self.registry
            .set_auth_state(worker.id, provider.as_str(), state.as_str())
            .await?;

        info!(worker = %worker.name, provider = %provider, state = state.as_str(), "Auth state recorded");
        Ok(state)
    }
}

/// Classify status-check output. Negative phrasings are checked first so
/// "not logged in" never reads as authenticated.
fn classify_output(output: &str) -> AuthState {
    let normalized = output.to_lowercase();
    const NEGATIVE: &[&str] = &[
        "not logged in",
        "not authenticated",
        "no credentials",
        "login required",
        "please run",
    ];
    const POSITIVE: &[&str] = &["logged in", "authenticated", "credentials found"];

    if NEGATIVE.iter().any(|p| normalized.contains(p)) {
        AuthState::NotAuthenticated
    } else if POSITIVE.iter().any(|p| normalized.contains(p)) {
        AuthState::Authenticated
    } else {
        AuthState::Unknown
    }
}
