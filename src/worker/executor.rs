//! Subprocess execution and supervision.
//!
//! An [`Executor`] turns a CLI invocation into a spawned process, either
//! directly on the host or routed through `docker exec` into a pre-existing
//! container. Supervision is a poll loop: each tick checks the cancellation
//! token, the wall-clock deadline, and process exit, in that order. A killed
//! process gets a bounded grace period to be reaped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ContainerConfig, RuntimeConfig};
use crate::worker::model::CliInvocation;

/// Combined output cap fed back into results (64KB).
const MAX_CAPTURE: usize = 64 * 1024;

/// A fully resolved command: program, argv, working directory.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

impl ExecRequest {
    /// Substitute the instruction into a CLI template. The template is split
    /// on whitespace and the `{instruction}` token becomes a single argv
    /// element, so the instruction never passes through a shell unquoted.
    pub fn from_invocation(
        invocation: CliInvocation,
        instruction: &str,
        workdir: &Path,
    ) -> Self {
        let args = invocation
            .template
            .split_whitespace()
            .map(|part| {
                if part == "{instruction}" {
                    instruction.to_string()
                } else {
                    part.to_string()
                }
            })
            .collect();
        Self {
            program: invocation.program.to_string(),
            args,
            workdir: workdir.to_path_buf(),
        }
    }
}

/// How the supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Process exited on its own with this code.
    Exited(i32),
    /// Deadline hit; process was killed.
    TimedOut,
    /// Cancellation requested; process was killed.
    Cancelled,
}

/// Captured result of one supervised execution.
#[derive(Debug)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        matches!(self.status, ExecStatus::Exited(0))
    }

    /// Stdout, falling back to stderr when stdout is empty.
    pub fn primary_output(&self) -> &str {
        if self.stdout.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

/// Where subprocesses run.
#[derive(Debug, Clone)]
pub enum Executor {
    /// Spawn directly on the host, cwd set to the task workdir.
    LocalSubprocess,
    /// Route through `docker exec -w <workdir> <container> argv...`.
    ContainerSubprocess(ContainerConfig),
}

impl Executor {
    pub fn from_runtime(cfg: &RuntimeConfig) -> Self {
        match &cfg.container {
            Some(container) => Self::ContainerSubprocess(container.clone()),
            None => Self::LocalSubprocess,
        }
    }

    fn command(&self, req: &ExecRequest) -> Command {
        match self {
            Self::LocalSubprocess => {
                let mut cmd = Command::new(&req.program);
                cmd.args(&req.args).current_dir(&req.workdir);
                cmd
            }
            Self::ContainerSubprocess(container) => {
                let mut cmd = Command::new("docker");
                cmd.arg("exec")
                    .args(["-w", &container.workdir])
                    .arg(&container.name)
                    .arg(&req.program)
                    .args(&req.args);
                cmd
            }
        }
    }

    /// Spawn and supervise a process.
    ///
    /// Spawn failures surface as `Err` so callers can distinguish
    /// "could not even start" from a started-then-failed run.
    pub async fn run(
        &self,
        req: &ExecRequest,
        deadline: Duration,
        cancel: &CancellationToken,
        poll_interval: Duration,
        kill_grace: Duration,
    ) -> std::io::Result<ExecOutcome> {
        let mut child = self
            .command(req)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!(program = %req.program, "Subprocess spawned");

        // Drain pipes concurrently so a chatty process never blocks on a
        // full pipe while we poll.
        let stdout_task = spawn_reader(child.stdout.take());
        let stderr_task = spawn_reader(child.stderr.take());

        let started = Instant::now();
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let status = loop {
            ticker.tick().await;

            if cancel.is_cancelled() {
                kill_and_reap(&mut child, kill_grace).await;
                break ExecStatus::Cancelled;
            }
            if started.elapsed() >= deadline {
                warn!(program = %req.program, ?deadline, "Subprocess deadline hit");
                kill_and_reap(&mut child, kill_grace).await;
                break ExecStatus::TimedOut;
            }
            match child.try_wait()? {
                Some(exit) => break ExecStatus::Exited(exit.code().unwrap_or(-1)),
                None => continue,
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(ExecOutcome {
            status,
            stdout: truncate(&stdout),
            stderr: truncate(&stderr),
        })
    }
}

/// Read a pipe to completion on a background task.
fn spawn_reader<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return String::new();
        };
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Kill the process, then wait up to the grace period for it to be reaped.
async fn kill_and_reap(child: &mut Child, grace: Duration) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill subprocess: {e}");
        return;
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Subprocess not reaped within grace period");
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_CAPTURE {
        return s.to_string();
    }
    let mut end = MAX_CAPTURE;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [output truncated]", &s[..end])
}
