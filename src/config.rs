//! Configuration types.
//!
//! Guard thresholds and supervision intervals are operational knobs, not
//! contracts: every value here can be overridden through a `FOREMAN_*`
//! environment variable.

use std::path::PathBuf;
use std::time::Duration;

/// Tool-loop configuration (guards and turn limits).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Hard cap on model turns per loop.
    pub max_turns: usize,
    /// Identical (tool, args) calls allowed before the exact-repeat guard trips.
    pub exact_repeat_threshold: u32,
    /// Normalized-duplicate calls allowed before the semantic-repeat guard trips.
    pub semantic_repeat_threshold: u32,
    /// Per-tool invocation budget within one loop (extension tools only).
    pub extension_call_budget: u32,
    /// Extra argument-planning attempts after an `invalid_args` validation failure.
    pub replan_attempts: u32,
    /// Whether a tripped turn limit may attempt one-shot capability synthesis.
    pub auto_evolution: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_turns: 8,
            exact_repeat_threshold: 3,
            semantic_repeat_threshold: 2,
            extension_call_budget: 5,
            replan_attempts: 1,
            auto_evolution: false,
        }
    }
}

impl LoopConfig {
    /// Build from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_turns: env_parse("FOREMAN_MAX_TURNS", d.max_turns),
            exact_repeat_threshold: env_parse(
                "FOREMAN_EXACT_REPEAT_THRESHOLD",
                d.exact_repeat_threshold,
            ),
            semantic_repeat_threshold: env_parse(
                "FOREMAN_SEMANTIC_REPEAT_THRESHOLD",
                d.semantic_repeat_threshold,
            ),
            extension_call_budget: env_parse(
                "FOREMAN_EXTENSION_CALL_BUDGET",
                d.extension_call_budget,
            ),
            replan_attempts: env_parse("FOREMAN_REPLAN_ATTEMPTS", d.replan_attempts),
            auto_evolution: env_parse("FOREMAN_AUTO_EVOLUTION", d.auto_evolution),
        }
    }
}

/// Container-exec routing for isolated mode.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Name of the pre-existing container to exec into.
    pub name: String,
    /// Working directory inside the container.
    pub workdir: String,
}

/// Worker runtime configuration (supervision and task ledger).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Wall-clock deadline per task, measured from task start.
    pub task_timeout: Duration,
    /// Supervision poll tick; bounds worst-case cancellation latency.
    pub poll_interval: Duration,
    /// Grace period for reaping a killed subprocess.
    pub kill_grace: Duration,
    /// Event-list tail length kept per task.
    pub max_task_events: usize,
    /// When set, subprocess spawns are routed through container exec.
    pub container: Option<ContainerConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(200),
            kill_grace: Duration::from_secs(2),
            max_task_events: 50,
            container: None,
        }
    }
}

impl RuntimeConfig {
    /// Build from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let container = std::env::var("FOREMAN_CONTAINER").ok().map(|name| {
            ContainerConfig {
                name,
                workdir: std::env::var("FOREMAN_CONTAINER_WORKDIR")
                    .unwrap_or_else(|_| "/workspace".to_string()),
            }
        });
        Self {
            task_timeout: Duration::from_secs(env_parse(
                "FOREMAN_TASK_TIMEOUT_SECS",
                d.task_timeout.as_secs(),
            )),
            poll_interval: Duration::from_millis(env_parse(
                "FOREMAN_POLL_INTERVAL_MS",
                d.poll_interval.as_millis() as u64,
            )),
            kill_grace: Duration::from_secs(env_parse(
                "FOREMAN_KILL_GRACE_SECS",
                d.kill_grace.as_secs(),
            )),
            max_task_events: env_parse("FOREMAN_MAX_TASK_EVENTS", d.max_task_events),
            container,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub loop_config: LoopConfig,
    pub runtime: RuntimeConfig,
    /// Root under which per-worker workspace directories are created.
    pub workers_root: PathBuf,
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loop_config: LoopConfig::default(),
            runtime: RuntimeConfig::default(),
            workers_root: PathBuf::from("./data/workers"),
            db_path: PathBuf::from("./data/foreman.db"),
        }
    }
}

impl Config {
    /// Build from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            loop_config: LoopConfig::from_env(),
            runtime: RuntimeConfig::from_env(),
            workers_root: std::env::var("FOREMAN_WORKERS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.workers_root),
            db_path: std::env::var("FOREMAN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
        }
    }
}

/// Parse an env var, falling back to `default` when unset or unparseable.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
