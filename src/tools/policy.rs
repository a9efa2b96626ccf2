//! Per-worker tool/backend allow-deny policy.
//!
//! Policy entries are either concrete names (`shell`, `dispatch_worker`,
//! backend names like `codex`) or groups (`group:all`, `group:coding`) that
//! expand at evaluation time. Deny always wins over allow for the same name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::llm::ToolDefinition;

/// Concrete names `group:coding` expands to.
const GROUP_CODING: &[&str] = &["read_file", "write_file", "list_dir", "shell"];

/// Allow/deny lists for one worker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    /// Allowed names and groups. Empty means "allow everything not denied".
    #[serde(default)]
    pub allow: Vec<String>,
    /// Denied names and groups.
    #[serde(default)]
    pub deny: Vec<String>,
}

impl ToolPolicy {
    pub fn allow_all() -> Self {
        Self {
            allow: vec!["group:all".to_string()],
            deny: Vec::new(),
        }
    }

    pub fn deny_only(deny: Vec<String>) -> Self {
        Self {
            allow: Vec::new(),
            deny,
        }
    }

    /// Whether `name` is allowed under this policy. Deny wins.
    pub fn allows(&self, name: &str) -> bool {
        if self.deny.iter().any(|entry| entry_matches(entry, name)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|entry| entry_matches(entry, name))
    }
}

/// Does a policy entry (name or group) cover `name`?
fn entry_matches(entry: &str, name: &str) -> bool {
    match entry {
        "group:all" => true,
        "group:coding" => GROUP_CODING.contains(&name),
        other => other == name,
    }
}

/// Policy store keyed by worker, with a default for workers without one.
pub struct PolicyGate {
    policies: RwLock<HashMap<Uuid, ToolPolicy>>,
    default_policy: ToolPolicy,
}

impl PolicyGate {
    pub fn new(default_policy: ToolPolicy) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            default_policy,
        }
    }

    pub async fn set_policy(&self, worker_id: Uuid, policy: ToolPolicy) {
        self.policies.write().await.insert(worker_id, policy);
    }

    pub async fn policy_for(&self, worker_id: Option<Uuid>) -> ToolPolicy {
        if let Some(id) = worker_id {
            if let Some(policy) = self.policies.read().await.get(&id) {
                return policy.clone();
            }
        }
        self.default_policy.clone()
    }

    /// Whether `name` (tool or backend) may run for this worker.
    pub async fn allowed(&self, worker_id: Option<Uuid>, name: &str) -> bool {
        self.policy_for(worker_id).await.allows(name)
    }

    /// Filter tool declarations down to what policy permits.
    pub async fn filter_tools(
        &self,
        worker_id: Option<Uuid>,
        tools: Vec<ToolDefinition>,
    ) -> Vec<ToolDefinition> {
        let policy = self.policy_for(worker_id).await;
        tools.into_iter().filter(|t| policy.allows(&t.name)).collect()
    }
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::new(ToolPolicy::allow_all())
    }
}
