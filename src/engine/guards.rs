//! Loop guards: stateful runaway detectors scoped to one tool loop.
//!
//! Three per-call guards, evaluated in order, first trip wins:
//! 1. exact-repeat — identical (tool, args) called too many times
//! 2. semantic-repeat — near-duplicate args (casing/whitespace/punctuation)
//! 3. per-tool budget — total invocations of one extension tool
//!
//! The turn limit is enforced by the loop engine itself. All counters reset
//! when a new `GuardRails` is built at loop start; nothing is persisted.

use std::collections::HashMap;

use crate::config::LoopConfig;
use crate::tools::tool::ToolKind;

/// Guard decision for one requested call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Call may execute.
    Allow,
    /// Loop must stop; `message` is the authoritative final text.
    Stop { guard: &'static str, message: String },
    /// Budget hit: withdraw this tool from the next turn and ask the model
    /// to synthesize a final answer from what was gathered.
    WithdrawTool { message: String },
}

/// Per-loop guard state.
pub struct GuardRails {
    exact_repeat_threshold: u32,
    semantic_repeat_threshold: u32,
    extension_call_budget: u32,
    /// Count per (tool, canonical args).
    exact_counts: HashMap<String, u32>,
    /// Count of *distinct* exact keys per (tool, normalized fingerprint).
    /// Identical repeats stay with the exact guard; this one catches
    /// surface-distinct near-duplicates.
    semantic_counts: HashMap<String, u32>,
    /// Total invocations per extension tool name.
    budget_counts: HashMap<String, u32>,
}

impl GuardRails {
    pub fn new(cfg: &LoopConfig) -> Self {
        Self {
            exact_repeat_threshold: cfg.exact_repeat_threshold,
            semantic_repeat_threshold: cfg.semantic_repeat_threshold,
            extension_call_budget: cfg.extension_call_budget,
            exact_counts: HashMap::new(),
            semantic_counts: HashMap::new(),
            budget_counts: HashMap::new(),
        }
    }

    /// Evaluate all per-call guards for one requested call.
    pub fn check(&mut self, name: &str, kind: ToolKind, args: &serde_json::Value) -> GuardVerdict {
        let exact_key = format!("{name}\u{1}{}", canonical_json(args));
        let exact_count = {
            let c = self.exact_counts.entry(exact_key.clone()).or_insert(0);
            *c += 1;
            *c
        };
        if exact_count >= self.exact_repeat_threshold {
            return GuardVerdict::Stop {
                guard: "exact_repeat",
                message: format!(
                    "Stopped: repeated tool call — '{name}' was invoked {exact_count} times \
                     with identical arguments."
                ),
            };
        }

        // Only the first occurrence of each exact variant feeds the semantic
        // counter, so pure identical repeats stay with the exact guard.
        if exact_count == 1 {
            let sem_key = format!("{name}\u{1}{}", semantic_fingerprint(args));
            let sem_count = {
                let c = self.semantic_counts.entry(sem_key).or_insert(0);
                *c += 1;
                *c
            };
            if sem_count >= self.semantic_repeat_threshold {
                return GuardVerdict::Stop {
                    guard: "semantic_repeat",
                    message: format!(
                        "Stopped: semantically duplicate call — '{name}' was invoked with \
                         arguments that differ only in casing, whitespace, or punctuation."
                    ),
                };
            }
        }

        if kind == ToolKind::Extension {
            let c = self.budget_counts.entry(name.to_string()).or_insert(0);
            *c += 1;
            if *c > self.extension_call_budget {
                return GuardVerdict::WithdrawTool {
                    message: format!(
                        "Tool '{name}' reached its call budget ({}) for this conversation \
                         and is no longer available.",
                        self.extension_call_budget
                    ),
                };
            }
        }

        GuardVerdict::Allow
    }
}

/// Deterministic serialization: object keys sorted recursively, compact.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), canonicalize(&map[k]));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// Normalized fingerprint: lowercase, punctuation dropped, whitespace
/// collapsed. Catches the "same URL, different casing" family of duplicates.
pub fn semantic_fingerprint(args: &serde_json::Value) -> String {
    let raw = canonical_json(args).to_lowercase();
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_space = false;
        } else if ch.is_whitespace() || ch.is_ascii_punctuation() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim_end().to_string()
}
