//! Lifecycle event sink for UI and telemetry.
//!
//! Events are observational only: subscribers may render or log them, but
//! nothing in the loop or runtime reads them back to make decisions.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A structured lifecycle event emitted by the loop engine or worker runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ToolCallFinished {
        tool_name: String,
        ok: bool,
        turn: usize,
        summary: String,
    },
    LoopGuard {
        guard: String,
        tool_name: String,
        message: String,
    },
    ToolBudgetGuard {
        tool_name: String,
        budget: u32,
    },
    FinalResponse {
        turns: usize,
    },
    MaxTurnLimit {
        max_turns: usize,
    },
    TaskStateChanged {
        task_id: Uuid,
        worker_id: Uuid,
        status: String,
        detail: Option<String>,
    },
}

impl LifecycleEvent {
    /// Short label for logs and the ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolCallFinished { .. } => "tool_call_finished",
            Self::LoopGuard { .. } => "loop_guard",
            Self::ToolBudgetGuard { .. } => "tool_budget_guard",
            Self::FinalResponse { .. } => "final_response",
            Self::MaxTurnLimit { .. } => "max_turn_limit",
            Self::TaskStateChanged { .. } => "task_state_changed",
        }
    }
}

/// Broadcast fan-out for lifecycle events. Cheap to clone; dropped receivers
/// never block emitters.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. Send failures (no subscribers) are ignored.
    pub fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(event = event.kind(), "lifecycle event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
