//! The tool-calling loop.
//!
//! Single-threaded cooperative per conversation: each turn asks the model,
//! dispatches any requested calls (each gated by the guards first), feeds the
//! results back, and repeats until the model answers in plain text, a guard
//! trips, or the turn limit is hit.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::LoopConfig;
use crate::engine::dispatcher::ToolCallDispatcher;
use crate::engine::evolve::{CapabilitySynthesizer, NoEvolution};
use crate::engine::guards::{GuardRails, GuardVerdict};
use crate::error::Result;
use crate::events::{EventSink, LifecycleEvent};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, Role, ToolDefinition};
use crate::tools::policy::PolicyGate;
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::{ToolContext, ToolKind};

/// Length cap for event summaries.
const SUMMARY_LEN: usize = 120;

/// Drives the turn-by-turn conversation for one instruction.
pub struct ToolLoopEngine {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyGate>,
    dispatcher: ToolCallDispatcher,
    events: EventSink,
    synthesizer: Arc<dyn CapabilitySynthesizer>,
    cfg: LoopConfig,
}

impl ToolLoopEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        policy: Arc<PolicyGate>,
        events: EventSink,
        cfg: LoopConfig,
    ) -> Self {
        let dispatcher =
            ToolCallDispatcher::new(registry.clone(), policy.clone(), provider.clone(), &cfg);
        Self {
            provider,
            registry,
            policy,
            dispatcher,
            events,
            synthesizer: Arc::new(NoEvolution),
            cfg,
        }
    }

    /// Install a capability synthesizer for the turn-limit recovery path.
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn CapabilitySynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Run the loop to completion. Always produces final text: guard trips
    /// and the turn limit synthesize a terminal message rather than erroring.
    pub async fn run(&self, history: Vec<ChatMessage>, ctx: &ToolContext) -> Result<String> {
        match self.run_once(history.clone(), ctx).await? {
            LoopOutcome::Final(text) => Ok(text),
            LoopOutcome::TurnLimit => {
                if self.cfg.auto_evolution && !self.registry.has_extension().await {
                    if let Some(text) = self.try_evolution(&history, ctx).await? {
                        return Ok(text);
                    }
                }
                self.events.emit(LifecycleEvent::MaxTurnLimit {
                    max_turns: self.cfg.max_turns,
                });
                Ok(self.turn_limit_message())
            }
        }
    }

    /// One-shot capability synthesis, then a single full retry.
    async fn try_evolution(
        &self,
        history: &[ChatMessage],
        ctx: &ToolContext,
    ) -> Result<Option<String>> {
        let instruction = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let Some(tool) = self.synthesizer.synthesize(&instruction).await else {
            return Ok(None);
        };
        info!(tool = tool.name(), "Synthesized new capability, retrying loop");
        self.registry.register(tool).await;

        match self.run_once(history.to_vec(), ctx).await? {
            LoopOutcome::Final(text) => Ok(Some(text)),
            LoopOutcome::TurnLimit => {
                self.events.emit(LifecycleEvent::MaxTurnLimit {
                    max_turns: self.cfg.max_turns,
                });
                Ok(Some(self.turn_limit_message()))
            }
        }
    }

    async fn run_once(
        &self,
        mut history: Vec<ChatMessage>,
        ctx: &ToolContext,
    ) -> Result<LoopOutcome> {
        let mut guards = GuardRails::new(&self.cfg);
        let mut withdrawn: HashSet<String> = HashSet::new();

        for turn in 1..=self.cfg.max_turns {
            let tools = self.available_tools(ctx, &withdrawn).await;
            let request = CompletionRequest::new(history.clone()).with_tools(tools);
            let response = self.provider.complete(request).await?;

            if response.is_text() {
                self.events.emit(LifecycleEvent::FinalResponse { turns: turn });
                return Ok(LoopOutcome::Final(non_empty(response.text())));
            }

            debug!(turn, calls = response.tool_calls.len(), "Model requested tool calls");
            history.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            let mut budget_tripped = false;
            for call in &response.tool_calls {
                let kind = match self.registry.get(&call.name).await {
                    Some(tool) => tool.kind(),
                    None => ToolKind::Extension,
                };

                match guards.check(&call.name, kind, &call.arguments) {
                    GuardVerdict::Stop { guard, message } => {
                        warn!(guard, tool = %call.name, "Loop guard tripped");
                        self.events.emit(LifecycleEvent::LoopGuard {
                            guard: guard.to_string(),
                            tool_name: call.name.clone(),
                            message: message.clone(),
                        });
                        return Ok(LoopOutcome::Final(message));
                    }
                    GuardVerdict::WithdrawTool { message } => {
                        self.events.emit(LifecycleEvent::ToolBudgetGuard {
                            tool_name: call.name.clone(),
                            budget: self.cfg.extension_call_budget,
                        });
                        withdrawn.insert(call.name.clone());
                        history.push(ChatMessage::tool_result(&call.id, &message));
                        budget_tripped = true;
                    }
                    GuardVerdict::Allow => {
                        let result = self.dispatcher.execute(call, ctx).await;
                        self.events.emit(LifecycleEvent::ToolCallFinished {
                            tool_name: call.name.clone(),
                            ok: result.ok,
                            turn,
                            summary: summarize(&result.render_for_model()),
                        });
                        let rendered = result.render_for_model();
                        history.push(ChatMessage::tool_result(&call.id, &rendered));

                        if result.terminal {
                            self.events
                                .emit(LifecycleEvent::FinalResponse { turns: turn });
                            return Ok(LoopOutcome::Final(non_empty(
                                result.text.unwrap_or(rendered),
                            )));
                        }
                    }
                }
            }

            if budget_tripped {
                return Ok(LoopOutcome::Final(
                    self.synthesize_final(history, &withdrawn).await?,
                ));
            }
        }

        Ok(LoopOutcome::TurnLimit)
    }

    /// Budget-guard recovery: one more model call with every tool withdrawn,
    /// asking for a best-effort answer from what was gathered.
    async fn synthesize_final(
        &self,
        mut history: Vec<ChatMessage>,
        withdrawn: &HashSet<String>,
    ) -> Result<String> {
        let names: Vec<&str> = withdrawn.iter().map(String::as_str).collect();
        history.push(ChatMessage::user(format!(
            "The tool(s) {} are no longer available in this conversation. \
             Give your best final answer using the information gathered so far.",
            names.join(", ")
        )));
        let response = self
            .provider
            .complete(CompletionRequest::new(history))
            .await?;
        self.events.emit(LifecycleEvent::FinalResponse {
            turns: self.cfg.max_turns,
        });
        let text = response.text();
        if text.trim().is_empty() {
            Ok(format!(
                "Stopped: the tool budget for {} was exhausted before a complete answer \
                 could be produced.",
                names.join(", ")
            ))
        } else {
            Ok(text)
        }
    }

    async fn available_tools(
        &self,
        ctx: &ToolContext,
        withdrawn: &HashSet<String>,
    ) -> Vec<ToolDefinition> {
        let all = self.registry.definitions().await;
        self.policy
            .filter_tools(ctx.worker_id, all)
            .await
            .into_iter()
            .filter(|t| !withdrawn.contains(&t.name))
            .collect()
    }

    fn turn_limit_message(&self) -> String {
        format!(
            "Stopped: reached the maximum of {} turns for this conversation. \
             Partial progress may be reflected above.",
            self.cfg.max_turns
        )
    }
}

enum LoopOutcome {
    Final(String),
    TurnLimit,
}

fn non_empty(text: String) -> String {
    if text.trim().is_empty() {
        "(no response)".to_string()
    } else {
        text
    }
}

fn summarize(text: &str) -> String {
    if text.len() <= SUMMARY_LEN {
        return text.to_string();
    }
    let mut end = SUMMARY_LEN;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
