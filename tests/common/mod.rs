//! Shared test doubles: a scripted LLM provider and a counting tool.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use foreman::error::{LlmError, ToolError};
use foreman::llm::{
    CompletionRequest, CompletionResponse, LlmProvider, TokenUsage, ToolCall,
};
use foreman::tools::tool::{Tool, ToolContext, ToolKind};
use tokio::sync::Mutex;

/// What the provider answers once the script runs out.
pub enum Fallback {
    /// A plain text answer.
    Text(String),
    /// A fresh tool call every time, with per-call unique arguments.
    ToolCall { name: String },
}

/// Plays back a fixed list of responses, then the fallback forever.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<CompletionResponse>>,
    fallback: Fallback,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(script: Vec<CompletionResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Fallback::Text("done".to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// A provider that always requests a new `name` call.
    pub fn always_calling(name: &str) -> Self {
        Self::new(Vec::new()).with_fallback(Fallback::ToolCall {
            name: name.to_string(),
        })
    }

    /// A provider that answers `text` on the first turn.
    pub fn answering(text: &str) -> Self {
        Self::new(vec![text_response(text)])
    }

    pub fn completions(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.script.lock().await.pop_front() {
            return Ok(response);
        }
        Ok(match &self.fallback {
            Fallback::Text(text) => text_response(text),
            Fallback::ToolCall { name } => {
                tool_call_response(name, serde_json::json!({"step": format!("unique {n}")}))
            }
        })
    }
}

pub fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
        usage: TokenUsage::default(),
    }
}

pub fn tool_call_response(name: &str, args: serde_json::Value) -> CompletionResponse {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    CompletionResponse {
        content: None,
        tool_calls: vec![ToolCall {
            id: format!("call_{id}"),
            name: name.to_string(),
            arguments: args,
        }],
        usage: TokenUsage::default(),
    }
}

/// Tool that counts executions and echoes a fixed reply.
pub struct CountingTool {
    name: String,
    kind: ToolKind,
    schema: serde_json::Value,
    pub executions: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn primitive(name: &str) -> Self {
        Self::with_kind(name, ToolKind::Primitive)
    }

    pub fn extension(name: &str) -> Self {
        Self::with_kind(name, ToolKind::Extension)
    }

    fn with_kind(name: &str, kind: ToolKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            schema: serde_json::json!({"type": "object", "properties": {}}),
            executions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.executions.clone()
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test tool"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn kind(&self) -> ToolKind {
        self.kind
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!(format!("executed with {args}")))
    }
}
