//! End-to-end tests for the tool loop: guards, budgets, turn limits, and the
//! evolution retry, driven by a scripted provider.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

use common::{CountingTool, Fallback, ScriptedProvider, text_response, tool_call_response};
use foreman::config::LoopConfig;
use foreman::engine::evolve::CapabilitySynthesizer;
use foreman::engine::{ToolCallDispatcher, ToolLoopEngine};
use foreman::events::EventSink;
use foreman::llm::{ChatMessage, LlmProvider, ToolCall};
use foreman::tools::policy::PolicyGate;
use foreman::tools::registry::ToolRegistry;
use foreman::tools::tool::{Tool, ToolContext};

fn history(instruction: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You are a test agent."),
        ChatMessage::user(instruction),
    ]
}

fn engine(
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    cfg: LoopConfig,
) -> ToolLoopEngine {
    ToolLoopEngine::new(
        provider,
        registry,
        Arc::new(PolicyGate::default()),
        EventSink::default(),
        cfg,
    )
}

#[tokio::test]
async fn plain_text_answer_ends_loop_immediately() {
    let provider = Arc::new(ScriptedProvider::answering("forty-two"));
    let registry = Arc::new(ToolRegistry::new());

    let result = engine(provider.clone(), registry, LoopConfig::default())
        .run(history("what is the answer"), &ToolContext::default())
        .await
        .unwrap();

    assert_eq!(result, "forty-two");
    assert_eq!(provider.completions(), 1);
}

#[tokio::test]
async fn exact_repeat_guard_stops_loop() {
    let args = serde_json::json!({"query": "same thing"});
    let provider = Arc::new(
        ScriptedProvider::new(vec![
            tool_call_response("probe", args.clone()),
            tool_call_response("probe", args.clone()),
            tool_call_response("probe", args.clone()),
            tool_call_response("probe", args.clone()),
        ])
        .with_fallback(Fallback::Text("should never get here".into())),
    );

    let tool = CountingTool::primitive("probe");
    let executions = tool.counter();
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(tool)).await;

    let result = engine(provider, registry, LoopConfig::default())
        .run(history("do it"), &ToolContext::default())
        .await
        .unwrap();

    assert!(result.contains("repeated tool call"), "got: {result}");
    // Threshold 3: two identical calls execute, the third trips the guard.
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn semantic_repeat_guard_catches_near_duplicates() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![
            tool_call_response("fetch", serde_json::json!({"url": "https://Example.com/Feed"})),
            tool_call_response("fetch", serde_json::json!({"url": "https://example.com/feed"})),
        ])
        .with_fallback(Fallback::Text("unreachable".into())),
    );

    let tool = CountingTool::primitive("fetch");
    let executions = tool.counter();
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(tool)).await;

    let result = engine(provider, registry, LoopConfig::default())
        .run(history("fetch the feed"), &ToolContext::default())
        .await
        .unwrap();

    assert!(result.contains("semantically duplicate"), "got: {result}");
    // Only the first surface-distinct variant actually ran.
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(executions.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn budget_exhaustion_withdraws_tool_and_still_answers() {
    // Six semantically distinct calls; the budget (5) trips on the sixth,
    // then the engine asks for a final synthesis with tools withdrawn.
    let mut script: Vec<_> = [
        "alpha topic",
        "bravo subject",
        "charlie matter",
        "delta item",
        "echo question",
        "foxtrot issue",
    ]
    .iter()
    .map(|q| tool_call_response("research", serde_json::json!({"query": q})))
    .collect();
    script.push(text_response("best effort from gathered context"));

    let provider = Arc::new(ScriptedProvider::new(script));
    let tool = CountingTool::extension("research");
    let executions = tool.counter();
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(tool)).await;

    let cfg = LoopConfig {
        max_turns: 20,
        ..Default::default()
    };
    let result = engine(provider, registry, cfg)
        .run(history("research everything"), &ToolContext::default())
        .await
        .unwrap();

    assert!(!result.trim().is_empty());
    assert_eq!(result, "best effort from gathered context");
    assert_eq!(executions.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn turn_limit_preempts_a_model_that_never_stops() {
    let provider = Arc::new(ScriptedProvider::always_calling("step"));
    let tool = CountingTool::primitive("step");
    let executions = tool.counter();
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(tool)).await;

    let cfg = LoopConfig {
        max_turns: 3,
        ..Default::default()
    };
    let result = engine(provider.clone(), registry, cfg)
        .run(history("loop forever"), &ToolContext::default())
        .await
        .unwrap();

    assert!(result.contains('3'), "limit should be named: {result}");
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    assert_eq!(provider.completions(), 3);
}

struct OneShotSynthesizer;

#[async_trait]
impl CapabilitySynthesizer for OneShotSynthesizer {
    async fn synthesize(&self, _instruction: &str) -> Option<Arc<dyn Tool>> {
        Some(Arc::new(CountingTool::extension("synthesized_capability")))
    }
}

#[tokio::test]
async fn turn_limit_with_auto_evolution_retries_once() {
    // Two burn turns, then the retried loop answers in text.
    let provider = Arc::new(
        ScriptedProvider::new(vec![
            tool_call_response("step", serde_json::json!({"step": "one"})),
            tool_call_response("step", serde_json::json!({"step": "two"})),
            text_response("evolved answer"),
        ])
        .with_fallback(Fallback::Text("fallback".into())),
    );

    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(CountingTool::primitive("step"))).await;

    let cfg = LoopConfig {
        max_turns: 2,
        auto_evolution: true,
        ..Default::default()
    };
    let engine = engine(provider, registry.clone(), cfg)
        .with_synthesizer(Arc::new(OneShotSynthesizer));

    let result = engine
        .run(history("needs a new capability"), &ToolContext::default())
        .await
        .unwrap();

    assert_eq!(result, "evolved answer");
    assert!(registry.has("synthesized_capability").await);
}

#[tokio::test]
async fn terminal_tool_result_ends_loop() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![tool_call_response(
            "finisher",
            serde_json::json!({"go": true}),
        )])
        .with_fallback(Fallback::Text("should not be asked again".into())),
    );

    struct FinisherTool;
    #[async_trait]
    impl Tool for FinisherTool {
        fn name(&self) -> &str {
            "finisher"
        }
        fn description(&self) -> &str {
            "ends the task"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, foreman::error::ToolError> {
            Ok(serde_json::json!({
                "ok": true,
                "text": "all wrapped up",
                "terminal": true,
                "task_outcome": "done"
            }))
        }
    }

    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(FinisherTool)).await;

    let result = engine(provider.clone(), registry, LoopConfig::default())
        .run(history("finish it"), &ToolContext::default())
        .await
        .unwrap();

    assert_eq!(result, "all wrapped up");
    assert_eq!(provider.completions(), 1);
}

#[tokio::test]
async fn dispatcher_replans_invalid_extension_args() {
    // The replan turn returns corrected JSON, after which execution succeeds.
    let provider = Arc::new(ScriptedProvider::new(vec![text_response(
        r#"{"url": "https://example.com"}"#,
    )]));

    let tool = CountingTool::extension("fetch").with_schema(serde_json::json!({
        "type": "object",
        "properties": {"url": {"type": "string"}},
        "required": ["url"]
    }));
    let executions = tool.counter();
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(tool)).await;

    let dispatcher = ToolCallDispatcher::new(
        registry,
        Arc::new(PolicyGate::default()),
        provider,
        &LoopConfig::default(),
    );

    let call = ToolCall {
        id: "call_x".into(),
        name: "fetch".into(),
        arguments: serde_json::json!({"address": "https://example.com"}),
    };
    let result = dispatcher.execute(&call, &ToolContext::default()).await;

    assert!(result.ok, "replanned call should succeed: {result:?}");
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dispatcher_reports_missing_fields_for_primitives() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let tool = CountingTool::primitive("writer").with_schema(serde_json::json!({
        "type": "object",
        "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
        "required": ["path", "content"]
    }));
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(tool)).await;

    let dispatcher = ToolCallDispatcher::new(
        registry,
        Arc::new(PolicyGate::default()),
        provider.clone(),
        &LoopConfig::default(),
    );

    let call = ToolCall {
        id: "call_y".into(),
        name: "writer".into(),
        arguments: serde_json::json!({"path": "a.txt"}),
    };
    let result = dispatcher.execute(&call, &ToolContext::default()).await;

    assert!(!result.ok);
    assert_eq!(result.missing_fields, vec!["content".to_string()]);
    // Primitives never trigger the replanner.
    assert_eq!(provider.completions(), 0);
}

#[tokio::test]
async fn unknown_tool_fails_fast() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let dispatcher = ToolCallDispatcher::new(
        Arc::new(ToolRegistry::new()),
        Arc::new(PolicyGate::default()),
        provider,
        &LoopConfig::default(),
    );

    let call = ToolCall {
        id: "call_z".into(),
        name: "nonexistent".into(),
        arguments: serde_json::json!({}),
    };
    let result = dispatcher.execute(&call, &ToolContext::default()).await;
    assert!(!result.ok);
    assert!(result.message.unwrap().contains("not available"));
}
