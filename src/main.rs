use std::sync::Arc;

use foreman::config::Config;
use foreman::engine::ToolLoopEngine;
use foreman::events::EventSink;
use foreman::llm::{ChatMessage, LlmBackend, LlmConfig, create_provider};
use foreman::store::{LibSqlStore, Store};
use foreman::tools::policy::PolicyGate;
use foreman::tools::registry::ToolRegistry;
use foreman::tools::tool::ToolContext;
use foreman::tools::{ToolPolicy, builtin};
use foreman::worker::auth::{AuthFlow, AuthProvider};
use foreman::worker::executor::Executor;
use foreman::worker::model::Backend;
use foreman::worker::registry::WorkerRegistry;
use foreman::worker::runtime::WorkerRuntime;
use foreman::worker::task_store::WorkerTaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("auth") {
        return run_auth(&args[1..]).await;
    }

    let instruction = args.join(" ");
    if instruction.trim().is_empty() {
        eprintln!("Usage: foreman <instruction>");
        eprintln!("       foreman auth <codex|gemini-cli> <start|status>");
        eprintln!("  FOREMAN_MODEL           model name (default claude-sonnet-4-20250514)");
        eprintln!("  FOREMAN_DB_PATH         ledger path (default ./data/foreman.db)");
        eprintln!("  FOREMAN_CONTAINER       run subprocesses inside this container");
        std::process::exit(2);
    }

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: ANTHROPIC_API_KEY not set");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });
    let model = std::env::var("FOREMAN_MODEL")
        .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

    let config = Config::from_env();

    let llm = create_provider(&LlmConfig {
        backend: LlmBackend::Anthropic,
        api_key: secrecy::SecretString::from(api_key),
        model,
    })?;

    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_local(&config.db_path).await?);

    let events = EventSink::default();
    let policy = Arc::new(PolicyGate::new(ToolPolicy::allow_all()));
    let tools = Arc::new(ToolRegistry::new());
    builtin::register_primitives(&tools).await;

    let engine = Arc::new(ToolLoopEngine::new(
        llm,
        tools.clone(),
        policy.clone(),
        events.clone(),
        config.loop_config.clone(),
    ));

    let workers = Arc::new(WorkerRegistry::new(
        store.clone(),
        config.workers_root.clone(),
    ));
    let tasks = Arc::new(WorkerTaskStore::new(
        store.clone(),
        config.runtime.max_task_events,
    ));
    let runtime = Arc::new(WorkerRuntime::new(
        workers.clone(),
        tasks,
        policy.clone(),
        engine.clone(),
        Executor::from_runtime(&config.runtime),
        events.clone(),
        config.runtime.clone(),
    ));
    tools
        .register(Arc::new(builtin::DispatchWorkerTool::new(runtime)))
        .await;

    let worker = workers.ensure_default(Backend::CoreAgent).await?;
    tracing::info!(worker = %worker.name, "Ready");

    let ctx = ToolContext::default();
    let history = vec![
        ChatMessage::system(
            "You are foreman, an agent that completes tasks with tools. Use dispatch_worker \
             for heavier work that should run in an isolated worker workspace.",
        ),
        ChatMessage::user(instruction),
    ];
    let answer = engine.run(history, &ctx).await?;
    println!("{answer}");

    Ok(())
}

/// `foreman auth <provider> <start|status>` — backend login helpers.
async fn run_auth(args: &[String]) -> anyhow::Result<()> {
    let (Some(provider_raw), Some(action)) = (args.first(), args.get(1)) else {
        anyhow::bail!("usage: foreman auth <codex|gemini-cli> <start|status>");
    };
    let provider = AuthProvider::parse(provider_raw)
        .ok_or_else(|| anyhow::anyhow!("unknown provider '{provider_raw}'"))?;

    let config = Config::from_env();
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_local(&config.db_path).await?);
    let workers = Arc::new(WorkerRegistry::new(store, config.workers_root));
    let worker = workers.ensure_default(Backend::CoreAgent).await?;
    let flow = AuthFlow::new(Executor::from_runtime(&config.runtime), workers);

    match action.as_str() {
        "start" => {
            println!("Run this command to log in:");
            println!("  {}", flow.start(provider));
        }
        "status" => {
            let state = flow.status(&worker, provider).await?;
            println!("{provider}: {}", state.as_str());
        }
        other => anyhow::bail!("unknown auth action '{other}'"),
    }
    Ok(())
}
