// Shared fixtures for the integration tests

#![allow(dead_code)]

use relay_core::{
    Actor, AgentEvent, DelegateRef, EventKind, FunctionTool, InMemoryRuntime, MockGenerator,
    ReasoningDefinition, RoutingDefinition, Rule, RuleRef, ToolExecutionResult, ToolRef, VarType,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const AGENT_MODEL: &str = "agent-model";
pub const ROUTER_MODEL: &str = "router-model";
pub const GREETER_MODEL: &str = "greeter-model";
pub const MUSIC_MODEL: &str = "music-model";

/// Generous bound for any single `next` call
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collect events up to and including the next `Eof`, `Closed` or `Interrupted`
pub async fn drain_round(actor: &dyn Actor) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(STEP_TIMEOUT, actor.next())
            .await
            .expect("next timed out")
            .expect("next failed");
        let stop = event.kind == EventKind::Eof || event.is_terminal();
        events.push(event);
        if stop {
            return events;
        }
    }
}

pub fn kinds(events: &[AgentEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

pub fn chunk_text(events: &[AgentEvent]) -> String {
    events.iter().filter_map(|e| e.chunk.as_deref()).collect()
}

/// Adds `a` and `b`
pub fn calculator() -> FunctionTool {
    FunctionTool::new("calculator", "Add two integers", |args| async move {
        match (args["a"].as_i64(), args["b"].as_i64()) {
            (Some(a), Some(b)) => ToolExecutionResult::success(json!(a + b)),
            _ => ToolExecutionResult::tool_error("a and b must be integers"),
        }
    })
    .with_parameters(json!({
        "type": "object",
        "properties": {
            "a": {"type": "integer"},
            "b": {"type": "integer"}
        },
        "required": ["a", "b"]
    }))
}

/// Ends the conversation when declared as a quitting tool
pub fn finish_tool() -> FunctionTool {
    FunctionTool::new("finish", "End the conversation", |_| async {
        ToolExecutionResult::success("bye")
    })
}

pub fn assistant_definition() -> ReasoningDefinition {
    ReasoningDefinition::new("assistant", AGENT_MODEL)
        .with_prompt("You are a careful assistant.")
        .with_tool(ToolRef::named("calculator"))
        .with_tool(ToolRef::named("finish").quitting())
}

pub fn greeting_rule() -> Rule {
    Rule::new("greeting").with_pattern("hello").with_pattern("hi there")
}

pub fn play_music_rule() -> Rule {
    Rule::new("play_music")
        .with_var("title", "song title", VarType::String)
        .with_pattern("play [title]")
        .with_pattern("play some music")
}

pub fn router_definition() -> RoutingDefinition {
    RoutingDefinition::new("router", ROUTER_MODEL)
        .with_rule(RuleRef::named("greeting"))
        .with_rule(RuleRef::named("play_music"))
        .with_route(["greeting"], DelegateRef::named("greeter"))
        .with_route(["play_music"], DelegateRef::named("music_agent"))
}

/// Runtime with the assistant, the router and its two delegates registered
pub fn runtime_with(mock: Arc<MockGenerator>) -> Arc<InMemoryRuntime> {
    let runtime = InMemoryRuntime::builder(mock)
        .tool(calculator())
        .tool(finish_tool())
        .rule(greeting_rule())
        .rule(play_music_rule())
        .definition(assistant_definition())
        .definition(
            ReasoningDefinition::new("greeter", GREETER_MODEL)
                .with_prompt("Greet the user warmly.")
                .with_tool(ToolRef::named("finish").quitting()),
        )
        .definition(
            ReasoningDefinition::new("music_agent", MUSIC_MODEL).with_prompt("Play music."),
        )
        .definition(router_definition())
        .build()
        .expect("valid fixture runtime");
    Arc::new(runtime)
}

/// Wait until `check` holds, polling every few milliseconds
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
