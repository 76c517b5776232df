// Integration tests for actor creation, persistence and restoration

mod common;

use common::*;
use relay_core::{
    create_actor, ActorConfig, ActorError, ActorKind, CompositeStep, EventKind, InMemoryRuntime,
    MockGenerator, MockResponse, PersistedState, ReasoningDefinition, Runtime, StateHandle,
    ToolDefinition, ToolRef,
};
use serde_json::json;
use std::sync::Arc;

const SUMMARY_MODEL: &str = "summary-model";

#[tokio::test]
async fn test_create_actor_picks_kind_from_definition() {
    init_tracing();
    let runtime = runtime_with(Arc::new(MockGenerator::new()));

    let assistant = create_actor(runtime.clone(), "agent:assistant", None)
        .await
        .unwrap();
    assert_eq!(assistant.kind(), ActorKind::Reasoning);
    assert_eq!(assistant.definition().name(), "assistant");

    let router = create_actor(runtime.clone(), "router", None).await.unwrap();
    assert_eq!(router.kind(), ActorKind::Routing);
    assert!(matches!(router.state(), StateHandle::Routing(_)));

    let missing = create_actor(runtime.clone(), "nobody", None).await;
    assert!(matches!(missing, Err(ActorError::NotFound { name, .. }) if name == "nobody"));
    assert_eq!(runtime.state_ids().await.len(), 2);
}

#[tokio::test]
async fn test_restore_reasoning_actor_from_saved_json() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push_all(
        AGENT_MODEL,
        [
            MockResponse::text("Nice to meet you, Ada."),
            MockResponse::text("Your name is Ada."),
        ],
    )
    .await;

    let first = runtime_with(mock.clone());
    let actor = create_actor(first.clone(), "assistant", None).await.unwrap();
    actor.input("my name is Ada").await.unwrap();
    drain_round(actor.as_ref()).await;

    let json = first.save_state(actor.state_id()).await.unwrap();
    assert!(json.contains(r#""state_type":"reasoning""#));

    // A second runtime picks the conversation up from the snapshot
    let second = runtime_with(mock.clone());
    let handle = second.load_state(&json).await.unwrap();
    assert_eq!(handle.kind(), ActorKind::Reasoning);

    let restored = second.restore(actor.state_id()).await.unwrap();
    assert_eq!(restored.state_id(), actor.state_id());
    assert_eq!(restored.format_history().await, actor.format_history().await);

    restored.input("what is my name?").await.unwrap();
    let events = drain_round(restored.as_ref()).await;
    assert_eq!(chunk_text(&events), "Your name is Ada.");

    let calls = mock.calls_for(AGENT_MODEL).await;
    let contents: Vec<&str> = calls[1]
        .context
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(
        contents,
        vec!["my name is Ada", "Nice to meet you, Ada.", "what is my name?"]
    );
}

#[tokio::test]
async fn test_restore_rejects_kind_mismatch() {
    init_tracing();
    let runtime = runtime_with(Arc::new(MockGenerator::new()));
    let state = runtime
        .create_routing_state("assistant", None)
        .await
        .unwrap();

    let result = runtime.restore(state.id()).await;
    match result {
        Err(ActorError::StateKindMismatch {
            expected, found, ..
        }) => {
            assert_eq!(expected, "reasoning");
            assert_eq!(found, "routing");
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("expected a kind mismatch"),
    }
}

#[tokio::test]
async fn test_restore_missing_state_is_not_found() {
    init_tracing();
    let runtime = runtime_with(Arc::new(MockGenerator::new()));

    match runtime.restore("state:does-not-exist").await {
        Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
        Ok(_) => panic!("expected restore to fail"),
    }
    assert!(matches!(
        runtime.save_state("does-not-exist").await,
        Err(ActorError::NotFound { kind: "state", .. })
    ));
}

#[tokio::test]
async fn test_load_state_rejects_unknown_discriminator() {
    init_tracing();
    let runtime = runtime_with(Arc::new(MockGenerator::new()));
    let json = json!({"state_type": "planner", "id": "s1", "definition_name": "x"}).to_string();

    assert!(runtime.load_state(&json).await.is_err());
    assert!(PersistedState::from_json(&json).is_err());
}

#[tokio::test]
async fn test_generator_tool_runs_nested_generation() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push_all(
        AGENT_MODEL,
        [
            MockResponse::tool_call("call_1", "summarize", r#"{"text":"a very long report"}"#),
            MockResponse::text("Here is the gist."),
        ],
    )
    .await;
    mock.push(SUMMARY_MODEL, MockResponse::chunks(["short ", "report"]))
        .await;

    let summarize = ToolDefinition::Generator {
        name: "summarize".to_string(),
        description: "Summarize a text".to_string(),
        model: SUMMARY_MODEL.to_string(),
        prompt: "Summarize in two words.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }),
    };
    let runtime = Arc::new(
        InMemoryRuntime::builder(mock.clone())
            .definition(
                ReasoningDefinition::new("editor", AGENT_MODEL)
                    .with_tool(ToolRef::inline(summarize)),
            )
            .build()
            .unwrap(),
    );
    let actor = create_actor(runtime, "editor", None).await.unwrap();

    actor.input("summarize the report").await.unwrap();
    let events = drain_round(actor.as_ref()).await;

    assert_eq!(
        kinds(&events),
        vec![
            EventKind::ToolStart,
            EventKind::ToolDone,
            EventKind::Chunk,
            EventKind::Eof
        ]
    );
    assert_eq!(events[1].tool_result.as_ref().unwrap().content, "short report");

    let nested = &mock.calls_for(SUMMARY_MODEL).await[0];
    assert_eq!(nested.context.prompts[0].text, "Summarize in two words.");
    assert_eq!(
        nested.context.messages[0].content,
        r#"{"text":"a very long report"}"#
    );

    // The declaration was offered to the outer model
    let outer = &mock.calls_for(AGENT_MODEL).await[0];
    assert_eq!(outer.context.tools[0].name, "summarize");
}

#[tokio::test]
async fn test_registered_tool_definition_is_resolved_by_name() {
    init_tracing();
    let runtime = InMemoryRuntime::builder(Arc::new(MockGenerator::new()))
        .tool_definition(ToolDefinition::Generator {
            name: "translate".to_string(),
            description: String::new(),
            model: SUMMARY_MODEL.to_string(),
            prompt: String::new(),
            parameters: json!({"type": "object", "properties": {}}),
        })
        .build()
        .unwrap();

    let tool = runtime.get_tool("tool:translate").await.unwrap();
    assert_eq!(tool.name(), "translate");
    assert!(matches!(
        runtime.get_tool_definition("translate").await.unwrap(),
        ToolDefinition::Generator { .. }
    ));
}

#[tokio::test]
async fn test_composite_tool_feeds_steps_into_each_other() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push_all(
        AGENT_MODEL,
        [
            MockResponse::tool_call("call_1", "add_then_add_a", r#"{"a":2,"b":3}"#),
            MockResponse::text("That makes 7."),
        ],
    )
    .await;

    let composite = ToolDefinition::Composite {
        name: "add_then_add_a".to_string(),
        description: "Add a and b, then add a again".to_string(),
        steps: vec![
            CompositeStep::new("sum", ToolRef::named("calculator")),
            CompositeStep::new("again", ToolRef::named("calculator"))
                .with_input(json!({"a": "$/steps/sum", "b": "$/input/a"})),
        ],
    };
    let runtime = Arc::new(
        InMemoryRuntime::builder(mock.clone())
            .tool(calculator())
            .definition(
                ReasoningDefinition::new("adder", AGENT_MODEL)
                    .with_tool(ToolRef::inline(composite)),
            )
            .build()
            .unwrap(),
    );
    let actor = create_actor(runtime, "adder", None).await.unwrap();

    actor.input("add 2 and 3, then 2 more").await.unwrap();
    let events = drain_round(actor.as_ref()).await;

    assert_eq!(
        kinds(&events),
        vec![
            EventKind::ToolStart,
            EventKind::ToolDone,
            EventKind::Chunk,
            EventKind::Eof
        ]
    );
    assert_eq!(events[1].tool_result.as_ref().unwrap().content, "7");

    // The model sees the first step's parameters
    let offered = &mock.calls_for(AGENT_MODEL).await[0].context.tools[0];
    assert_eq!(offered.name, "add_then_add_a");
    assert_eq!(offered.parameters["required"], json!(["a", "b"]));
}

#[tokio::test]
async fn test_close_without_archive() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    let runtime = Arc::new(
        InMemoryRuntime::builder(mock)
            .config(ActorConfig::default().with_archive_on_close(false))
            .definition(assistant_definition())
            .tool(calculator())
            .tool(finish_tool())
            .build()
            .unwrap(),
    );
    let actor = create_actor(runtime.clone(), "assistant", None)
        .await
        .unwrap();

    actor.close().await.unwrap();
    assert!(runtime.state_ids().await.is_empty());
    assert!(runtime.archived_states().await.is_empty());
}

#[tokio::test]
async fn test_default_memory_window_comes_from_config() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push_all(
        AGENT_MODEL,
        [MockResponse::text("one"), MockResponse::text("two")],
    )
    .await;
    let runtime = Arc::new(
        InMemoryRuntime::builder(mock.clone())
            .config(ActorConfig::default().with_default_recent_messages(1))
            .definition(ReasoningDefinition::new("forgetful", AGENT_MODEL))
            .build()
            .unwrap(),
    );
    let actor = create_actor(runtime, "forgetful", None).await.unwrap();

    actor.input("first").await.unwrap();
    drain_round(actor.as_ref()).await;
    actor.input("second").await.unwrap();
    drain_round(actor.as_ref()).await;

    let calls = mock.calls_for(AGENT_MODEL).await;
    assert_eq!(calls[1].context.messages.len(), 1);
    assert_eq!(calls[1].context.messages[0].content, "second");
    // The full conversation is still stored
    assert_eq!(
        actor.format_history().await,
        "[user]: first\n[model]: one\n[user]: second\n[model]: two\n"
    );
}

#[tokio::test]
async fn test_restore_routing_actor_with_delegate() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(GREETER_MODEL, MockResponse::text("Hi!")).await;

    let first = runtime_with(mock.clone());
    let router = create_actor(first.clone(), "router", None).await.unwrap();
    router.input("hello").await.unwrap();
    drain_round(router.as_ref()).await;

    let json = first.save_state(router.state_id()).await.unwrap();
    assert!(json.contains(r#""state_type":"routing""#));
    assert!(json.contains(r#""delegate_state""#));

    let second = runtime_with(mock.clone());
    second.load_state(&json).await.unwrap();
    // The nested delegate state is live too
    assert_eq!(second.state_ids().await.len(), 2);

    let restored = second.restore(router.state_id()).await.unwrap();
    assert_eq!(restored.kind(), ActorKind::Routing);
    assert_eq!(restored.format_history().await, "[user]: hello\n[model]: Hi!\n");

    // Same intent again: the restored greeter keeps the conversation
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(GREETER_MODEL, MockResponse::text("Hi again!")).await;
    restored.input("hello again").await.unwrap();
    let events = drain_round(restored.as_ref()).await;

    assert_eq!(chunk_text(&events), "Hi again!");
    assert_eq!(events.last().unwrap().phase, "executing");
    assert_eq!(
        restored.format_history().await,
        "[user]: hello\n[model]: Hi!\n[user]: hello again\n[model]: Hi again!\n"
    );
}
