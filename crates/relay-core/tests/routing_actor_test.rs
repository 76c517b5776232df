// Integration tests for intent routing and delegation

mod common;

use common::*;
use relay_core::{
    Actor, ActorError, DelegateRef, EventKind, InMemoryRuntime, MockGenerator, MockResponse,
    RoutingActor, RoutingDefinition, RoutingPhase, Runtime, RuleRef,
};
use std::sync::Arc;
use std::time::Duration;

async fn router(runtime: &Arc<InMemoryRuntime>) -> Arc<RoutingActor> {
    let actor = RoutingActor::new(runtime.clone(), router_definition(), None)
        .await
        .expect("router actor");
    Arc::new(actor)
}

/// Router with an active greeter after one "hello" round
async fn greeted(mock: &Arc<MockGenerator>) -> (Arc<InMemoryRuntime>, Arc<RoutingActor>) {
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(GREETER_MODEL, MockResponse::text("Hi! What can I do for you?"))
        .await;
    let runtime = runtime_with(mock.clone());
    let actor = router(&runtime).await;

    actor.input("hello").await.unwrap();
    let events = drain_round(actor.as_ref()).await;
    assert_eq!(kinds(&events), vec![EventKind::Chunk, EventKind::Eof]);
    assert_eq!(events[1].phase, "executing");
    (runtime, actor)
}

#[tokio::test]
async fn test_no_match_keeps_accumulating_input() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.set_default(ROUTER_MODEL, MockResponse::text("NONE")).await;
    let runtime = runtime_with(mock.clone());
    let actor = router(&runtime).await;

    actor.input("so").await.unwrap();
    let events = drain_round(actor.as_ref()).await;
    assert_eq!(kinds(&events), vec![EventKind::Eof]);
    assert_eq!(events[0].phase, "idle");
    assert_eq!(events[0].actor_state_id, actor.state_id());
    assert!(actor.delegate().await.is_none());

    actor.input("anyway").await.unwrap();
    drain_round(actor.as_ref()).await;

    let state = actor.routing_state();
    assert_eq!(state.input().await, "so anyway");
    assert_eq!(state.phase().await, RoutingPhase::Idle);
    assert!(!state.has_matched().await);

    // The second classification saw the accumulated input
    let calls = mock.calls_for(ROUTER_MODEL).await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].context.messages[0].content, "so anyway");
    assert_eq!(mock.call_count(GREETER_MODEL).await, 0);
}

#[tokio::test]
async fn test_match_starts_delegate_and_forwards_its_events() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    let (_runtime, actor) = greeted(&mock).await;

    let delegate = actor.delegate().await.expect("greeter delegate");
    assert_eq!(delegate.reasoning_definition().name, "greeter");
    assert_eq!(
        delegate.reasoning_state().parent_id(),
        Some(actor.state_id())
    );

    let state = actor.routing_state();
    assert_eq!(state.phase().await, RoutingPhase::Executing);
    assert!(state.has_matched().await);
    assert_eq!(state.current_intent().await.unwrap().rule, "greeting");
    assert_eq!(
        state.delegate_state().await.unwrap().id(),
        delegate.state_id()
    );

    // Without extracted args the delegate receives the input unchanged
    let greeter_call = &mock.calls_for(GREETER_MODEL).await[0];
    assert_eq!(greeter_call.context.messages[0].content, "hello");
    assert_eq!(
        actor.format_history().await,
        "[user]: hello\n[model]: Hi! What can I do for you?\n"
    );
}

#[tokio::test]
async fn test_intent_switch_replaces_delegate() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    let (_runtime, actor) = greeted(&mock).await;
    let greeter = actor.delegate().await.unwrap();

    mock.push(ROUTER_MODEL, MockResponse::text("play_music: title=Yesterday"))
        .await;
    mock.push(MUSIC_MODEL, MockResponse::text("Now playing Yesterday."))
        .await;

    let started = tokio::time::Instant::now();
    actor.input("play Yesterday").await.unwrap();
    let events = drain_round(actor.as_ref()).await;
    assert!(started.elapsed() < STEP_TIMEOUT);

    assert_eq!(kinds(&events), vec![EventKind::Chunk, EventKind::Eof]);
    assert_eq!(events[0].actor_definition, "music_agent");
    assert_eq!(chunk_text(&events), "Now playing Yesterday.");

    let music = actor.delegate().await.unwrap();
    assert!(!Arc::ptr_eq(&music, &greeter));
    assert_eq!(music.reasoning_definition().name, "music_agent");

    // The first input carries the extracted arguments
    let music_call = &mock.calls_for(MUSIC_MODEL).await[0];
    let first_input = &music_call.context.messages[0].content;
    assert!(first_input.starts_with("play Yesterday\n(Extracted args: "));
    assert!(first_input.contains(r#""title":"Yesterday""#));

    // The replaced delegate is closed in the background
    let closed = eventually(|| {
        let greeter = greeter.clone();
        async move { greeter.is_closed().await }
    })
    .await;
    assert!(closed);

    let intent = actor.routing_state().current_intent().await.unwrap();
    assert_eq!(intent.rule, "play_music");
    assert_eq!(intent.args["title"], "Yesterday");
}

#[tokio::test]
async fn test_same_rule_forwards_to_active_delegate() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    let (_runtime, actor) = greeted(&mock).await;
    let greeter = actor.delegate().await.unwrap();

    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(GREETER_MODEL, MockResponse::text("Hello again!"))
        .await;

    actor.input("hello again").await.unwrap();
    let events = drain_round(actor.as_ref()).await;
    assert_eq!(kinds(&events), vec![EventKind::Chunk, EventKind::Eof]);
    assert_eq!(chunk_text(&events), "Hello again!");
    assert_eq!(events.last().unwrap().phase, "executing");

    let current = actor.delegate().await.unwrap();
    assert!(Arc::ptr_eq(&current, &greeter));
    assert_eq!(mock.call_count(GREETER_MODEL).await, 2);
    assert!(actor
        .format_history()
        .await
        .contains("[user]: hello again\n[model]: Hello again!"));
}

#[tokio::test]
async fn test_unmatched_input_during_delegation_is_forwarded() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.set_default(ROUTER_MODEL, MockResponse::text("NONE")).await;
    let (_runtime, actor) = greeted(&mock).await;
    let greeter = actor.delegate().await.unwrap();

    mock.push(GREETER_MODEL, MockResponse::text("Tell me more."))
        .await;
    actor.input("I had a long day").await.unwrap();
    let events = drain_round(actor.as_ref()).await;

    assert_eq!(chunk_text(&events), "Tell me more.");
    assert!(Arc::ptr_eq(&actor.delegate().await.unwrap(), &greeter));
    let greeter_call = &mock.calls_for(GREETER_MODEL).await[1];
    assert_eq!(
        greeter_call.context.messages.last().unwrap().content,
        "I had a long day"
    );
}

#[tokio::test]
async fn test_finished_delegate_returns_router_to_idle() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(GREETER_MODEL, MockResponse::tool_call("call_1", "finish", "{}"))
        .await;
    let runtime = runtime_with(mock.clone());
    let actor = router(&runtime).await;

    actor.input("hello").await.unwrap();
    let events = drain_round(actor.as_ref()).await;

    // The delegate's Closed is absorbed; the router reports a boundary instead
    assert_eq!(
        kinds(&events),
        vec![EventKind::ToolStart, EventKind::ToolDone, EventKind::Eof]
    );
    assert_eq!(events[0].actor_definition, "greeter");
    let eof = events.last().unwrap();
    assert_eq!(eof.actor_state_id, actor.state_id());
    assert_eq!(eof.phase, "idle");

    assert!(actor.delegate().await.is_none());
    let state = actor.routing_state();
    assert_eq!(state.phase().await, RoutingPhase::Idle);
    assert!(state.matches().await.is_empty());
    assert!(state.delegate_state().await.is_none());

    // The finished delegate's state was released
    let archived = runtime.archived_states().await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].core().definition_name, "greeter");
}

#[tokio::test]
async fn test_multiple_intents_run_in_order() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(
        ROUTER_MODEL,
        MockResponse::text("greeting\nplay_music: title=Hey Jude"),
    )
    .await;
    mock.push(GREETER_MODEL, MockResponse::tool_call("call_1", "finish", "{}"))
        .await;
    mock.push(MUSIC_MODEL, MockResponse::text("Playing Hey Jude."))
        .await;
    let runtime = runtime_with(mock.clone());
    let actor = router(&runtime).await;

    actor.input("hi there, play Hey Jude").await.unwrap();
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
    assert_eq!(events[0].actor_definition, "greeter");
    assert_eq!(events[2].actor_definition, "music_agent");
    assert_eq!(events[3].phase, "executing");

    let state = actor.routing_state();
    assert_eq!(state.matches().await.len(), 2);
    assert_eq!(state.current_index().await, 1);

    let music_call = &mock.calls_for(MUSIC_MODEL).await[0];
    assert!(music_call.context.messages[0]
        .content
        .starts_with("hi there, play Hey Jude\n(Extracted args: "));
}

#[tokio::test]
async fn test_switch_waits_for_streaming_delegate() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(
        GREETER_MODEL,
        MockResponse::text("Hello, friend.").with_delay(Duration::from_millis(200)),
    )
    .await;
    mock.push(ROUTER_MODEL, MockResponse::text("play_music: title=Help")).await;
    mock.push(MUSIC_MODEL, MockResponse::text("Playing Help.")).await;
    let runtime = runtime_with(mock.clone());
    let actor = router(&runtime).await;

    actor.input("hello").await.unwrap();
    let has_delegate = eventually(|| {
        let actor = actor.clone();
        async move { actor.delegate().await.is_some() }
    })
    .await;
    assert!(has_delegate);

    // New input before the greeter finished its round
    actor.input("play Help").await.unwrap();
    let events = drain_round(actor.as_ref()).await;

    assert_eq!(
        kinds(&events),
        vec![EventKind::Chunk, EventKind::Chunk, EventKind::Eof]
    );
    assert_eq!(events[0].actor_definition, "greeter");
    assert_eq!(events[0].chunk.as_deref(), Some("Hello, friend."));
    assert_eq!(events[1].actor_definition, "music_agent");
    assert_eq!(
        actor.delegate().await.unwrap().reasoning_definition().name,
        "music_agent"
    );
}

#[tokio::test]
async fn test_input_mid_stream_keeps_forwarded_events() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(GREETER_MODEL, MockResponse::chunks(["a", "b", "c", "d"]))
        .await;
    let runtime = runtime_with(mock.clone());
    let actor = router(&runtime).await;

    actor.input("hello").await.unwrap();
    let first = tokio::time::timeout(STEP_TIMEOUT, actor.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.chunk.as_deref(), Some("a"));

    // The rest of the greeter's round is queued while nobody reads
    tokio::time::sleep(Duration::from_millis(50)).await;
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(GREETER_MODEL, MockResponse::text("X")).await;
    actor.input("hello again").await.unwrap();
    let events = drain_round(actor.as_ref()).await;

    let chunks: Vec<&str> = events.iter().filter_map(|e| e.chunk.as_deref()).collect();
    assert_eq!(chunks, vec!["b", "c", "d", "X"]);
    // Only the boundary of the new round is reported
    assert_eq!(
        events.iter().filter(|e| e.kind == EventKind::Eof).count(),
        1
    );
    assert!(events
        .iter()
        .filter(|e| e.kind == EventKind::Chunk)
        .all(|e| e.actor_definition == "greeter"));
    assert_eq!(
        actor.format_history().await,
        "[user]: hello\n[model]: abcd\n[user]: hello again\n[model]: X\n"
    );
}

#[tokio::test]
async fn test_input_during_delegate_startup_does_not_leak_state() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(
        GREETER_MODEL,
        MockResponse::text("Hi!").with_open_delay(Duration::from_millis(200)),
    )
    .await;
    mock.push(ROUTER_MODEL, MockResponse::text("NONE")).await;
    mock.push(GREETER_MODEL, MockResponse::text("Still here.")).await;
    let runtime = runtime_with(mock.clone());
    let actor = router(&runtime).await;

    actor.input("hello").await.unwrap();
    // The greeter is still waiting for its stream to open
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(actor.delegate().await.is_none());

    actor.input("there").await.unwrap();
    let greeter = actor.delegate().await.expect("greeter registered");
    let events = drain_round(actor.as_ref()).await;

    assert_eq!(chunk_text(&events), "Hi!Still here.");
    assert_eq!(
        greeter.format_history().await,
        "[user]: hello\n[model]: Hi!\n[user]: there\n[model]: Still here.\n"
    );
    assert_eq!(runtime.state_ids().await.len(), 2);

    actor.close().await.unwrap();
    assert!(greeter.is_closed().await);
    assert!(runtime.state_ids().await.is_empty());
}

#[tokio::test]
async fn test_close_during_delegate_startup_closes_the_delegate() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(
        GREETER_MODEL,
        MockResponse::text("Hi!").with_open_delay(Duration::from_millis(200)),
    )
    .await;
    let runtime = runtime_with(mock.clone());
    let actor = router(&runtime).await;

    actor.input("hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    actor.close().await.unwrap();

    assert!(actor.delegate().await.is_none());
    assert!(runtime.state_ids().await.is_empty());
    assert_eq!(runtime.archived_states().await.len(), 2);
}

#[tokio::test]
async fn test_close_closes_delegate_and_archives_states() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    let (runtime, actor) = greeted(&mock).await;
    let greeter = actor.delegate().await.unwrap();
    let router_id = actor.state_id().to_string();
    let greeter_id = greeter.state_id().to_string();

    actor.close().await.unwrap();
    actor.close().await.unwrap();

    assert!(greeter.is_closed().await);
    assert!(actor.delegate().await.is_none());
    assert!(runtime.state_ids().await.is_empty());

    let archived: Vec<String> = runtime
        .archived_states()
        .await
        .iter()
        .map(|s| s.core().id.clone())
        .collect();
    assert!(archived.contains(&router_id));
    assert!(archived.contains(&greeter_id));

    let event = actor.next().await.unwrap();
    assert_eq!(event.kind, EventKind::Closed);
    assert!(matches!(actor.input("hello").await, Err(ActorError::Closed)));
}

#[tokio::test]
async fn test_interrupt_is_terminal() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    mock.push(GREETER_MODEL, MockResponse::hanging()).await;
    let runtime = runtime_with(mock);
    let actor = router(&runtime).await;

    actor.input("hello").await.unwrap();
    let waiter = {
        let actor = actor.clone();
        tokio::spawn(async move { actor.next().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    actor.interrupt().await.unwrap();
    let event = tokio::time::timeout(STEP_TIMEOUT, waiter)
        .await
        .expect("next did not wake up")
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::Interrupted);
    assert_eq!(event.actor_state_id, actor.state_id());

    assert!(matches!(actor.input("hello?").await, Err(ActorError::Closed)));
    assert_eq!(actor.next().await.unwrap().kind, EventKind::Interrupted);
}

#[tokio::test]
async fn test_revert_applies_to_delegate() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    let runtime = runtime_with(mock.clone());
    let idle_router = router(&runtime).await;
    idle_router.revert().await.unwrap();
    assert_eq!(idle_router.format_history().await, "");

    let (_runtime, actor) = greeted(&mock).await;
    actor.revert().await.unwrap();
    assert_eq!(actor.format_history().await, "");
}

#[tokio::test]
async fn test_route_to_routing_definition_is_rejected() {
    init_tracing();
    let mock = Arc::new(MockGenerator::new());
    mock.push(ROUTER_MODEL, MockResponse::text("greeting")).await;
    let runtime = runtime_with(mock);
    runtime
        .register_definition(
            RoutingDefinition::new("front_desk", ROUTER_MODEL)
                .with_rule(RuleRef::named("greeting"))
                .with_route(["greeting"], DelegateRef::named("router")),
        )
        .await
        .unwrap();

    let actor = relay_core::create_actor(runtime.clone(), "front_desk", None)
        .await
        .unwrap();
    actor.input("hello").await.unwrap();

    let result = tokio::time::timeout(STEP_TIMEOUT, actor.next())
        .await
        .unwrap();
    assert!(matches!(result, Err(ActorError::NestedRouting(name)) if name == "router"));

    let state = runtime.get_state(actor.state_id()).await.unwrap().unwrap();
    assert_eq!(state.id(), actor.state_id());
}
