// Reasoning actor
//
// Runs the think/act/observe loop over one conversation thread:
// generate → maybe call a tool → feed the result back → generate again,
// until the model stops (Eof, waiting for input) or a terminating tool has
// fired (Closed).
//
// Locking:
// - `lifecycle` guards the closed/interrupted flags and is only held briefly
// - `turn` owns the round's activity (stream or tool task) and buffered text;
//   `next` holds it while waiting so a dropped `next` future never loses the stream
// - the ActorState is never behind either lock

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::actor::{format_history, Actor, StateHandle};
use crate::definition::{ActorDefinition, ActorKind, ContextLayer, MemoryOptions, ReasoningDefinition};
use crate::error::{ActorError, Result};
use crate::events::AgentEvent;
use crate::llm::{GenerationEvent, GenerationStream, ModelContext, Prompt};
use crate::message::{Message, ToolCall, ToolResult};
use crate::state::{ReasoningPhase, ReasoningState};
use crate::tools::{unresolved_tool_result, Tool, ToolExecutionResult};
use crate::traits::Runtime;

/// A reasoning-and-acting actor
pub struct ReasoningActor {
    core: Arc<ReasoningCore>,
}

struct ReasoningCore {
    definition: ReasoningDefinition,
    runtime: Arc<dyn Runtime>,
    state: Arc<dyn ReasoningState>,
    state_id: String,
    model: String,
    /// Prompts from context layers plus tool declarations
    base_context: ModelContext,
    tools: HashMap<String, Arc<dyn Tool>>,
    quit_tools: HashSet<String>,
    memory: MemoryOptions,
    archive_on_close: bool,
    cancel: CancellationToken,
    input_ready: Notify,
    lifecycle: Mutex<Lifecycle>,
    turn: Mutex<Turn>,
}

#[derive(Default)]
struct Lifecycle {
    closed: bool,
    interrupted: bool,
}

#[derive(Default)]
struct Turn {
    activity: Option<Activity>,
    /// Text streamed since the last flush to state
    pending_text: String,
}

enum Activity {
    Streaming(GenerationStream),
    Tool(PendingTool),
}

struct PendingTool {
    call: ToolCall,
    handle: JoinHandle<Result<ToolOutcome>>,
}

struct ToolOutcome {
    result: ToolResult,
    /// Set when the invocation failed; the failure is still in `result`
    error: Option<String>,
    /// Generation started with the result in history
    continuation: GenerationStream,
}

enum Polled<T> {
    Cancelled,
    Ready(T),
}

impl Turn {
    fn clear_activity(&mut self) {
        if let Some(Activity::Tool(pending)) = self.activity.take() {
            pending.handle.abort();
        }
    }
}

impl ReasoningActor {
    /// Create an actor with a freshly allocated state
    pub async fn new(
        runtime: Arc<dyn Runtime>,
        definition: ReasoningDefinition,
        parent_state_id: Option<&str>,
    ) -> Result<Self> {
        Self::create(runtime, definition, parent_state_id, CancellationToken::new()).await
    }

    /// Create a delegate whose work is cancelled together with its owner's
    pub(crate) async fn new_delegate(
        runtime: Arc<dyn Runtime>,
        definition: ReasoningDefinition,
        parent_state_id: &str,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        Self::create(
            runtime,
            definition,
            Some(parent_state_id),
            parent_cancel.child_token(),
        )
        .await
    }

    /// Rebuild an actor around an existing state
    pub async fn with_state(
        runtime: Arc<dyn Runtime>,
        definition: ReasoningDefinition,
        state: Arc<dyn ReasoningState>,
    ) -> Result<Self> {
        Self::build(runtime, definition, state, CancellationToken::new()).await
    }

    pub(crate) async fn with_state_in(
        runtime: Arc<dyn Runtime>,
        definition: ReasoningDefinition,
        state: Arc<dyn ReasoningState>,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        Self::build(runtime, definition, state, parent_cancel.child_token()).await
    }

    async fn create(
        runtime: Arc<dyn Runtime>,
        definition: ReasoningDefinition,
        parent_state_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        definition.validate()?;
        let state = runtime
            .create_reasoning_state(&definition.name, parent_state_id)
            .await?;
        let state_id = state.id().to_string();

        match Self::build(Arc::clone(&runtime), definition, state, cancel).await {
            Ok(actor) => Ok(actor),
            Err(e) => {
                if let Err(destroy_err) = runtime.destroy_state(&state_id, false).await {
                    warn!(state_id = %state_id, error = %destroy_err, "failed to release state of unbuilt actor");
                }
                Err(e)
            }
        }
    }

    async fn build(
        runtime: Arc<dyn Runtime>,
        definition: ReasoningDefinition,
        state: Arc<dyn ReasoningState>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let config = runtime.actor_config();
        let mut memory = MemoryOptions::recent(config.default_recent_messages);
        let mut base_context = ModelContext::new();

        if definition.context_layers.is_empty() && !definition.prompt.is_empty() {
            base_context
                .prompts
                .push(Prompt::new("system", definition.prompt.clone()));
        }
        for layer in &definition.context_layers {
            match layer {
                ContextLayer::Prompt(text) => {
                    base_context.prompts.push(Prompt::new("prompt", text.clone()));
                }
                ContextLayer::This(field) => match field.trim_start_matches('.') {
                    "prompt" => {
                        if !definition.prompt.is_empty() {
                            base_context
                                .prompts
                                .push(Prompt::new("this", definition.prompt.clone()));
                        }
                    }
                    "name" => {
                        base_context
                            .prompts
                            .push(Prompt::new("this", definition.name.clone()));
                    }
                    other => {
                        return Err(ActorError::config(format!(
                            "reasoning actor {}: unknown $this field {:?}",
                            definition.name, other
                        )));
                    }
                },
                ContextLayer::Ref(name) => {
                    let builder = runtime.get_context_builder(name).await?;
                    base_context.extend(builder.build_context().await?);
                }
                ContextLayer::Env(var) => match std::env::var(var) {
                    Ok(value) if !value.is_empty() => {
                        base_context.prompts.push(Prompt::new(var.clone(), value));
                    }
                    _ => debug!(actor = %definition.name, var = %var, "env context layer is unset"),
                },
                ContextLayer::Memory(options) => memory = *options,
            }
        }

        let mut tools = HashMap::new();
        let mut quit_tools = HashSet::new();
        for tool_ref in &definition.tools {
            let tool = match (&tool_ref.reference, &tool_ref.tool) {
                (Some(name), _) => runtime.get_tool(name).await?,
                (None, Some(def)) => runtime.create_tool_from_definition(def).await?,
                (None, None) => {
                    return Err(ActorError::config(
                        "tool ref: neither $ref nor inline definition",
                    ))
                }
            };
            let name = tool.name().to_string();
            if tool_ref.quit {
                quit_tools.insert(name.clone());
            }
            base_context.tools.push(tool.to_schema());
            tools.insert(name, tool);
        }

        let state_id = state.id().to_string();
        info!(
            actor = %definition.name,
            state_id = %state_id,
            parent_id = state.parent_id().unwrap_or(""),
            tools = tools.len(),
            "reasoning actor ready"
        );

        Ok(Self {
            core: Arc::new(ReasoningCore {
                model: definition.generator.model.clone(),
                definition,
                runtime,
                state,
                state_id,
                base_context,
                tools,
                quit_tools,
                memory,
                archive_on_close: config.archive_on_close,
                cancel,
                input_ready: Notify::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
                turn: Mutex::new(Turn::default()),
            }),
        })
    }

    pub fn reasoning_definition(&self) -> &ReasoningDefinition {
        &self.core.definition
    }

    pub fn reasoning_state(&self) -> Arc<dyn ReasoningState> {
        Arc::clone(&self.core.state)
    }

    /// True once a terminating tool has fired
    pub async fn is_finished(&self) -> bool {
        self.core.state.is_finished().await
    }

    pub async fn is_closed(&self) -> bool {
        self.core.lifecycle.lock().await.closed
    }
}

impl ReasoningCore {
    fn tag(&self, event: AgentEvent, phase: ReasoningPhase) -> AgentEvent {
        event
            .from_actor(&self.definition.name, &self.state_id)
            .with_phase(phase.as_str())
    }

    async fn terminal_event(&self) -> Result<Option<AgentEvent>> {
        let finished = self.state.is_finished().await;
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.closed {
            let phase = if finished {
                ReasoningPhase::Finished
            } else {
                ReasoningPhase::Idle
            };
            return Ok(Some(self.tag(AgentEvent::closed(), phase)));
        }
        if lifecycle.interrupted {
            return Ok(Some(self.tag(AgentEvent::interrupted(), ReasoningPhase::Idle)));
        }
        drop(lifecycle);
        if self.cancel.is_cancelled() {
            return Err(ActorError::Cancelled);
        }
        Ok(None)
    }

    async fn ensure_open(&self) -> Result<()> {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.closed || lifecycle.interrupted {
            return Err(ActorError::Closed);
        }
        Ok(())
    }

    /// Build the request context from the base prompts and tools plus memory
    /// and open a generation stream
    async fn start_generation(&self) -> Result<GenerationStream> {
        let mut context = self.base_context.clone();
        context.extend(self.state.build_memory_context(&self.memory).await?);
        self.state.clear_tool_results().await;
        self.state.set_phase(ReasoningPhase::Thinking).await;
        debug!(
            actor = %self.definition.name,
            state_id = %self.state_id,
            messages = context.messages.len(),
            "starting generation"
        );
        self.runtime.generate_stream(&self.model, &context).await
    }

    async fn flush_text(&self, turn: &mut Turn) -> Result<()> {
        if turn.pending_text.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut turn.pending_text);
        self.state.store_message(Message::model(text)).await
    }

    async fn input(&self, content: &str) -> Result<()> {
        // a finished actor still takes input; its rounds end in `Closed`
        self.ensure_open().await?;

        let mut turn = self.turn.lock().await;
        turn.clear_activity();
        turn.pending_text.clear();
        self.state.store_message(Message::user(content)).await?;
        let stream = self.start_generation().await?;
        turn.activity = Some(Activity::Streaming(stream));
        drop(turn);

        self.input_ready.notify_one();
        Ok(())
    }

    async fn next(self: &Arc<Self>) -> Result<AgentEvent> {
        loop {
            if let Some(event) = self.terminal_event().await? {
                return Ok(event);
            }

            let mut turn = self.turn.lock().await;
            match turn.activity.as_mut() {
                None => {
                    if self.state.is_finished().await {
                        return Ok(self.tag(AgentEvent::closed(), ReasoningPhase::Finished));
                    }
                    drop(turn);
                    let notified = self.input_ready.notified();
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = notified => {}
                    }
                }
                Some(Activity::Streaming(stream)) => {
                    let polled = tokio::select! {
                        _ = self.cancel.cancelled() => Polled::Cancelled,
                        item = stream.next() => Polled::Ready(item),
                    };
                    match polled {
                        Polled::Cancelled => turn.clear_activity(),
                        Polled::Ready(item) => return self.on_stream_item(&mut turn, item).await,
                    }
                }
                Some(Activity::Tool(pending)) => {
                    let polled = tokio::select! {
                        _ = self.cancel.cancelled() => Polled::Cancelled,
                        joined = &mut pending.handle => Polled::Ready(joined),
                    };
                    match polled {
                        Polled::Cancelled => turn.clear_activity(),
                        Polled::Ready(joined) => {
                            let call = pending.call.clone();
                            turn.activity = None;
                            return self.on_tool_finished(&mut turn, call, joined).await;
                        }
                    }
                }
            }
        }
    }

    async fn on_stream_item(
        self: &Arc<Self>,
        turn: &mut Turn,
        item: Option<Result<GenerationEvent>>,
    ) -> Result<AgentEvent> {
        match item {
            Some(Ok(GenerationEvent::TextDelta(text))) => {
                turn.pending_text.push_str(&text);
                Ok(self.tag(AgentEvent::chunk(text), ReasoningPhase::Thinking))
            }
            Some(Ok(GenerationEvent::ToolCall(call))) => self.on_tool_call(turn, call).await,
            Some(Ok(GenerationEvent::Done(_))) | None => self.on_stream_end(turn).await,
            Some(Err(e)) => {
                warn!(actor = %self.definition.name, state_id = %self.state_id, error = %e, "generation stream failed");
                turn.activity = None;
                self.flush_text(turn).await?;
                self.state.set_phase(ReasoningPhase::Idle).await;
                Err(e)
            }
        }
    }

    async fn on_stream_end(&self, turn: &mut Turn) -> Result<AgentEvent> {
        turn.activity = None;
        self.flush_text(turn).await?;

        if self.state.is_finished().await {
            self.state.set_phase(ReasoningPhase::Finished).await;
            debug!(actor = %self.definition.name, state_id = %self.state_id, "generation ended after terminating tool");
            Ok(self.tag(AgentEvent::closed(), ReasoningPhase::Finished))
        } else {
            self.state.set_phase(ReasoningPhase::Idle).await;
            Ok(self.tag(AgentEvent::eof(), ReasoningPhase::Idle))
        }
    }

    /// Record the call, start the tool task and report `ToolStart`; the
    /// task's outcome is reported by the following `next`
    async fn on_tool_call(self: &Arc<Self>, turn: &mut Turn, call: ToolCall) -> Result<AgentEvent> {
        // the continuation stream replaces the current one
        turn.activity = None;
        if let Err(e) = call.validate() {
            self.flush_text(turn).await?;
            self.state.set_phase(ReasoningPhase::Idle).await;
            return Err(e);
        }

        self.flush_text(turn).await?;
        self.state.store_message(Message::tool_call(call.clone())).await?;
        self.state.set_phase(ReasoningPhase::Tool).await;

        let span = info_span!(
            "tool",
            actor = %self.definition.name,
            state_id = %self.state_id,
            tool = %call.name
        );
        let core = Arc::clone(self);
        let task_call = call.clone();
        let handle = tokio::spawn(async move { core.run_tool(task_call).await }.instrument(span));

        turn.activity = Some(Activity::Tool(PendingTool {
            call: call.clone(),
            handle,
        }));
        Ok(self.tag(AgentEvent::tool_start(call), ReasoningPhase::Tool))
    }

    /// Invoke the tool with no actor lock held, record the outcome and start
    /// the continuation generation
    async fn run_tool(&self, call: ToolCall) -> Result<ToolOutcome> {
        let tool = match self.tools.get(&call.name) {
            Some(tool) => Ok(Arc::clone(tool)),
            None => self.runtime.get_tool(&call.name).await,
        };

        let result = match tool {
            Ok(tool) => match call.arguments_json() {
                Ok(arguments) => tool.execute(arguments).await.into_tool_result(&call),
                Err(e) => ToolExecutionResult::tool_error(e.to_string()).into_tool_result(&call),
            },
            Err(e) => unresolved_tool_result(&call, e),
        };
        let error = result.is_error.then(|| result.content.clone());
        match &error {
            Some(err) => warn!(tool = %call.name, error = %err, "tool failed; result fed back to the model"),
            None => debug!(tool = %call.name, "tool completed"),
        }

        self.state.store_message(Message::tool_result(&result)).await?;
        self.state.push_tool_result(result.clone()).await;

        if self.quit_tools.contains(&call.name) {
            info!(actor = %self.definition.name, state_id = %self.state_id, tool = %call.name, "terminating tool invoked");
            self.state.set_finished(true).await;
        }

        let continuation = self.start_generation().await?;
        Ok(ToolOutcome {
            result,
            error,
            continuation,
        })
    }

    async fn on_tool_finished(
        &self,
        turn: &mut Turn,
        call: ToolCall,
        joined: std::result::Result<Result<ToolOutcome>, JoinError>,
    ) -> Result<AgentEvent> {
        let outcome = match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.state.set_phase(ReasoningPhase::Idle).await;
                return Err(e);
            }
            Err(join_err) => {
                self.state.set_phase(ReasoningPhase::Idle).await;
                return Err(anyhow::anyhow!("tool task for {} failed: {}", call.name, join_err).into());
            }
        };

        turn.activity = Some(Activity::Streaming(outcome.continuation));
        let event = match outcome.error {
            Some(error) => AgentEvent::tool_error(call, outcome.result, error),
            None => AgentEvent::tool_done(call, outcome.result),
        };
        Ok(self.tag(event, ReasoningPhase::Thinking))
    }

    async fn interrupt(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.closed || lifecycle.interrupted {
                return Ok(());
            }
            lifecycle.interrupted = true;
        }
        self.cancel.cancel();
        // A `next` parked on the stream releases the turn as soon as it sees the cancellation
        if let Ok(mut turn) = self.turn.try_lock() {
            turn.clear_activity();
        }
        self.input_ready.notify_one();
        info!(actor = %self.definition.name, state_id = %self.state_id, "reasoning actor interrupted");
        Ok(())
    }

    async fn revert(&self) -> Result<()> {
        if self.lifecycle.lock().await.closed {
            return Err(ActorError::Closed);
        }
        let mut turn = self.turn.lock().await;
        turn.clear_activity();
        turn.pending_text.clear();
        self.state.revert().await?;
        self.state.set_phase(ReasoningPhase::Idle).await;
        debug!(actor = %self.definition.name, state_id = %self.state_id, "reverted last user turn");
        Ok(())
    }

    async fn close_with_error(&self, reason: Option<String>) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.closed {
                return Ok(());
            }
            lifecycle.closed = true;
        }
        self.cancel.cancel();
        if let Ok(mut turn) = self.turn.try_lock() {
            turn.clear_activity();
        }
        self.input_ready.notify_one();

        match &reason {
            Some(reason) => info!(actor = %self.definition.name, state_id = %self.state_id, reason = %reason, "closing reasoning actor"),
            None => info!(actor = %self.definition.name, state_id = %self.state_id, "closing reasoning actor"),
        }

        if let Err(e) = self
            .runtime
            .destroy_state(&self.state_id, self.archive_on_close)
            .await
        {
            warn!(state_id = %self.state_id, error = %e, "failed to destroy state on close");
        }
        Ok(())
    }
}

#[async_trait]
impl Actor for ReasoningActor {
    fn kind(&self) -> ActorKind {
        ActorKind::Reasoning
    }

    fn definition(&self) -> ActorDefinition {
        ActorDefinition::Reasoning(self.core.definition.clone())
    }

    fn state(&self) -> StateHandle {
        StateHandle::Reasoning(Arc::clone(&self.core.state))
    }

    fn state_id(&self) -> &str {
        &self.core.state_id
    }

    async fn input(&self, content: &str) -> Result<()> {
        self.core.input(content).await
    }

    async fn interrupt(&self) -> Result<()> {
        self.core.interrupt().await
    }

    async fn next(&self) -> Result<AgentEvent> {
        self.core.next().await
    }

    async fn revert(&self) -> Result<()> {
        self.core.revert().await
    }

    async fn format_history(&self) -> String {
        format_history(self.core.state.as_actor_state()).await
    }

    async fn close_with_error(&self, reason: Option<String>) -> Result<()> {
        self.core.close_with_error(reason).await
    }
}
