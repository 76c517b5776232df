// In-memory implementations for examples and testing
//
// These implementations keep all data in memory, making them perfect for:
// - Unit and integration tests
// - Embedding the actors without a persistence layer
// - Save/restore round trips through the JSON state format

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::actor::{restore_actor, Actor, StateHandle};
use crate::config::ActorConfig;
use crate::definition::{ActorDefinition, ActorKind, MemoryOptions, ToolDefinition};
use crate::error::{ActorError, Result};
use crate::llm::{FuncCall, GenerationStream, Generator, ModelContext, Prompt, ToolSchema, Usage};
use crate::message::{Message, ToolResult};
use crate::rules::Rule;
use crate::state::{
    ActorState, MatchedIntent, PersistedState, ReasoningPhase, ReasoningState, ReasoningStateData,
    RoutingPhase, RoutingState, RoutingStateData, StateCoreData,
};
use crate::tools::{CompositeTool, CompositeToolStep, GeneratorTool, Tool};
use crate::traits::{ContextBuilder, Runtime};

/// Name prefixes accepted by the lookups
pub const TOOL_PREFIX: &str = "tool:";
pub const AGENT_PREFIX: &str = "agent:";
pub const CONTEXT_PREFIX: &str = "context:";
pub const RULE_PREFIX: &str = "rule:";
pub const STATE_PREFIX: &str = "state:";

fn parse_ref<'a>(name: &'a str, prefix: &str) -> &'a str {
    name.strip_prefix(prefix).unwrap_or(name)
}

// ============================================================================
// MemoryReasoningState
// ============================================================================

/// Reasoning state kept behind a `RwLock`
#[derive(Debug)]
pub struct MemoryReasoningState {
    id: String,
    definition_name: String,
    parent_id: Option<String>,
    data: RwLock<ReasoningStateData>,
}

impl MemoryReasoningState {
    pub fn new(id: impl Into<String>, definition_name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self::from_data(ReasoningStateData {
            core: StateCoreData::new(id, definition_name, parent_id),
            ..Default::default()
        })
    }

    /// Hydrate from persisted data
    pub fn from_data(data: ReasoningStateData) -> Self {
        Self {
            id: data.core.id.clone(),
            definition_name: data.core.definition_name.clone(),
            parent_id: data.core.parent_id.clone(),
            data: RwLock::new(data),
        }
    }
}

#[async_trait]
impl ActorState for MemoryReasoningState {
    fn id(&self) -> &str {
        &self.id
    }

    fn definition_name(&self) -> &str {
        &self.definition_name
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Reasoning
    }

    async fn load_recent(&self) -> Result<Vec<Message>> {
        Ok(self.data.read().await.core.messages.clone())
    }

    async fn store_message(&self, message: Message) -> Result<()> {
        self.data.write().await.core.push_message(message);
        Ok(())
    }

    async fn revert(&self) -> Result<()> {
        self.data.write().await.core.revert();
        Ok(())
    }

    async fn summary(&self) -> Result<String> {
        Ok(self.data.read().await.core.summary.clone())
    }

    async fn set_summary(&self, summary: String) -> Result<()> {
        self.data.write().await.core.summary = summary;
        Ok(())
    }

    async fn build_memory_context(&self, options: &MemoryOptions) -> Result<ModelContext> {
        Ok(self.data.read().await.core.memory_context(options))
    }

    async fn get_property(&self, key: &str) -> Option<Value> {
        self.data.read().await.core.properties.get(key).cloned()
    }

    async fn set_property(&self, key: &str, value: Value) {
        self.data
            .write()
            .await
            .core
            .properties
            .insert(key.to_string(), value);
    }

    async fn delete_property(&self, key: &str) {
        self.data.write().await.core.properties.remove(key);
    }

    async fn snapshot(&self) -> Result<PersistedState> {
        Ok(PersistedState::Reasoning(self.reasoning_snapshot().await))
    }
}

#[async_trait]
impl ReasoningState for MemoryReasoningState {
    fn as_actor_state(&self) -> &dyn ActorState {
        self
    }

    async fn phase(&self) -> ReasoningPhase {
        self.data.read().await.phase
    }

    async fn set_phase(&self, phase: ReasoningPhase) {
        self.data.write().await.phase = phase;
    }

    async fn pending_tool_results(&self) -> Vec<ToolResult> {
        self.data.read().await.pending_tool_results.clone()
    }

    async fn push_tool_result(&self, result: ToolResult) {
        self.data.write().await.pending_tool_results.push(result);
    }

    async fn clear_tool_results(&self) {
        self.data.write().await.pending_tool_results.clear();
    }

    async fn is_finished(&self) -> bool {
        self.data.read().await.finished
    }

    async fn set_finished(&self, finished: bool) {
        self.data.write().await.finished = finished;
    }

    async fn reasoning_snapshot(&self) -> ReasoningStateData {
        self.data.read().await.clone()
    }
}

// ============================================================================
// MemoryRoutingState
// ============================================================================

/// Routing state kept behind a `RwLock`. The delegate's state is held as a
/// live handle and nested into snapshots.
pub struct MemoryRoutingState {
    id: String,
    definition_name: String,
    parent_id: Option<String>,
    data: RwLock<RoutingStateData>,
    delegate: RwLock<Option<Arc<dyn ReasoningState>>>,
}

impl MemoryRoutingState {
    pub fn new(id: impl Into<String>, definition_name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self::from_data(RoutingStateData {
            core: StateCoreData::new(id, definition_name, parent_id),
            ..Default::default()
        })
    }

    /// Hydrate from persisted data, including the nested delegate state
    pub fn from_data(mut data: RoutingStateData) -> Self {
        let delegate = data
            .delegate_state
            .take()
            .map(|d| Arc::new(MemoryReasoningState::from_data(*d)) as Arc<dyn ReasoningState>);
        Self {
            id: data.core.id.clone(),
            definition_name: data.core.definition_name.clone(),
            parent_id: data.core.parent_id.clone(),
            data: RwLock::new(data),
            delegate: RwLock::new(delegate),
        }
    }
}

impl std::fmt::Debug for MemoryRoutingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRoutingState")
            .field("id", &self.id)
            .field("definition_name", &self.definition_name)
            .field("parent_id", &self.parent_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ActorState for MemoryRoutingState {
    fn id(&self) -> &str {
        &self.id
    }

    fn definition_name(&self) -> &str {
        &self.definition_name
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn kind(&self) -> ActorKind {
        ActorKind::Routing
    }

    async fn load_recent(&self) -> Result<Vec<Message>> {
        Ok(self.data.read().await.core.messages.clone())
    }

    async fn store_message(&self, message: Message) -> Result<()> {
        self.data.write().await.core.push_message(message);
        Ok(())
    }

    async fn revert(&self) -> Result<()> {
        self.data.write().await.core.revert();
        Ok(())
    }

    async fn summary(&self) -> Result<String> {
        Ok(self.data.read().await.core.summary.clone())
    }

    async fn set_summary(&self, summary: String) -> Result<()> {
        self.data.write().await.core.summary = summary;
        Ok(())
    }

    async fn build_memory_context(&self, options: &MemoryOptions) -> Result<ModelContext> {
        Ok(self.data.read().await.core.memory_context(options))
    }

    async fn get_property(&self, key: &str) -> Option<Value> {
        self.data.read().await.core.properties.get(key).cloned()
    }

    async fn set_property(&self, key: &str, value: Value) {
        self.data
            .write()
            .await
            .core
            .properties
            .insert(key.to_string(), value);
    }

    async fn delete_property(&self, key: &str) {
        self.data.write().await.core.properties.remove(key);
    }

    async fn snapshot(&self) -> Result<PersistedState> {
        let mut data = self.data.read().await.clone();
        if let Some(delegate) = self.delegate.read().await.as_ref() {
            data.delegate_state = Some(Box::new(delegate.reasoning_snapshot().await));
        }
        Ok(PersistedState::Routing(data))
    }
}

#[async_trait]
impl RoutingState for MemoryRoutingState {
    fn as_actor_state(&self) -> &dyn ActorState {
        self
    }

    async fn phase(&self) -> RoutingPhase {
        self.data.read().await.phase
    }

    async fn set_phase(&self, phase: RoutingPhase) {
        self.data.write().await.phase = phase;
    }

    async fn input(&self) -> String {
        self.data.read().await.input.clone()
    }

    async fn set_input(&self, input: String) {
        self.data.write().await.input = input;
    }

    async fn matches(&self) -> Vec<MatchedIntent> {
        self.data.read().await.matches.clone()
    }

    async fn set_matches(&self, matches: Vec<MatchedIntent>) {
        self.data.write().await.matches = matches;
    }

    async fn current_index(&self) -> usize {
        self.data.read().await.current_index
    }

    async fn set_current_index(&self, index: usize) {
        self.data.write().await.current_index = index;
    }

    async fn has_matched(&self) -> bool {
        self.data.read().await.matched
    }

    async fn set_matched(&self, matched: bool) {
        self.data.write().await.matched = matched;
    }

    async fn delegate_state(&self) -> Option<Arc<dyn ReasoningState>> {
        self.delegate.read().await.clone()
    }

    async fn set_delegate_state(&self, state: Option<Arc<dyn ReasoningState>>) {
        *self.delegate.write().await = state;
    }
}

// ============================================================================
// PromptContextBuilder
// ============================================================================

/// Context builder serving one named prompt fragment
#[derive(Debug, Clone)]
pub struct PromptContextBuilder {
    name: String,
    prompt: String,
}

impl PromptContextBuilder {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
        }
    }
}

#[async_trait]
impl ContextBuilder for PromptContextBuilder {
    async fn build_context(&self) -> Result<ModelContext> {
        Ok(ModelContext::new().with_prompt(Prompt::new(self.name.clone(), self.prompt.clone())))
    }
}

// ============================================================================
// InMemoryRuntime
// ============================================================================

/// Builder for [`InMemoryRuntime`]
pub struct InMemoryRuntimeBuilder {
    generator: Arc<dyn Generator>,
    config: ActorConfig,
    tools: HashMap<String, Arc<dyn Tool>>,
    tool_definitions: HashMap<String, ToolDefinition>,
    definitions: HashMap<String, ActorDefinition>,
    context_builders: HashMap<String, Arc<dyn ContextBuilder>>,
    rules: HashMap<String, Rule>,
}

impl InMemoryRuntimeBuilder {
    pub fn config(mut self, config: ActorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a builtin tool under its own name
    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn tool_definition(mut self, definition: ToolDefinition) -> Self {
        self.tool_definitions
            .insert(definition.name().to_string(), definition);
        self
    }

    pub fn definition(mut self, definition: impl Into<ActorDefinition>) -> Self {
        let definition = definition.into();
        self.definitions
            .insert(definition.name().to_string(), definition);
        self
    }

    pub fn context_builder(mut self, name: impl Into<String>, builder: impl ContextBuilder + 'static) -> Self {
        self.context_builders.insert(name.into(), Arc::new(builder));
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.insert(rule.name.clone(), rule);
        self
    }

    /// Validate every registered definition and build the runtime
    pub fn build(self) -> Result<InMemoryRuntime> {
        for definition in self.definitions.values() {
            definition.validate()?;
        }
        Ok(InMemoryRuntime {
            generator: self.generator,
            config: self.config,
            tools: RwLock::new(self.tools),
            tool_definitions: RwLock::new(self.tool_definitions),
            definitions: RwLock::new(self.definitions),
            context_builders: RwLock::new(self.context_builders),
            rules: RwLock::new(self.rules),
            states: RwLock::new(HashMap::new()),
            archived: RwLock::new(Vec::new()),
        })
    }
}

/// Runtime with in-process registries and state storage
///
/// Lookups accept the `tool:`, `agent:`, `context:`, `rule:` and `state:`
/// prefixes. Builtin tools take precedence over tool definitions.
pub struct InMemoryRuntime {
    generator: Arc<dyn Generator>,
    config: ActorConfig,
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    tool_definitions: RwLock<HashMap<String, ToolDefinition>>,
    definitions: RwLock<HashMap<String, ActorDefinition>>,
    context_builders: RwLock<HashMap<String, Arc<dyn ContextBuilder>>>,
    rules: RwLock<HashMap<String, Rule>>,
    states: RwLock<HashMap<String, StateHandle>>,
    archived: RwLock<Vec<PersistedState>>,
}

impl InMemoryRuntime {
    pub fn builder(generator: Arc<dyn Generator>) -> InMemoryRuntimeBuilder {
        InMemoryRuntimeBuilder {
            generator,
            config: ActorConfig::default(),
            tools: HashMap::new(),
            tool_definitions: HashMap::new(),
            definitions: HashMap::new(),
            context_builders: HashMap::new(),
            rules: HashMap::new(),
        }
    }

    /// Register (or replace) an actor definition
    pub async fn register_definition(&self, definition: impl Into<ActorDefinition>) -> Result<()> {
        let definition = definition.into();
        definition.validate()?;
        self.definitions
            .write()
            .await
            .insert(definition.name().to_string(), definition);
        Ok(())
    }

    /// Register (or replace) a builtin tool
    pub async fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .await
            .insert(tool.name().to_string(), tool);
    }

    pub async fn register_rule(&self, rule: Rule) {
        self.rules.write().await.insert(rule.name.clone(), rule);
    }

    /// IDs of all live states
    pub async fn state_ids(&self) -> Vec<String> {
        self.states.read().await.keys().cloned().collect()
    }

    /// Final snapshots of states destroyed with `archive`
    pub async fn archived_states(&self) -> Vec<PersistedState> {
        self.archived.read().await.clone()
    }

    /// Serialize a live state to JSON
    pub async fn save_state(&self, id: &str) -> Result<String> {
        let id = parse_ref(id, STATE_PREFIX);
        let state = self
            .states
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ActorError::not_found("state", id))?;
        state.snapshot().await?.to_json()
    }

    /// Hydrate a state from JSON and make it live. A routing state's nested
    /// delegate state is registered as well.
    pub async fn load_state(&self, json: &str) -> Result<StateHandle> {
        let handle = match PersistedState::from_json(json)? {
            PersistedState::Reasoning(data) => {
                StateHandle::Reasoning(Arc::new(MemoryReasoningState::from_data(data)))
            }
            PersistedState::Routing(data) => {
                StateHandle::Routing(Arc::new(MemoryRoutingState::from_data(data)))
            }
        };
        if handle.id().is_empty() {
            return Err(ActorError::state("persisted state has no id"));
        }

        let delegate = match &handle {
            StateHandle::Routing(state) => state.delegate_state().await,
            StateHandle::Reasoning(_) => None,
        };

        let mut states = self.states.write().await;
        if let Some(delegate) = delegate {
            states.insert(delegate.id().to_string(), StateHandle::Reasoning(delegate));
        }
        states.insert(handle.id().to_string(), handle.clone());
        debug!(state_id = %handle.id(), kind = %handle.kind(), "state loaded");
        Ok(handle)
    }

    /// Rebuild a live actor from a state held by this runtime
    pub async fn restore(self: &Arc<Self>, state_id: &str) -> Result<Arc<dyn Actor>> {
        restore_actor(Arc::clone(self) as Arc<dyn Runtime>, state_id).await
    }

    async fn insert_state(&self, handle: StateHandle) {
        debug!(
            state_id = %handle.id(),
            kind = %handle.kind(),
            definition = %handle.definition_name(),
            parent_id = handle.parent_id().unwrap_or(""),
            "state created"
        );
        self.states
            .write()
            .await
            .insert(handle.id().to_string(), handle);
    }
}

#[async_trait]
impl Generator for InMemoryRuntime {
    async fn generate_stream(&self, model: &str, context: &ModelContext) -> Result<GenerationStream> {
        self.generator.generate_stream(model, context).await
    }

    async fn invoke(
        &self,
        model: &str,
        context: &ModelContext,
        tool: &ToolSchema,
    ) -> Result<(Usage, FuncCall)> {
        self.generator.invoke(model, context, tool).await
    }
}

#[async_trait]
impl Runtime for InMemoryRuntime {
    fn actor_config(&self) -> ActorConfig {
        self.config
    }

    async fn get_tool(&self, name: &str) -> Result<Arc<dyn Tool>> {
        let name = parse_ref(name, TOOL_PREFIX);
        if let Some(tool) = self.tools.read().await.get(name) {
            return Ok(Arc::clone(tool));
        }
        let definition = self.tool_definitions.read().await.get(name).cloned();
        match definition {
            Some(definition) => self.create_tool_from_definition(&definition).await,
            None => Err(ActorError::not_found("tool", name)),
        }
    }

    async fn get_tool_definition(&self, name: &str) -> Result<ToolDefinition> {
        let name = parse_ref(name, TOOL_PREFIX);
        if self.tools.read().await.contains_key(name) {
            return Ok(ToolDefinition::Builtin {
                name: name.to_string(),
            });
        }
        self.tool_definitions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ActorError::not_found("tool", name))
    }

    async fn create_tool_from_definition(&self, definition: &ToolDefinition) -> Result<Arc<dyn Tool>> {
        match definition {
            ToolDefinition::Builtin { name } => {
                let name = parse_ref(name, TOOL_PREFIX);
                self.tools
                    .read()
                    .await
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ActorError::not_found("tool", name))
            }
            ToolDefinition::Generator {
                name,
                description,
                model,
                prompt,
                parameters,
            } => {
                if model.trim().is_empty() {
                    return Err(ActorError::config(format!(
                        "generator tool {}: model is required",
                        name
                    )));
                }
                let schema = ToolSchema {
                    name: name.clone(),
                    description: description.clone(),
                    parameters: parameters.clone(),
                };
                Ok(Arc::new(GeneratorTool::new(
                    schema,
                    model.clone(),
                    prompt.clone(),
                    Arc::clone(&self.generator),
                )))
            }
            ToolDefinition::Composite {
                name,
                description,
                steps,
            } => {
                definition.validate()?;
                let mut resolved = Vec::with_capacity(steps.len());
                for step in steps {
                    let tool = match (&step.tool.reference, &step.tool.tool) {
                        (Some(reference), _) => self.get_tool(reference).await?,
                        (None, Some(inline)) => self.create_tool_from_definition(inline).await?,
                        (None, None) => {
                            return Err(ActorError::config(format!(
                                "composite tool {}: step {} has no tool",
                                name, step.id
                            )))
                        }
                    };
                    resolved.push(CompositeToolStep {
                        id: step.id.clone(),
                        tool,
                        input: step.input.clone(),
                    });
                }
                let tool = CompositeTool::new(name.clone(), description.clone(), resolved)
                    .ok_or_else(|| ActorError::config(format!("composite tool {}: no steps", name)))?;
                Ok(Arc::new(tool))
            }
        }
    }

    async fn get_actor_definition(&self, name: &str) -> Result<ActorDefinition> {
        let name = parse_ref(name, AGENT_PREFIX);
        self.definitions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ActorError::not_found("actor definition", name))
    }

    async fn get_context_builder(&self, name: &str) -> Result<Arc<dyn ContextBuilder>> {
        let name = parse_ref(name, CONTEXT_PREFIX);
        self.context_builders
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ActorError::not_found("context builder", name))
    }

    async fn get_rule(&self, name: &str) -> Result<Rule> {
        let name = parse_ref(name, RULE_PREFIX);
        self.rules
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ActorError::not_found("rule", name))
    }

    async fn create_reasoning_state(
        &self,
        definition_name: &str,
        parent_id: Option<&str>,
    ) -> Result<Arc<dyn ReasoningState>> {
        let state = Arc::new(MemoryReasoningState::new(
            Uuid::now_v7().to_string(),
            definition_name,
            parent_id.map(str::to_string),
        ));
        self.insert_state(StateHandle::Reasoning(state.clone())).await;
        Ok(state)
    }

    async fn create_routing_state(
        &self,
        definition_name: &str,
        parent_id: Option<&str>,
    ) -> Result<Arc<dyn RoutingState>> {
        let state = Arc::new(MemoryRoutingState::new(
            Uuid::now_v7().to_string(),
            definition_name,
            parent_id.map(str::to_string),
        ));
        self.insert_state(StateHandle::Routing(state.clone())).await;
        Ok(state)
    }

    async fn get_state(&self, id: &str) -> Result<Option<StateHandle>> {
        let id = parse_ref(id, STATE_PREFIX);
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn destroy_state(&self, id: &str, archive: bool) -> Result<()> {
        let id = parse_ref(id, STATE_PREFIX);
        let Some(state) = self.states.write().await.remove(id) else {
            return Ok(());
        };
        if archive {
            let snapshot = state.snapshot().await?;
            self.archived.write().await.push(snapshot);
        }
        debug!(state_id = %id, archive, "state destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        CompositeStep, DelegateRef, ReasoningDefinition, RoutingDefinition, RuleRef, ToolRef,
    };
    use crate::tools::ToolExecutionResult;
    use crate::llm::GenerationEvent;
    use crate::tools::EchoTool;

    struct NoopGenerator;

    #[async_trait]
    impl Generator for NoopGenerator {
        async fn generate_stream(&self, _model: &str, _context: &ModelContext) -> Result<GenerationStream> {
            Ok(Box::pin(futures::stream::empty::<Result<GenerationEvent>>()))
        }

        async fn invoke(
            &self,
            _model: &str,
            _context: &ModelContext,
            tool: &ToolSchema,
        ) -> Result<(Usage, FuncCall)> {
            Ok((
                Usage::default(),
                FuncCall {
                    name: tool.name.clone(),
                    arguments: "{}".to_string(),
                },
            ))
        }
    }

    fn runtime() -> InMemoryRuntime {
        InMemoryRuntime::builder(Arc::new(NoopGenerator))
            .tool(EchoTool)
            .tool_definition(ToolDefinition::Generator {
                name: "echo".to_string(),
                description: "shadowed by the builtin".to_string(),
                model: "m".to_string(),
                prompt: String::new(),
                parameters: serde_json::json!({}),
            })
            .tool_definition(ToolDefinition::Generator {
                name: "summarize".to_string(),
                description: "Summarize text".to_string(),
                model: "m".to_string(),
                prompt: "Summarize".to_string(),
                parameters: serde_json::json!({}),
            })
            .definition(ReasoningDefinition::new("assistant", "m"))
            .rule(Rule::new("greeting").with_pattern("hello"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lookups_accept_prefixes() {
        let rt = runtime();
        assert_eq!(rt.get_tool("tool:echo").await.unwrap().name(), "echo");
        assert_eq!(
            rt.get_actor_definition("agent:assistant").await.unwrap().name(),
            "assistant"
        );
        assert_eq!(rt.get_rule("rule:greeting").await.unwrap().name, "greeting");
    }

    #[tokio::test]
    async fn test_composite_tool_definition_resolves_steps() {
        let rt = InMemoryRuntime::builder(Arc::new(NoopGenerator))
            .tool(EchoTool)
            .tool_definition(ToolDefinition::Composite {
                name: "echo_then_summarize".to_string(),
                description: "Echo, then summarize the echoed text".to_string(),
                steps: vec![
                    CompositeStep::new("echo", ToolRef::named("echo")),
                    CompositeStep::new(
                        "summary",
                        ToolRef::inline(ToolDefinition::Generator {
                            name: "summarize".to_string(),
                            description: String::new(),
                            model: "m".to_string(),
                            prompt: "Summarize".to_string(),
                            parameters: serde_json::json!({}),
                        }),
                    )
                    .with_input(serde_json::json!({"text": "$/steps/echo/text"})),
                ],
            })
            .tool_definition(ToolDefinition::Composite {
                name: "dangling".to_string(),
                description: String::new(),
                steps: vec![CompositeStep::new("first", ToolRef::named("nowhere"))],
            })
            .build()
            .unwrap();

        let tool = rt.get_tool("tool:echo_then_summarize").await.unwrap();
        assert_eq!(tool.parameters_schema(), EchoTool.parameters_schema());
        // The generator step streams nothing here
        let result = tool.execute(serde_json::json!({"text": "long text"})).await;
        assert!(matches!(result, ToolExecutionResult::Success(Value::String(s)) if s.is_empty()));

        match rt.get_tool("dangling").await {
            Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
            Ok(_) => panic!("a step naming an unknown tool must fail"),
        }
    }

    #[tokio::test]
    async fn test_builtin_tool_takes_precedence() {
        let rt = runtime();
        assert_eq!(
            rt.get_tool_definition("echo").await.unwrap(),
            ToolDefinition::Builtin {
                name: "echo".to_string()
            }
        );
        let tool = rt.get_tool("echo").await.unwrap();
        assert_eq!(tool.description(), EchoTool.description());

        let summarize = rt.get_tool("summarize").await.unwrap();
        assert_eq!(summarize.description(), "Summarize text");
    }

    #[tokio::test]
    async fn test_missing_lookups_are_not_found() {
        let rt = runtime();
        assert!(rt.get_tool("missing").await.err().unwrap().is_not_found());
        assert!(rt.get_actor_definition("missing").await.unwrap_err().is_not_found());
        assert!(rt.get_context_builder("missing").await.err().unwrap().is_not_found());
        assert!(rt.get_rule("missing").await.unwrap_err().is_not_found());
        assert!(rt.get_state("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_definition() {
        let result = InMemoryRuntime::builder(Arc::new(NoopGenerator))
            .definition(RoutingDefinition::new("router", "m"))
            .build();
        assert!(matches!(result, Err(ActorError::Configuration(_))));

        let ok = InMemoryRuntime::builder(Arc::new(NoopGenerator))
            .definition(
                RoutingDefinition::new("router", "m")
                    .with_rule(RuleRef::named("greeting"))
                    .with_route(["greeting"], DelegateRef::named("assistant")),
            )
            .build();
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_state_lifecycle_and_archive() {
        let rt = runtime();
        let a = rt.create_reasoning_state("assistant", None).await.unwrap();
        let b = rt.create_reasoning_state("assistant", Some("")).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(b.parent_id(), None);

        a.store_message(Message::user("hi")).await.unwrap();
        rt.destroy_state(a.id(), true).await.unwrap();
        rt.destroy_state(a.id(), true).await.unwrap();
        rt.destroy_state(b.id(), false).await.unwrap();

        assert!(rt.get_state(a.id()).await.unwrap().is_none());
        let archived = rt.archived_states().await;
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].core().messages[0].content, "hi");
    }

    #[tokio::test]
    async fn test_routing_snapshot_nests_delegate() {
        let rt = runtime();
        let router = rt.create_routing_state("router", None).await.unwrap();
        let delegate = rt
            .create_reasoning_state("assistant", Some(router.id()))
            .await
            .unwrap();
        delegate.store_message(Message::user("hello")).await.unwrap();
        router.set_phase(RoutingPhase::Executing).await;
        router.set_delegate_state(Some(delegate.clone())).await;

        let json = rt.save_state(&format!("state:{}", router.id())).await.unwrap();

        let other = runtime();
        let handle = other.load_state(&json).await.unwrap();
        assert_eq!(handle.kind(), ActorKind::Routing);
        let restored = other.get_state(delegate.id()).await.unwrap().unwrap();
        assert_eq!(restored.parent_id(), Some(router.id()));
        assert_eq!(restored.as_actor_state().load_recent().await.unwrap()[0].content, "hello");
    }

    #[tokio::test]
    async fn test_prompt_context_builder() {
        let builder = PromptContextBuilder::new("persona", "You are terse.");
        let ctx = builder.build_context().await.unwrap();
        assert_eq!(ctx.prompts, vec![Prompt::new("persona", "You are terse.")]);
    }

    #[tokio::test]
    async fn test_properties() {
        let state = MemoryReasoningState::new("s1", "assistant", None);
        state.set_property("k", serde_json::json!(1)).await;
        assert_eq!(state.get_property("k").await, Some(serde_json::json!(1)));
        state.delete_property("k").await;
        assert_eq!(state.get_property("k").await, None);
    }
}
