// Actor state contracts
//
// ActorState is the persistence-capable memory of one actor instance. The
// actor layer never locks around it: implementations are internally
// synchronized, which is what lets tool execution and classification run
// while the actor's own lifecycle lock is released.
//
// The data types below (StateCoreData and friends) are the serialized form
// of a state. They also carry the history rules (message merging, revert
// checkpoint, memory window) so every ActorState implementation applies them
// the same way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::definition::{ActorKind, DelegateRef, MemoryOptions};
use crate::error::Result;
use crate::llm::{ModelContext, Prompt};
use crate::message::{Message, MessageRole, ToolResult};

// ============================================================================
// Phases
// ============================================================================

/// Reasoning actor phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPhase {
    #[default]
    Idle,
    Thinking,
    Tool,
    Finished,
}

impl ReasoningPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningPhase::Idle => "idle",
            ReasoningPhase::Thinking => "thinking",
            ReasoningPhase::Tool => "tool",
            ReasoningPhase::Finished => "finished",
        }
    }
}

/// Routing actor phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPhase {
    #[default]
    Idle,
    Matching,
    Executing,
}

impl RoutingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingPhase::Idle => "idle",
            RoutingPhase::Matching => "matching",
            RoutingPhase::Executing => "executing",
        }
    }
}

/// A classified intent waiting to be (or being) executed by a delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedIntent {
    pub rule: String,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    pub target: DelegateRef,
}

// ============================================================================
// Traits
// ============================================================================

/// Memory shared by both actor kinds
#[async_trait]
pub trait ActorState: Send + Sync {
    /// Unique, immutable ID
    fn id(&self) -> &str;

    fn definition_name(&self) -> &str;

    /// State ID of the actor that created this one, if any
    fn parent_id(&self) -> Option<&str>;

    fn kind(&self) -> ActorKind;

    /// All messages, oldest first
    async fn load_recent(&self) -> Result<Vec<Message>>;

    /// Append a message, merging it into the previous one where the history rules say so
    async fn store_message(&self, message: Message) -> Result<()>;

    /// Discard every message from the revert checkpoint on
    async fn revert(&self) -> Result<()>;

    async fn summary(&self) -> Result<String>;

    async fn set_summary(&self, summary: String) -> Result<()>;

    /// Context for the next generation; valid (possibly empty) even with no history
    async fn build_memory_context(&self, options: &MemoryOptions) -> Result<ModelContext>;

    async fn get_property(&self, key: &str) -> Option<Value>;

    async fn set_property(&self, key: &str, value: Value);

    async fn delete_property(&self, key: &str);

    /// Serialized form of the whole state
    async fn snapshot(&self) -> Result<PersistedState>;
}

/// State of a reasoning actor
#[async_trait]
pub trait ReasoningState: ActorState {
    fn as_actor_state(&self) -> &dyn ActorState;

    async fn phase(&self) -> ReasoningPhase;
    async fn set_phase(&self, phase: ReasoningPhase);

    /// Tool results recorded but not yet sent back to the model
    async fn pending_tool_results(&self) -> Vec<ToolResult>;
    async fn push_tool_result(&self, result: ToolResult);
    async fn clear_tool_results(&self);

    async fn is_finished(&self) -> bool;
    async fn set_finished(&self, finished: bool);

    async fn reasoning_snapshot(&self) -> ReasoningStateData;
}

/// State of a routing actor
#[async_trait]
pub trait RoutingState: ActorState {
    fn as_actor_state(&self) -> &dyn ActorState;

    async fn phase(&self) -> RoutingPhase;
    async fn set_phase(&self, phase: RoutingPhase);

    /// Input accumulated while no delegate is active
    async fn input(&self) -> String;
    async fn set_input(&self, input: String);

    async fn matches(&self) -> Vec<MatchedIntent>;
    async fn set_matches(&self, matches: Vec<MatchedIntent>);

    async fn current_index(&self) -> usize;
    async fn set_current_index(&self, index: usize);

    async fn has_matched(&self) -> bool;
    async fn set_matched(&self, matched: bool);

    /// State of the active delegate, if any
    async fn delegate_state(&self) -> Option<Arc<dyn ReasoningState>>;
    async fn set_delegate_state(&self, state: Option<Arc<dyn ReasoningState>>);

    /// Intent at the current index
    async fn current_intent(&self) -> Option<MatchedIntent> {
        let index = self.current_index().await;
        self.matches().await.get(index).cloned()
    }
}

// ============================================================================
// Persisted data
// ============================================================================

/// Fields shared by both state kinds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateCoreData {
    pub id: String,
    pub definition_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub revert_checkpoint: usize,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl StateCoreData {
    pub fn new(id: impl Into<String>, definition_name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            definition_name: definition_name.into(),
            parent_id: parent_id.filter(|p| !p.is_empty()),
            ..Default::default()
        }
    }

    /// Append with merging:
    /// - consecutive user messages join with a newline
    /// - consecutive plain model text concatenates
    /// - a tool call fragment with the same call ID appends its arguments
    ///
    /// The revert checkpoint moves to the first user message of a user run.
    pub fn push_message(&mut self, message: Message) {
        if let Some(last) = self.messages.last_mut() {
            match (last.role, message.role) {
                (MessageRole::User, MessageRole::User) => {
                    last.content.push('\n');
                    last.content.push_str(&message.content);
                    return;
                }
                (MessageRole::Model, MessageRole::Model) => {
                    if last.is_model_text() && message.is_model_text() {
                        last.content.push_str(&message.content);
                        return;
                    }
                    if let (Some(prev), Some(next)) = (last.tool_call.as_mut(), message.tool_call.as_ref()) {
                        if !prev.id.is_empty() && prev.id == next.id {
                            prev.arguments.push_str(&next.arguments);
                            return;
                        }
                    }
                }
                _ => {}
            }
        }

        if message.role == MessageRole::User {
            self.revert_checkpoint = self.messages.len();
        }
        self.messages.push(message);
    }

    pub fn revert(&mut self) {
        let checkpoint = self.revert_checkpoint.min(self.messages.len());
        self.messages.truncate(checkpoint);
    }

    pub fn memory_context(&self, options: &MemoryOptions) -> ModelContext {
        let start = self.messages.len().saturating_sub(options.recent);
        let mut context = ModelContext {
            messages: self.messages[start..].to_vec(),
            ..Default::default()
        };
        if options.summary && !self.summary.is_empty() {
            context.prompts.push(Prompt::new("summary", self.summary.clone()));
        }
        context
    }
}

/// Serialized reasoning state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStateData {
    #[serde(flatten)]
    pub core: StateCoreData,
    #[serde(default)]
    pub phase: ReasoningPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_tool_results: Vec<ToolResult>,
    #[serde(default)]
    pub finished: bool,
}

/// Serialized routing state; the delegate's state is nested
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingStateData {
    #[serde(flatten)]
    pub core: StateCoreData,
    #[serde(default)]
    pub phase: RoutingPhase,
    #[serde(default)]
    pub input: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<MatchedIntent>,
    #[serde(default)]
    pub current_index: usize,
    #[serde(default)]
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_state: Option<Box<ReasoningStateData>>,
}

/// Any persisted state, discriminated by `state_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state_type", rename_all = "snake_case")]
pub enum PersistedState {
    Reasoning(ReasoningStateData),
    Routing(RoutingStateData),
}

impl PersistedState {
    pub fn kind(&self) -> ActorKind {
        match self {
            PersistedState::Reasoning(_) => ActorKind::Reasoning,
            PersistedState::Routing(_) => ActorKind::Routing,
        }
    }

    pub fn core(&self) -> &StateCoreData {
        match self {
            PersistedState::Reasoning(data) => &data.core,
            PersistedState::Routing(data) => &data.core,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Render messages as `[role]: content` lines
pub fn format_messages(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&message.history_line());
        out.push('\n');
    }
    out
}
