// Actor capability interface
//
// Both actor kinds implement `Actor`. Callers feed input with `input`, drain
// events with `next` until a round boundary (`Eof`) or a terminal event, then
// supply more input or close the actor. Entry points are called sequentially
// by a single owner; `interrupt` and `close` may be called at any time.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::definition::{ActorDefinition, ActorKind};
use crate::error::{ActorError, Result};
use crate::events::AgentEvent;
use crate::reasoning::ReasoningActor;
use crate::routing::RoutingActor;
use crate::state::{format_messages, ActorState, PersistedState, ReasoningState, RoutingState};
use crate::traits::Runtime;

/// A live actor
#[async_trait]
pub trait Actor: Send + Sync {
    fn kind(&self) -> ActorKind;

    fn definition(&self) -> ActorDefinition;

    fn state(&self) -> StateHandle;

    fn state_id(&self) -> &str;

    /// Deliver caller input and start a round
    async fn input(&self, content: &str) -> Result<()>;

    /// Stop the current round; terminal
    async fn interrupt(&self) -> Result<()>;

    /// Next event of the current round; suspends while there is nothing to report
    async fn next(&self) -> Result<AgentEvent>;

    /// Undo the most recent user turn
    async fn revert(&self) -> Result<()>;

    /// Conversation history as `[role]: content` lines
    async fn format_history(&self) -> String;

    async fn close(&self) -> Result<()> {
        self.close_with_error(None).await
    }

    /// Close the actor, recording why. Idempotent.
    async fn close_with_error(&self, reason: Option<String>) -> Result<()>;
}

/// Either kind of actor state
#[derive(Clone)]
pub enum StateHandle {
    Reasoning(Arc<dyn ReasoningState>),
    Routing(Arc<dyn RoutingState>),
}

impl StateHandle {
    pub fn as_actor_state(&self) -> &dyn ActorState {
        match self {
            StateHandle::Reasoning(state) => state.as_actor_state(),
            StateHandle::Routing(state) => state.as_actor_state(),
        }
    }

    pub fn id(&self) -> &str {
        self.as_actor_state().id()
    }

    pub fn kind(&self) -> ActorKind {
        self.as_actor_state().kind()
    }

    pub fn definition_name(&self) -> &str {
        self.as_actor_state().definition_name()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.as_actor_state().parent_id()
    }

    pub async fn snapshot(&self) -> Result<PersistedState> {
        self.as_actor_state().snapshot().await
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .field("definition", &self.definition_name())
            .finish()
    }
}

/// Render a state's history; load failures are rendered inline
pub async fn format_history(state: &dyn ActorState) -> String {
    match state.load_recent().await {
        Ok(messages) => format_messages(&messages),
        Err(e) => format!("error loading history: {}", e),
    }
}

/// Create a fresh actor for the named definition
pub async fn create_actor(
    runtime: Arc<dyn Runtime>,
    definition_name: &str,
    parent_state_id: Option<&str>,
) -> Result<Arc<dyn Actor>> {
    match runtime.get_actor_definition(definition_name).await? {
        ActorDefinition::Reasoning(def) => {
            let actor = ReasoningActor::new(runtime, def, parent_state_id).await?;
            Ok(Arc::new(actor))
        }
        ActorDefinition::Routing(def) => {
            let actor = RoutingActor::new(runtime, def, parent_state_id).await?;
            Ok(Arc::new(actor))
        }
    }
}

/// Rebuild a live actor from a state the runtime still holds.
///
/// The actor kind comes from the state's own discriminator; the definition it
/// names must be of the same kind.
pub async fn restore_actor(runtime: Arc<dyn Runtime>, state_id: &str) -> Result<Arc<dyn Actor>> {
    let state = runtime
        .get_state(state_id)
        .await?
        .ok_or_else(|| ActorError::not_found("state", state_id))?;

    let definition_name = state.definition_name().to_string();
    if definition_name.is_empty() {
        return Err(ActorError::state(format!(
            "state {:?} has no actor definition",
            state_id
        )));
    }
    let definition = runtime.get_actor_definition(&definition_name).await?;

    info!(
        state_id = %state_id,
        kind = %state.kind(),
        definition = %definition_name,
        "restoring actor"
    );

    match (state, definition) {
        (StateHandle::Reasoning(state), ActorDefinition::Reasoning(def)) => {
            let actor = ReasoningActor::with_state(runtime, def, state).await?;
            Ok(Arc::new(actor))
        }
        (StateHandle::Routing(state), ActorDefinition::Routing(def)) => {
            let actor = RoutingActor::with_state(runtime, def, state).await?;
            Ok(Arc::new(actor))
        }
        (state, definition) => Err(ActorError::StateKindMismatch {
            state_id: state_id.to_string(),
            definition: definition_name,
            expected: definition.kind().as_str(),
            found: state.kind().as_str(),
        }),
    }
}
