// Runtime collaborator traits
//
// The Runtime is the dependency-injection boundary of the actors: generation,
// tool lookup/creation, definition and rule lookup, and state lifecycle.
// Actors never reach into global registries; everything comes through here.
//
// Lookup contract: a missing tool, definition, context builder or rule is a
// definite `ActorError::NotFound`. `get_state` is the one exception and
// returns `Ok(None)`, since callers look states up speculatively.

use async_trait::async_trait;
use std::sync::Arc;

use crate::actor::StateHandle;
use crate::config::ActorConfig;
use crate::definition::{ActorDefinition, ToolDefinition};
use crate::error::Result;
use crate::llm::{Generator, ModelContext};
use crate::rules::Rule;
use crate::state::{ReasoningState, RoutingState};
use crate::tools::Tool;

/// Produces prompt material for a `$ref` context layer
#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build_context(&self) -> Result<ModelContext>;
}

/// Everything an actor consumes from its environment
#[async_trait]
pub trait Runtime: Generator {
    /// Tunables applied to actors created against this runtime
    fn actor_config(&self) -> ActorConfig {
        ActorConfig::default()
    }

    // ------------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------------

    async fn get_tool(&self, name: &str) -> Result<Arc<dyn Tool>>;

    async fn get_tool_definition(&self, name: &str) -> Result<ToolDefinition>;

    async fn create_tool_from_definition(&self, definition: &ToolDefinition) -> Result<Arc<dyn Tool>>;

    // ------------------------------------------------------------------------
    // Definitions and rules
    // ------------------------------------------------------------------------

    async fn get_actor_definition(&self, name: &str) -> Result<ActorDefinition>;

    async fn get_context_builder(&self, name: &str) -> Result<Arc<dyn ContextBuilder>>;

    async fn get_rule(&self, name: &str) -> Result<Rule>;

    // ------------------------------------------------------------------------
    // State lifecycle
    // ------------------------------------------------------------------------

    /// Allocate a fresh reasoning state with a unique ID
    async fn create_reasoning_state(
        &self,
        definition_name: &str,
        parent_id: Option<&str>,
    ) -> Result<Arc<dyn ReasoningState>>;

    /// Allocate a fresh routing state with a unique ID
    async fn create_routing_state(
        &self,
        definition_name: &str,
        parent_id: Option<&str>,
    ) -> Result<Arc<dyn RoutingState>>;

    /// Look up a live state; `Ok(None)` when absent
    async fn get_state(&self, id: &str) -> Result<Option<StateHandle>>;

    /// Destroy a state, archiving its final snapshot first when asked. Idempotent.
    async fn destroy_state(&self, id: &str, archive: bool) -> Result<()>;
}
