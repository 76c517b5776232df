// Actor execution core
//
// This crate turns declarative agent definitions into live, resumable,
// event-emitting conversational actors.
//
// Key design decisions:
// - Two actor kinds behind one `Actor` trait: a reasoning actor (generate → tool → generate)
//   and a routing actor (classify → delegate → forward)
// - Everything an actor consumes comes through the `Runtime` trait; no global registries
// - Actor state is internally synchronized and never held behind the actor's own lock
// - Round work (generation, tool calls, classification) runs in cancellable tasks
// - Tool failures become tool output; lookup and generation failures are errors
// - State snapshots carry a `state_type` discriminator so restoration picks the actor kind

pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod llm;
pub mod message;
pub mod rules;
pub mod state;
pub mod tools;
pub mod traits;

// Actors
pub mod actor;
pub mod reasoning;
pub mod routing;

// In-memory implementations for examples and testing
pub mod memory;
pub mod mock;

// Re-exports for convenience
pub use actor::{create_actor, format_history, restore_actor, Actor, StateHandle};
pub use config::ActorConfig;
pub use definition::{
    ActorDefinition, ActorKind, CompositeStep, ContextLayer, DelegateRef, GeneratorRef,
    MemoryOptions, ReasoningDefinition, Route, RoutingDefinition, RuleRef, ToolDefinition,
    ToolRef,
};
pub use error::{ActorError, Result};
pub use events::{AgentEvent, EventKind};
pub use llm::{
    FuncCall, GenerationEvent, GenerationStream, Generator, ModelContext, Prompt, ToolSchema, Usage,
};
pub use message::{Message, MessageRole, ToolCall, ToolResult};
pub use reasoning::ReasoningActor;
pub use routing::{MatchedIntent, RoutingActor};
pub use rules::{Matcher, Rule, RuleMatch, Var, VarType, NO_MATCH};
pub use state::{
    ActorState, PersistedState, ReasoningPhase, ReasoningState, RoutingPhase, RoutingState,
};
pub use traits::{ContextBuilder, Runtime};

// Tool abstraction re-exports
pub use tools::{
    CompositeTool, CompositeToolStep, EchoTool, FailingTool, FunctionTool, GeneratorTool, Tool,
    ToolExecutionResult, ToolInternalError,
};

// In-memory re-exports
pub use memory::{
    InMemoryRuntime, InMemoryRuntimeBuilder, MemoryReasoningState, MemoryRoutingState,
    PromptContextBuilder,
};
pub use mock::{MockCall, MockGenerator, MockResponse};
