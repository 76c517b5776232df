// Error types for actors and their runtime collaborators

use thiserror::Error;

/// Result type alias for actor operations
pub type Result<T> = std::result::Result<T, ActorError>;

/// Errors that can occur while driving an actor
#[derive(Debug, Error)]
pub enum ActorError {
    /// The actor was closed (or interrupted) and accepts no further work
    #[error("actor closed")]
    Closed,

    /// The model produced a tool call that cannot be dispatched
    #[error("invalid tool call: {0}")]
    InvalidToolCall(String),

    /// A runtime lookup found nothing under the requested name
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Generation backend error (stream open or mid-stream failure)
    #[error("generation error: {0}")]
    Generation(String),

    /// Tool construction or dispatch error
    #[error("tool error: {0}")]
    Tool(String),

    /// State access error
    #[error("state error: {0}")]
    State(String),

    /// Invalid definition or configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A routing actor tried to delegate to another routing actor
    #[error("nested routing actor not supported: {0}")]
    NestedRouting(String),

    /// Persisted state kind does not match the definition it names
    #[error("state {state_id} is a {found} state but definition {definition} expects {expected}")]
    StateKindMismatch {
        state_id: String,
        definition: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Work was cancelled by an outer scope
    #[error("cancelled")]
    Cancelled,

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ActorError {
    /// Create a not-found error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ActorError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        ActorError::Generation(msg.into())
    }

    /// Create a tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        ActorError::Tool(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        ActorError::State(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ActorError::Configuration(msg.into())
    }

    /// Create an invalid tool call error
    pub fn invalid_tool_call(msg: impl Into<String>) -> Self {
        ActorError::InvalidToolCall(msg.into())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ActorError::Closed)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ActorError::NotFound { .. })
    }
}
