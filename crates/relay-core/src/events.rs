// Actor events
//
// AgentEvent is the unit of observable actor output returned by `Actor::next`.
// Every event names the actor instance that produced it (definition name and
// state ID), so events forwarded across a delegation boundary keep the
// delegate's identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ToolCall, ToolResult};

/// Kind of an actor event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Text fragment
    Chunk,
    /// Round boundary: the actor is waiting for more input
    Eof,
    /// Terminal: the actor finished or was closed
    Closed,
    /// A tool invocation started
    ToolStart,
    /// A tool invocation produced a result
    ToolDone,
    /// A tool invocation failed (the failure is still fed back to the model)
    ToolError,
    /// Terminal: the actor was interrupted
    Interrupted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Chunk => "chunk",
            EventKind::Eof => "eof",
            EventKind::Closed => "closed",
            EventKind::ToolStart => "tool_start",
            EventKind::ToolDone => "tool_done",
            EventKind::ToolError => "tool_error",
            EventKind::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// One unit of observable actor output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub kind: EventKind,

    /// Phase of the producing actor when the event was emitted
    pub phase: String,

    /// Definition name of the producing actor
    pub actor_definition: String,

    /// State ID of the producing actor
    pub actor_state_id: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chunk: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call: Option<ToolCall>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_result: Option<ToolResult>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    /// Create an event of the given kind with no payload and no identity
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            phase: String::new(),
            actor_definition: String::new(),
            actor_state_id: String::new(),
            chunk: None,
            tool_call: None,
            tool_result: None,
            tool_error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a text chunk event
    pub fn chunk(text: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::Chunk);
        event.chunk = Some(text.into());
        event
    }

    pub fn eof() -> Self {
        Self::new(EventKind::Eof)
    }

    pub fn closed() -> Self {
        Self::new(EventKind::Closed)
    }

    pub fn interrupted() -> Self {
        Self::new(EventKind::Interrupted)
    }

    /// Create a tool start event
    pub fn tool_start(call: ToolCall) -> Self {
        let mut event = Self::new(EventKind::ToolStart);
        event.tool_call = Some(call);
        event
    }

    /// Create a tool done event
    pub fn tool_done(call: ToolCall, result: ToolResult) -> Self {
        let mut event = Self::new(EventKind::ToolDone);
        event.tool_call = Some(call);
        event.tool_result = Some(result);
        event
    }

    /// Create a tool error event; the recorded result is attached as well
    pub fn tool_error(call: ToolCall, result: ToolResult, error: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::ToolError);
        event.tool_call = Some(call);
        event.tool_result = Some(result);
        event.tool_error = Some(error.into());
        event
    }

    /// Stamp the producing actor's identity
    pub fn from_actor(mut self, definition: &str, state_id: &str) -> Self {
        self.actor_definition = definition.to_string();
        self.actor_state_id = state_id.to_string();
        self
    }

    /// Stamp the producing actor's phase
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    /// `Closed` and `Interrupted` end the caller's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Closed | EventKind::Interrupted)
    }
}
