// Message types
//
// Message is one role-tagged entry in an actor's conversation history.
// Tool calls and tool results are messages too, so a history replayed into a
// generation request carries the full think/act/observe trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ActorError, Result};

/// Message role in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Caller input
    User,
    /// Generated text or a tool call request
    Model,
    /// Observed tool output
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Model => write!(f, "model"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call ID used to correlate the result
    pub id: String,
    /// Tool name
    pub name: String,
    /// Raw JSON arguments; streamed fragments are appended verbatim
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the arguments, treating an empty payload as `{}`
    pub fn arguments_json(&self) -> Result<Value> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments).map_err(|e| {
            ActorError::invalid_tool_call(format!("{}: arguments are not JSON: {}", self.name, e))
        })
    }

    /// Reject payloads that cannot be dispatched to a tool
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ActorError::invalid_tool_call(format!(
                "call {} has no tool name",
                self.id
            )));
        }
        self.arguments_json().map(|_| ())
    }
}

/// Outcome of one tool invocation, as fed back to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    /// Formatted output, or the failure text prefixed with an error indicator
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: Uuid,

    /// Message role
    pub role: MessageRole,

    /// Text content (empty for tool call requests)
    #[serde(default)]
    pub content: String,

    /// Tool call requested by the model
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call: Option<ToolCall>,

    /// Tool call ID this message answers (tool results only)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,

    /// Timestamp when the message was created
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            role,
            content: content.into(),
            tool_call: None,
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create a model text message
    pub fn model(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Model, content)
    }

    /// Create a model message carrying a tool call request
    pub fn tool_call(call: ToolCall) -> Self {
        let mut msg = Self::new(MessageRole::Model, "");
        msg.tool_call = Some(call);
        msg
    }

    /// Create a tool result message
    pub fn tool_result(result: &ToolResult) -> Self {
        let mut msg = Self::new(MessageRole::Tool, result.content.clone());
        msg.tool_call_id = Some(result.tool_call_id.clone());
        msg
    }

    /// Plain model text (no tool call attached)
    pub fn is_model_text(&self) -> bool {
        self.role == MessageRole::Model && self.tool_call.is_none()
    }

    /// Render as a single `[role]: content` history line (without newline)
    pub fn history_line(&self) -> String {
        match &self.tool_call {
            Some(call) => format!("[{}]: call {}({})", self.role, call.name, call.arguments),
            None => format!("[{}]: {}", self.role, self.content),
        }
    }
}
