// Generation abstractions
//
// Types describing what an actor sends to a generation backend (ModelContext)
// and what comes back (a stream of GenerationEvent). The Generator trait is
// the backend seam; provider integrations live outside this crate.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

use crate::error::Result;
use crate::message::{Message, ToolCall};

// ============================================================================
// Request side
// ============================================================================

/// A named prompt fragment (system prompt, context layer, summary, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    pub text: String,
}

impl Prompt {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Tool declaration offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: Value,
}

/// Everything a generation request needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelContext {
    #[serde(default)]
    pub prompts: Vec<Prompt>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

impl ModelContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prompt
    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompts.push(prompt);
        self
    }

    /// Add a message
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Append another context's prompts, messages and tools
    pub fn extend(&mut self, other: ModelContext) {
        self.prompts.extend(other.prompts);
        self.messages.extend(other.messages);
        self.tools.extend(other.tools);
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty() && self.messages.is_empty() && self.tools.is_empty()
    }
}

// ============================================================================
// Response side
// ============================================================================

/// Token accounting reported at the end of a generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Structured function call produced by `Generator::invoke`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncCall {
    pub name: String,
    pub arguments: String,
}

/// One item of a generation stream
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Text fragment
    TextDelta(String),
    /// Tool invocation request
    ToolCall(ToolCall),
    /// Normal completion
    Done(Usage),
}

/// Stream of generation events. Ends with `Done` (or simply ends); an `Err`
/// item is a failure other than normal completion. Dropping the stream closes it.
pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<GenerationEvent>> + Send>>;

/// Generation backend
#[async_trait]
pub trait Generator: Send + Sync {
    /// Open a streaming generation for `model` over `context`
    async fn generate_stream(&self, model: &str, context: &ModelContext) -> Result<GenerationStream>;

    /// Force a single structured call against `tool`
    async fn invoke(
        &self,
        model: &str,
        context: &ModelContext,
        tool: &ToolSchema,
    ) -> Result<(Usage, FuncCall)>;
}
