// Tool abstraction for reasoning actors
//
// A reasoning actor resolves its tools through the Runtime, invokes them with
// no actor lock held, and records whatever comes back as a tool-result
// message. A failed invocation is observation, not an actor error: the model
// sees it on the next generation and decides what to do.
//
// Failures come in two flavours. A tool failure carries text meant for the
// model. An internal failure is logged with its cause and the model only sees
// a fixed placeholder.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::error;

use crate::llm::{GenerationEvent, Generator, ModelContext, Prompt, ToolSchema};
use crate::message::{Message, ToolCall, ToolResult};

/// Prefix of a tool-result message recorded when the tool could not be resolved
pub const TOOL_ERROR_PREFIX: &str = "tool error: ";
/// Prefix of a tool-result message recorded when the invocation failed
pub const INVOKE_ERROR_PREFIX: &str = "invoke error: ";

const HIDDEN_FAILURE_TEXT: &str = "the tool failed for an internal reason";

// ============================================================================
// Invocation outcome
// ============================================================================

/// What a tool invocation produced
#[derive(Debug)]
pub enum ToolExecutionResult {
    /// Output for the model; strings are recorded as-is, other values as JSON
    Success(Value),

    /// Failure the model is allowed to read, such as "no such city"
    ToolError(String),

    /// Failure whose details stay in the logs
    InternalError(ToolInternalError),
}

impl ToolExecutionResult {
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success(value.into())
    }

    pub fn tool_error(message: impl Into<String>) -> Self {
        Self::ToolError(message.into())
    }

    /// Hide `cause` from the model
    pub fn internal_error(cause: impl Into<anyhow::Error>) -> Self {
        Self::InternalError(ToolInternalError::new(cause))
    }

    pub fn internal_error_msg(message: impl Into<String>) -> Self {
        Self::InternalError(ToolInternalError::new(anyhow::anyhow!(message.into())))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Turn the outcome into the result recorded for `call`. Both failure
    /// kinds carry the invoke-error prefix.
    pub fn into_tool_result(self, call: &ToolCall) -> ToolResult {
        let (content, is_error) = match self {
            Self::Success(value) => (format_output(&value), false),
            Self::ToolError(message) => (format!("{}{}", INVOKE_ERROR_PREFIX, message), true),
            Self::InternalError(internal) => {
                error!(
                    tool = %call.name,
                    tool_call_id = %call.id,
                    error = %internal,
                    "tool failed internally; cause withheld from the model"
                );
                (format!("{}{}", INVOKE_ERROR_PREFIX, HIDDEN_FAILURE_TEXT), true)
            }
        };

        ToolResult {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error,
        }
    }
}

/// Result recorded when a tool could not be resolved at call time
pub fn unresolved_tool_result(call: &ToolCall, reason: impl std::fmt::Display) -> ToolResult {
    ToolResult {
        tool_call_id: call.id.clone(),
        name: call.name.clone(),
        content: format!("{}{}", TOOL_ERROR_PREFIX, reason),
        is_error: true,
    }
}

fn format_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cause of an internal tool failure
#[derive(Debug, thiserror::Error)]
#[error("{cause:#}")]
pub struct ToolInternalError {
    cause: anyhow::Error,
}

impl ToolInternalError {
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
        }
    }

    /// The underlying cause, for logging or inspection
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

// ============================================================================
// Tool Trait
// ============================================================================

/// A callable tool.
///
/// Implementations may be long-running or recursive (a tool can run another
/// generation), so callers never hold a lock across `execute`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to invoke the tool
    fn name(&self) -> &str;

    /// Description offered to the model
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments
    async fn execute(&self, arguments: Value) -> ToolExecutionResult;

    /// Declaration offered to the model
    fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

// ============================================================================
// FunctionTool - closure-backed tool
// ============================================================================

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, ToolExecutionResult> + Send + Sync;

/// A tool backed by an async closure
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    func: Arc<ToolFn>,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolExecutionResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            func: Arc::new(move |args| func(args).boxed()),
        }
    }

    /// Set the parameter schema
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        (self.func)(arguments).await
    }
}

// ============================================================================
// GeneratorTool - a tool that is itself a generation call
// ============================================================================

/// Runs a nested generation: the tool prompt becomes the system prompt and
/// the call arguments the user message. The generated text is the result.
pub struct GeneratorTool {
    schema: ToolSchema,
    model: String,
    prompt: String,
    generator: Arc<dyn Generator>,
}

impl GeneratorTool {
    pub fn new(
        schema: ToolSchema,
        model: impl Into<String>,
        prompt: impl Into<String>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            schema,
            model: model.into(),
            prompt: prompt.into(),
            generator,
        }
    }
}

#[async_trait]
impl Tool for GeneratorTool {
    fn name(&self) -> &str {
        &self.schema.name
    }

    fn description(&self) -> &str {
        &self.schema.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.parameters.clone()
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let mut context = ModelContext::new().with_message(Message::user(format_output(&arguments)));
        if !self.prompt.is_empty() {
            context.prompts.push(Prompt::new("system", self.prompt.clone()));
        }

        let mut stream = match self.generator.generate_stream(&self.model, &context).await {
            Ok(stream) => stream,
            Err(e) => return ToolExecutionResult::tool_error(e.to_string()),
        };

        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(GenerationEvent::TextDelta(delta)) => text.push_str(&delta),
                Ok(GenerationEvent::ToolCall(_)) => {}
                Ok(GenerationEvent::Done(_)) => break,
                Err(e) => return ToolExecutionResult::tool_error(e.to_string()),
            }
        }
        ToolExecutionResult::success(text)
    }
}

// ============================================================================
// CompositeTool - tools chained in sequence
// ============================================================================

/// A resolved step of a [`CompositeTool`]
pub struct CompositeToolStep {
    pub id: String,
    pub tool: Arc<dyn Tool>,
    pub input: Option<Value>,
}

/// Runs its steps in order and returns the last step's output.
///
/// The first step receives the call arguments. A later step receives its
/// rendered input template, or the previous output when it has none. Step
/// outputs are kept under `steps.<id>`, parsed as JSON when they are JSON.
pub struct CompositeTool {
    schema: ToolSchema,
    steps: Vec<CompositeToolStep>,
}

impl CompositeTool {
    /// Returns `None` without steps. The parameter schema is the first step's.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<CompositeToolStep>,
    ) -> Option<Self> {
        let parameters = steps.first()?.tool.parameters_schema();
        Some(Self {
            schema: ToolSchema {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            steps,
        })
    }
}

#[async_trait]
impl Tool for CompositeTool {
    fn name(&self) -> &str {
        &self.schema.name
    }

    fn description(&self) -> &str {
        &self.schema.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.parameters.clone()
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let mut scope = serde_json::json!({
            "input": arguments.clone(),
            "steps": {}
        });
        let mut previous = arguments;
        let mut last = Value::Null;

        for (i, step) in self.steps.iter().enumerate() {
            // the first step always takes the call arguments
            let template = step.input.as_ref().filter(|_| i > 0);
            let args = match template.map(|t| render_template(t, &scope)) {
                Some(Ok(args)) => args,
                Some(Err(pointer)) => {
                    return ToolExecutionResult::tool_error(format!(
                        "step {}: nothing at {}",
                        step.id, pointer
                    ))
                }
                None => previous.clone(),
            };

            let output = match step.tool.execute(args).await {
                ToolExecutionResult::Success(output) => output,
                ToolExecutionResult::ToolError(message) => {
                    return ToolExecutionResult::tool_error(format!("step {}: {}", step.id, message))
                }
                internal @ ToolExecutionResult::InternalError(_) => return internal,
            };

            let parsed = parse_output(&output);
            scope["steps"][step.id.as_str()] = parsed.clone();
            previous = parsed;
            last = output;
        }

        ToolExecutionResult::Success(last)
    }
}

/// String outputs holding JSON become JSON values
fn parse_output(output: &Value) -> Value {
    match output {
        Value::String(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        other => other.clone(),
    }
}

/// Replace `$<pointer>` string leaves with the value found in `scope`. The
/// error is the first pointer that resolves to nothing.
fn render_template(template: &Value, scope: &Value) -> std::result::Result<Value, String> {
    match template {
        Value::String(text) => match text.strip_prefix('$') {
            Some(pointer) if pointer.starts_with('/') => scope
                .pointer(pointer)
                .cloned()
                .ok_or_else(|| pointer.to_string()),
            _ => Ok(template.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| render_template(item, scope))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut rendered = serde_json::Map::with_capacity(fields.len());
            for (key, value) in fields {
                rendered.insert(key.clone(), render_template(value, scope)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

// ============================================================================
// Fixture tools
// ============================================================================

/// Returns its `text` argument together with its length in characters
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Repeat the given text back to the caller."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to repeat"}
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        match arguments.get("text").and_then(Value::as_str) {
            Some(text) => ToolExecutionResult::success(serde_json::json!({
                "text": text,
                "chars": text.chars().count()
            })),
            None => ToolExecutionResult::tool_error("missing string argument `text`"),
        }
    }
}

enum Failure {
    Visible(String),
    Hidden(String),
}

/// Fails every invocation, either visibly or internally
pub struct FailingTool {
    name: String,
    failure: Failure,
}

impl FailingTool {
    /// Fail with `message` shown to the model
    pub fn with_tool_error(message: impl Into<String>) -> Self {
        Self {
            name: "always_fails".to_string(),
            failure: Failure::Visible(message.into()),
        }
    }

    /// Fail with `message` kept out of the model's view
    pub fn with_internal_error(message: impl Into<String>) -> Self {
        Self {
            name: "always_fails".to_string(),
            failure: Failure::Hidden(message.into()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Fails on every call."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value) -> ToolExecutionResult {
        match &self.failure {
            Failure::Visible(message) => ToolExecutionResult::tool_error(message.clone()),
            Failure::Hidden(message) => ToolExecutionResult::internal_error_msg(message.clone()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
