// Declarative actor definitions
//
// An ActorDefinition says what an actor is (prompt, context layers, model,
// tools or routing rules); the actors in this crate turn one into a live,
// event-emitting conversation. Definitions are plain serde data so they can
// be loaded from any document format by the embedding application.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ActorError, Result};
use crate::rules::Rule;

/// The two actor kinds. Persisted state records this as its discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Reasoning,
    Routing,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Reasoning => "reasoning",
            ActorKind::Routing => "routing",
        }
    }
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Actor definitions
// ============================================================================

/// Definition of either actor kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActorDefinition {
    Reasoning(ReasoningDefinition),
    Routing(RoutingDefinition),
}

impl ActorDefinition {
    pub fn name(&self) -> &str {
        match self {
            ActorDefinition::Reasoning(def) => &def.name,
            ActorDefinition::Routing(def) => &def.name,
        }
    }

    pub fn kind(&self) -> ActorKind {
        match self {
            ActorDefinition::Reasoning(_) => ActorKind::Reasoning,
            ActorDefinition::Routing(_) => ActorKind::Routing,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ActorDefinition::Reasoning(def) => def.validate(),
            ActorDefinition::Routing(def) => def.validate(),
        }
    }
}

impl From<ReasoningDefinition> for ActorDefinition {
    fn from(def: ReasoningDefinition) -> Self {
        ActorDefinition::Reasoning(def)
    }
}

impl From<RoutingDefinition> for ActorDefinition {
    fn from(def: RoutingDefinition) -> Self {
        ActorDefinition::Routing(def)
    }
}

/// Generation backend selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorRef {
    #[serde(default)]
    pub model: String,
}

/// A reasoning-and-acting actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningDefinition {
    pub name: String,

    /// Used as the system prompt when no context layers are declared,
    /// and as `$this: .prompt` otherwise
    #[serde(default)]
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_layers: Vec<ContextLayer>,

    #[serde(default)]
    pub generator: GeneratorRef,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolRef>,
}

impl ReasoningDefinition {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: String::new(),
            context_layers: Vec::new(),
            generator: GeneratorRef {
                model: model.into(),
            },
            tools: Vec::new(),
        }
    }

    /// Set the prompt
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Add a context layer
    pub fn with_layer(mut self, layer: ContextLayer) -> Self {
        self.context_layers.push(layer);
        self
    }

    /// Add a tool
    pub fn with_tool(mut self, tool: ToolRef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ActorError::config("reasoning actor: name is required"));
        }
        for tool in &self.tools {
            tool.validate()?;
        }
        Ok(())
    }
}

/// A rule-based routing actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDefinition {
    pub name: String,

    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub generator: GeneratorRef,

    pub rules: Vec<RuleRef>,

    #[serde(default)]
    pub routes: Vec<Route>,
}

impl RoutingDefinition {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: String::new(),
            generator: GeneratorRef {
                model: model.into(),
            },
            rules: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Add a rule
    pub fn with_rule(mut self, rule: RuleRef) -> Self {
        self.rules.push(rule);
        self
    }

    /// Route the given rule names to a delegate
    pub fn with_route<I, S>(mut self, rules: I, agent: DelegateRef) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.push(Route {
            rules: rules.into_iter().map(Into::into).collect(),
            agent,
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ActorError::config("routing actor: name is required"));
        }
        if self.generator.model.trim().is_empty() {
            return Err(ActorError::config(format!(
                "routing actor {}: generator.model is required",
                self.name
            )));
        }
        if self.rules.is_empty() {
            return Err(ActorError::config(format!(
                "routing actor {}: at least one rule is required",
                self.name
            )));
        }
        for (i, route) in self.routes.iter().enumerate() {
            if route.rules.is_empty() {
                return Err(ActorError::config(format!(
                    "routing actor {}: route[{}] has no rules",
                    self.name, i
                )));
            }
            if let DelegateRef::Inline(def) = &route.agent {
                def.validate()?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// References
// ============================================================================

/// Tool reference: by name (`$ref`) or inline, optionally terminating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRef {
    #[serde(rename = "$ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolDefinition>,

    /// Invoking this tool marks the actor finished
    #[serde(default)]
    pub quit: bool,
}

impl ToolRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            reference: Some(name.into()),
            tool: None,
            quit: false,
        }
    }

    pub fn inline(def: ToolDefinition) -> Self {
        Self {
            reference: None,
            tool: Some(def),
            quit: false,
        }
    }

    /// Mark as a terminating tool
    pub fn quitting(mut self) -> Self {
        self.quit = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.reference, &self.tool) {
            (None, None) => Err(ActorError::config(
                "tool ref: neither $ref nor inline definition",
            )),
            (_, Some(def)) => def.validate(),
            _ => Ok(()),
        }
    }
}

/// How a tool is built from a declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolDefinition {
    /// A tool registered with the runtime under `name`
    Builtin { name: String },

    /// A nested generation call
    Generator {
        name: String,
        #[serde(default)]
        description: String,
        model: String,
        #[serde(default)]
        prompt: String,
        #[serde(default = "default_parameters")]
        parameters: Value,
    },

    /// Tools run in sequence, each step fed from the ones before it. The
    /// parameter schema is the first step's.
    Composite {
        name: String,
        #[serde(default)]
        description: String,
        steps: Vec<CompositeStep>,
    },
}

/// One step of a composite tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeStep {
    /// Key of this step's output under `steps` in later templates
    pub id: String,
    pub tool: ToolRef,
    /// Argument template for every step but the first. String leaves of the
    /// form `$<json pointer>` are looked up in `{"input": .., "steps": {..}}`.
    /// Without a template the step gets the previous step's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl CompositeStep {
    pub fn new(id: impl Into<String>, tool: ToolRef) -> Self {
        Self {
            id: id.into(),
            tool,
            input: None,
        }
    }

    pub fn with_input(mut self, template: Value) -> Self {
        self.input = Some(template);
        self
    }
}

fn default_parameters() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDefinition {
    pub fn name(&self) -> &str {
        match self {
            ToolDefinition::Builtin { name } => name,
            ToolDefinition::Generator { name, .. } => name,
            ToolDefinition::Composite { name, .. } => name,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ToolDefinition::Composite { name, steps, .. } = self else {
            return Ok(());
        };
        if steps.is_empty() {
            return Err(ActorError::config(format!(
                "composite tool {}: at least one step is required",
                name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for (i, step) in steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(ActorError::config(format!(
                    "composite tool {}: step {} has no id",
                    name, i
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ActorError::config(format!(
                    "composite tool {}: duplicate step id {}",
                    name, step.id
                )));
            }
            step.tool.validate()?;
            if step.tool.reference.as_deref() == Some(name.as_str()) {
                return Err(ActorError::config(format!(
                    "composite tool {}: step {} refers to the tool itself",
                    name, step.id
                )));
            }
        }
        Ok(())
    }
}

/// Rule reference: by name or inline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleRef {
    Ref {
        #[serde(rename = "$ref")]
        reference: String,
    },
    Inline(Rule),
}

impl RuleRef {
    pub fn named(name: impl Into<String>) -> Self {
        RuleRef::Ref {
            reference: name.into(),
        }
    }
}

/// Rules routed to one delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub rules: Vec<String>,
    pub agent: DelegateRef,
}

/// Delegate reference: by definition name or an inline reasoning definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelegateRef {
    Ref {
        #[serde(rename = "$ref")]
        reference: String,
    },
    Inline(Box<ReasoningDefinition>),
}

impl DelegateRef {
    pub fn named(name: impl Into<String>) -> Self {
        DelegateRef::Ref {
            reference: name.into(),
        }
    }

    pub fn inline(def: ReasoningDefinition) -> Self {
        DelegateRef::Inline(Box::new(def))
    }

    /// Display name of the delegate
    pub fn name(&self) -> &str {
        match self {
            DelegateRef::Ref { reference } => reference,
            DelegateRef::Inline(def) => &def.name,
        }
    }
}

// ============================================================================
// Context layers and memory
// ============================================================================

/// One source of prompt material for a reasoning actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContextLayer {
    /// Inline prompt text
    #[serde(rename = "prompt")]
    Prompt(String),
    /// A field of the owning definition: `.prompt` or `.name`
    #[serde(rename = "$this")]
    This(String),
    /// A context builder resolved through the runtime
    #[serde(rename = "$ref")]
    Ref(String),
    /// A process environment variable
    #[serde(rename = "$env")]
    Env(String),
    /// Memory options for the conversation history
    #[serde(rename = "$mem")]
    Memory(MemoryOptions),
}

/// How much history goes into each generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOptions {
    /// Number of most recent messages to include
    pub recent: usize,
    /// Include the stored summary as a prompt
    #[serde(default)]
    pub summary: bool,
}

impl MemoryOptions {
    pub fn recent(n: usize) -> Self {
        Self {
            recent: n,
            summary: false,
        }
    }
}
