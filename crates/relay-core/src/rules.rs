// Rule-based intent classification
//
// A Rule describes one intent (patterns with `[var]` placeholders, typed
// variables, examples). `Matcher::compile` turns a rule set into a single
// classification prompt; `Matcher::classify` runs it through a generator and
// parses the reply, one `rule_name: key=value, key=value` line per match.

use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use crate::error::{ActorError, Result};
use crate::llm::{GenerationEvent, Generator, ModelContext, Prompt};
use crate::message::Message;

/// Reply line meaning "no rule matched"
pub const NO_MATCH: &str = "NONE";

const PLACEHOLDER: &str = r"\[(\w+)\]";

fn placeholder_re() -> Result<Regex> {
    Regex::new(PLACEHOLDER).map_err(|e| ActorError::config(e.to_string()))
}

// ============================================================================
// Rule model
// ============================================================================

/// Variable type, used to type extracted argument values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    #[default]
    String,
    Int,
    Float,
    Bool,
}

/// A rule variable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Var {
    /// Human-readable label shown to the model in place of `[name]`
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub var_type: VarType,
}

/// A pattern: `"play [title]"` or `["play [title]", "play_song: title=[title]"]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PatternRepr", into = "PatternRepr")]
pub struct Pattern {
    pub input: String,
    /// Expected reply line; derived from the input when empty
    pub output: String,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PatternRepr {
    Input(String),
    Pair(Vec<String>),
}

impl TryFrom<PatternRepr> for Pattern {
    type Error = String;

    fn try_from(repr: PatternRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PatternRepr::Input(input) => Ok(Pattern {
                input,
                output: String::new(),
            }),
            PatternRepr::Pair(mut parts) => match parts.len() {
                1 | 2 => {
                    let output = if parts.len() == 2 {
                        parts.remove(1)
                    } else {
                        String::new()
                    };
                    Ok(Pattern {
                        input: parts.remove(0),
                        output,
                    })
                }
                n => Err(format!("invalid pattern array length: {}", n)),
            },
        }
    }
}

impl From<Pattern> for PatternRepr {
    fn from(p: Pattern) -> Self {
        if p.output.is_empty() {
            PatternRepr::Input(p.input)
        } else {
            PatternRepr::Pair(vec![p.input, p.output])
        }
    }
}

/// An example: `[subject]`, `[subject, user_text]` or `[subject, user_text, formatted_to]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Example {
    pub subject: String,
    pub user_text: String,
    pub formatted_to: String,
}

impl TryFrom<Vec<String>> for Example {
    type Error = String;

    fn try_from(parts: Vec<String>) -> std::result::Result<Self, Self::Error> {
        if parts.is_empty() || parts.len() > 3 {
            return Err(format!(
                "invalid example array length: {} (expected 1-3)",
                parts.len()
            ));
        }
        let mut it = parts.into_iter();
        Ok(Example {
            subject: it.next().unwrap_or_default(),
            user_text: it.next().unwrap_or_default(),
            formatted_to: it.next().unwrap_or_default(),
        })
    }
}

impl From<Example> for Vec<String> {
    fn from(e: Example) -> Self {
        let mut parts = vec![e.subject];
        if !e.user_text.is_empty() {
            parts.push(e.user_text);
        }
        if !e.formatted_to.is_empty() {
            parts.push(e.formatted_to);
        }
        parts
    }
}

/// One classifiable intent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,

    /// Background facts shared with the classifier
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, Var>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<Pattern>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Example>,
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a pattern whose reply line is derived from the input
    pub fn with_pattern(mut self, input: impl Into<String>) -> Self {
        self.patterns.push(Pattern {
            input: input.into(),
            output: String::new(),
        });
        self
    }

    /// Add a variable
    pub fn with_var(mut self, name: impl Into<String>, label: impl Into<String>, var_type: VarType) -> Self {
        self.vars.insert(
            name.into(),
            Var {
                label: label.into(),
                var_type,
            },
        );
        self
    }

    fn validate(&self, placeholder: &Regex) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() || name.contains([':', '\n', '\r']) || name == NO_MATCH {
            return Err(ActorError::config(format!("rule {:?}: invalid name", self.name)));
        }
        for (var_name, var) in &self.vars {
            if var.label.contains(['[', ']']) {
                return Err(ActorError::config(format!(
                    "rule {:?}: var {:?} label must not contain '[' or ']'",
                    self.name, var_name
                )));
            }
        }
        for (i, p) in self.patterns.iter().enumerate() {
            if p.input.contains(['\r', '\n']) || p.output.contains(['\r', '\n']) {
                return Err(ActorError::config(format!(
                    "rule {:?}: pattern[{}] contains newline",
                    self.name, i
                )));
            }
            for cap in placeholder.captures_iter(&p.input) {
                if !self.vars.contains_key(&cap[1]) {
                    return Err(ActorError::config(format!(
                        "rule {:?}: pattern[{}] has placeholder [{}] not defined in vars",
                        self.name, i, &cap[1]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve a pattern into the (input, reply line) pair shown to the model.
    /// `play [title]` with label "song title" becomes
    /// `play [song title]` => `play_song: title=[song title]`.
    fn expand(&self, pattern: &Pattern, placeholder: &Regex) -> (String, String) {
        if !pattern.output.is_empty() {
            return (pattern.input.clone(), pattern.output.clone());
        }
        if pattern.input.is_empty() {
            return (String::new(), self.name.clone());
        }

        let mut assignments = Vec::new();
        let expanded = placeholder.replace_all(&pattern.input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match self.vars.get(var_name) {
                Some(var) if !var.label.is_empty() => {
                    let label = format!("[{}]", var.label);
                    assignments.push(format!("{}={}", var_name, label));
                    label
                }
                _ => caps[0].to_string(),
            }
        });

        if assignments.is_empty() {
            (expanded.into_owned(), self.name.clone())
        } else {
            (
                expanded.into_owned(),
                format!("{}: {}", self.name, assignments.join(", ")),
            )
        }
    }
}

// ============================================================================
// Matcher
// ============================================================================

/// One classification hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule: String,
    /// Extracted arguments, typed by the variable declaration
    pub args: BTreeMap<String, Value>,
}

/// Compiled rule set
#[derive(Debug, Clone)]
pub struct Matcher {
    system_prompt: String,
    specs: HashMap<String, BTreeMap<String, Var>>,
}

impl Matcher {
    /// Validate the rules and build the classification prompt
    pub fn compile(rules: &[Rule]) -> Result<Self> {
        let placeholder = placeholder_re()?;
        let mut specs = HashMap::new();
        let mut references = BTreeMap::new();
        let mut prompt = String::from(
            "Classify the user's input against the rules below.\n\
             Reply with one line per matching rule, most relevant first, in the form\n\
             `rule_name: key=value, key=value` (omit the colon when there are no values).\n\
             Reply with NONE when no rule matches. Do not add any other text.\n\n## Rules\n",
        );

        for rule in rules {
            rule.validate(&placeholder)?;
            if specs.insert(rule.name.clone(), rule.vars.clone()).is_some() {
                return Err(ActorError::config(format!("duplicate rule {:?}", rule.name)));
            }
            references.extend(rule.references.clone());

            let _ = writeln!(prompt, "\n### {}", rule.name);
            for pattern in &rule.patterns {
                let (input, output) = rule.expand(pattern, &placeholder);
                let _ = writeln!(prompt, "- \"{}\" => {}", input, output);
            }
            for example in &rule.examples {
                match (example.user_text.is_empty(), example.formatted_to.is_empty()) {
                    (true, _) => {
                        let _ = writeln!(prompt, "- example: {}", example.subject);
                    }
                    (false, true) => {
                        let _ = writeln!(
                            prompt,
                            "- example ({}): \"{}\"",
                            example.subject, example.user_text
                        );
                    }
                    (false, false) => {
                        let _ = writeln!(
                            prompt,
                            "- example ({}): \"{}\" => {}",
                            example.subject, example.user_text, example.formatted_to
                        );
                    }
                }
            }
        }

        if !references.is_empty() {
            prompt.push_str("\n## References\n");
            for (key, value) in &references {
                let _ = writeln!(prompt, "- {}: {}", key, value);
            }
        }

        Ok(Self {
            system_prompt: prompt,
            specs,
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Classify `input` with `model`. Lines naming unknown rules (including
    /// `NONE`) are ignored, so an empty result means no match.
    pub async fn classify<G>(&self, generator: &G, model: &str, input: &str) -> Result<Vec<RuleMatch>>
    where
        G: Generator + ?Sized,
    {
        let context = ModelContext::new()
            .with_prompt(Prompt::new("system", self.system_prompt.clone()))
            .with_message(Message::user(input));

        let mut stream = generator.generate_stream(model, &context).await?;
        let mut results = Vec::new();
        let mut pending = String::new();

        while let Some(item) = stream.next().await {
            match item? {
                GenerationEvent::TextDelta(text) => {
                    pending.push_str(&text);
                    while let Some(i) = pending.find('\n') {
                        let line: String = pending.drain(..=i).collect();
                        results.extend(self.parse_line(&line));
                    }
                }
                GenerationEvent::ToolCall(_) => {}
                GenerationEvent::Done(_) => break,
            }
        }
        results.extend(self.parse_line(&pending));
        Ok(results)
    }

    /// Parse one reply line
    pub fn parse_line(&self, line: &str) -> Option<RuleMatch> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (name, kv) = match line.split_once(':') {
            Some((name, kv)) => (name.trim(), kv.trim()),
            None => (line, ""),
        };
        let vars = self.specs.get(name)?;

        let mut args = BTreeMap::new();
        for part in kv.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            let Some(var) = vars.get(key) else {
                continue;
            };
            args.insert(key.to_string(), typed_value(var.var_type, value));
        }

        Some(RuleMatch {
            rule: name.to_string(),
            args,
        })
    }
}

fn typed_value(var_type: VarType, raw: &str) -> Value {
    let parsed = match var_type {
        VarType::String => None,
        VarType::Int => raw.parse::<i64>().ok().map(Value::from),
        VarType::Float => raw.parse::<f64>().ok().map(Value::from),
        VarType::Bool => raw.parse::<bool>().ok().map(Value::from),
    };
    parsed.unwrap_or_else(|| Value::String(raw.to_string()))
}
