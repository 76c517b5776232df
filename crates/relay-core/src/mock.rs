// Scripted generation backend for tests and examples
//
// Responses are queued per model and consumed in order. When a model's queue
// is empty its default response is used, and without a default the stream
// simply completes. Every request is recorded.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{ActorError, Result};
use crate::llm::{FuncCall, GenerationEvent, GenerationStream, Generator, ModelContext, ToolSchema, Usage};
use crate::message::ToolCall;

/// A mock generation response
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    /// Text deltas, emitted in order
    pub chunks: Vec<String>,
    /// Tool calls, emitted after the text
    pub tool_calls: Vec<ToolCall>,
    /// Wait before the first event
    pub delay: Option<Duration>,
    /// Wait before the stream is handed out at all
    pub open_delay: Option<Duration>,
    /// Never complete after the scripted events
    pub hang: bool,
    /// Fail the stream after the scripted events
    pub error: Option<String>,
}

impl MockResponse {
    /// Create a text-only response
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            chunks: vec![text.into()],
            ..Default::default()
        }
    }

    /// Create a text response split into several deltas
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Create a response with a single tool call
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            tool_calls: vec![ToolCall::new(id, name, arguments)],
            ..Default::default()
        }
    }

    /// Create a stream that emits nothing and never completes
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    /// Create a stream that fails
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make `generate_stream` itself slow, as with a backend that takes a
    /// while to accept the request
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn with_hang(mut self) -> Self {
        self.hang = true;
        self
    }

    fn into_stream(self) -> GenerationStream {
        let mut events: Vec<Result<GenerationEvent>> = self
            .chunks
            .into_iter()
            .map(|text| Ok(GenerationEvent::TextDelta(text)))
            .collect();
        events.extend(
            self.tool_calls
                .into_iter()
                .map(|call| Ok(GenerationEvent::ToolCall(call))),
        );
        match self.error {
            Some(message) => events.push(Err(ActorError::generation(message))),
            None if !self.hang => events.push(Ok(GenerationEvent::Done(Usage::default()))),
            None => {}
        }

        let mut scripted: GenerationStream = Box::pin(stream::iter(events));
        if self.hang {
            scripted = Box::pin(scripted.chain(stream::pending()));
        }
        if let Some(delay) = self.delay {
            let wait = stream::once(tokio::time::sleep(delay))
                .filter_map(|_| futures::future::ready(None::<Result<GenerationEvent>>));
            scripted = Box::pin(wait.chain(scripted));
        }
        scripted
    }
}

/// One recorded generation request
#[derive(Debug, Clone)]
pub struct MockCall {
    pub model: String,
    pub context: ModelContext,
}

/// Mock generator for testing
///
/// Returns scripted responses per model.
#[derive(Debug, Default)]
pub struct MockGenerator {
    responses: RwLock<HashMap<String, VecDeque<MockResponse>>>,
    defaults: RwLock<HashMap<String, MockResponse>>,
    call_log: RwLock<Vec<MockCall>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `model`
    pub async fn push(&self, model: impl Into<String>, response: MockResponse) {
        self.responses
            .write()
            .await
            .entry(model.into())
            .or_default()
            .push_back(response);
    }

    /// Queue several responses for `model`
    pub async fn push_all(&self, model: impl Into<String>, responses: impl IntoIterator<Item = MockResponse>) {
        self.responses
            .write()
            .await
            .entry(model.into())
            .or_default()
            .extend(responses);
    }

    /// Response used for `model` once its queue is empty
    pub async fn set_default(&self, model: impl Into<String>, response: MockResponse) {
        self.defaults.write().await.insert(model.into(), response);
    }

    /// Get the call log
    pub async fn calls(&self) -> Vec<MockCall> {
        self.call_log.read().await.clone()
    }

    /// Calls made for one model
    pub async fn calls_for(&self, model: &str) -> Vec<MockCall> {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|call| call.model == model)
            .cloned()
            .collect()
    }

    pub async fn call_count(&self, model: &str) -> usize {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|call| call.model == model)
            .count()
    }

    async fn next_response(&self, model: &str, context: &ModelContext) -> MockResponse {
        self.call_log.write().await.push(MockCall {
            model: model.to_string(),
            context: context.clone(),
        });

        if let Some(response) = self
            .responses
            .write()
            .await
            .get_mut(model)
            .and_then(VecDeque::pop_front)
        {
            return response;
        }
        self.defaults
            .read()
            .await
            .get(model)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate_stream(&self, model: &str, context: &ModelContext) -> Result<GenerationStream> {
        let response = self.next_response(model, context).await;
        if let Some(delay) = response.open_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(response.into_stream())
    }

    async fn invoke(
        &self,
        model: &str,
        context: &ModelContext,
        tool: &ToolSchema,
    ) -> Result<(Usage, FuncCall)> {
        let response = self.next_response(model, context).await;
        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = response.error {
            return Err(ActorError::generation(message));
        }

        let call = match response.tool_calls.into_iter().next() {
            Some(call) => FuncCall {
                name: call.name,
                arguments: call.arguments,
            },
            None => FuncCall {
                name: tool.name.clone(),
                arguments: response.chunks.concat(),
            },
        };
        Ok((Usage::default(), call))
    }
}
