//! Bridge adapter: wraps a non-streaming `CompletionProvider` into a
//! `ToolAwareLlmProvider`.
//!
//! Backends that only offer request/response completion still have to look
//! like a stream to the agentic loop. The bridge replays the completed
//! response as the same event sequence a streaming backend would produce.

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::provider::{BackendRequest, EventStream, LlmError, ToolAwareLlmProvider};
use crate::stream::{StopReason, StreamEvent};

/// A tool call as returned by a non-streaming backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Token counts and cost of one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Full response of a non-streaming backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: Option<String>,
    pub tool_calls: Vec<CompletedToolCall>,
    pub usage: Option<Usage>,
}

/// Minimal non-streaming LLM provider trait.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: BackendRequest) -> Result<Completion, LlmError>;
}

/// Wraps a `CompletionProvider` into a `ToolAwareLlmProvider`.
pub struct LlmProviderBridge {
    inner: Box<dyn CompletionProvider>,
    name: String,
}

impl LlmProviderBridge {
    pub fn new(inner: Box<dyn CompletionProvider>, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }
}

/// Events a streaming backend would have produced for `completion`.
pub fn completion_events(completion: Completion) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if let Some(text) = completion.text.filter(|t| !t.is_empty()) {
        events.push(StreamEvent::TextDelta { text });
    }
    let stop_reason = if completion.tool_calls.is_empty() {
        StopReason::EndTurn
    } else {
        StopReason::ToolUse
    };
    for call in completion.tool_calls {
        events.push(StreamEvent::ToolCallStart {
            id: call.id.clone(),
            name: call.name,
        });
        events.push(StreamEvent::ToolCallDelta {
            id: call.id.clone(),
            arguments_delta: call.arguments.to_string(),
        });
        events.push(StreamEvent::ToolCallEnd { id: call.id });
    }
    if let Some(usage) = completion.usage {
        events.push(StreamEvent::Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: usage.cost,
        });
    }
    events.push(StreamEvent::MessageEnd { stop_reason });
    events
}

#[async_trait]
impl ToolAwareLlmProvider for LlmProviderBridge {
    async fn stream_with_tools(&self, request: BackendRequest) -> Result<EventStream, LlmError> {
        let completion = self.inner.complete(request).await?;
        let events = completion_events(completion);
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}
