use crate::conversation::ConversationMessage;
use crate::stream::StreamEvent;
use crate::tool::ToolDefinition;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Stream of events for one model response.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Everything a backend needs for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub messages: Vec<ConversationMessage>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Trait for LLM providers that support tool use and streaming.
///
/// This trait lives in tool-runtime because it's defined by the consumer
/// (the agentic loop), not the provider. Vendor adapters implement it.
#[async_trait]
pub trait ToolAwareLlmProvider: Send + Sync {
    /// Stream a response from the LLM with tool definitions available.
    async fn stream_with_tools(&self, request: BackendRequest) -> Result<EventStream, LlmError>;

    /// Non-streaming convenience: collects the full response.
    async fn complete_with_tools(&self, request: BackendRequest) -> Result<Vec<StreamEvent>, LlmError> {
        use futures::StreamExt;
        let stream = self.stream_with_tools(request).await?;
        let events: Vec<_> = stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Provider name for logging/debugging (e.g., "claude", "openai", "ollama")
    fn provider_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Authentication failed")]
    AuthError,
    #[error("Stream error: {message}")]
    StreamError { message: String, recoverable: bool },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::NetworkError(_) | LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => matches!(status, 408 | 429 | 500..=599),
            LlmError::StreamError { recoverable, .. } => *recoverable,
            LlmError::InvalidResponse(_) | LlmError::AuthError | LlmError::Other(_) => false,
        }
    }

    /// Delay requested by the server, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

/// Mock LLM provider for testing the agentic loop without real API calls.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::stream::StopReason;
    use futures::{stream, StreamExt};
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::{Mutex, PoisonError};

    enum Scripted {
        Stream {
            events: Vec<Result<StreamEvent, LlmError>>,
            delay: Option<Duration>,
        },
        Fail(LlmError),
    }

    /// A mock provider that replays queued responses in order.
    ///
    /// Once the script is exhausted every call answers with an empty
    /// `EndTurn` message. Every request is recorded.
    #[derive(Default)]
    pub struct MockLlmProvider {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<BackendRequest>>,
    }

    impl MockLlmProvider {
        pub fn new() -> Self {
            Self::default()
        }

        fn push(&self, entry: Scripted) {
            self.script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(entry);
        }

        /// Queue a response that will be returned on the next call.
        pub fn queue_response(&self, events: Vec<StreamEvent>) {
            self.push(Scripted::Stream {
                events: events.into_iter().map(Ok).collect(),
                delay: None,
            });
        }

        /// Queue a response whose events each arrive after `delay`.
        pub fn queue_delayed(&self, events: Vec<StreamEvent>, delay: Duration) {
            self.push(Scripted::Stream {
                events: events.into_iter().map(Ok).collect(),
                delay: Some(delay),
            });
        }

        /// Queue a simple text response.
        pub fn queue_text(&self, text: &str) {
            self.queue_response(text_events(text));
        }

        /// Queue a response requesting the given `(id, name, arguments)` calls.
        pub fn queue_tool_calls(&self, calls: Vec<(&str, &str, Value)>) {
            self.queue_response(tool_call_events(calls));
        }

        /// The next call fails before streaming anything.
        pub fn queue_error(&self, error: LlmError) {
            self.push(Scripted::Fail(error));
        }

        /// The next stream yields `partial` text and then fails.
        pub fn queue_stream_failure(&self, partial: &str, error: LlmError) {
            self.push(Scripted::Stream {
                events: vec![
                    Ok(StreamEvent::TextDelta {
                        text: partial.to_string(),
                    }),
                    Err(error),
                ],
                delay: None,
            });
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        pub fn requests(&self) -> Vec<BackendRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    pub fn text_events(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta {
                text: text.to_string(),
            },
            StreamEvent::MessageEnd {
                stop_reason: StopReason::EndTurn,
            },
        ]
    }

    pub fn tool_call_events(calls: Vec<(&str, &str, Value)>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for (id, name, args) in calls {
            events.push(StreamEvent::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            });
            events.push(StreamEvent::ToolCallDelta {
                id: id.to_string(),
                arguments_delta: args.to_string(),
            });
            events.push(StreamEvent::ToolCallEnd { id: id.to_string() });
        }
        events.push(StreamEvent::MessageEnd {
            stop_reason: StopReason::ToolUse,
        });
        events
    }

    #[async_trait]
    impl ToolAwareLlmProvider for MockLlmProvider {
        async fn stream_with_tools(&self, request: BackendRequest) -> Result<EventStream, LlmError> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            let next = self
                .script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(Scripted::Fail(error)) => Err(error),
                Some(Scripted::Stream {
                    events,
                    delay: Some(delay),
                }) => Ok(Box::pin(stream::iter(events).then(move |event| async move {
                    tokio::time::sleep(delay).await;
                    event
                }))),
                Some(Scripted::Stream { events, delay: None }) => Ok(Box::pin(stream::iter(events))),
                None => Ok(Box::pin(stream::iter(vec![Ok(StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndTurn,
                })]))),
            }
        }

        fn provider_name(&self) -> &str {
            "mock"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockLlmProvider;
    use super::*;

    fn request() -> BackendRequest {
        BackendRequest {
            messages: vec![ConversationMessage::User("hi".to_string())],
            system_prompt: None,
            tools: vec![],
            temperature: 0.0,
            max_tokens: 256,
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::NetworkError("reset".into()).is_transient());
        assert!(LlmError::RateLimited { retry_after_secs: 2 }.is_transient());
        assert!(LlmError::ApiError { status: 503, message: "busy".into() }.is_transient());
        assert!(LlmError::ApiError { status: 429, message: "slow down".into() }.is_transient());
        assert!(!LlmError::ApiError { status: 400, message: "bad".into() }.is_transient());
        assert!(!LlmError::AuthError.is_transient());
        assert!(LlmError::StreamError { message: "cut".into(), recoverable: true }.is_transient());
        assert!(!LlmError::StreamError { message: "bad".into(), recoverable: false }.is_transient());
    }

    #[test]
    fn test_retry_after() {
        let err = LlmError::RateLimited { retry_after_secs: 7 };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(LlmError::AuthError.retry_after(), None);
    }

    #[tokio::test]
    async fn test_mock_replays_in_order_and_records() {
        let mock = MockLlmProvider::new();
        mock.queue_text("first");
        mock.queue_text("second");

        let first = mock.complete_with_tools(request()).await.unwrap();
        let second = mock.complete_with_tools(request()).await.unwrap();
        assert_eq!(first[0], StreamEvent::TextDelta { text: "first".into() });
        assert_eq!(second[0], StreamEvent::TextDelta { text: "second".into() });
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requests()[0].max_tokens, 256);
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let mock = MockLlmProvider::new();
        mock.queue_error(LlmError::AuthError);
        assert!(matches!(
            mock.stream_with_tools(request()).await,
            Err(LlmError::AuthError)
        ));
    }
}
