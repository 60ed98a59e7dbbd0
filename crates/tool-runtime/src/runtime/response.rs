//! Consuming one model response: stream events in, assistant message out.

use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::AgentEvent;
use crate::provider::{BackendRequest, LlmError, ToolAwareLlmProvider};
use crate::retry::{wait_backoff, RetryPolicy};
use crate::stream::{StopReason, StreamEvent};
use crate::tool::ToolCall;
use crate::turn::TurnCounters;

use super::TurnContext;

/// A tool call assembled from the stream.
#[derive(Debug, Clone)]
pub(crate) struct RequestedCall {
    pub call: ToolCall,
    /// Set when the arguments were not valid JSON
    pub parse_error: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct ModelResponse {
    pub text: Option<String>,
    pub calls: Vec<RequestedCall>,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug)]
pub(crate) enum ResponseError {
    Cancelled,
    Backend(LlmError),
    Protocol(String),
}

struct PendingCall {
    name: String,
    arguments: String,
    finished: bool,
}

/// Assembles tool calls from id-keyed, possibly interleaved deltas.
#[derive(Default)]
struct CallAssembler {
    order: Vec<String>,
    pending: HashMap<String, PendingCall>,
}

impl CallAssembler {
    fn start(&mut self, id: String, name: String) -> Result<(), ResponseError> {
        if self.pending.contains_key(&id) {
            return Err(ResponseError::Protocol(format!(
                "model response reused tool call id '{}'",
                id
            )));
        }
        self.order.push(id.clone());
        self.pending.insert(
            id,
            PendingCall {
                name,
                arguments: String::new(),
                finished: false,
            },
        );
        Ok(())
    }

    fn delta(&mut self, id: &str, fragment: &str) -> Result<(), ResponseError> {
        match self.pending.get_mut(id) {
            Some(call) if !call.finished => {
                call.arguments.push_str(fragment);
                Ok(())
            }
            Some(_) => Err(ResponseError::Protocol(format!(
                "arguments for tool call '{}' arrived after it ended",
                id
            ))),
            None => Err(ResponseError::Protocol(format!(
                "arguments for unknown tool call '{}'",
                id
            ))),
        }
    }

    fn end(&mut self, id: &str) -> Result<(), ResponseError> {
        match self.pending.get_mut(id) {
            Some(call) => {
                call.finished = true;
                Ok(())
            }
            None => Err(ResponseError::Protocol(format!("end of unknown tool call '{}'", id))),
        }
    }

    fn finish(mut self) -> Vec<RequestedCall> {
        let mut calls = Vec::with_capacity(self.order.len());
        for id in self.order {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            if !pending.finished {
                warn!(call_id = %id, tool = %pending.name, "tool call not terminated before end of response");
            }
            let raw = pending.arguments.trim();
            let (input, parse_error) = if raw.is_empty() {
                (Value::Object(Default::default()), None)
            } else {
                match serde_json::from_str::<Value>(raw) {
                    Ok(value) => (value, None),
                    Err(e) => (Value::String(pending.arguments.clone()), Some(e.to_string())),
                }
            };
            calls.push(RequestedCall {
                call: ToolCall {
                    id,
                    name: pending.name,
                    input,
                    message_id: String::new(),
                },
                parse_error,
            });
        }
        calls
    }
}

/// Run one logical model call, retrying transient failures.
pub(crate) async fn stream_response(
    provider: &dyn ToolAwareLlmProvider,
    request: BackendRequest,
    retry: &RetryPolicy,
    counters: &mut TurnCounters,
    ctx: &TurnContext,
    cancel: &CancellationToken,
) -> Result<ModelResponse, ResponseError> {
    let mut retries = 0u32;
    loop {
        match stream_once(provider, request.clone(), counters, ctx, cancel).await {
            Ok(response) => return Ok(response),
            Err(ResponseError::Backend(error)) if retry.should_retry(retries, &error) => {
                retries += 1;
                let delay = retry.backoff(retries, &error);
                warn!(
                    provider = provider.provider_name(),
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient backend failure, retrying"
                );
                ctx.emit(AgentEvent::BackendRetry {
                    attempt: retries,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                });
                if wait_backoff(delay, cancel).await {
                    return Err(ResponseError::Cancelled);
                }
            }
            Err(other) => return Err(other),
        }
    }
}

async fn stream_once(
    provider: &dyn ToolAwareLlmProvider,
    request: BackendRequest,
    counters: &mut TurnCounters,
    ctx: &TurnContext,
    cancel: &CancellationToken,
) -> Result<ModelResponse, ResponseError> {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ResponseError::Cancelled),
        result = provider.stream_with_tools(request) => result.map_err(ResponseError::Backend)?,
    };

    let mut text = String::new();
    let mut calls = CallAssembler::default();
    let mut stop_reason = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResponseError::Cancelled),
            next = stream.next() => next,
        };
        let Some(event) = next else {
            break;
        };
        match event.map_err(ResponseError::Backend)? {
            StreamEvent::TextDelta { text: delta } => {
                text.push_str(&delta);
                ctx.emit(AgentEvent::TextDelta { text: delta });
            }
            StreamEvent::ToolCallStart { id, name } => calls.start(id, name)?,
            StreamEvent::ToolCallDelta { id, arguments_delta } => calls.delta(&id, &arguments_delta)?,
            StreamEvent::ToolCallEnd { id } => calls.end(&id)?,
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
                cost,
            } => {
                debug!(input_tokens, output_tokens, cost, "backend usage");
                counters.add_cost(cost);
            }
            StreamEvent::MessageEnd { stop_reason: reason } => {
                stop_reason = Some(reason);
                break;
            }
            StreamEvent::Error { message, recoverable } => {
                return Err(ResponseError::Backend(LlmError::StreamError { message, recoverable }));
            }
        }
    }

    Ok(ModelResponse {
        text: if text.is_empty() { None } else { Some(text) },
        calls: calls.finish(),
        stop_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_calls_assemble_by_id() {
        let mut asm = CallAssembler::default();
        asm.start("a".into(), "read_file".into()).unwrap();
        asm.start("b".into(), "read_file".into()).unwrap();
        asm.delta("a", r#"{"path":"#).unwrap();
        asm.delta("b", r#"{"path":"b"}"#).unwrap();
        asm.delta("a", r#""a"}"#).unwrap();
        asm.end("b").unwrap();
        asm.end("a").unwrap();

        let calls = asm.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call.id, "a");
        assert_eq!(calls[0].call.input["path"], "a");
        assert_eq!(calls[1].call.input["path"], "b");
    }

    #[test]
    fn test_empty_arguments_mean_empty_object() {
        let mut asm = CallAssembler::default();
        asm.start("a".into(), "list_dir".into()).unwrap();
        asm.end("a").unwrap();
        let calls = asm.finish();
        assert_eq!(calls[0].call.input, serde_json::json!({}));
        assert!(calls[0].parse_error.is_none());
    }

    #[test]
    fn test_bad_json_recorded_not_fatal() {
        let mut asm = CallAssembler::default();
        asm.start("a".into(), "bash".into()).unwrap();
        asm.delta("a", "{not json").unwrap();
        asm.end("a").unwrap();
        let calls = asm.finish();
        assert!(calls[0].parse_error.is_some());
    }

    #[test]
    fn test_protocol_violations() {
        let mut asm = CallAssembler::default();
        asm.start("a".into(), "bash".into()).unwrap();
        assert!(matches!(asm.start("a".into(), "bash".into()), Err(ResponseError::Protocol(_))));
        assert!(matches!(asm.delta("zz", "{}"), Err(ResponseError::Protocol(_))));
        asm.end("a").unwrap();
        assert!(matches!(asm.delta("a", "{}"), Err(ResponseError::Protocol(_))));
    }
}
