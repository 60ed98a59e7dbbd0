//! The agent turn orchestrator.
//!
//! Flow per turn: User → [middleware → LLM → tool calls → gate → execute →
//! results]* → final text. The loop owns the conversation for the whole
//! turn and is its only writer.

mod dispatch;
mod response;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalTable, ApprovalToken};
use crate::config::{AgentPolicy, PolicyError};
use crate::conversation::{AssistantContent, Conversation};
use crate::event::AgentEvent;
use crate::middleware::MiddlewareChain;
use crate::permission::{ApprovalCache, PermissionGate};
use crate::provider::{BackendRequest, ToolAwareLlmProvider};
use crate::resolver::ResolvedTools;
use crate::turn::{AbortReason, TurnCounters, TurnOutcome, TurnState, TurnStatus};

use self::response::{stream_response, ResponseError};

/// Per-turn wiring between the loop and its consumer.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub events: mpsc::UnboundedSender<AgentEvent>,
    pub approvals: ApprovalTable,
    pub cancel: CancellationToken,
    pub working_directory: PathBuf,
}

impl TurnContext {
    pub fn new(working_directory: impl Into<PathBuf>) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: tx,
                approvals: ApprovalTable::new(),
                cancel: CancellationToken::new(),
                working_directory: working_directory.into(),
            },
            rx,
        )
    }

    /// Send an event. A consumer that went away is not an error.
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

/// A turn running on its own task.
pub struct TurnHandle {
    events: mpsc::UnboundedReceiver<AgentEvent>,
    approvals: ApprovalTable,
    cancel: CancellationToken,
    join: JoinHandle<(Conversation, TurnOutcome)>,
}

impl TurnHandle {
    /// Next event, `None` once the turn has finished and all events are read.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    pub fn approve(&self, token: ApprovalToken) -> bool {
        self.approvals.approve(token)
    }

    pub fn deny(&self, token: ApprovalToken) -> bool {
        self.approvals.deny(token)
    }

    pub fn approvals(&self) -> &ApprovalTable {
        &self.approvals
    }

    /// Request cooperative cancellation of the turn.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the turn and take the conversation back.
    pub async fn join(self) -> Result<(Conversation, TurnOutcome), tokio::task::JoinError> {
        self.join.await
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The core agentic loop that orchestrates LLM ↔ Tool execution.
pub struct AgenticLoop {
    provider: Arc<dyn ToolAwareLlmProvider>,
    tools: Arc<ResolvedTools>,
    policy: AgentPolicy,
    gate: PermissionGate,
    middleware: MiddlewareChain,
    working_directory: PathBuf,
}

impl AgenticLoop {
    pub fn new(
        provider: Arc<dyn ToolAwareLlmProvider>,
        tools: Arc<ResolvedTools>,
        policy: AgentPolicy,
    ) -> Result<Self, PolicyError> {
        policy.validate()?;
        let gate = PermissionGate::from_rules(&policy.permissions)?;
        let middleware = MiddlewareChain::from_policy(&policy);
        Ok(Self {
            provider,
            tools,
            policy,
            gate,
            middleware,
            working_directory: PathBuf::from("."),
        })
    }

    /// Replace the middleware chain built from the policy.
    pub fn with_middleware(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = chain;
        self
    }

    /// Working directory for turns started with [`AgenticLoop::start_turn`].
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn policy(&self) -> &AgentPolicy {
        &self.policy
    }

    pub fn tools(&self) -> &ResolvedTools {
        &self.tools
    }

    /// Spawn a turn. The conversation is handed back by [`TurnHandle::join`].
    pub fn start_turn(self: &Arc<Self>, mut conversation: Conversation, user_message: impl Into<String>) -> TurnHandle {
        let (ctx, events) = TurnContext::new(self.working_directory.clone());
        let approvals = ctx.approvals.clone();
        let cancel = ctx.cancel.clone();
        let this = Arc::clone(self);
        let message = user_message.into();
        let join = tokio::spawn(async move {
            let outcome = this.run_turn(&mut conversation, message, &ctx).await;
            (conversation, outcome)
        });
        TurnHandle {
            events,
            approvals,
            cancel,
            join,
        }
    }

    /// Drive one user turn to `Completed` or `Aborted`.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        user_message: impl Into<String>,
        ctx: &TurnContext,
    ) -> TurnOutcome {
        let turn = conversation.begin_turn(user_message);
        let mut state = TurnState::new();
        let mut counters = TurnCounters {
            turn,
            ..Default::default()
        };
        let mut approvals = ApprovalCache::new(self.gate.ask_every_time());
        // Call ids are scoped to the turn, not to one model response.
        let mut issued_ids: HashSet<String> = HashSet::new();
        ctx.emit(AgentEvent::TurnStarted { turn });
        info!(turn, provider = self.provider.provider_name(), "turn started");

        // The turn deadline is a cancellation with its own reason.
        let cancel = ctx.cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let _deadline = self.policy.timeouts.turn().map(|limit| {
            let cancel = cancel.clone();
            let timed_out = Arc::clone(&timed_out);
            AbortOnDrop(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            }))
        });
        let cancel_reason = || {
            if timed_out.load(Ordering::SeqCst) {
                AbortReason::TimedOut {
                    after_secs: self.policy.timeouts.turn_secs.unwrap_or_default(),
                }
            } else {
                AbortReason::Cancelled
            }
        };

        loop {
            if cancel.is_cancelled() {
                return self.abort(&mut state, counters, cancel_reason(), ctx);
            }

            let halt = self.middleware.run(conversation, &counters, |name, action| {
                ctx.emit(AgentEvent::MiddlewareApplied {
                    middleware: name.to_string(),
                    action,
                });
            });
            if let Some((middleware, reason)) = halt {
                let abort = if reason.kind.is_limit() {
                    AbortReason::LimitExceeded {
                        limit: reason.kind.to_string(),
                        message: reason.message,
                    }
                } else {
                    AbortReason::Halted {
                        middleware,
                        message: reason.message,
                    }
                };
                return self.abort(&mut state, counters, abort, ctx);
            }

            counters.model_calls += 1;
            debug!(turn, model_call = counters.model_calls, "calling model");
            let request = self.request_for(conversation);
            let streamed = stream_response(
                self.provider.as_ref(),
                request,
                &self.policy.retry,
                &mut counters,
                ctx,
                &cancel,
            )
            .await;
            let response = match streamed {
                Ok(response) => response,
                Err(ResponseError::Cancelled) => {
                    return self.abort(&mut state, counters, cancel_reason(), ctx);
                }
                Err(ResponseError::Backend(e)) => {
                    let reason = AbortReason::BackendFailure { message: e.to_string() };
                    return self.abort(&mut state, counters, reason, ctx);
                }
                Err(ResponseError::Protocol(message)) => {
                    return self.abort(&mut state, counters, AbortReason::ProtocolError { message }, ctx);
                }
            };

            if let Some(reused) = response.calls.iter().find(|c| issued_ids.contains(&c.call.id)) {
                let message = format!("tool call id '{}' was already used in this turn", reused.call.id);
                return self.abort(&mut state, counters, AbortReason::ProtocolError { message }, ctx);
            }
            issued_ids.extend(response.calls.iter().map(|c| c.call.id.clone()));

            let final_text = response.text.clone();
            let mut calls = response.calls;
            let message_id = conversation.add_assistant_response(AssistantContent {
                message_id: String::new(),
                text: response.text,
                tool_calls: calls.iter().map(|c| c.call.clone()).collect(),
            });

            if calls.is_empty() {
                debug!(turn, stop_reason = ?response.stop_reason, "model produced a final answer");
                return self.complete(&mut state, counters, final_text, ctx);
            }

            counters.tool_calls += calls.len() as u32;
            for requested in &mut calls {
                requested.call.message_id = message_id.clone();
                ctx.emit(AgentEvent::ToolCallRequested {
                    call: requested.call.clone(),
                });
            }
            info!(turn, count = calls.len(), "dispatching tool calls");

            let report = self
                .dispatch(calls, ctx, &cancel, &mut approvals, &mut state)
                .await;

            if let Err(e) = conversation.append_tool_results(report.results.clone()) {
                let reason = AbortReason::ProtocolError { message: e.to_string() };
                return self.abort(&mut state, counters, reason, ctx);
            }
            for result in report.results {
                ctx.emit(AgentEvent::ToolCallResolved { result });
            }

            if cancel.is_cancelled() {
                return self.abort(&mut state, counters, cancel_reason(), ctx);
            }
            if self.policy.abort_on_denial {
                if let Some(denial) = report.denials.into_iter().next() {
                    let reason = AbortReason::PermissionDenied {
                        tool: denial.tool,
                        message: denial.reason,
                    };
                    return self.abort(&mut state, counters, reason, ctx);
                }
            }
        }
    }

    fn request_for(&self, conversation: &Conversation) -> BackendRequest {
        BackendRequest {
            messages: conversation.messages().to_vec(),
            system_prompt: conversation
                .system_prompt()
                .map(String::from)
                .or_else(|| self.policy.system_prompt.clone()),
            tools: self.tools.definitions(),
            temperature: self.policy.temperature,
            max_tokens: self.policy.max_tokens,
        }
    }

    fn complete(
        &self,
        state: &mut TurnState,
        counters: TurnCounters,
        final_text: Option<String>,
        ctx: &TurnContext,
    ) -> TurnOutcome {
        if let Err(e) = state.transition(TurnStatus::Completed) {
            warn!(error = %e, "turn already finished");
        }
        info!(turn = counters.turn, model_calls = counters.model_calls, "turn completed");
        let outcome = TurnOutcome {
            status: state.status(),
            abort_reason: None,
            final_text,
            counters,
        };
        ctx.emit(AgentEvent::TurnCompleted {
            outcome: outcome.clone(),
        });
        outcome
    }

    fn abort(
        &self,
        state: &mut TurnState,
        counters: TurnCounters,
        reason: AbortReason,
        ctx: &TurnContext,
    ) -> TurnOutcome {
        if let Err(e) = state.transition(TurnStatus::Aborted) {
            warn!(error = %e, "turn already finished");
        }
        warn!(turn = counters.turn, reason = %reason, "turn aborted");
        ctx.emit(AgentEvent::TurnAborted {
            reason: reason.clone(),
            counters: counters.clone(),
        });
        TurnOutcome {
            status: state.status(),
            abort_reason: Some(reason),
            final_text: None,
            counters,
        }
    }
}
