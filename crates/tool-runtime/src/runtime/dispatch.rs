//! Tool dispatch for one assistant message.
//!
//! Two phases. Gating walks the calls in request order and settles every
//! permission question, suspending the whole turn on `ask`. Execution then
//! runs the allowed calls on the worker pool. Results come back in request
//! order whatever the completion order.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::ApprovalDecision;
use crate::event::AgentEvent;
use crate::handle::ToolHandle;
use crate::permission::{ApprovalCache, PermissionDecision};
use crate::tool::{ToolCall, ToolContext, ToolError, ToolResult};
use crate::turn::{TurnState, TurnStatus};

use super::response::RequestedCall;
use super::{AgenticLoop, TurnContext};

/// A call that was refused before running.
#[derive(Debug, Clone)]
pub(crate) struct Denial {
    pub tool: String,
    pub reason: String,
}

pub(crate) struct DispatchReport {
    /// One result per requested call, in request order
    pub results: Vec<ToolResult>,
    pub denials: Vec<Denial>,
}

enum Slot {
    Done(ToolResult),
    Run(ToolHandle, ToolCall),
}

impl AgenticLoop {
    pub(crate) async fn dispatch(
        &self,
        calls: Vec<RequestedCall>,
        ctx: &TurnContext,
        cancel: &CancellationToken,
        cache: &mut ApprovalCache,
        state: &mut TurnState,
    ) -> DispatchReport {
        let mut slots = Vec::with_capacity(calls.len());
        let mut denials = Vec::new();

        for requested in calls {
            let call = requested.call;
            if cancel.is_cancelled() {
                slots.push(Slot::Done(cancelled(&call)));
                continue;
            }
            if let Some(error) = requested.parse_error {
                slots.push(Slot::Done(ToolResult::error(
                    &call,
                    format!("Invalid JSON arguments for tool '{}': {}", call.name, error),
                )));
                continue;
            }
            let Some(handle) = self.tools.get(&call.name) else {
                warn!(tool = %call.name, call_id = %call.id, "model requested unknown tool");
                slots.push(Slot::Done(ToolResult::error(
                    &call,
                    format!("Unknown tool: '{}'", call.name),
                )));
                continue;
            };
            if let Err(e) = handle.validate(&call.input) {
                slots.push(Slot::Done(ToolResult::error(&call, e.to_string())));
                continue;
            }

            match self.gate.decide(handle.descriptor(), &call.input) {
                PermissionDecision::Allow => slots.push(Slot::Run(handle.clone(), call)),
                PermissionDecision::Deny(reason) => {
                    info!(tool = %call.name, call_id = %call.id, %reason, "tool call denied");
                    slots.push(Slot::Done(denied(&call, &reason)));
                    denials.push(Denial {
                        tool: call.name.clone(),
                        reason,
                    });
                }
                PermissionDecision::Ask => {
                    let approval = self.ask(handle, &call, ctx, cancel, cache, state).await;
                    match approval {
                        Approval::Approved => slots.push(Slot::Run(handle.clone(), call)),
                        Approval::Denied(reason) => {
                            info!(tool = %call.name, call_id = %call.id, %reason, "tool call not approved");
                            slots.push(Slot::Done(denied(&call, &reason)));
                            denials.push(Denial {
                                tool: call.name.clone(),
                                reason,
                            });
                        }
                        Approval::Cancelled => slots.push(Slot::Done(cancelled(&call))),
                    }
                }
            }
        }

        let results = self.execute(slots, ctx, cancel).await;
        DispatchReport { results, denials }
    }

    async fn ask(
        &self,
        handle: &ToolHandle,
        call: &ToolCall,
        ctx: &TurnContext,
        cancel: &CancellationToken,
        cache: &mut ApprovalCache,
        state: &mut TurnState,
    ) -> Approval {
        let key = ApprovalCache::key(handle.descriptor(), &call.input);
        if let Some(approved) = cache.get(&key) {
            debug!(tool = %call.name, approved, "reusing approval answer for this turn");
            return if approved {
                Approval::Approved
            } else {
                Approval::Denied("denied earlier in this turn".to_string())
            };
        }

        let (token, answer) = ctx.approvals.register();
        if let Err(e) = state.transition(TurnStatus::AwaitingApproval) {
            warn!(error = %e, "unexpected turn state while awaiting approval");
        }
        ctx.emit(AgentEvent::ApprovalRequested {
            token,
            call: call.clone(),
            subject: key.1.clone(),
        });

        let timeout = self.policy.timeouts.approval();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ctx.approvals.forget(token);
                Approval::Cancelled
            }
            decision = answer => match decision {
                Ok(ApprovalDecision::Approve) => Approval::Approved,
                Ok(ApprovalDecision::Deny) => Approval::Denied("denied by user".to_string()),
                Err(_) => Approval::Denied("approval request was dropped".to_string()),
            },
            _ = tokio::time::sleep(timeout) => {
                ctx.approvals.forget(token);
                warn!(tool = %call.name, call_id = %call.id, ?timeout, "approval timed out, treating as denial");
                Approval::Denied(format!("no approval within {}s", timeout.as_secs()))
            }
        };

        if let Err(e) = state.transition(TurnStatus::Running) {
            warn!(error = %e, "unexpected turn state after approval");
        }
        match &outcome {
            Approval::Approved => cache.record(key, true),
            Approval::Denied(_) => cache.record(key, false),
            Approval::Cancelled => {}
        }
        outcome
    }

    async fn execute(&self, slots: Vec<Slot>, ctx: &TurnContext, cancel: &CancellationToken) -> Vec<ToolResult> {
        let pool = Arc::new(Semaphore::new(self.policy.max_concurrent_tools.max(1)));
        let base = ToolContext::new(ctx.working_directory.clone());
        let tool_timeout = self.policy.timeouts.tool();
        let grace = self.policy.timeouts.cancel_grace();

        let runs = slots.into_iter().map(|slot| {
            let pool = Arc::clone(&pool);
            let base = &base;
            async move {
                match slot {
                    Slot::Done(result) => result,
                    Slot::Run(handle, call) => {
                        let _permit = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return cancelled(&call),
                            permit = pool.acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => return cancelled(&call),
                            },
                        };
                        let tool_ctx = base.for_call(&call.id, cancel);
                        handle.invoke(&call, &tool_ctx, tool_timeout, grace).await
                    }
                }
            }
        });

        futures::future::join_all(runs).await
    }
}

enum Approval {
    Approved,
    Denied(String),
    Cancelled,
}

fn denied(call: &ToolCall, reason: &str) -> ToolResult {
    ToolResult::error(call, format!("Permission denied: {}", reason))
}

fn cancelled(call: &ToolCall) -> ToolResult {
    ToolResult::error(call, format!("{}: tool call '{}' did not run to completion", ToolError::Cancelled, call.id))
}
