use serde::Serialize;

use crate::approval::ApprovalToken;
use crate::middleware::MiddlewareAction;
use crate::tool::{ToolCall, ToolResult};
use crate::turn::{AbortReason, TurnCounters, TurnOutcome};

/// Ordered events a turn emits to its consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStarted {
        turn: u64,
    },
    /// Streamed assistant text
    TextDelta {
        text: String,
    },
    /// A complete tool call parsed from the model response
    ToolCallRequested {
        call: ToolCall,
    },
    /// The turn is suspended until `token` is answered
    ApprovalRequested {
        token: ApprovalToken,
        call: ToolCall,
        /// Argument the approval applies to
        subject: String,
    },
    /// Final result of a call, emitted in request order
    ToolCallResolved {
        result: ToolResult,
    },
    /// A backend attempt failed transiently; text streamed since the last
    /// model call started is discarded.
    BackendRetry {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    MiddlewareApplied {
        middleware: String,
        action: MiddlewareAction,
    },
    TurnCompleted {
        outcome: TurnOutcome,
    },
    TurnAborted {
        reason: AbortReason,
        counters: TurnCounters,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::TurnCompleted { .. } | AgentEvent::TurnAborted { .. })
    }
}
