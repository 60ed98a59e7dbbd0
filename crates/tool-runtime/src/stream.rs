//! Normalized backend stream.
//!
//! Adapters turn each vendor's wire events into these before the runtime
//! sees them. Tool call fragments are keyed by call id and may interleave.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    /// The model opened a tool call
    ToolCallStart {
        id: String,
        name: String,
    },
    /// A fragment of the call's JSON arguments
    ToolCallDelta {
        id: String,
        arguments_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    /// Usage for this response, in backend-reported units
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    },
    MessageEnd {
        stop_reason: StopReason,
    },
    /// Stream failure. `recoverable` errors are retried by the runtime.
    Error {
        message: String,
        recoverable: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    /// The response asked for tools
    ToolUse,
    MaxTokens,
    StopSequence,
}
