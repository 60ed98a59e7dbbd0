use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Running,
    AwaitingApproval,
    Completed,
    Aborted,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Aborted)
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnStatus::Running => "running",
            TurnStatus::AwaitingApproval => "awaiting_approval",
            TurnStatus::Completed => "completed",
            TurnStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("invalid turn transition {from} -> {to}")]
    InvalidTransition { from: TurnStatus, to: TurnStatus },
}

/// Status holder enforcing that terminal states are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnState {
    status: TurnStatus,
}

impl TurnState {
    pub fn new() -> Self {
        Self {
            status: TurnStatus::Running,
        }
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn transition(&mut self, to: TurnStatus) -> Result<(), TurnError> {
        if self.status.is_terminal() {
            return Err(TurnError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

impl Default for TurnState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-turn counters handed to middleware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnCounters {
    /// Conversation-wide turn number
    pub turn: u64,
    /// Model calls made so far in this turn
    pub model_calls: u32,
    /// Tool calls requested so far in this turn
    pub tool_calls: u32,
    /// Accumulated cost reported by the backend
    pub cost: f64,
}

impl TurnCounters {
    /// Add a reported cost. Negative and non-finite reports are ignored.
    pub fn add_cost(&mut self, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.cost += cost;
        }
    }
}

/// Why a turn ended in `Aborted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    LimitExceeded { limit: String, message: String },
    PermissionDenied { tool: String, message: String },
    BackendFailure { message: String },
    ProtocolError { message: String },
    Halted { middleware: String, message: String },
    Cancelled,
    TimedOut { after_secs: u64 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::LimitExceeded { limit, message } => {
                write!(f, "limit exceeded ({}): {}", limit, message)
            }
            AbortReason::PermissionDenied { tool, message } => {
                write!(f, "permission denied for '{}': {}", tool, message)
            }
            AbortReason::BackendFailure { message } => write!(f, "backend failure: {}", message),
            AbortReason::ProtocolError { message } => write!(f, "protocol error: {}", message),
            AbortReason::Halted { middleware, message } => {
                write!(f, "halted by {}: {}", middleware, message)
            }
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::TimedOut { after_secs } => write!(f, "turn timed out after {}s", after_secs),
        }
    }
}

/// Final result of `run_turn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub abort_reason: Option<AbortReason>,
    /// Text of the last assistant message
    pub final_text: Option<String>,
    pub counters: TurnCounters,
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == TurnStatus::Completed
    }
}
