//! Pre-model-call policies.
//!
//! The chain runs before every model call of a turn, strictly in order.
//! Each middleware sees the conversation as left by the ones before it;
//! the first halt stops the chain and the turn.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AgentPolicy;
use crate::conversation::{message_chars, Conversation, ConversationMessage};
use crate::turn::TurnCounters;

/// Verdict of one middleware.
#[derive(Debug, Clone, PartialEq)]
pub enum MiddlewareVerdict {
    Continue,
    /// Replace the conversation before the model sees it
    Modify(Conversation),
    Halt(HaltReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltKind {
    TurnLimit,
    SpendLimit,
    ContextLimit,
    /// Any other policy decision
    Policy,
}

impl HaltKind {
    /// Whether this halt is a configured limit being exceeded.
    pub fn is_limit(self) -> bool {
        !matches!(self, HaltKind::Policy)
    }
}

impl fmt::Display for HaltKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaltKind::TurnLimit => "turn_limit",
            HaltKind::SpendLimit => "spend_limit",
            HaltKind::ContextLimit => "context_limit",
            HaltKind::Policy => "policy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltReason {
    pub kind: HaltKind,
    pub message: String,
}

impl HaltReason {
    pub fn new(kind: HaltKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What a middleware did, as reported to event consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MiddlewareAction {
    Modified { messages_before: usize, messages_after: usize },
    Halted { reason: HaltReason },
}

/// A turn-scoped policy evaluated before each model call.
///
/// Implementations hold configuration only; anything they need to know
/// about the run comes from the arguments.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn before_turn(&self, conversation: &Conversation, counters: &TurnCounters) -> MiddlewareVerdict;
}

/// Built-in middleware names usable in `AgentPolicy::middleware`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareKind {
    Compaction,
    TurnLimit,
    SpendLimit,
    ContextLimit,
}

/// Drops the oldest messages of earlier turns until the conversation fits
/// `threshold_tokens`. The current turn is never touched, and the
/// conversation never starts with a tool result whose call was dropped.
#[derive(Debug, Clone)]
pub struct CompactionMiddleware {
    threshold_tokens: usize,
}

impl CompactionMiddleware {
    pub fn new(threshold_tokens: usize) -> Self {
        Self { threshold_tokens }
    }
}

impl Middleware for CompactionMiddleware {
    fn name(&self) -> &str {
        "compaction"
    }

    fn before_turn(&self, conversation: &Conversation, _counters: &TurnCounters) -> MiddlewareVerdict {
        if conversation.approximate_tokens() <= self.threshold_tokens {
            return MiddlewareVerdict::Continue;
        }

        let messages = conversation.messages();
        let protected = conversation.current_turn_start();
        let prompt = conversation.system_prompt().map_or(0, str::len);
        let mut remaining: usize = messages.iter().map(message_chars).sum();

        let mut drop = 0;
        while drop < protected && (prompt + remaining) / 4 > self.threshold_tokens {
            remaining -= message_chars(&messages[drop]);
            drop += 1;
        }
        while drop < protected && matches!(messages[drop], ConversationMessage::ToolResult(_)) {
            drop += 1;
        }

        if drop == 0 {
            return MiddlewareVerdict::Continue;
        }
        let mut compacted = conversation.clone();
        compacted.drop_oldest(drop);
        debug!(dropped = drop, tokens = compacted.approximate_tokens(), "conversation compacted");
        MiddlewareVerdict::Modify(compacted)
    }
}

/// Halts once `max_model_calls` model calls have been made in the turn.
#[derive(Debug, Clone)]
pub struct TurnLimitMiddleware {
    max_model_calls: u32,
}

impl TurnLimitMiddleware {
    pub fn new(max_model_calls: u32) -> Self {
        Self { max_model_calls }
    }
}

impl Middleware for TurnLimitMiddleware {
    fn name(&self) -> &str {
        "turn_limit"
    }

    fn before_turn(&self, _conversation: &Conversation, counters: &TurnCounters) -> MiddlewareVerdict {
        if counters.model_calls >= self.max_model_calls {
            return MiddlewareVerdict::Halt(HaltReason::new(
                HaltKind::TurnLimit,
                format!("reached the limit of {} model calls", self.max_model_calls),
            ));
        }
        MiddlewareVerdict::Continue
    }
}

/// Halts once accumulated cost reaches the ceiling.
#[derive(Debug, Clone)]
pub struct SpendLimitMiddleware {
    max_spend: f64,
}

impl SpendLimitMiddleware {
    pub fn new(max_spend: f64) -> Self {
        Self { max_spend }
    }
}

impl Middleware for SpendLimitMiddleware {
    fn name(&self) -> &str {
        "spend_limit"
    }

    fn before_turn(&self, _conversation: &Conversation, counters: &TurnCounters) -> MiddlewareVerdict {
        if counters.cost >= self.max_spend {
            return MiddlewareVerdict::Halt(HaltReason::new(
                HaltKind::SpendLimit,
                format!("spent {:.4} of {:.4}", counters.cost, self.max_spend),
            ));
        }
        MiddlewareVerdict::Continue
    }
}

/// Hard ceiling on conversation size. Place it after compaction.
#[derive(Debug, Clone)]
pub struct ContextLimitMiddleware {
    max_tokens: usize,
}

impl ContextLimitMiddleware {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

impl Middleware for ContextLimitMiddleware {
    fn name(&self) -> &str {
        "context_limit"
    }

    fn before_turn(&self, conversation: &Conversation, _counters: &TurnCounters) -> MiddlewareVerdict {
        let tokens = conversation.approximate_tokens();
        if tokens > self.max_tokens {
            return MiddlewareVerdict::Halt(HaltReason::new(
                HaltKind::ContextLimit,
                format!("conversation is ~{} tokens, limit is {}", tokens, self.max_tokens),
            ));
        }
        MiddlewareVerdict::Continue
    }
}

/// Ordered middleware list.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the configured chain. Stages whose limit is unset are skipped.
    pub fn from_policy(policy: &AgentPolicy) -> Self {
        let mut chain = Self::new();
        for kind in &policy.middleware {
            match kind {
                MiddlewareKind::Compaction => {
                    if let Some(threshold) = policy.compaction.threshold_tokens {
                        chain = chain.with(CompactionMiddleware::new(threshold));
                    }
                }
                MiddlewareKind::TurnLimit => {
                    if let Some(max) = policy.limits.max_model_calls {
                        chain = chain.with(TurnLimitMiddleware::new(max));
                    }
                }
                MiddlewareKind::SpendLimit => {
                    if let Some(max) = policy.limits.max_spend {
                        chain = chain.with(SpendLimitMiddleware::new(max));
                    }
                }
                MiddlewareKind::ContextLimit => {
                    if let Some(max) = policy.limits.max_context_tokens {
                        chain = chain.with(ContextLimitMiddleware::new(max));
                    }
                }
            }
        }
        chain
    }

    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.stages.push(Arc::new(middleware));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order, applying modifications in place.
    ///
    /// `observe` is told about each modification and halt. Returns the
    /// halting middleware's name and reason, if any.
    pub fn run(
        &self,
        conversation: &mut Conversation,
        counters: &TurnCounters,
        mut observe: impl FnMut(&str, MiddlewareAction),
    ) -> Option<(String, HaltReason)> {
        for stage in &self.stages {
            match stage.before_turn(conversation, counters) {
                MiddlewareVerdict::Continue => {}
                MiddlewareVerdict::Modify(next) => {
                    let action = MiddlewareAction::Modified {
                        messages_before: conversation.len(),
                        messages_after: next.len(),
                    };
                    *conversation = next;
                    observe(stage.name(), action);
                }
                MiddlewareVerdict::Halt(reason) => {
                    info!(middleware = %stage.name(), kind = %reason.kind, message = %reason.message, "middleware halted turn");
                    observe(
                        stage.name(),
                        MiddlewareAction::Halted {
                            reason: reason.clone(),
                        },
                    );
                    return Some((stage.name().to_string(), reason));
                }
            }
        }
        None
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
