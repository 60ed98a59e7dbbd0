//! Agent policy: the configuration the orchestrator runs under.
//!
//! Loaded by the caller (usually from TOML) and validated before a turn
//! starts. Every field has a default so partial documents are accepted.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::middleware::MiddlewareKind;
use crate::permission::{PermissionError, PermissionGate, PermissionRules};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPolicy {
    pub permissions: PermissionRules,
    pub limits: Limits,
    pub compaction: CompactionSettings,
    /// Middleware order; significant
    pub middleware: Vec<MiddlewareKind>,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
    /// Size of the tool worker pool
    pub max_concurrent_tools: usize,
    /// Tool sources that must resolve for the run to start
    pub required_sources: Vec<String>,
    /// Abort the turn when any call is denied instead of reporting the denial to the model
    pub abort_on_denial: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            permissions: PermissionRules::default(),
            limits: Limits::default(),
            compaction: CompactionSettings::default(),
            middleware: vec![
                MiddlewareKind::Compaction,
                MiddlewareKind::TurnLimit,
                MiddlewareKind::SpendLimit,
                MiddlewareKind::ContextLimit,
            ],
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            max_concurrent_tools: 4,
            required_sources: Vec::new(),
            abort_on_denial: false,
            temperature: 0.0,
            max_tokens: 4096,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Model calls allowed per turn
    pub max_model_calls: Option<u32>,
    /// Cost ceiling per turn, in backend-reported units
    pub max_spend: Option<f64>,
    /// Hard ceiling on approximate conversation tokens
    pub max_context_tokens: Option<usize>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_model_calls: Some(25),
            max_spend: None,
            max_context_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Compact earlier turns once the conversation exceeds this many tokens
    pub threshold_tokens: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub turn_secs: Option<u64>,
    /// Default per-tool deadline when the descriptor sets none
    pub tool_secs: Option<u64>,
    /// Unanswered approvals count as denials after this long
    pub approval_secs: u64,
    /// How long cancelled tools get to wind down
    pub cancel_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            turn_secs: None,
            tool_secs: Some(120),
            approval_secs: 300,
            cancel_grace_ms: 2_000,
        }
    }
}

impl Timeouts {
    pub fn turn(&self) -> Option<Duration> {
        self.turn_secs.map(Duration::from_secs)
    }

    pub fn tool(&self) -> Option<Duration> {
        self.tool_secs.map(Duration::from_secs)
    }

    pub fn approval(&self) -> Duration {
        Duration::from_secs(self.approval_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error("max_concurrent_tools must be at least 1")]
    NoWorkers,
    #[error("max_spend must be a non-negative number, got {0}")]
    InvalidSpend(f64),
    #[error("failed to parse policy: {0}")]
    Parse(String),
}

impl AgentPolicy {
    pub fn from_toml_str(s: &str) -> Result<Self, PolicyError> {
        let policy: Self = toml::from_str(s).map_err(|e| PolicyError::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        PermissionGate::from_rules(&self.permissions)?;
        if self.max_concurrent_tools == 0 {
            return Err(PolicyError::NoWorkers);
        }
        if let Some(spend) = self.limits.max_spend {
            if spend.is_nan() || spend < 0.0 {
                return Err(PolicyError::InvalidSpend(spend));
            }
        }
        Ok(())
    }
}
