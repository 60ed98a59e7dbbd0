use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::provider::LlmError;

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether a failed attempt followed by `retries_so_far` retries may be retried.
    pub fn should_retry(&self, retries_so_far: u32, error: &LlmError) -> bool {
        retries_so_far < self.max_retries && error.is_transient()
    }

    /// Wait before retry number `retry` (1-based).
    ///
    /// Doubles from `initial_backoff_ms`, capped at `max_backoff_ms`. A
    /// server-provided delay replaces the computed one, still capped.
    pub fn backoff(&self, retry: u32, error: &LlmError) -> Duration {
        let cap = self.max_backoff_ms.max(self.initial_backoff_ms);
        if let Some(after) = error.retry_after() {
            let after_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
            return Duration::from_millis(after_ms.min(cap));
        }
        let shift = retry.saturating_sub(1).min(20);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor).min(cap))
    }
}

/// Sleep for `delay`. Returns true if `cancel` fired first.
pub async fn wait_backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
