use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Resumption token for a turn suspended on a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalToken(Uuid);

impl ApprovalToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApprovalToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ApprovalToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// Pending approvals of one turn, shared between the orchestrator and
/// whoever answers the prompts.
#[derive(Debug, Clone, Default)]
pub struct ApprovalTable {
    pending: Arc<Mutex<HashMap<ApprovalToken, oneshot::Sender<ApprovalDecision>>>>,
}

impl ApprovalTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ApprovalToken, oneshot::Sender<ApprovalDecision>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a prompt. The receiver completes when someone resolves the token.
    pub fn register(&self) -> (ApprovalToken, oneshot::Receiver<ApprovalDecision>) {
        let token = ApprovalToken::new();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(token, tx);
        (token, rx)
    }

    /// Answer a prompt. Returns false for unknown or already answered tokens.
    pub fn resolve(&self, token: ApprovalToken, decision: ApprovalDecision) -> bool {
        match self.lock().remove(&token) {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn approve(&self, token: ApprovalToken) -> bool {
        self.resolve(token, ApprovalDecision::Approve)
    }

    pub fn deny(&self, token: ApprovalToken) -> bool {
        self.resolve(token, ApprovalDecision::Deny)
    }

    /// Drop a prompt that timed out or was abandoned.
    pub fn forget(&self, token: ApprovalToken) {
        self.lock().remove(&token);
    }

    pub fn pending(&self) -> Vec<ApprovalToken> {
        self.lock().keys().copied().collect()
    }
}
