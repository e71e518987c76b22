//! Single-use credentials for the plan → evaluate → execute pipeline.
//!
//! The store holds at most one live planning token and one live execution
//! token per session. Issuing a new token supersedes the previous one, and
//! validate-then-consume is atomic: two concurrent calls can never both
//! observe the same token as valid.

use crate::error::{TokenError, TokenKind};
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::sync::Mutex;

/// Plan metadata attached at `plan()` time and carried into evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanMetadata {
    /// Whether the agent intends a research pass before writing code.
    pub research: bool,
    pub notes: Option<String>,
}

/// Single-use credential authorizing exactly one evaluation attempt.
#[derive(Debug, Clone)]
pub struct PlanningToken {
    pub token: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: PlanMetadata,
}

/// Record of the human approval that minted an execution token.
#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    pub explanation: String,
    pub approved_at: DateTime<Utc>,
    pub feedback: Option<String>,
}

/// Single-use credential bound to one approved code body.
#[derive(Debug, Clone)]
pub struct ExecutionToken {
    pub token: String,
    pub session_id: String,
    /// The exact code text the human approved. Empty for decoy tokens.
    pub code: String,
    pub approval: Option<ApprovalRecord>,
    /// Hygiene placeholder issued after a real token is consumed; can never
    /// pass validation for dispatch.
    pub decoy: bool,
}

/// Per-session token table. One store per real session/user — no process
/// globals.
pub struct SessionTokenStore {
    session_id: String,
    planning: Mutex<Option<PlanningToken>>,
    execution: Mutex<Option<ExecutionToken>>,
}

impl SessionTokenStore {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            planning: Mutex::new(None),
            execution: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Issue a fresh planning token, superseding any unconsumed prior one.
    pub fn issue_planning(&self, metadata: PlanMetadata) -> PlanningToken {
        let token = PlanningToken {
            token: generate_token("pt"),
            session_id: self.session_id.clone(),
            created_at: Utc::now(),
            metadata,
        };

        let mut slot = lock(&self.planning);
        if let Some(previous) = slot.replace(token.clone()) {
            tracing::debug!(
                session = %self.session_id,
                superseded = %token_prefix(&previous.token),
                "unconsumed planning token superseded"
            );
        }
        token
    }

    /// Validate and consume the live planning token in one step. The slot is
    /// emptied the instant the token matches, so a slow approval round trip
    /// can never be raced into a replay.
    pub fn consume_planning(&self, token: &str) -> Result<PlanningToken, TokenError> {
        let mut slot = lock(&self.planning);
        match slot.take() {
            Some(live) if live.token == token => Ok(live),
            other => {
                *slot = other;
                Err(TokenError {
                    kind: TokenKind::Planning,
                })
            }
        }
    }

    /// Issue an execution token bound to approved code. Supersedes and
    /// invalidates any previously issued execution token for this session —
    /// only the most recent one is ever valid.
    pub fn issue_execution(&self, code: String, approval: ApprovalRecord) -> ExecutionToken {
        self.store_execution(ExecutionToken {
            token: generate_token("xt"),
            session_id: self.session_id.clone(),
            code,
            approval: Some(approval),
            decoy: false,
        })
    }

    /// Issue a decoy execution token. Installed right after a real token is
    /// consumed so a stale token value can never match the live slot again.
    pub fn issue_decoy(&self) -> ExecutionToken {
        self.store_execution(ExecutionToken {
            token: generate_token("xt"),
            session_id: self.session_id.clone(),
            code: String::new(),
            approval: None,
            decoy: true,
        })
    }

    fn store_execution(&self, token: ExecutionToken) -> ExecutionToken {
        let mut slot = lock(&self.execution);
        if let Some(previous) = slot.replace(token.clone())
            && !previous.decoy
        {
            tracing::debug!(
                session = %self.session_id,
                superseded = %token_prefix(&previous.token),
                "unconsumed execution token superseded"
            );
        }
        token
    }

    /// Validate and consume the live execution token, returning its bound
    /// code. The entry is deleted immediately, before any dispatch happens —
    /// single use even if the downstream dispatch later fails. Decoy tokens
    /// never validate.
    pub fn consume_execution(&self, token: &str) -> Result<ExecutionToken, TokenError> {
        let mut slot = lock(&self.execution);
        match slot.take() {
            Some(live) if live.token == token && !live.decoy => Ok(live),
            other => {
                *slot = other;
                Err(TokenError {
                    kind: TokenKind::Execution,
                })
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Opaque random token: prefix + 32 hex chars from 16 CSPRNG bytes.
fn generate_token(prefix: &str) -> String {
    let mut buf = [0u8; 16];
    rand::rng().fill_bytes(&mut buf);
    format!("{prefix}_{}", hex::encode(buf))
}

/// Loggable form of a token: type prefix and first few chars only.
pub(crate) fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}
