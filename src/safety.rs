//! AI code-safety collaborator.
//!
//! Consulted only in fully-automated evaluation mode, as a substitute for
//! human approval. The core treats the verdict as opaque — it never inspects
//! the code itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    #[serde(default)]
    pub concerns: Vec<String>,
}

impl SafetyVerdict {
    /// Concerns flattened into rejection feedback.
    #[must_use]
    pub fn feedback(&self) -> Option<String> {
        if self.concerns.is_empty() {
            None
        } else {
            Some(self.concerns.join("; "))
        }
    }
}

#[async_trait]
pub trait CodeSafetyAdvisor: Send + Sync {
    async fn review(&self, code: &str, explanation: &str) -> anyhow::Result<SafetyVerdict>;
}

/// Default advisor for contexts where no reviewer is wired up: declines
/// everything rather than waving code through.
pub struct AutoDenyAdvisor {
    pub reason: String,
}

#[async_trait]
impl CodeSafetyAdvisor for AutoDenyAdvisor {
    async fn review(&self, _code: &str, _explanation: &str) -> anyhow::Result<SafetyVerdict> {
        Ok(SafetyVerdict {
            safe: false,
            concerns: vec![self.reason.clone()],
        })
    }
}
