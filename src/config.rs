//! TOML configuration for the gateway.

use crate::channel::ReconnectPolicy;
use crate::lifecycle::{ApprovalMode, GateConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,
}

// ── Control channel ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// WebSocket address of the human approval endpoint.
    pub endpoint: String,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8787/control".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ── Approval behaviour ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_sender")]
    pub sender: String,

    /// Human round-trip budget for `evaluate`, in milliseconds.
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,

    /// Acknowledgment budget after `execute`, in milliseconds.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_mode")]
    pub mode: ApprovalMode,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            sender: default_sender(),
            approval_timeout_ms: default_approval_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            mode: default_mode(),
        }
    }
}

fn default_sender() -> String {
    "codewarden".to_string()
}

fn default_approval_timeout_ms() -> u64 {
    300_000
}

fn default_ack_timeout_ms() -> u64 {
    60_000
}

fn default_mode() -> ApprovalMode {
    ApprovalMode::Human
}

// ── Sandbox provider ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base URL of the sandbox provider API.
    #[serde(default)]
    pub api_base: Option<String>,

    #[serde(default = "default_scope")]
    pub session_scope: String,

    /// Encrypt code and output in transit to the sandbox.
    #[serde(default)]
    pub confidentiality: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            session_scope: default_scope(),
            confidentiality: false,
        }
    }
}

fn default_scope() -> String {
    "default".to_string()
}

// ── Limits ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_code_lines")]
    pub max_code_lines: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_code_lines: default_max_code_lines(),
        }
    }
}

fn default_max_code_lines() -> usize {
    1_000
}

// ── Crypto ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Hex-encoded 32-byte key for payload confidentiality.
    #[serde(default)]
    pub key_hex: Option<String>,
}

impl WardenConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config: {}", path.display()))
    }

    /// Gate settings for one session, derived from this config.
    #[must_use]
    pub fn gate_config(&self, session_id: impl Into<String>) -> GateConfig {
        GateConfig {
            session_id: session_id.into(),
            sender: self.approval.sender.clone(),
            session_scope: self.sandbox.session_scope.clone(),
            approval_timeout: Duration::from_millis(self.approval.approval_timeout_ms),
            ack_timeout: Duration::from_millis(self.approval.ack_timeout_ms),
            max_code_lines: self.limits.max_code_lines,
            mode: self.approval.mode,
            confidentiality: self.sandbox.confidentiality,
        }
    }
}
