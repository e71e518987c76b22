#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

//! codewarden — human-gated remote code execution for autonomous agents.
//!
//! An agent plans, a human approves, a sandbox executes. Every execution is
//! gated behind an explicit out-of-band approval delivered over a persistent
//! control channel, enforced by single-use planning and execution tokens.

pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod safety;
pub mod sandbox;
pub mod tokens;

pub use channel::correlator::Correlator;
pub use channel::transport::{MemoryTransport, Transport, WsTransport};
pub use channel::{ControlChannel, LinkState, ReconnectPolicy};
pub use config::WardenConfig;
pub use crypto::PayloadCipher;
pub use error::{Result, WardenError};
pub use lifecycle::{
    ApprovalMode, EvaluationOutcome, ExecutionGate, ExecutionOutcome, GateConfig,
    ReviewDisposition,
};
pub use message::{ApprovalMessage, ApprovalStatus, Priority, ReplyOutcome};
pub use tokens::{PlanMetadata, PlanningToken, SessionTokenStore};
