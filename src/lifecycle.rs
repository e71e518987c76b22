//! Plan → evaluate → execute token state machine.
//!
//! Enforces the invariant the whole crate exists for: no code runs without a
//! prior, single-use, human-approved evaluation. `plan` issues a planning
//! token, `evaluate` consumes it and trades it for an execution token via one
//! human approval round trip, `execute` consumes that token and dispatches
//! the bound code to the sandbox, then routes the result back for a human
//! acknowledgment pass.

use crate::channel::ControlChannel;
use crate::channel::correlator::Correlator;
use crate::error::{ConnectionError, ResourceError, ValidationError, WardenError};
use crate::message::{ApprovalMessage, Priority, ReplyOutcome};
use crate::safety::CodeSafetyAdvisor;
use crate::sandbox::{
    ExecutionRequest, ExecutionResult, ResourceDescriptor, SandboxDirectory, SandboxEndpoint,
    SandboxExecutor,
};
use crate::tokens::{ApprovalRecord, PlanMetadata, PlanningToken, SessionTokenStore, token_prefix};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// How evaluation decisions are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Every evaluation waits on a human reply over the control channel.
    Human,
    /// No human in the loop; the AI safety advisor substitutes for approval.
    Automated,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub session_id: String,
    /// Sender label stamped on outbound approval messages.
    pub sender: String,
    /// Scope passed to the sandbox directory when listing endpoints.
    pub session_scope: String,
    /// Human round trips take minutes, not milliseconds.
    pub approval_timeout: Duration,
    pub ack_timeout: Duration,
    /// Defense-in-depth bound on submitted code, not a precision limit.
    pub max_code_lines: usize,
    pub mode: ApprovalMode,
    /// Encrypt code and output in transit to the sandbox.
    pub confidentiality: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            sender: "codewarden".to_string(),
            session_scope: "default".to_string(),
            approval_timeout: Duration::from_millis(300_000),
            ack_timeout: Duration::from_millis(60_000),
            max_code_lines: 1_000,
            mode: ApprovalMode::Human,
            confidentiality: false,
        }
    }
}

/// Terminal result of one evaluation attempt. Rejection is data, not an
/// error; a rejected evaluation simply leaves no execution token behind.
#[derive(Debug, Clone)]
pub enum EvaluationOutcome {
    Approved {
        execution_token: String,
        approved_at: DateTime<Utc>,
    },
    Rejected {
        feedback: Option<String>,
    },
}

/// How the human acknowledgment pass left an execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDisposition {
    /// Human saw the result and signed it off.
    Acknowledged,
    /// Human flagged the result for follow-up.
    Flagged { feedback: Option<String> },
    /// No usable acknowledgment (channel offline, timeout, invalid reply);
    /// the result needs manual review. Never fails the call — the code has
    /// already run.
    ManualReview { reason: String },
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: ExecutionResult,
    pub review: ReviewDisposition,
}

/// The token lifecycle manager. One gate per session; owns that session's
/// token store.
pub struct ExecutionGate {
    config: GateConfig,
    correlator: Correlator,
    directory: Arc<dyn SandboxDirectory>,
    executor: Arc<dyn SandboxExecutor>,
    advisor: Option<Arc<dyn CodeSafetyAdvisor>>,
    store: SessionTokenStore,
}

impl ExecutionGate {
    pub fn new(
        config: GateConfig,
        channel: Arc<ControlChannel>,
        directory: Arc<dyn SandboxDirectory>,
        executor: Arc<dyn SandboxExecutor>,
    ) -> Self {
        let store = SessionTokenStore::new(config.session_id.clone());
        Self {
            config,
            correlator: Correlator::new(channel),
            directory,
            executor,
            advisor: None,
            store,
        }
    }

    #[must_use]
    pub fn with_advisor(mut self, advisor: Arc<dyn CodeSafetyAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn session_id(&self) -> &str {
        self.store.session_id()
    }

    /// Issue a fresh single-use planning token. Calling again simply issues
    /// a new token and discards the old one.
    pub fn plan(&self, metadata: PlanMetadata) -> PlanningToken {
        let token = self.store.issue_planning(metadata);
        tracing::info!(
            session = %self.session_id(),
            token = %token_prefix(&token.token),
            research = token.metadata.research,
            "planning token issued"
        );
        token
    }

    /// Consume the planning token and submit the code for approval. On
    /// approval, mints the execution token bound to this exact code text.
    pub async fn evaluate(
        &self,
        planning_token: &str,
        code: &str,
        explanation: &str,
    ) -> Result<EvaluationOutcome, WardenError> {
        // Consumed the instant evaluation begins, before the (slow) round
        // trip, so the token cannot be replayed meanwhile.
        let plan = self.store.consume_planning(planning_token)?;

        let decision = match self.config.mode {
            ApprovalMode::Human => self.human_decision(code, explanation).await,
            ApprovalMode::Automated => self.automated_decision(code, explanation).await,
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    session = %self.session_id(),
                    "evaluation failed; session can retry with a new plan: {err}"
                );
                return Err(err.in_operation("evaluate"));
            }
        };

        match decision {
            ReplyOutcome::Approved { feedback } => {
                let approved_at = Utc::now();
                let token = self.store.issue_execution(
                    code.to_string(),
                    ApprovalRecord {
                        explanation: explanation.to_string(),
                        approved_at,
                        feedback,
                    },
                );
                tracing::info!(
                    session = %self.session_id(),
                    plan = %token_prefix(&plan.token),
                    token = %token_prefix(&token.token),
                    "evaluation approved; execution token issued"
                );
                Ok(EvaluationOutcome::Approved {
                    execution_token: token.token,
                    approved_at,
                })
            }
            ReplyOutcome::Rejected { feedback } => {
                tracing::info!(
                    session = %self.session_id(),
                    plan = %token_prefix(&plan.token),
                    "evaluation rejected by reviewer"
                );
                Ok(EvaluationOutcome::Rejected { feedback })
            }
            ReplyOutcome::Invalid { reason } => {
                Err(WardenError::from(ValidationError::MalformedReply(reason))
                    .in_operation("evaluate"))
            }
        }
    }

    /// Consume the execution token, dispatch its bound code to the sandbox,
    /// and route the result through the acknowledgment pass.
    pub async fn execute(&self, execution_token: &str) -> Result<ExecutionOutcome, WardenError> {
        let consumed = self.store.consume_execution(execution_token)?;
        // The entry is gone even if dispatch fails below; a stale token
        // value can never match the live slot again.
        let _ = self.store.issue_decoy();

        tracing::info!(
            session = %self.session_id(),
            token = %token_prefix(&consumed.token),
            "execution token consumed; dispatching to sandbox"
        );

        let (endpoint, _resources) = self
            .endpoint_with_resources()
            .await
            .map_err(|e| e.in_operation("execute"))?;

        let result = self
            .executor
            .run(
                &endpoint,
                ExecutionRequest {
                    code: consumed.code,
                    confidentiality_requested: self.config.confidentiality,
                },
            )
            .await
            .map_err(|e| WardenError::from(e).in_operation("execute"))?;

        let review = self.acknowledge(&result).await;
        Ok(ExecutionOutcome { result, review })
    }

    // ── decision paths ───────────────────────────────────────────────────

    async fn human_decision(
        &self,
        code: &str,
        explanation: &str,
    ) -> Result<ReplyOutcome, WardenError> {
        // Fail before any message is sent: connection, then resources, then
        // the size ceiling.
        if !self.correlator.channel().is_open() {
            return Err(ConnectionError::NotConnected.into());
        }
        let (endpoint, resources) = self.endpoint_with_resources().await?;
        validate_code(code, self.config.max_code_lines)?;

        let message = ApprovalMessage::request(
            "Approve code execution?",
            describe_request(code, &endpoint, &resources),
            Priority::High,
            self.config.sender.clone(),
        )
        .with_code(code, explanation);

        self.correlator
            .send_and_await(&message, self.config.approval_timeout)
            .await
    }

    async fn automated_decision(
        &self,
        code: &str,
        explanation: &str,
    ) -> Result<ReplyOutcome, WardenError> {
        let Some(advisor) = &self.advisor else {
            return Err(anyhow::anyhow!(
                "automated approval mode requires a code safety advisor"
            )
            .into());
        };
        let (endpoint, resources) = self.endpoint_with_resources().await?;
        tracing::debug!(
            sandbox = %endpoint.id,
            packages = resources.packages.len(),
            "endpoint resources gathered for automated review"
        );
        validate_code(code, self.config.max_code_lines)?;

        let verdict = advisor
            .review(code, explanation)
            .await
            .map_err(WardenError::Other)?;

        if verdict.safe {
            Ok(ReplyOutcome::Approved {
                feedback: verdict.feedback(),
            })
        } else {
            Ok(ReplyOutcome::Rejected {
                feedback: verdict.feedback(),
            })
        }
    }

    // ── helpers ──────────────────────────────────────────────────────────

    /// Pick the first reachable endpoint for this session's scope and fetch
    /// what it has available. Both lookups are part of the resource check;
    /// either failing fails the operation.
    async fn endpoint_with_resources(
        &self,
    ) -> Result<(SandboxEndpoint, ResourceDescriptor), WardenError> {
        let endpoints = self
            .directory
            .list_active_endpoints(&self.config.session_scope)
            .await?;
        let endpoint = endpoints.into_iter().next().ok_or_else(|| {
            WardenError::from(ResourceError::NoEndpoints {
                scope: self.config.session_scope.clone(),
            })
        })?;
        let resources = self.directory.fetch_resources(&endpoint.url).await?;
        Ok((endpoint, resources))
    }

    /// Acknowledgment pass after execution. Never fails the call; every
    /// degraded path lands on `ManualReview`.
    async fn acknowledge(&self, result: &ExecutionResult) -> ReviewDisposition {
        let title = if result.success {
            "Execution finished"
        } else {
            "Execution failed"
        };

        if !self.correlator.channel().is_open() {
            tracing::warn!(
                session = %self.session_id(),
                "control channel offline during acknowledgment; flagging for manual review"
            );
            // Queue the result as a fire-and-forget notification so the
            // human still sees it once the channel comes back.
            let notice = ApprovalMessage::notification(
                title,
                summarize_result(result),
                self.config.sender.clone(),
            );
            if let Err(err) = self.correlator.send(&notice) {
                tracing::debug!("failed to queue result notification: {err}");
            }
            return ReviewDisposition::ManualReview {
                reason: "control channel offline".to_string(),
            };
        }

        let message = ApprovalMessage::request(
            title,
            summarize_result(result),
            Priority::Normal,
            self.config.sender.clone(),
        );

        match self
            .correlator
            .send_and_await(&message, self.config.ack_timeout)
            .await
        {
            Ok(ReplyOutcome::Approved { .. }) => ReviewDisposition::Acknowledged,
            Ok(ReplyOutcome::Rejected { feedback }) => ReviewDisposition::Flagged { feedback },
            Ok(ReplyOutcome::Invalid { reason }) => ReviewDisposition::ManualReview { reason },
            Err(err) => {
                tracing::warn!(
                    session = %self.session_id(),
                    "acknowledgment round trip failed: {err}"
                );
                ReviewDisposition::ManualReview {
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Approval-request body: what will run, where, and what the endpoint has
/// in scope, so the reviewer decides with the blast radius in view.
fn describe_request(
    code: &str,
    endpoint: &SandboxEndpoint,
    resources: &ResourceDescriptor,
) -> String {
    let mut body = format!(
        "The agent wants to run {} lines of code on sandbox '{}'.",
        code.lines().count(),
        endpoint.id
    );
    if !resources.packages.is_empty() {
        body.push_str(&format!(
            "\nPackages available: {}.",
            resources.packages.join(", ")
        ));
    }
    if !resources.secrets.is_empty() {
        body.push_str(&format!(
            "\nSecrets in scope: {}.",
            resources.secrets.join(", ")
        ));
    }
    body
}

fn validate_code(code: &str, max_lines: usize) -> Result<(), ValidationError> {
    if code.trim().is_empty() {
        return Err(ValidationError::EmptyCode);
    }
    let actual = code.lines().count();
    if actual > max_lines {
        return Err(ValidationError::CodeTooLarge {
            max: max_lines,
            actual,
        });
    }
    Ok(())
}

const MAX_SUMMARY_LEN: usize = 2_000;

fn summarize_result(result: &ExecutionResult) -> String {
    let mut body = String::new();
    if !result.output.is_empty() {
        body.push_str("output:\n");
        body.push_str(truncate(&result.output));
    }
    if !result.stderr.is_empty() {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("stderr:\n");
        body.push_str(truncate(&result.stderr));
    }
    if body.is_empty() {
        body.push_str("(no output)");
    }
    body
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_SUMMARY_LEN) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
