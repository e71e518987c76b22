//! Wire records exchanged with the human approval endpoint.
//!
//! Field names are stable across versions; the reply side is interpreted into
//! a closed [`ReplyOutcome`] so the correlator's handling is exhaustive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Status carried on an [`ApprovalMessage`]. Outbound requests are always
/// `Pending`; the only valid reply transitions are `pending → approved` and
/// `pending → rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// The payload unit exchanged with the human endpoint. Immutable once sent;
/// a reply is a separate message correlated by the channel's pending slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalMessage {
    pub id: String,
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub sender: String,
    pub status: ApprovalStatus,
    pub requires_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ApprovalMessage {
    /// A pending request that expects a human reply.
    pub fn request(
        title: impl Into<String>,
        body: impl Into<String>,
        priority: Priority,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
            priority,
            sender: sender.into(),
            status: ApprovalStatus::Pending,
            requires_response: true,
            feedback: None,
            code: None,
            explanation: None,
        }
    }

    /// A fire-and-forget notification; no reply expected.
    pub fn notification(
        title: impl Into<String>,
        body: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        let mut message = Self::request(title, body, Priority::Normal, sender);
        message.requires_response = false;
        message
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>, explanation: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self.explanation = Some(explanation.into());
        self
    }
}

/// Terminal interpretation of one inbound reply frame.
///
/// Rejection is a normal outcome, never a transport failure, and a
/// structurally invalid frame resolves as `Invalid` rather than propagating
/// a parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Approved { feedback: Option<String> },
    Rejected { feedback: Option<String> },
    Invalid { reason: String },
}

/// Parse a raw inbound frame into a [`ReplyOutcome`].
#[must_use]
pub fn interpret_reply(raw: &str) -> ReplyOutcome {
    let reply: ApprovalMessage = match serde_json::from_str(raw) {
        Ok(reply) => reply,
        Err(err) => {
            return ReplyOutcome::Invalid {
                reason: format!("unparseable reply frame: {err}"),
            };
        }
    };

    match reply.status {
        ApprovalStatus::Approved => ReplyOutcome::Approved {
            feedback: reply.feedback,
        },
        ApprovalStatus::Rejected => ReplyOutcome::Rejected {
            feedback: reply.feedback,
        },
        ApprovalStatus::Pending => ReplyOutcome::Invalid {
            reason: "reply still marked pending".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_json(status: &str, feedback: Option<&str>) -> String {
        let mut message = ApprovalMessage::request(
            "Re: run code",
            "decision",
            Priority::High,
            "human-operator",
        );
        message.feedback = feedback.map(str::to_string);
        let mut value = serde_json::to_value(&message).unwrap();
        value["status"] = serde_json::json!(status);
        value.to_string()
    }

    #[test]
    fn wire_field_names_are_stable() {
        let message = ApprovalMessage::request("t", "b", Priority::Urgent, "codewarden")
            .with_code("print(1)", "prints one");
        let value = serde_json::to_value(&message).unwrap();

        for field in [
            "id",
            "title",
            "body",
            "timestamp",
            "priority",
            "sender",
            "status",
            "requiresResponse",
            "code",
            "explanation",
        ] {
            assert!(value.get(field).is_some(), "missing wire field {field}");
        }
        assert_eq!(value["priority"], "urgent");
        assert_eq!(value["status"], "pending");
    }

    #[test]
    fn notification_does_not_require_response() {
        let message = ApprovalMessage::notification("done", "result attached", "codewarden");
        assert!(!message.requires_response);
        let value = serde_json::to_value(&message).unwrap();
        // Optional fields stay off the wire when unset.
        assert!(value.get("feedback").is_none());
        assert!(value.get("code").is_none());
    }

    #[test]
    fn interpret_approved_reply() {
        let outcome = interpret_reply(&reply_json("approved", Some("looks fine")));
        assert_eq!(
            outcome,
            ReplyOutcome::Approved {
                feedback: Some("looks fine".to_string())
            }
        );
    }

    #[test]
    fn interpret_rejected_reply_keeps_feedback() {
        let outcome = interpret_reply(&reply_json("rejected", Some("too risky")));
        assert_eq!(
            outcome,
            ReplyOutcome::Rejected {
                feedback: Some("too risky".to_string())
            }
        );
    }

    #[test]
    fn pending_status_is_not_a_valid_reply() {
        let outcome = interpret_reply(&reply_json("pending", None));
        assert!(matches!(outcome, ReplyOutcome::Invalid { .. }));
    }

    #[test]
    fn garbage_resolves_as_invalid_not_panic() {
        let outcome = interpret_reply("{not json");
        assert!(matches!(outcome, ReplyOutcome::Invalid { .. }));

        let outcome = interpret_reply(r#"{"unexpected": true}"#);
        assert!(matches!(outcome, ReplyOutcome::Invalid { .. }));
    }
}
