//! Request correlator: one outbound request paired with one inbound reply.
//!
//! The channel supports a single in-flight human round trip; human attention
//! is the bottleneck, so there is nothing to parallelize. The next inbound
//! frame while a request is pending *is* the reply. If multiple concurrent
//! approvals are ever needed, this slot becomes an id-keyed table and the
//! reply carries the correlation id.

use super::ControlChannel;
use crate::error::{TimeoutError, WardenError};
use crate::message::{ApprovalMessage, ReplyOutcome, interpret_reply};
use std::sync::Arc;
use std::time::Duration;

pub struct Correlator {
    channel: Arc<ControlChannel>,
}

impl Correlator {
    pub fn new(channel: Arc<ControlChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    /// Send a message and suspend until the reply, the timeout, or a
    /// disconnect — whichever happens first wins, and all three are
    /// mutually exclusive terminal outcomes.
    ///
    /// Rejection and structurally invalid replies are normal resolutions
    /// ([`ReplyOutcome`]), never errors.
    pub async fn send_and_await(
        &self,
        message: &ApprovalMessage,
        timeout: Duration,
    ) -> Result<ReplyOutcome, WardenError> {
        let frame = serde_json::to_string(message)
            .map_err(|e| anyhow::anyhow!("serialize approval message: {e}"))?;

        let rx = self.channel.begin_request(frame)?;
        tracing::debug!(
            id = %message.id,
            title = %message.title,
            timeout_ms = timeout.as_millis() as u64,
            "awaiting approval reply"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(raw))) => Ok(interpret_reply(&raw)),
            Ok(Ok(Err(connection_err))) => Err(connection_err.into()),
            // The sender side vanished without resolving; treat as a
            // disconnect rather than a hang.
            Ok(Err(_recv_err)) => Err(crate::error::ConnectionError::Disconnected.into()),
            Err(_elapsed) => {
                self.channel.clear_pending();
                Err(TimeoutError {
                    waited_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Fire-and-forget send: transmits if OPEN, silently enqueues otherwise.
    /// Always succeeds from the caller's perspective.
    pub fn send(&self, message: &ApprovalMessage) -> Result<(), WardenError> {
        let frame = serde_json::to_string(message)
            .map_err(|e| anyhow::anyhow!("serialize approval message: {e}"))?;
        self.channel.send(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transport::MemoryTransport;
    use crate::channel::{LinkState, ReconnectPolicy};
    use crate::error::ConnectionError;
    use crate::message::{ApprovalStatus, Priority};

    async fn open_correlator() -> (Correlator, crate::channel::transport::MemoryHub) {
        let (transport, hub) = MemoryTransport::new();
        let channel = Arc::new(ControlChannel::new(Box::new(transport)));
        channel
            .connect(
                "mem://hub",
                ReconnectPolicy {
                    enabled: false,
                    ..ReconnectPolicy::default()
                },
            )
            .await
            .unwrap();
        (Correlator::new(channel), hub)
    }

    fn request() -> ApprovalMessage {
        ApprovalMessage::request("Run code?", "print(1)", Priority::High, "codewarden")
    }

    fn reply_frame(request_raw: &str, status: ApprovalStatus, feedback: Option<&str>) -> String {
        let mut reply: ApprovalMessage = serde_json::from_str(request_raw).unwrap();
        reply.status = status;
        reply.feedback = feedback.map(str::to_string);
        serde_json::to_string(&reply).unwrap()
    }

    #[tokio::test]
    async fn approved_reply_resolves_with_payload() {
        let (correlator, hub) = open_correlator().await;
        let mut peer = hub.accept().await;

        let human = tokio::spawn(async move {
            let raw = peer.next_sent().await.unwrap();
            peer.reply(reply_frame(&raw, ApprovalStatus::Approved, Some("go ahead")));
            peer
        });

        let outcome = correlator
            .send_and_await(&request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReplyOutcome::Approved {
                feedback: Some("go ahead".to_string())
            }
        );
        human.await.unwrap();
    }

    #[tokio::test]
    async fn rejection_is_a_normal_outcome_not_an_error() {
        let (correlator, hub) = open_correlator().await;
        let mut peer = hub.accept().await;

        let human = tokio::spawn(async move {
            let raw = peer.next_sent().await.unwrap();
            peer.reply(reply_frame(&raw, ApprovalStatus::Rejected, Some("too risky")));
            peer
        });

        let outcome = correlator
            .send_and_await(&request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReplyOutcome::Rejected {
                feedback: Some("too risky".to_string())
            }
        );
        human.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_reply_resolves_structurally() {
        let (correlator, hub) = open_correlator().await;
        let mut peer = hub.accept().await;

        let human = tokio::spawn(async move {
            let _ = peer.next_sent().await.unwrap();
            peer.reply("not even close to json");
            peer
        });

        let outcome = correlator
            .send_and_await(&request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, ReplyOutcome::Invalid { .. }));
        human.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_resolves_and_channel_stays_usable() {
        let (correlator, hub) = open_correlator().await;
        let mut peer = hub.accept().await;

        let err = correlator
            .send_and_await(&request(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Timeout(_)));
        let _ = peer.next_sent().await.unwrap();

        // The slot was cleared; the next round trip works.
        let human = tokio::spawn(async move {
            let raw = peer.next_sent().await.unwrap();
            peer.reply(reply_frame(&raw, ApprovalStatus::Approved, None));
            peer
        });
        let outcome = correlator
            .send_and_await(&request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, ReplyOutcome::Approved { .. }));
        human.await.unwrap();
    }

    #[tokio::test]
    async fn second_send_and_await_fails_immediately() {
        let (correlator, hub) = open_correlator().await;
        let _peer = hub.accept().await;

        let first_request = request();
        let first = correlator.send_and_await(&first_request, Duration::from_secs(5));
        tokio::pin!(first);
        // Drive the first call far enough to register its pending slot.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), first.as_mut())
                .await
                .is_err()
        );

        let err = correlator
            .send_and_await(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::Connection(ConnectionError::AlreadyAwaiting)
        ));
    }

    #[tokio::test]
    async fn send_while_disconnected_queues_silently() {
        let (transport, _hub) = MemoryTransport::new();
        let channel = Arc::new(ControlChannel::new(Box::new(transport)));
        let correlator = Correlator::new(Arc::clone(&channel));

        correlator.send(&request()).unwrap();
        assert_eq!(channel.state(), LinkState::Disconnected);
    }
}
