//! Control-channel manager.
//!
//! Owns the one duplex connection to the human approval endpoint: connect,
//! reconnect with backoff, FIFO queuing while disconnected, and the single
//! pending-request slot the correlator pairs replies against. Every close or
//! error path fails the pending request *before* the connection state
//! changes, so a caller can never hang past connection loss.

pub mod correlator;
pub mod transport;

use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use transport::{Transport, TransportPair};

/// Lifecycle of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Reconnect behaviour after a connect failure or link loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    5
}

type PendingSender = oneshot::Sender<Result<String, ConnectionError>>;
pub(crate) type PendingReceiver = oneshot::Receiver<Result<String, ConnectionError>>;

struct Shared {
    transport: Box<dyn Transport>,
    state: Mutex<LinkState>,
    address: Mutex<Option<String>>,
    policy: Mutex<ReconnectPolicy>,
    /// Cleared by `disconnect()` regardless of the configured policy.
    auto_reconnect: AtomicBool,
    /// Outbound frames waiting for an OPEN link, flushed in FIFO order.
    queue: Mutex<VecDeque<String>>,
    sink: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// At most one in-flight correlated request per connection.
    pending: Mutex<Option<PendingSender>>,
    /// General handler for inbound frames with no pending request.
    unsolicited: Mutex<Option<mpsc::UnboundedSender<String>>>,
    attempts: AtomicU32,
    /// Bumped on every new link and on disconnect; stale reader loops and
    /// reconnect timers check it and stand down.
    epoch: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// The duplex control channel to the approval endpoint.
pub struct ControlChannel {
    shared: Arc<Shared>,
}

impl ControlChannel {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                state: Mutex::new(LinkState::Disconnected),
                address: Mutex::new(None),
                policy: Mutex::new(ReconnectPolicy::default()),
                auto_reconnect: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                sink: Mutex::new(None),
                pending: Mutex::new(None),
                unsolicited: Mutex::new(None),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                reconnect_task: Mutex::new(None),
                reader_task: Mutex::new(None),
            }),
        }
    }

    /// Connect to the approval endpoint. On failure the reconnect policy
    /// takes over; the error from the first attempt is still returned.
    pub async fn connect(
        &self,
        address: &str,
        policy: ReconnectPolicy,
    ) -> Result<(), ConnectionError> {
        *lock(&self.shared.address) = Some(address.to_string());
        self.shared
            .auto_reconnect
            .store(policy.enabled, Ordering::SeqCst);
        *lock(&self.shared.policy) = policy;
        self.shared.attempts.store(0, Ordering::SeqCst);
        try_open(&self.shared).await
    }

    /// Explicit reconnect: resets the attempt counter and re-arms the
    /// configured auto-reconnect policy.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.shared.attempts.store(0, Ordering::SeqCst);
        let enabled = lock(&self.shared.policy).enabled;
        self.shared.auto_reconnect.store(enabled, Ordering::SeqCst);
        try_open(&self.shared).await
    }

    /// Disable auto-reconnect, cancel any scheduled reconnect, fail the
    /// pending request, and close the link.
    pub async fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(task) = lock(&self.shared.reconnect_task).take() {
            task.abort();
        }

        *lock(&self.shared.state) = LinkState::Closing;
        fail_pending(&self.shared, ConnectionError::Disconnected);
        *lock(&self.shared.sink) = None;

        if let Some(task) = lock(&self.shared.reader_task).take() {
            task.abort();
        }

        *lock(&self.shared.state) = LinkState::Disconnected;
        tracing::info!("control channel disconnected");
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.shared.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Fire-and-forget send. Transmits immediately when OPEN, otherwise the
    /// frame joins the outbound queue (unbounded; queue growth is the only
    /// backpressure signal — documented limitation).
    pub fn send(&self, frame: String) {
        if self.is_open()
            && let Some(sink) = lock(&self.shared.sink).as_ref()
        {
            match sink.send(frame) {
                Ok(()) => return,
                Err(err) => {
                    // Link died under us; requeue so the frame survives the
                    // reconnect. The reader loop handles the state change.
                    lock(&self.shared.queue).push_back(err.0);
                    return;
                }
            }
        }
        lock(&self.shared.queue).push_back(frame);
    }

    /// Route inbound frames that arrive without a pending request to the
    /// returned receiver. Frames are logged and dropped when no handler is
    /// installed.
    pub fn set_inbound_handler(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.unsolicited) = Some(tx);
        rx
    }

    /// Register the single pending request and transmit its frame. Fails
    /// fast when a request is already in flight or the channel is not OPEN.
    pub(crate) fn begin_request(&self, frame: String) -> Result<PendingReceiver, ConnectionError> {
        let mut pending = lock(&self.shared.pending);
        if pending.is_some() {
            return Err(ConnectionError::AlreadyAwaiting);
        }
        if *lock(&self.shared.state) != LinkState::Open {
            return Err(ConnectionError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        *pending = Some(tx);
        drop(pending);

        self.send(frame);
        Ok(rx)
    }

    /// Clear the pending slot (timeout path in the correlator).
    pub(crate) fn clear_pending(&self) {
        lock(&self.shared.pending).take();
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        lock(&self.shared.queue).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn try_open(shared: &Arc<Shared>) -> Result<(), ConnectionError> {
    let Some(address) = lock(&shared.address).clone() else {
        return Err(ConnectionError::NotConnected);
    };

    *lock(&shared.state) = LinkState::Connecting;
    match shared.transport.connect(&address).await {
        Ok(pair) => {
            open_link(shared, pair);
            Ok(())
        }
        Err(err) => {
            *lock(&shared.state) = LinkState::Disconnected;
            tracing::warn!(%address, "control channel connect failed: {err}");
            schedule_reconnect(shared);
            Err(err)
        }
    }
}

fn open_link(shared: &Arc<Shared>, pair: TransportPair) {
    let TransportPair { outbound, inbound } = pair;

    let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    *lock(&shared.sink) = Some(outbound.clone());
    *lock(&shared.state) = LinkState::Open;
    shared.attempts.store(0, Ordering::SeqCst);

    flush_queue(shared, &outbound);

    let reader = tokio::spawn(reader_loop(Arc::clone(shared), inbound, epoch));
    if let Some(previous) = lock(&shared.reader_task).replace(reader) {
        previous.abort();
    }

    tracing::info!("control channel open");
}

/// Drain queued frames in FIFO order. Anything that fails to transmit goes
/// back to the front of the queue, order preserved.
fn flush_queue(shared: &Arc<Shared>, sink: &mpsc::UnboundedSender<String>) {
    let mut queue = lock(&shared.queue);
    let flushed = queue.len();
    while let Some(frame) = queue.pop_front() {
        if let Err(err) = sink.send(frame) {
            queue.push_front(err.0);
            break;
        }
    }
    if flushed > 0 {
        tracing::info!(frames = flushed, "flushed outbound queue");
    }
}

async fn reader_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    epoch: u64,
) {
    while let Some(frame) = inbound.recv().await {
        if shared.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        dispatch_inbound(&shared, frame);
    }

    if shared.epoch.load(Ordering::SeqCst) != epoch {
        return;
    }

    tracing::warn!("control channel link lost");
    fail_pending(&shared, ConnectionError::Disconnected);
    *lock(&shared.sink) = None;
    *lock(&shared.state) = LinkState::Disconnected;
    schedule_reconnect(&shared);
}

fn dispatch_inbound(shared: &Arc<Shared>, frame: String) {
    if let Some(tx) = lock(&shared.pending).take() {
        if tx.send(Ok(frame)).is_err() {
            tracing::debug!("pending request receiver dropped before its reply arrived");
        }
        return;
    }

    if let Some(handler) = lock(&shared.unsolicited).as_ref()
        && handler.send(frame).is_ok()
    {
        return;
    }
    tracing::debug!("unsolicited inbound frame dropped (no handler installed)");
}

/// Fail the pending request, if any. Always called before the connection
/// state transition so the caller observes the failure first.
fn fail_pending(shared: &Arc<Shared>, err: ConnectionError) {
    if let Some(tx) = lock(&shared.pending).take() {
        let _ = tx.send(Err(err));
    }
}

fn schedule_reconnect(shared: &Arc<Shared>) {
    if !shared.auto_reconnect.load(Ordering::SeqCst) {
        return;
    }
    let policy = lock(&shared.policy).clone();
    if !policy.enabled {
        return;
    }

    let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt > policy.max_attempts {
        tracing::warn!(
            max_attempts = policy.max_attempts,
            "reconnect budget exhausted; waiting for explicit reconnect"
        );
        return;
    }

    let epoch = shared.epoch.load(Ordering::SeqCst);
    let task_shared = Arc::clone(shared);
    let task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(policy.interval_ms)).await;
        if task_shared.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        tracing::info!(attempt, "attempting control channel reconnect");
        let _ = try_open(&task_shared).await;
    });

    if let Some(previous) = lock(&shared.reconnect_task).replace(task) {
        previous.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::transport::MemoryTransport;
    use super::*;
    use std::time::Duration;

    fn channel() -> (ControlChannel, transport::MemoryHub) {
        let (transport, hub) = MemoryTransport::new();
        (ControlChannel::new(Box::new(transport)), hub)
    }

    fn no_reconnect() -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        }
    }

    #[tokio::test]
    async fn connect_transitions_to_open() {
        let (channel, _hub) = channel();
        assert_eq!(channel.state(), LinkState::Disconnected);

        channel.connect("mem://hub", no_reconnect()).await.unwrap();
        assert_eq!(channel.state(), LinkState::Open);
    }

    #[tokio::test]
    async fn send_while_disconnected_queues_and_flushes_in_order() {
        let (channel, hub) = channel();
        channel.send("first".to_string());
        channel.send("second".to_string());
        channel.send("third".to_string());
        assert_eq!(channel.queued_len(), 3);

        channel.connect("mem://hub", no_reconnect()).await.unwrap();
        let mut peer = hub.accept().await;

        assert_eq!(peer.next_sent().await.unwrap(), "first");
        assert_eq!(peer.next_sent().await.unwrap(), "second");
        assert_eq!(peer.next_sent().await.unwrap(), "third");
        assert_eq!(channel.queued_len(), 0);
    }

    #[tokio::test]
    async fn send_while_open_transmits_immediately() {
        let (channel, hub) = channel();
        channel.connect("mem://hub", no_reconnect()).await.unwrap();
        let mut peer = hub.accept().await;

        channel.send("live frame".to_string());
        assert_eq!(peer.next_sent().await.unwrap(), "live frame");
    }

    #[tokio::test]
    async fn disconnect_fails_pending_request() {
        let (channel, hub) = channel();
        channel.connect("mem://hub", no_reconnect()).await.unwrap();
        let _peer = hub.accept().await;

        let rx = channel.begin_request("ping".to_string()).unwrap();
        channel.disconnect().await;

        let resolved = rx.await.expect("pending slot must be resolved, not dropped");
        assert!(matches!(resolved, Err(ConnectionError::Disconnected)));
        assert_eq!(channel.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn link_loss_fails_pending_request() {
        let (channel, hub) = channel();
        channel.connect("mem://hub", no_reconnect()).await.unwrap();
        let peer = hub.accept().await;

        let rx = channel.begin_request("ping".to_string()).unwrap();
        drop(peer);

        let resolved = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("pending request must resolve promptly on link loss")
            .unwrap();
        assert!(matches!(resolved, Err(ConnectionError::Disconnected)));
    }

    #[tokio::test]
    async fn second_request_fails_while_one_is_pending() {
        let (channel, hub) = channel();
        channel.connect("mem://hub", no_reconnect()).await.unwrap();
        let mut peer = hub.accept().await;

        let _rx = channel.begin_request("one".to_string()).unwrap();
        let err = channel.begin_request("two".to_string()).unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyAwaiting));

        // Only the first frame ever reached the wire.
        assert_eq!(peer.next_sent().await.unwrap(), "one");
        assert!(peer.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn begin_request_requires_open_channel() {
        let (channel, _hub) = channel();
        let err = channel.begin_request("ping".to_string()).unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn inbound_frame_resolves_pending_request() {
        let (channel, hub) = channel();
        channel.connect("mem://hub", no_reconnect()).await.unwrap();
        let mut peer = hub.accept().await;

        let rx = channel.begin_request("request".to_string()).unwrap();
        assert_eq!(peer.next_sent().await.unwrap(), "request");

        peer.reply("reply");
        assert_eq!(rx.await.unwrap().unwrap(), "reply");
    }

    #[tokio::test]
    async fn unsolicited_frames_reach_the_general_handler() {
        let (channel, hub) = channel();
        let mut general = channel.set_inbound_handler();
        channel.connect("mem://hub", no_reconnect()).await.unwrap();
        let peer = hub.accept().await;

        peer.reply("broadcast");
        assert_eq!(general.recv().await.unwrap(), "broadcast");
    }

    #[tokio::test]
    async fn auto_reconnect_reopens_after_link_loss() {
        let (channel, hub) = channel();
        channel
            .connect(
                "mem://hub",
                ReconnectPolicy {
                    enabled: true,
                    interval_ms: 10,
                    max_attempts: 3,
                },
            )
            .await
            .unwrap();
        let peer = hub.accept().await;

        drop(peer);
        let mut peer = tokio::time::timeout(Duration::from_secs(2), hub.accept())
            .await
            .expect("channel should reconnect on its own");

        channel.send("after reconnect".to_string());
        assert_eq!(peer.next_sent().await.unwrap(), "after reconnect");
    }

    #[tokio::test]
    async fn reconnect_budget_is_capped_until_explicit_reconnect() {
        let (transport, hub) = MemoryTransport::new();
        hub.fail_next_connects(10);
        let channel = ControlChannel::new(Box::new(transport));

        let result = channel
            .connect(
                "mem://hub",
                ReconnectPolicy {
                    enabled: true,
                    interval_ms: 5,
                    max_attempts: 2,
                },
            )
            .await;
        assert!(result.is_err());

        // Two scheduled retries burn the remaining scripted failures 2 and 3,
        // then the budget is exhausted and the channel stays down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.state(), LinkState::Disconnected);

        // Explicit reconnect resets the counter and succeeds once the
        // scripted failures are cleared.
        hub.fail_next_connects(0);
        channel.reconnect().await.unwrap();
        assert_eq!(channel.state(), LinkState::Open);
    }

    #[tokio::test]
    async fn disconnect_cancels_scheduled_reconnect() {
        let (transport, hub) = MemoryTransport::new();
        hub.fail_next_connects(1);
        let channel = ControlChannel::new(Box::new(transport));

        let _ = channel
            .connect(
                "mem://hub",
                ReconnectPolicy {
                    enabled: true,
                    interval_ms: 20,
                    max_attempts: 5,
                },
            )
            .await;
        channel.disconnect().await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(channel.state(), LinkState::Disconnected);
    }
}
