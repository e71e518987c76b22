//! Transport seam for the control channel.
//!
//! The channel owns a pair of frame queues; what sits on the far side is an
//! implementation detail. [`WsTransport`] speaks WebSocket to a remote
//! approval endpoint, [`MemoryTransport`] is an in-process loopback used by
//! tests and local mode.

use crate::error::ConnectionError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// One live duplex link: frames the channel pushes to the wire, and frames
/// arriving from it. The inbound receiver closing means the link is down.
pub struct TransportPair {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Connection factory — bring your own wire.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<TransportPair, ConnectionError>;
}

// ─── WebSocket transport ────────────────────────────────────────────────────

/// WebSocket transport to the approval endpoint. Each connect spawns a write
/// pump and a read pump; dropping the outbound sender closes the socket.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, address: &str) -> Result<TransportPair, ConnectionError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(address)
            .await
            .map_err(|e| ConnectionError::Transport(format!("connect {address}: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = write.send(Message::Text(frame.into())).await {
                    tracing::warn!("control channel write failed: {err}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(message) => {
                        if let Some(text) = websocket_message_to_text(message)
                            && in_tx.send(text).is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!("control channel read failed: {err}");
                        break;
                    }
                }
            }
            // in_tx drops here; the channel observes the closed inbound side.
        });

        Ok(TransportPair {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn websocket_message_to_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.to_string()),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        _ => None,
    }
}

// ─── In-memory transport ────────────────────────────────────────────────────

/// In-process transport. Every successful connect hands the paired
/// [`MemoryHub`] a [`MemoryPeer`] representing the far (human) side.
pub struct MemoryTransport {
    shared: Arc<MemoryShared>,
}

/// Test/local-mode handle to the far side of a [`MemoryTransport`].
pub struct MemoryHub {
    shared: Arc<MemoryShared>,
}

/// The far side of one accepted link: frames the channel sent, and an
/// injector for replies. Dropping the peer closes the link.
pub struct MemoryPeer {
    pub sent: mpsc::UnboundedReceiver<String>,
    pub inject: mpsc::UnboundedSender<String>,
}

struct MemoryShared {
    fail_next: AtomicU32,
    peers: Mutex<VecDeque<MemoryPeer>>,
    notify: Notify,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryHub) {
        let shared = Arc::new(MemoryShared {
            fail_next: AtomicU32::new(0),
            peers: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemoryHub { shared },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _address: &str) -> Result<TransportPair, ConnectionError> {
        let scripted_failure = self
            .shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(ConnectionError::Transport(
                "simulated connect failure".to_string(),
            ));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        self.shared
            .peers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(MemoryPeer {
                sent: out_rx,
                inject: in_tx,
            });
        self.shared.notify.notify_one();

        Ok(TransportPair {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MemoryHub {
    /// Wait for the next link the channel opens.
    pub async fn accept(&self) -> MemoryPeer {
        loop {
            if let Some(peer) = self
                .shared
                .peers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front()
            {
                return peer;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Make the next `n` connect attempts fail with a transport error.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }
}

impl MemoryPeer {
    /// Next frame the channel transmitted, in send order.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Inject an inbound frame, as if the human endpoint replied.
    pub fn reply(&self, frame: impl Into<String>) {
        let _ = self.inject.send(frame.into());
    }
}
