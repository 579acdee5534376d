//! Live channel supervision: connect, subscribe, reconnect with backoff.
//!
//! The supervisor drives an explicit state machine (disconnected, connecting,
//! subscribed, reconnecting), observable through a `watch` channel, and feeds
//! every received message through the normalize/upsert pipeline. Push delivery is
//! not gap-free across a disconnect window, so each successful *re*connect
//! signals the controller to issue one supplementary history fetch as the
//! correctness backstop.
//!
//! Transport is a trait so tests drive the machine deterministically with
//! scripted connects and disconnects; the real implementation speaks
//! WebSocket and subscribes to the per-user topic right after connecting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt as _, StreamExt as _};
use rand::Rng as _;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::logging;
use crate::protocol::{normalize, now_secs, Origin};
use crate::state::{FeedEvent, FeedSender, SharedStore};

/// Connection lifecycle of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting,
}

impl ChannelState {
    pub fn is_connected(self) -> bool {
        matches!(self, ChannelState::Subscribed)
    }
}

#[derive(Debug)]
pub enum TransportError {
    Connect(String),
    Read(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connect(error) => write!(f, "connect failed: {error}"),
            TransportError::Read(error) => write!(f, "read failed: {error}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The per-user push destination.
pub fn user_topic(user_id: &str) -> String {
    format!("notifications/{user_id}")
}

/// Exponential backoff with a cap and half-jitter: the delay for attempt `n`
/// is drawn uniformly from `[d/2, d]` where `d = min(cap, base * 2^n)`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let millis = capped.as_millis() as u64;
        let jittered = millis / 2 + rand::thread_rng().gen_range(0..=millis / 2);
        Duration::from_millis(jittered)
    }
}

/// One established push session.
#[async_trait]
pub trait PushStream: Send {
    /// Next raw message; `None` when the server closed the stream.
    async fn next_event(&mut self) -> Option<Result<String, TransportError>>;
}

/// Factory for push sessions; the supervisor reconnects through it.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, topic: &str) -> Result<Box<dyn PushStream>, TransportError>;
}

/// WebSocket implementation of [`PushTransport`].
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self, topic: &str) -> Result<Box<dyn PushStream>, TransportError> {
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, read) = ws.split();

        // Subscribe to the per-user destination before consuming events.
        let subscribe = serde_json::json!({ "type": "subscribe", "topic": topic });
        let text = serde_json::to_string(&subscribe)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        write
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Box::new(WsStream {
            read,
            // Keep the write half alive for the duration of the session.
            _write: write,
        }))
    }
}

struct WsStream {
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    _write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>,
}

#[async_trait]
impl PushStream for WsStream {
    async fn next_event(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(message) = self.read.next().await {
            match message {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => {
                        return Some(Err(TransportError::Read(format!("non-utf8 frame: {e}"))))
                    }
                },
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue, // ping/pong/raw frames
                Err(e) => return Some(Err(TransportError::Read(e.to_string()))),
            }
        }
        None
    }
}

pub struct ChannelConfig {
    pub topic: String,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

/// Supervises the push connection and feeds its events into the store.
pub struct LiveChannel {
    transport: Arc<dyn PushTransport>,
    store: SharedStore,
    events: FeedSender,
    state_tx: watch::Sender<ChannelState>,
    refetch_tx: mpsc::UnboundedSender<()>,
    config: ChannelConfig,
}

impl LiveChannel {
    /// Returns the supervisor plus its state observer and the re-fetch
    /// trigger the controller listens on.
    pub fn new(
        transport: Arc<dyn PushTransport>,
        store: SharedStore,
        events: FeedSender,
        config: ChannelConfig,
    ) -> (
        Self,
        watch::Receiver<ChannelState>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                store,
                events,
                state_tx,
                refetch_tx,
                config,
            },
            state_rx,
            refetch_rx,
        )
    }

    fn set_state(&self, next: ChannelState) {
        let prev = *self.state_tx.borrow();
        if prev == next {
            return;
        }
        let _ = self.state_tx.send(next);
        if prev.is_connected() != next.is_connected() {
            let _ = self.events.send(FeedEvent::Channel {
                connected: next.is_connected(),
            });
        }
    }

    async fn handle_message(&self, text: &str) {
        let raw: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(error) => {
                crate::mlog!("channel: dropping undecodable frame: {}", error);
                return;
            }
        };
        let event = match normalize(&raw, Origin::Pushed, now_secs()) {
            Ok(event) => event,
            Err(error) => {
                crate::mlog!("channel: dropping malformed event: {}", error);
                return;
            }
        };

        let mut store = self.store.lock().await;
        let id = event.record.id.clone();
        if store.apply(event) {
            crate::mlog!("channel: applied pushed event {}", logging::notif_id(&id));
            let _ = self.events.send(FeedEvent::Updated { id });
            let _ = self.events.send(FeedEvent::Unread {
                count: store.unread_count(),
            });
        }
    }

    /// Run until `shutdown` flips true. Retries indefinitely; transport
    /// failures never escape this loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_cap);
        let mut had_session = false;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ChannelState::Connecting);

            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                connected = self.transport.connect(&self.config.topic) => connected,
            };

            match connected {
                Ok(mut stream) => {
                    backoff.reset();
                    self.set_state(ChannelState::Subscribed);
                    crate::mlog!("channel: subscribed to {}", self.config.topic);
                    if had_session {
                        // Events published while disconnected were lost; the
                        // supplementary fetch closes the gap.
                        let _ = self.refetch_tx.send(());
                    }
                    had_session = true;

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                self.set_state(ChannelState::Disconnected);
                                return;
                            }
                            message = stream.next_event() => match message {
                                Some(Ok(text)) => self.handle_message(&text).await,
                                Some(Err(error)) => {
                                    crate::mlog!("channel: read error: {}", error);
                                    break;
                                }
                                None => {
                                    crate::mlog!("channel: server closed the stream");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(error) => {
                    crate::mlog!("channel: {}", error);
                }
            }

            self.set_state(ChannelState::Reconnecting);
            let delay = backoff.next_delay();
            crate::mlog!("channel: reconnecting in {}ms", delay.as_millis());
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ChannelState::Disconnected);
    }
}
