//! Real-time channel lifecycle: connect, heartbeat, reconnect.
//!
//! [`ConnectionManager`] owns at most one live WebSocket at a time. Opening
//! a channel for a new target always tears down the previous one first.
//! Unintentional drops are retried with capped exponential backoff while an
//! access token is held; an intentional [`disconnect`](ConnectionManager::disconnect)
//! sends a normal-closure frame and cancels any pending retry so no timer
//! fires after teardown.
//!
//! Inbound events are routed here: message-addressed events mutate the
//! [`MessageStore`], typing indicators fan out to a presence channel, and
//! unrecognized envelopes are forwarded raw to a generic handler channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use chatloop_proto::event::{ClientEvent, Envelope, ServerEvent, parse_event};
use chatloop_proto::message::ConversationId;

use crate::auth::TokenProvider;
use crate::config::{ReconnectConfig, SyncConfig};
use crate::store::MessageStore;

/// Type alias for the write half of the channel WebSocket.
type WsSink =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// How long a replaced or disconnected channel task gets to close cleanly
/// before it is aborted.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Observable lifecycle of the real-time channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// A typing indicator received on the channel; delivered to the presence
/// handler, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingNotice {
    pub user_id: String,
    pub is_typing: bool,
}

/// Receiving ends of the channels the connection layer fans events into.
pub struct ChannelEvents {
    /// Typing indicators for the presence UI.
    pub typing: mpsc::Receiver<TypingNotice>,
    /// Raw payloads of event types the engine does not recognize.
    pub generic: mpsc::Receiver<serde_json::Value>,
}

/// Everything a channel task needs, cheap to clone into the task.
#[derive(Clone)]
struct ChannelShared {
    cfg: Arc<SyncConfig>,
    store: Arc<MessageStore>,
    tokens: Arc<dyn TokenProvider>,
    typing_tx: mpsc::Sender<TypingNotice>,
    generic_tx: mpsc::Sender<serde_json::Value>,
    state_tx: watch::Sender<ConnectionState>,
}

/// A spawned channel task and the handle to shut it down.
struct ActiveChannel {
    conversation: Option<ConversationId>,
    shutdown: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the single live real-time channel and recovers from drops.
pub struct ConnectionManager {
    shared: ChannelShared,
    active: Mutex<Option<ActiveChannel>>,
}

impl ConnectionManager {
    /// Creates a manager wired to the given store and token source.
    ///
    /// Returns the manager and the event channels the host consumes. No
    /// connection is opened until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        cfg: Arc<SyncConfig>,
        store: Arc<MessageStore>,
        tokens: Arc<dyn TokenProvider>,
    ) -> (Self, ChannelEvents) {
        let (typing_tx, typing_rx) = mpsc::channel(cfg.event_buffer);
        let (generic_tx, generic_rx) = mpsc::channel(cfg.event_buffer);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let manager = Self {
            shared: ChannelShared {
                cfg,
                store,
                tokens,
                typing_tx,
                generic_tx,
                state_tx,
            },
            active: Mutex::new(None),
        };
        let events = ChannelEvents {
            typing: typing_rx,
            generic: generic_rx,
        };
        (manager, events)
    }

    /// Opens the channel for the given conversation (or the
    /// conversation-less default).
    ///
    /// A no-op when a live channel for the same target already exists.
    /// Otherwise any existing channel is closed first, so at most one live
    /// socket exists per manager.
    pub async fn connect(&self, conversation: Option<ConversationId>) {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref()
            && current.conversation == conversation
            && !current.task.is_finished()
        {
            tracing::debug!(conversation = ?conversation, "channel already open for target");
            return;
        }
        if let Some(previous) = active.take() {
            teardown(previous).await;
        }

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(run_channel(
            self.shared.clone(),
            conversation.clone(),
            Arc::clone(&shutdown),
        ));
        *active = Some(ActiveChannel {
            conversation,
            shutdown,
            task,
        });
    }

    /// Closes the channel with a normal-closure frame and cancels any
    /// pending reconnection. Idempotent.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        if let Some(channel) = active.take() {
            teardown(channel).await;
        }
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch channel for connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

/// Signals the task to close and waits briefly before aborting it.
async fn teardown(channel: ActiveChannel) {
    channel.shutdown.notify_one();
    let mut task = channel.task;
    if tokio::time::timeout(TEARDOWN_GRACE, &mut task).await.is_err() {
        tracing::warn!("channel task did not stop in time, aborting");
        task.abort();
    }
}

/// Why a driven socket stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    /// Client-requested closure; do not reconnect.
    Intentional,
    /// Server close, read/write error, or stream end; reconnect.
    Dropped,
}

/// Connect-and-reconnect loop for one channel target.
///
/// Runs until the channel is intentionally closed, authentication is lost,
/// or the configured attempt cap is exhausted. The attempt counter resets
/// only on a confirmed open.
async fn run_channel(
    shared: ChannelShared,
    conversation: Option<ConversationId>,
    shutdown: Arc<Notify>,
) {
    let mut attempt: u32 = 0;
    let mut recovering = false;
    loop {
        let Some(token) = shared.tokens.access_token() else {
            tracing::info!("not authenticated, leaving channel down");
            shared.state_tx.send_replace(ConnectionState::Disconnected);
            return;
        };
        shared.state_tx.send_replace(if recovering || attempt > 0 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let endpoint = match shared.cfg.channel_endpoint(conversation.as_ref(), &token) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(err = %e, "channel endpoint misconfigured");
                shared.state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }
        };

        match open_socket(&shared.cfg, endpoint.as_str()).await {
            Ok(socket) => {
                attempt = 0;
                shared.state_tx.send_replace(ConnectionState::Connected);
                tracing::info!(conversation = ?conversation, "channel open");

                if drive_socket(&shared, socket, &shutdown).await == CloseKind::Intentional {
                    shared.state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
                // Flip the state before the backoff sleep, not at the
                // top of the next pass.
                recovering = true;
                shared.state_tx.send_replace(ConnectionState::Reconnecting);
                tracing::warn!("channel dropped");
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "channel connect failed");
            }
        }

        if let Some(cap) = shared.cfg.reconnect.max_attempts
            && attempt >= cap
        {
            tracing::warn!(attempts = attempt, "reconnect attempts exhausted, giving up");
            shared.state_tx.send_replace(ConnectionState::Disconnected);
            return;
        }

        let delay = backoff_delay(attempt, &shared.cfg.reconnect);
        attempt += 1;
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            () = shutdown.notified() => {
                tracing::debug!("reconnect cancelled");
                shared.state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Delay before retry number `attempt` (zero-based): `base · 2^attempt`,
/// capped at the policy maximum.
#[must_use]
pub fn backoff_delay(attempt: u32, policy: &ReconnectConfig) -> Duration {
    let base = u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX);
    let delay = 2u64
        .checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(policy.max_delay, Duration::from_millis);
    delay.min(policy.max_delay)
}

/// Establishes the WebSocket with the configured connect timeout.
async fn open_socket(
    cfg: &SyncConfig,
    endpoint: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, String> {
    match tokio::time::timeout(cfg.connect_timeout, connect_async(endpoint)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("connect timed out".to_string()),
    }
}

/// Pumps one open socket: heartbeat out, events in.
///
/// Returns when the socket closes. An intentional shutdown sends a
/// normal-closure frame first; the close code is what tells the backend
/// (and this loop) not to treat it as a drop.
async fn drive_socket(
    shared: &ChannelShared,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    shutdown: &Notify,
) -> CloseKind {
    let (mut sink, mut reader) = socket.split();
    let mut heartbeat = tokio::time::interval(shared.cfg.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick completes immediately; the heartbeat starts
    // one full period after open.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            () = shutdown.notified() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(err = %e, "close frame not sent");
                }
                return CloseKind::Intentional;
            }
            _ = heartbeat.tick() => {
                if !send_ping(&mut sink).await {
                    return CloseKind::Dropped;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(shared, text.as_str()),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("channel closed by server");
                    return CloseKind::Dropped;
                }
                Some(Ok(_)) => {
                    // Binary/pong frames carry nothing for us.
                }
                Some(Err(e)) => {
                    tracing::warn!(err = %e, "channel read error");
                    return CloseKind::Dropped;
                }
                None => return CloseKind::Dropped,
            }
        }
    }
}

/// Sends the heartbeat ping. Exists solely to keep idle intermediaries
/// from dropping the connection.
async fn send_ping(sink: &mut WsSink) -> bool {
    let Ok(ping) = serde_json::to_string(&ClientEvent::Ping) else {
        return true;
    };
    match sink.send(Message::Text(ping.into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(err = %e, "heartbeat send failed");
            false
        }
    }
}

/// Routes one inbound text frame.
///
/// Malformed frames are logged and skipped; the channel does not
/// disconnect on bad data.
fn handle_frame(shared: &ChannelShared, text: &str) {
    match parse_event(text) {
        Ok(Envelope::Known(event)) => match &event {
            ServerEvent::Typing { user_id, is_typing } => {
                let notice = TypingNotice {
                    user_id: user_id.clone(),
                    is_typing: *is_typing,
                };
                if shared.typing_tx.try_send(notice).is_err() {
                    tracing::debug!("typing channel full, dropping notice");
                }
            }
            ServerEvent::Connection { message } => {
                tracing::debug!(message = ?message, "channel confirmed");
            }
            ServerEvent::ProcessingStarted { message_id } => {
                tracing::debug!(message_id = ?message_id, "processing started");
            }
            ServerEvent::Pong => {
                tracing::trace!("heartbeat acknowledged");
            }
            ServerEvent::Chunk { .. }
            | ServerEvent::Sources { .. }
            | ServerEvent::ProcessingCompleted { .. }
            | ServerEvent::Error { .. } => {
                shared.store.apply_event(&event);
            }
        },
        Ok(Envelope::Unknown(value)) => {
            tracing::debug!(kind = ?value.get("type"), "unrecognized event, forwarding");
            if shared.generic_tx.try_send(value).is_err() {
                tracing::debug!("generic event channel full, dropping event");
            }
        }
        Err(e) => {
            tracing::warn!(err = %e, "malformed channel frame, skipping");
        }
    }
}
