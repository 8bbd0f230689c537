//! Mock backend core: shared state, channel handler, and REST endpoints.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, RwLock, mpsc};

use chatloop_proto::auth::{RefreshRequest, RefreshResponse};
use chatloop_proto::event::ServerEvent;
use chatloop_proto::message::{ConversationId, MessageId};
use chatloop_proto::query::{QueryRequest, QueryResponse};
use chatloop_proto::upload::UploadResponse;

/// Room for a full 10 MB upload plus multipart framing.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// One scripted reaction to a `/query` request, consumed in FIFO order.
/// With no script queued, the backend echoes the query as the answer.
#[derive(Debug, Clone)]
pub enum QueryScript {
    /// Respond 200 with this body.
    Answer(QueryResponse),
    /// Respond 503 (service not ready).
    Busy,
    /// Respond 504 (no upstream response).
    NoUpstream,
    /// Respond with this status and JSON body.
    ErrorBody {
        status: u16,
        body: serde_json::Value,
    },
    /// Wait, then respond 200 with this body.
    Delayed {
        delay: Duration,
        response: QueryResponse,
    },
    /// Respond 200 with headers, then never deliver a body byte.
    StalledBody,
}

/// How `/token/refresh` behaves.
#[derive(Debug, Clone)]
pub enum RefreshBehavior {
    /// Issue this access token.
    Issue(String),
    /// Respond 401; the session is revoked.
    Reject,
}

/// Builds a minimal successful query response for scripting.
#[must_use]
pub fn canned_response(conversation: &str, message: &str, answer: &str) -> QueryResponse {
    QueryResponse {
        conversation_id: ConversationId::new(conversation),
        message_id: MessageId::new(message),
        answer: answer.to_string(),
        sources: vec![],
        chunks: vec![],
        tokens_used: 7,
        processing_time_ms: 42,
        model_used: Some("mock-1".to_string()),
        context_used: 0,
        cached: false,
    }
}

/// Shared mock state: connected channels, counters, scripts.
struct BackendState {
    /// Live channel senders keyed by conversation id ("" for the
    /// conversation-less default endpoint).
    channels: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    query_scripts: Mutex<VecDeque<QueryScript>>,
    refresh_behavior: Mutex<RefreshBehavior>,
    /// When set, REST requests must carry this bearer token or get a 401.
    required_token: Mutex<Option<String>>,
    /// When `true`, `/upload` responds 500.
    fail_uploads: Mutex<bool>,
    /// The most recent `/query` body, for wire-level assertions.
    last_query: Mutex<Option<QueryRequest>>,
    ping_count: AtomicU32,
    connection_count: AtomicU32,
    query_count: AtomicU32,
    upload_count: AtomicU32,
    refresh_count: AtomicU32,
}

impl BackendState {
    fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            query_scripts: Mutex::new(VecDeque::new()),
            refresh_behavior: Mutex::new(RefreshBehavior::Reject),
            required_token: Mutex::new(None),
            fail_uploads: Mutex::new(false),
            last_query: Mutex::new(None),
            ping_count: AtomicU32::new(0),
            connection_count: AtomicU32::new(0),
            query_count: AtomicU32::new(0),
            upload_count: AtomicU32::new(0),
            refresh_count: AtomicU32::new(0),
        }
    }

    /// `None` when the bearer token is acceptable, otherwise a 401.
    async fn check_auth(&self, headers: &HeaderMap) -> Option<(StatusCode, String)> {
        let required = self.required_token.lock().await.clone()?;
        let expected = format!("Bearer {required}");
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented == Some(expected.as_str()) {
            None
        } else {
            Some((
                StatusCode::UNAUTHORIZED,
                r#"{"detail":"invalid token"}"#.to_string(),
            ))
        }
    }
}

/// Errors starting the mock backend.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The listener could not bind.
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

/// An in-process mock backend bound to an OS-assigned port.
pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
    task: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    /// Binds to `127.0.0.1:0` and serves until dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the listener cannot bind.
    pub async fn spawn() -> Result<Self, SpawnError> {
        Self::spawn_on("127.0.0.1:0").await
    }

    /// Binds to the given address and serves until dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the listener cannot bind.
    pub async fn spawn_on(addr: &str) -> Result<Self, SpawnError> {
        let state = Arc::new(BackendState::new());

        let app = axum::Router::new()
            .route("/channel/chat", axum::routing::get(channel_default))
            .route(
                "/channel/chat/{conversation}",
                axum::routing::get(channel_for_conversation),
            )
            .route("/query", axum::routing::post(query))
            .route("/upload", axum::routing::post(upload))
            .route("/token/refresh", axum::routing::post(refresh))
            .layer(DefaultBodyLimit::max(BODY_LIMIT))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "mock backend server error");
            }
        });

        tracing::info!(addr = %bound_addr, "mock backend listening");
        Ok(Self {
            addr: bound_addr,
            state,
            task,
        })
    }

    /// Runs until the server task exits (never, in practice).
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// REST base URL.
    #[must_use]
    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Channel base URL.
    #[must_use]
    pub fn channel_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Queues one `/query` reaction.
    pub async fn script_query(&self, script: QueryScript) {
        self.state.query_scripts.lock().await.push_back(script);
    }

    /// Sets `/token/refresh` behavior.
    pub async fn set_refresh(&self, behavior: RefreshBehavior) {
        *self.state.refresh_behavior.lock().await = behavior;
    }

    /// Requires this bearer token on REST endpoints (or clears the
    /// requirement).
    pub async fn require_token(&self, token: Option<&str>) {
        *self.state.required_token.lock().await = token.map(str::to_string);
    }

    /// Makes `/upload` respond 500 (or restores it).
    pub async fn set_fail_uploads(&self, fail: bool) {
        *self.state.fail_uploads.lock().await = fail;
    }

    /// Pushes one event into the channel for the given conversation (or
    /// the conversation-less default). Returns `false` when no channel for
    /// that target is connected.
    pub async fn push_event(
        &self,
        conversation: Option<&ConversationId>,
        event: &ServerEvent,
    ) -> bool {
        match serde_json::to_string(event) {
            Ok(text) => self.push_raw(conversation, &text).await,
            Err(_) => false,
        }
    }

    /// Pushes a raw text frame, for event types the engine does not know.
    pub async fn push_raw(&self, conversation: Option<&ConversationId>, text: &str) -> bool {
        let key = channel_key(conversation);
        let channels = self.state.channels.read().await;
        channels
            .get(&key)
            .is_some_and(|tx| tx.send(Message::Text(text.to_string().into())).is_ok())
    }

    /// Closes the channel for the given target from the server side,
    /// simulating a connection drop.
    pub async fn drop_channel(&self, conversation: Option<&ConversationId>) {
        let key = channel_key(conversation);
        if let Some(tx) = self.state.channels.write().await.remove(&key) {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Whether a channel for this target is currently connected.
    pub async fn channel_connected(&self, conversation: Option<&ConversationId>) -> bool {
        let key = channel_key(conversation);
        self.state.channels.read().await.contains_key(&key)
    }

    /// Heartbeat pings observed across all channels.
    #[must_use]
    pub fn ping_count(&self) -> u32 {
        self.state.ping_count.load(Ordering::Relaxed)
    }

    /// WebSocket connections accepted since start.
    #[must_use]
    pub fn connection_count(&self) -> u32 {
        self.state.connection_count.load(Ordering::Relaxed)
    }

    /// `/query` requests served.
    #[must_use]
    pub fn query_count(&self) -> u32 {
        self.state.query_count.load(Ordering::Relaxed)
    }

    /// `/upload` requests served.
    #[must_use]
    pub fn upload_count(&self) -> u32 {
        self.state.upload_count.load(Ordering::Relaxed)
    }

    /// `/token/refresh` requests served.
    #[must_use]
    pub fn refresh_count(&self) -> u32 {
        self.state.refresh_count.load(Ordering::Relaxed)
    }

    /// The most recent `/query` body, as parsed off the wire.
    pub async fn last_query(&self) -> Option<QueryRequest> {
        self.state.last_query.lock().await.clone()
    }
}

fn channel_key(conversation: Option<&ConversationId>) -> String {
    conversation.map(ToString::to_string).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Channel handlers
// ---------------------------------------------------------------------------

async fn channel_default(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    upgrade_channel(ws, params, state, String::new())
}

async fn channel_for_conversation(
    ws: WebSocketUpgrade,
    Path(conversation): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    upgrade_channel(ws, params, state, conversation)
}

fn upgrade_channel(
    ws: WebSocketUpgrade,
    params: HashMap<String, String>,
    state: Arc<BackendState>,
    key: String,
) -> axum::response::Response {
    if params.get("token").is_none_or(String::is_empty) {
        return (StatusCode::FORBIDDEN, "missing token").into_response();
    }
    ws.on_upgrade(move |socket| handle_channel(socket, state, key))
}

/// Drives one channel connection: greets the client, forwards pushed
/// events, and acknowledges heartbeat pings.
async fn handle_channel(socket: WebSocket, state: Arc<BackendState>, key: String) {
    state.connection_count.fetch_add(1, Ordering::Relaxed);

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.channels.write().await.insert(key.clone(), tx.clone());
    tracing::info!(target = %key, "channel connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let greeting = serde_json::json!({ "type": "connection", "message": "ready" });
    let _ = ws_tx.send(Message::Text(greeting.to_string().into())).await;

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if ws_tx.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                // Sender removed from the registry; close this socket.
                None => break,
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&state, &tx, text.as_str());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(err = %e, "channel read error");
                    break;
                }
            }
        }
    }

    // Unregister only if this connection still owns the slot; a reconnect
    // may have replaced it already.
    let mut channels = state.channels.write().await;
    if channels.get(&key).is_some_and(|cur| cur.same_channel(&tx)) {
        channels.remove(&key);
    }
    drop(channels);
    tracing::info!(target = %key, "channel disconnected");
}

fn handle_client_frame(
    state: &BackendState,
    reply: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::debug!("ignoring malformed client frame");
        return;
    };
    if value.get("type").and_then(serde_json::Value::as_str) == Some("ping") {
        state.ping_count.fetch_add(1, Ordering::Relaxed);
        let pong = serde_json::json!({ "type": "pong" });
        let _ = reply.send(Message::Text(pong.to_string().into()));
    }
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

async fn query(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<QueryRequest>,
) -> axum::response::Response {
    if let Some(denied) = state.check_auth(&headers).await {
        return denied.into_response();
    }
    let n = state.query_count.fetch_add(1, Ordering::Relaxed) + 1;
    *state.last_query.lock().await = Some(request.clone());

    let script = state.query_scripts.lock().await.pop_front();
    match script {
        None => {
            let mut response = canned_response(
                "conv-auto",
                &format!("msg-{n}"),
                &format!("echo: {}", request.query),
            );
            if let Some(conversation) = request.conversation_id {
                response.conversation_id = conversation;
            }
            axum::Json(response).into_response()
        }
        Some(QueryScript::Answer(response)) => axum::Json(response).into_response(),
        Some(QueryScript::Busy) => (
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"detail":"warming up"}"#,
        )
            .into_response(),
        Some(QueryScript::NoUpstream) => (
            StatusCode::GATEWAY_TIMEOUT,
            r#"{"detail":"no upstream response"}"#,
        )
            .into_response(),
        Some(QueryScript::ErrorBody { status, body }) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            axum::Json(body),
        )
            .into_response(),
        Some(QueryScript::Delayed { delay, response }) => {
            tokio::time::sleep(delay).await;
            axum::Json(response).into_response()
        }
        Some(QueryScript::StalledBody) => {
            let body = axum::body::Body::from_stream(futures_util::stream::pending::<
                Result<Vec<u8>, std::io::Error>,
            >());
            match axum::response::Response::builder()
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(body)
            {
                Ok(response) => response.into_response(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
    }
}

async fn upload(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> axum::response::Response {
    if let Some(denied) = state.check_auth(&headers).await {
        return denied.into_response();
    }
    if *state.fail_uploads.lock().await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":"storage offline"}"#,
        )
            .into_response();
    }

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("unnamed").to_string();
        let Ok(data) = field.bytes().await else {
            return (StatusCode::BAD_REQUEST, r#"{"error":"truncated body"}"#).into_response();
        };
        let n = state.upload_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(file = %file_name, bytes = data.len(), "upload stored");
        return axum::Json(UploadResponse {
            object_key: format!("uploads/{n}/{file_name}"),
        })
        .into_response();
    }
    (StatusCode::BAD_REQUEST, r#"{"error":"no file field"}"#).into_response()
}

async fn refresh(
    State(state): State<Arc<BackendState>>,
    axum::Json(request): axum::Json<RefreshRequest>,
) -> axum::response::Response {
    state.refresh_count.fetch_add(1, Ordering::Relaxed);
    if request.refresh.is_empty() {
        return (StatusCode::BAD_REQUEST, r#"{"detail":"missing refresh"}"#).into_response();
    }
    let behavior = state.refresh_behavior.lock().await.clone();
    match behavior {
        RefreshBehavior::Issue(access) => axum::Json(RefreshResponse { access }).into_response(),
        RefreshBehavior::Reject => (
            StatusCode::UNAUTHORIZED,
            r#"{"detail":"refresh token revoked"}"#,
        )
            .into_response(),
    }
}
