//! Common Test Utilities for Integration Tests
//!
//! An in-process mock of the chat service: login, messages, streams,
//! subscriptions and the `/events/connect` WebSocket.

#![allow(dead_code)]

use axum::{
    Form, Json, Router,
    extract::{
        Path, Query, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chatload::Config;
use chatload::scheduler::RampStage;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const PASSWORD: &str = "test123";

/// A message accepted by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub user: String,
    pub stream_id: u64,
    pub content: String,
}

/// Shared state of the mock chat service
#[derive(Clone)]
pub struct MockState {
    inner: Arc<Inner>,
}

struct Inner {
    requests: AtomicUsize,
    logins: AtomicUsize,
    failing_logins: Mutex<HashSet<String>>,
    fail_sends: AtomicBool,
    /// Accept WebSocket connections but never push anything
    silent_events: AtomicBool,
    /// Answer stream creation with 200 instead of 201
    create_returns_ok: AtomicBool,
    sent: Mutex<Vec<SentMessage>>,
    subscriptions: Mutex<Vec<(String, u64)>>,
    activations: AtomicUsize,
    deactivations: AtomicUsize,
    next_stream_id: AtomicU64,
    events: broadcast::Sender<String>,
}

impl MockState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                requests: AtomicUsize::new(0),
                logins: AtomicUsize::new(0),
                failing_logins: Mutex::new(HashSet::new()),
                fail_sends: AtomicBool::new(false),
                silent_events: AtomicBool::new(false),
                create_returns_ok: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                activations: AtomicUsize::new(0),
                deactivations: AtomicUsize::new(0),
                next_stream_id: AtomicU64::new(100),
                events,
            }),
        }
    }

    /// Logins for `username` answer 500
    pub fn fail_login_for(&self, username: &str) {
        self.inner
            .failing_logins
            .lock()
            .unwrap()
            .insert(username.to_string());
    }

    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn silence_events(&self, silent: bool) {
        self.inner.silent_events.store(silent, Ordering::SeqCst);
    }

    pub fn create_returns_ok(&self, ok: bool) {
        self.inner.create_returns_ok.store(ok, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.inner.logins.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, u64)> {
        self.inner.subscriptions.lock().unwrap().clone()
    }

    pub fn activations(&self) -> usize {
        self.inner.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.inner.deactivations.load(Ordering::SeqCst)
    }
}

fn user_from_token(token: &str) -> Option<String> {
    token.strip_prefix("token-").map(str::to_string)
}

fn bearer_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .and_then(user_from_token)
}

async fn count_requests(State(state): State<MockState>, request: Request, next: Next) -> Response {
    state.inner.requests.fetch_add(1, Ordering::SeqCst);
    next.run(request).await
}

#[derive(Deserialize)]
struct LoginForm {
    grant_type: String,
    username: String,
    password: String,
}

async fn login(State(state): State<MockState>, Form(form): Form<LoginForm>) -> Response {
    state.inner.logins.fetch_add(1, Ordering::SeqCst);
    if state.inner.failing_logins.lock().unwrap().contains(&form.username) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if form.grant_type != "password" || form.password != PASSWORD {
        return (StatusCode::BAD_REQUEST, Json(json!({"detail": "LOGIN_BAD_CREDENTIALS"})))
            .into_response();
    }
    Json(json!({
        "access_token": format!("token-{}", form.username),
        "token_type": "bearer",
    }))
    .into_response()
}

#[derive(Deserialize)]
struct SendQuery {
    lifetime_seconds: Option<u64>,
}

#[derive(Deserialize)]
struct SendForm {
    message_content: String,
}

async fn send_message(
    State(state): State<MockState>,
    Path(stream_id): Path<u64>,
    Query(_query): Query<SendQuery>,
    headers: HeaderMap,
    Form(form): Form<SendForm>,
) -> Response {
    let Some(user) = bearer_user(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if state.inner.fail_sends.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let message = SentMessage {
        user: user.clone(),
        stream_id,
        content: form.message_content,
    };
    let event = json!({
        "type": "message",
        "stream_id": stream_id,
        "user": user,
        "content": message.content,
    });
    state.inner.sent.lock().unwrap().push(message);
    if !state.inner.silent_events.load(Ordering::SeqCst) {
        let _ = state.inner.events.send(event.to_string());
    }
    Json(event).into_response()
}

#[derive(Deserialize)]
struct ReadQuery {
    stream_id: u64,
}

async fn read_messages(
    State(state): State<MockState>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Response {
    if bearer_user(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let messages: Vec<_> = state
        .sent()
        .into_iter()
        .filter(|m| m.stream_id == query.stream_id)
        .map(|m| json!({"user": m.user, "content": m.content}))
        .collect();
    Json(messages).into_response()
}

async fn create_stream(State(state): State<MockState>, headers: HeaderMap) -> Response {
    if bearer_user(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let id = state.inner.next_stream_id.fetch_add(1, Ordering::SeqCst);
    let status = if state.inner.create_returns_ok.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(json!({ "id": id }))).into_response()
}

async fn activate_stream(
    State(state): State<MockState>,
    Path(_stream_id): Path<u64>,
    headers: HeaderMap,
) -> StatusCode {
    if bearer_user(&headers).is_none() {
        return StatusCode::UNAUTHORIZED;
    }
    state.inner.activations.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn deactivate_stream(State(state): State<MockState>, headers: HeaderMap) -> StatusCode {
    if bearer_user(&headers).is_none() {
        return StatusCode::UNAUTHORIZED;
    }
    state.inner.deactivations.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

#[derive(Deserialize)]
struct SubscribeBody {
    stream_id: u64,
}

async fn subscribe(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<SubscribeBody>,
) -> StatusCode {
    let Some(user) = bearer_user(&headers) else {
        return StatusCode::UNAUTHORIZED;
    };
    state
        .inner
        .subscriptions
        .lock()
        .unwrap()
        .push((user, body.stream_id));
    StatusCode::OK
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "message": "pong" }))
}

/// The token arrives as the requested subprotocol (echoed back), as a bearer
/// `Authorization` header, or as the `token` query parameter
async fn events(
    State(state): State<MockState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let subprotocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .filter(|t| user_from_token(t).is_some())
        .map(str::to_string);
    let authenticated = subprotocol.is_some()
        || bearer_user(&headers).is_some()
        || params.get("token").and_then(|t| user_from_token(t)).is_some();
    if !authenticated {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    // Subscribe before answering the upgrade so no event sent after the
    // handshake can be missed
    let events = state.inner.events.subscribe();
    let ws = match subprotocol {
        Some(token) => ws.protocols([token]),
        None => ws,
    };
    ws.on_upgrade(move |socket| handle_events(socket, events))
}

async fn handle_events(mut socket: WebSocket, mut events: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn router(state: MockState) -> Router {
    let api = Router::new()
        .route("/auth/login", post(login))
        .route("/messages/send/stream/:stream_id", post(send_message))
        .route("/messages/stream", get(read_messages))
        .route("/stream/create", post(create_stream))
        .route("/stream/:stream_id/active", post(activate_stream))
        .route("/stream/deactive", post(deactivate_stream))
        .route("/users/me/subscriptions", post(subscribe))
        .route("/test/ping", get(ping))
        .route("/events/connect", get(events));

    Router::new()
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
}

/// A running mock chat service on a random local port
pub struct MockChatService {
    pub addr: SocketAddr,
    pub state: MockState,
    handle: tokio::task::JoinHandle<()>,
}

impl MockChatService {
    pub async fn start() -> Self {
        let state = MockState::new();
        let app = router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }

    /// A short, fast configuration aimed at this service: every slot runs one
    /// iteration for its own identity.
    pub fn config(&self, identities: usize, streams: usize) -> Config {
        let mut config = Config::default();
        config.target.base_url = self.base_url();
        config.identities.count = identities;
        config.streams.count = streams;
        config.load.start_vus = identities;
        config.load.stages = vec![RampStage::new(Duration::from_millis(500), identities)];
        config.load.think_time = Duration::from_millis(50);
        config.load.graceful_ramp_down = Duration::from_secs(2);
        config.load.call_timeout = Duration::from_secs(5);
        config.load.run_timeout = Some(Duration::from_secs(20));
        config.load.iterations_per_vu = Some(1);
        config.provisioning.concurrency = 4;
        config
    }
}

impl Drop for MockChatService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
