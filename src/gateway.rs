//! HTTP gateway: control surface in, live broadcast out.
//!
//! Control frames (user message, mode, delay, step, external injection)
//! arrive as JSON POSTs or WebSocket frames; observers attach over SSE or
//! WebSocket and receive the hub's `{type, data}` envelopes. Read-only
//! endpoints expose the log, notables, tasks, and current state.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::broadcast::{EventHub, HubEvent};
use crate::fsm::executor::AgentHandle;
use crate::fsm::{AgentEvent, Delay, Mode};
use crate::store::{Store, TaskStatus};

/// Valid sources for external injection.
static EXTERNAL_SOURCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^external:[^\s]+$").expect("valid source regex"));

/// Shared gateway state.
pub struct GatewayState {
    pub handle: AgentHandle,
    pub store: Arc<Store>,
    pub hub: EventHub,
}

// --- Request/response DTOs ---

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct SetModeRequest {
    mode: String,
}

#[derive(Debug, Deserialize)]
struct SetDelayRequest {
    delay: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InjectRequest {
    source: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct StateResponse {
    mode: String,
    delay: serde_json::Value,
    session_id: Option<i64>,
    observers: u64,
}

/// Control frames accepted over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsClientFrame {
    UserMessage { content: String },
    SetMode { mode: String },
    SetDelay { delay: serde_json::Value },
    Step,
    Ping,
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn store_error(e: crate::error::StoreError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/message", post(post_message))
        .route("/api/mode", post(set_mode))
        .route("/api/delay", post(set_delay))
        .route("/api/step", post(step))
        .route("/api/inject", post(inject))
        .route("/api/messages", get(list_messages))
        .route("/api/notables", get(list_notables))
        .route("/api/tasks", get(list_tasks))
        .route("/api/state", get(get_state))
        .route("/api/events", get(sse_events))
        .route("/api/ws", get(ws_upgrade))
        .with_state(state)
}

/// Bind and serve until the process ends.
pub async fn serve(state: Arc<GatewayState>, port: u16) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("gateway listening on port {port}");
    axum::serve(listener, router(state)).await
}

// --- Handlers ---

async fn health() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

async fn post_message(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SendMessageRequest>,
) -> impl IntoResponse {
    if req.content.trim().is_empty() {
        return bad_request("content must not be empty").into_response();
    }
    state
        .handle
        .send(AgentEvent::UserMessage {
            content: req.content,
        })
        .await;
    Json(StatusResponse { status: "queued" }).into_response()
}

async fn set_mode(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SetModeRequest>,
) -> impl IntoResponse {
    match apply_mode(&state, &req.mode).await {
        Ok(()) => Json(StatusResponse { status: "ok" }).into_response(),
        Err(response) => response.into_response(),
    }
}

async fn set_delay(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SetDelayRequest>,
) -> impl IntoResponse {
    match apply_delay(&state, &req.delay).await {
        Ok(()) => Json(StatusResponse { status: "ok" }).into_response(),
        Err(response) => response.into_response(),
    }
}

async fn step(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    state.handle.send(AgentEvent::Step).await;
    Json(StatusResponse { status: "ok" })
}

async fn inject(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<InjectRequest>,
) -> impl IntoResponse {
    if !EXTERNAL_SOURCE.is_match(&req.source) {
        return bad_request(format!(
            "source must match ^external:[^\\s]+$, got '{}'",
            req.source
        ))
        .into_response();
    }

    // Persist and broadcast the record here; the FSM wraps it into the
    // window when it consumes the event.
    let source = crate::store::MessageSource::external(&req.source);
    let record = match state
        .store
        .append_message(&source, &req.content, None, None, None)
    {
        Ok(record) => record,
        Err(e) => return store_error(e).into_response(),
    };
    state.hub.publish(HubEvent::Message(record));

    state
        .handle
        .send(AgentEvent::ExternalMessage {
            source: req.source,
            content: req.content,
        })
        .await;
    Json(StatusResponse { status: "queued" }).into_response()
}

async fn list_messages(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match state.store.list_messages() {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

async fn list_notables(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match state.store.list_notables() {
        Ok(notables) => Json(notables).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

async fn list_tasks(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<TaskListQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        None => None,
        Some("running") => Some(TaskStatus::Running),
        Some("completed") => Some(TaskStatus::Completed),
        Some("failed") => Some(TaskStatus::Failed),
        Some(other) => {
            return bad_request(format!("unknown status filter '{other}'")).into_response()
        }
    };
    match state.store.list_tasks(status) {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}

async fn get_state(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = match state_snapshot(&state) {
        Ok(snapshot) => snapshot,
        Err(e) => return store_error(e).into_response(),
    };
    Json(snapshot).into_response()
}

fn state_snapshot(state: &GatewayState) -> Result<StateResponse, crate::error::StoreError> {
    let mode = state
        .store
        .get_state("mode", serde_json::json!("conversational"))?;
    let delay = state.store.get_state("delay", serde_json::json!(30))?;
    let session_id = state.store.current_session()?.map(|s| s.id);
    Ok(StateResponse {
        mode: mode.as_str().unwrap_or("conversational").to_string(),
        delay,
        session_id,
        observers: state.hub.observer_count(),
    })
}

// --- Shared control logic (REST and WS) ---

async fn apply_mode(
    state: &GatewayState,
    mode_str: &str,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let mode = Mode::parse(mode_str)
        .ok_or_else(|| bad_request(format!("unknown mode '{mode_str}'")))?;

    state
        .store
        .set_state("mode", &serde_json::json!(mode.as_str()))
        .map_err(store_error)?;
    publish_state(state);
    state.handle.send(AgentEvent::ModeChanged { mode }).await;
    Ok(())
}

async fn apply_delay(
    state: &GatewayState,
    delay_value: &serde_json::Value,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let delay = Delay::from_json(delay_value).ok_or_else(|| {
        bad_request("delay must be a positive number of seconds or \"infinite\"")
    })?;
    if let Delay::Seconds(0) = delay {
        return Err(bad_request("delay must be positive"));
    }

    state
        .store
        .set_state("delay", &delay.as_json())
        .map_err(store_error)?;
    publish_state(state);
    state.handle.send(AgentEvent::DelayChanged { delay }).await;
    Ok(())
}

fn publish_state(state: &GatewayState) {
    let mode = state
        .store
        .get_state("mode", serde_json::json!("conversational"))
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "conversational".to_string());
    let delay = state
        .store
        .get_state("delay", serde_json::json!(30))
        .map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .unwrap_or_else(|_| "30".to_string());
    state.hub.publish(HubEvent::State { mode, delay });
}

// --- Observers ---

async fn sse_events(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let Some(observer) = state.hub.subscribe() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "observer limit reached").into_response();
    };

    let stream = futures::stream::unfold(observer, |mut observer| async move {
        let event = observer.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_default();
        let sse = Event::default().event(event.kind()).data(data);
        Some((Ok::<_, Infallible>(sse), observer))
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text(""))
        .into_response()
}

async fn ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| ws_session(socket, state))
}

async fn ws_session(socket: WebSocket, state: Arc<GatewayState>) {
    let Some(mut observer) = state.hub.subscribe() else {
        tracing::warn!("websocket rejected: observer limit reached");
        return;
    };
    let (mut sink, mut source) = socket.split();

    // Hub events flow out; a closed socket ends the forwarder.
    let forward = tokio::spawn(async move {
        while let Some(event) = observer.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            if sink.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Control frames flow in.
    while let Some(Ok(message)) = source.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let frame: WsClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("ignoring malformed ws frame: {e}");
                continue;
            }
        };
        match frame {
            WsClientFrame::UserMessage { content } => {
                if !content.trim().is_empty() {
                    state.handle.send(AgentEvent::UserMessage { content }).await;
                }
            }
            WsClientFrame::SetMode { mode } => {
                if let Err((_, Json(e))) = apply_mode(&state, &mode).await {
                    tracing::debug!("ws set_mode rejected: {}", e.error);
                }
            }
            WsClientFrame::SetDelay { delay } => {
                if let Err((_, Json(e))) = apply_delay(&state, &delay).await {
                    tracing::debug!("ws set_delay rejected: {}", e.error);
                }
            }
            WsClientFrame::Step => state.handle.send(AgentEvent::Step).await,
            WsClientFrame::Ping => {}
        }
    }

    forward.abort();
}
