//! ==============================================================================
//! server.rs - http api and websocket endpoint
//! ==============================================================================
//!
//! routes:
//!     GET  /                   relay is up
//!     GET  /ws                 real-time channel (see domain.rs for events)
//!     GET  /api                latest reading + plant liveness as json
//!     POST /api/motor          confirmed motor command
//!     POST /save-token         register a push notification token
//!     GET  /send-notification  push a test notification to every token
//!
//! websocket session:
//!     1. subscribe to the hub, send the cached reading straight away
//!     2. forward every hub event to the socket
//!     3. motor_control frames go through the command path; bad frames get an
//!        `error` event back to the sender only
//!     nothing is kept per client after the socket closes.
//!
//! ==============================================================================

use crate::command::CommandDispatcher;
use crate::domain::{ClientEvent, MotorCommand, SensorReading, ServerEvent};
use crate::heartbeat::Heartbeat;
use crate::hub::Hub;
use crate::notify::Notifier;

use anyhow::Result;
use axum::{
    extract::rejection::JsonRejection,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

// ==============================================================================
// shared state
// ==============================================================================
// cloned into every handler. everything mutable lives behind the hub's store,
// the heartbeat and the notifier, so the clone is a handful of Arc bumps.

#[derive(Clone)]
pub struct RelayState {
    pub hub: Hub,
    pub dispatcher: Arc<CommandDispatcher>,
    pub heartbeat: Arc<Heartbeat>,
    pub notifier: Arc<Notifier>,
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws_handler))
        .route("/api", get(api_handler))
        .route("/api/motor", post(motor_handler))
        .route("/save-token", post(save_token_handler))
        .route("/send-notification", get(send_notification_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "message": "Plant relay is running" }))
}

// ==============================================================================
// websocket
// ==============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: RelayState) {
    let id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let subscription = state.hub.subscribe();
    let mut events = subscription.events;
    tracing::info!("[WS] client {} connected ({} total)", id, state.hub.client_count());
    if subscription.snapshot.is_empty() {
        tracing::debug!("[WS] no reading cached yet, client {} starts from {{}}", id);
    }

    if let Err(e) = send_event(&mut sink, &ServerEvent::SensorData(subscription.snapshot)).await {
        tracing::debug!("[WS] client {} gone before snapshot: {:#}", id, e);
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        // the backlog is stale anyway, catch up with the cache
                        tracing::warn!("[WS] client {} lagged, skipped {} events", id, skipped);
                        ServerEvent::SensorData(state.hub.latest())
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Err(e) = send_event(&mut sink, &event).await {
                    tracing::debug!("[WS] client {} send failed: {:#}", id, e);
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_client_frame(&state, &text).await {
                        if send_event(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // ping/pong are answered by axum, binary frames are not part of the protocol
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("[WS] client {} read error: {}", id, e);
                    break;
                }
            }
        }
    }

    tracing::info!("[WS] client {} disconnected", id);
}

/// runs one client frame; returns an event for the sender alone, if any
async fn handle_client_frame(state: &RelayState, text: &str) -> Option<ServerEvent> {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("[WS] unrecognised client frame: {}", e);
            return Some(ServerEvent::Error { message: format!("unrecognised event: {}", e) });
        }
    };

    match event {
        ClientEvent::MotorControl { command } => match command.parse::<MotorCommand>() {
            Ok(command) => {
                // fire-and-forget: a failed publish is logged by the dispatcher
                let _ = state.dispatcher.dispatch(command).await;
                None
            }
            Err(e) => {
                tracing::warn!("[WS] rejected motor_control: {}", e);
                Some(ServerEvent::Error { message: e.to_string() })
            }
        },
    }
}

async fn send_event<S>(sink: &mut S, event: &ServerEvent) -> Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let text = serde_json::to_string(event)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

// ==============================================================================
// json api
// ==============================================================================

#[derive(Serialize)]
struct ApiSnapshot {
    reading: SensorReading,
    /// telemetry arrived within the liveness window
    connected: bool,
    /// unix ms of the last accepted reading
    last_update: Option<u64>,
    clients: usize,
}

async fn api_handler(State(state): State<RelayState>) -> Json<ApiSnapshot> {
    Json(ApiSnapshot {
        reading: state.hub.latest(),
        connected: state.heartbeat.is_connected(),
        last_update: state.heartbeat.last_beat_ms(),
        clients: state.hub.client_count(),
    })
}

#[derive(Deserialize)]
struct MotorRequest {
    command: String,
}

/// POST /api/motor {"command": "ON"|"OFF"}
async fn motor_handler(
    State(state): State<RelayState>,
    request: Result<Json<MotorRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_body(rejection),
    };
    let command = match request.command.parse::<MotorCommand>() {
        Ok(command) => command,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.dispatcher.dispatch_confirmed(command).await {
        Ok(outcome) => Json(json!({ "status": "ok", "command": command, "result": outcome })).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, format!("{:#}", e)),
    }
}

#[derive(Deserialize)]
struct TokenRequest {
    token: String,
}

async fn save_token_handler(
    State(state): State<RelayState>,
    request: Result<Json<TokenRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_body(rejection),
    };
    if request.token.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "token must not be empty".to_string());
    }
    let registered = state.notifier.register(&request.token);
    if registered {
        tracing::info!("[NOTIFY] token registered ({} total)", state.notifier.token_count());
    }
    Json(json!({ "status": "ok", "registered": registered })).into_response()
}

async fn send_notification_handler(State(state): State<RelayState>) -> Response {
    let report = state
        .notifier
        .send_all("Test notification", "This is a test notification from the plant relay")
        .await;
    Json(report).into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}

/// missing fields, wrong content type and broken json all answer 400
fn bad_body(rejection: JsonRejection) -> Response {
    tracing::debug!("[HTTP] rejected body: {}", rejection.body_text());
    error_response(StatusCode::BAD_REQUEST, rejection.body_text())
}
