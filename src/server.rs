//! HTTP and WebSocket front end.
//!
//! `GET /ws/terminal/?session=<id>` upgrades to a WebSocket and drives one
//! [`Session`] for the life of the connection.

use crate::bridge::BridgeEvent;
use crate::config::ShellConfig;
use crate::errors::{ErrorBody, ShellError, ShellResult};
use crate::protocol::ServerMessage;
use crate::session::Session;
use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Identities of live sessions. One live session per identity.
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `session_id` until the returned guard is dropped.
    pub fn claim(self: &Arc<Self>, session_id: &str) -> ShellResult<RegistryClaim> {
        let mut active = self.active.lock();
        if !active.insert(session_id.to_string()) {
            return Err(ShellError::SessionBusy(session_id.to_string()));
        }
        Ok(RegistryClaim {
            registry: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Releases a registry entry on drop.
pub struct RegistryClaim {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for RegistryClaim {
    fn drop(&mut self) {
        self.registry.active.lock().remove(&self.session_id);
    }
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ShellConfig>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    session: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/ws/terminal", any(terminal_websocket))
        .route("/ws/terminal/", any(terminal_websocket))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.registry.active_count(),
    })
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody::new("not_found", "no such route")),
    )
        .into_response()
}

/// Query errors are reported over the socket like any other rejection, so
/// the peer always sees a protocol error frame.
async fn terminal_websocket(
    State(state): State<AppState>,
    query: Result<Query<TerminalQuery>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            debug!("[ws] Not a WebSocket upgrade: {}", e);
            return ShellError::Protocol("expected a WebSocket upgrade".to_string())
                .into_response();
        }
    };
    let session = query
        .map(|Query(query)| query.session)
        .map_err(|e| format!("invalid query: {}", e.body_text()));
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, session))
}

/// Why the connection loop ended.
enum LoopExit {
    PeerGone,
    BridgeEnded,
    Failed,
}

async fn handle_terminal_socket(
    socket: WebSocket,
    state: AppState,
    session: Result<Option<String>, String>,
) {
    let (mut sender, mut receiver) = socket.split();

    let session = match session {
        Ok(session) => session,
        Err(reason) => {
            warn!("[ws] Rejecting connection: {}", reason);
            reject(&mut sender, &reason).await;
            return;
        }
    };

    let Some(session_id) = session.filter(|s| !s.trim().is_empty()) else {
        warn!("[ws] Rejecting connection without session parameter");
        reject(&mut sender, "missing required query parameter: session").await;
        return;
    };

    let _claim = match state.registry.claim(&session_id) {
        Ok(claim) => claim,
        Err(e) => {
            warn!("[ws:{}] {}", session_id, e);
            reject(&mut sender, &e.to_string()).await;
            return;
        }
    };

    let session = match Session::new(session_id.clone(), state.config.clone()) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            reject(&mut sender, &e.to_string()).await;
            return;
        }
    };

    info!("[ws:{}] Connected", session_id);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let starter = session.clone();
    let started = tokio::task::spawn_blocking(move || starter.start(events_tx)).await;
    match started {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            reject(&mut sender, &e.to_string()).await;
            return;
        }
        Err(e) => {
            error!("[ws:{}] Session start task failed: {}", session_id, e);
            session.teardown();
            reject(&mut sender, "internal error while starting session").await;
            return;
        }
    }

    let (Some(mode), Some(workspace)) = (session.sandbox_mode(), session.workspace_path()) else {
        reject(&mut sender, "session started without a workspace").await;
        return;
    };
    let welcome = ServerMessage::welcome(&session_id, mode, workspace);
    let mut peer_connected = send_frame(&mut sender, &welcome).await;

    let exit = if peer_connected {
        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(BridgeEvent::Output(text)) => {
                        if !send_frame(&mut sender, &ServerMessage::output(text)).await {
                            peer_connected = false;
                            break LoopExit::PeerGone;
                        }
                    }
                    Some(BridgeEvent::Ended(reason)) => {
                        info!("[ws:{}] Bridge ended: {}", session_id, reason);
                        break LoopExit::BridgeEnded;
                    }
                    None => break LoopExit::BridgeEnded,
                },
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(exit) = forward_input(&session, &mut sender, text.as_str()).await {
                            peer_connected = !matches!(exit, LoopExit::PeerGone);
                            break exit;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if let Err(exit) = forward_input(&session, &mut sender, &text).await {
                            peer_connected = !matches!(exit, LoopExit::PeerGone);
                            break exit;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("[ws:{}] Client closed connection", session_id);
                        peer_connected = false;
                        break LoopExit::PeerGone;
                    }
                    Some(Err(e)) => {
                        warn!("[ws:{}] WebSocket error: {}", session_id, e);
                        peer_connected = false;
                        break LoopExit::PeerGone;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    } else {
        LoopExit::PeerGone
    };

    let teardown_session = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || teardown_session.teardown()).await {
        error!("[ws:{}] Teardown task failed: {}", session_id, e);
    }

    if peer_connected {
        // The reader thread has been joined, so whatever it produced is
        // already queued.
        while let Ok(event) = events_rx.try_recv() {
            if let BridgeEvent::Output(text) = event {
                if !send_frame(&mut sender, &ServerMessage::output(text)).await {
                    break;
                }
            }
        }
        send_frame(&mut sender, &ServerMessage::session_ended()).await;
        let _ = sender.send(Message::Close(None)).await;
    }

    match exit {
        LoopExit::PeerGone => info!("[ws:{}] Disconnected", session_id),
        LoopExit::BridgeEnded => info!("[ws:{}] Session ended by shell", session_id),
        LoopExit::Failed => info!("[ws:{}] Session ended after a fatal error", session_id),
    }
}

/// Forward one inbound frame. Per-message errors go back to the peer and
/// the loop continues; a fatal error is reported and ends the loop.
async fn forward_input(
    session: &Session,
    sender: &mut WsSender,
    raw: &str,
) -> Result<(), LoopExit> {
    let e = match session.handle_message(raw) {
        Ok(written) => {
            debug!("[ws:{}] Forwarded {} bytes", session.id(), written);
            return Ok(());
        }
        Err(e) => e,
    };

    if e.is_fatal() {
        error!("[ws:{}] Fatal input error ({}): {}", session.id(), e.code(), e);
    } else {
        warn!("[ws:{}] Input rejected ({}): {}", session.id(), e.code(), e);
    }
    if !send_frame(sender, &ServerMessage::error(e.to_string())).await {
        return Err(LoopExit::PeerGone);
    }
    if e.is_fatal() {
        return Err(LoopExit::Failed);
    }
    Ok(())
}

async fn send_frame(sender: &mut WsSender, message: &ServerMessage) -> bool {
    sender
        .send(Message::Text(message.to_json().into()))
        .await
        .is_ok()
}

/// Send one error frame and close.
async fn reject(sender: &mut WsSender, reason: &str) {
    send_frame(sender, &ServerMessage::error(reason)).await;
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(ShellConfig::default())
    }

    #[test]
    fn test_registry_allows_one_live_claim_per_id() {
        let registry = Arc::new(SessionRegistry::new());
        let claim = registry.claim("abc").unwrap();
        assert!(matches!(
            registry.claim("abc"),
            Err(ShellError::SessionBusy(_))
        ));
        assert!(registry.claim("other").is_ok());
        assert_eq!(registry.active_count(), 1);

        drop(claim);
        assert_eq!(registry.active_count(), 0);
        assert!(registry.claim("abc").is_ok());
    }

    #[tokio::test]
    async fn test_healthz_reports_active_sessions() {
        let state = test_state();
        let _claim = state.registry.claim("busy").unwrap();
        let app = build_router(state.clone());

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_plain_get_on_terminal_is_protocol_400() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::get("/ws/terminal/?session=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "protocol");
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
