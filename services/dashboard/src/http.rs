//! HTTP surface: WebSocket attach, history and config APIs, embedded UI.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{Method, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::config::ReflectorConfig;
use crate::hub::Hub;
use crate::store::Store;

const INDEX_HTML: &str = include_str!("../assets/index.html");

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub store: Arc<Mutex<Store>>,
    pub reflector: ReflectorConfig,
    pub history_limit: u32,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_attach))
        .route("/api/history", get(history))
        .route("/api/config", get(config_info))
        .fallback(serve_ui)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_attach(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| subscriber_loop(socket, state.hub))
}

/// Bridge one subscriber's hub queue onto its socket.
///
/// Inbound frames are drained and discarded — the channel is outbound-only —
/// but reading them is what lets us notice the peer going away.
async fn subscriber_loop(socket: WebSocket, hub: Hub) {
    let mut sub = hub.attach();
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            queued = sub.rx.recv() => match queued {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Queue closed: the hub dropped us (backpressure).
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
    hub.detach(sub.id);
    debug!(id = sub.id, "websocket subscriber closed");
}

async fn history(State(state): State<AppState>) -> Response {
    match state.store.lock().await.recent_sessions(state.history_limit) {
        Ok(records) => Json(records).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn config_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "reflector": state.reflector,
    }))
}

/// Serve the single-page dashboard for anything that is not an API route.
async fn serve_ui(method: Method, uri: Uri) -> Response {
    // Preserve API semantics for unknown API endpoints.
    if uri.path().starts_with("/api/") {
        return StatusCode::NOT_FOUND.into_response();
    }
    // UI routes are read-only.
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    Html(INDEX_HTML).into_response()
}
