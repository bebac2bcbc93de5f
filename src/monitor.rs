use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::registry::{Registry, Snapshot};

/// Shared state for the monitoring surface.
#[derive(Clone)]
pub struct MonitorState {
    pub registry: Arc<Registry>,
    pub broadcaster: Arc<Broadcaster>,
}

/// Build the monitoring router: REST stats, WebSocket push, and the
/// dashboard files (whose content lives outside this crate).
pub fn make_router(state: MonitorState) -> Router {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/ws", get(handle_ws))
        .route_service("/", ServeFile::new("dashboard.html"))
        .nest_service("/static", ServeDir::new("static"))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the monitoring surface on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: MonitorState) -> std::io::Result<()> {
    axum::serve(listener, make_router(state)).await
}

async fn get_stats(State(state): State<MonitorState>) -> Json<Snapshot> {
    Json(state.registry.snapshot())
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<MonitorState>) -> Response {
    ws.on_upgrade(move |socket| stream_updates(socket, state))
}

/// Push snapshots to one WebSocket client: one immediately on upgrade, then
/// one per broadcaster firing. Client frames are not interpreted; a read
/// error or close frame ends the subscription.
async fn stream_updates(mut socket: WebSocket, state: MonitorState) {
    let mut subscription = state.broadcaster.subscribe();

    if let Some(initial) = state.broadcaster.snapshot_json() {
        if socket.send(Message::Text(initial)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            update = subscription.recv() => {
                let Some(message) = update else {
                    // Removed by the broadcaster (slow sink) or shutdown.
                    break;
                };
                if let Err(e) = socket.send(Message::Text(message)).await {
                    debug!(error = %e, "websocket send failed");
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Anything else the client sends is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = socket.close().await;
}
