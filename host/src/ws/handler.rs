//! WebSocket upgrade handler.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info};

use crate::infrastructure::server::AppState;
use crate::ws::connection::Connection;

/// Handles `/{name}/ws` upgrade requests.
pub async fn handle_ws_upgrade(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, name, state)
}

/// Upgrades to a browser connection on `analysis`, or answers 404 for
/// analyses the host does not know.
pub fn upgrade(ws: WebSocketUpgrade, analysis: String, state: AppState) -> Response {
    if !state.index().contains(&analysis) {
        return StatusCode::NOT_FOUND.into_response();
    }
    info!(%analysis, "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| async move {
        let connection = Connection::new(socket, analysis, state.hub().clone());
        if let Err(e) = connection.run().await {
            error!(error = %e, "WebSocket connection error");
        }
    })
}

/// Creates a router with WebSocket handling for every analysis.
pub fn ws_router(state: AppState) -> Router {
    Router::new()
        .route("/{name}/ws", get(handle_ws_upgrade))
        .with_state(state)
}
