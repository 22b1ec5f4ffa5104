//! ACP relay: bridges HTTP and WebSocket clients to agent subprocesses
//! speaking the Agent Client Protocol over stdio.

pub mod config;
pub mod http;
pub mod protocol;
pub mod state;
pub mod ws;

use axum::routing::post;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the Axum router, shared by the real binary and integration tests.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/session/new", post(http::create_session))
        .route("/session/prompt", post(http::prompt))
        .route("/ws", axum::routing::get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
