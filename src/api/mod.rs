//! HTTP surface of the relay.
//!
//! Exactly two things are exposed: the WebSocket upgrade at `/ws` and a
//! static liveness response on the plain request path. Everything else
//! about the process is internal.

mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;

use crate::relay::Relay;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    /// Per-message send budget for a single receiver
    pub send_timeout: Duration,
}

pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(
            DefaultOnResponse::new()
                .level(tracing::Level::INFO)
                .latency_unit(LatencyUnit::Millis),
        );

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/ws", get(websocket::websocket_handler))
        .layer(trace_layer)
        .with_state(state)
}

/// Static liveness response: confirms the process is up, nothing more.
async fn health() -> &'static str {
    "Relay server is running.\n"
}
