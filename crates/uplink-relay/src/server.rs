//! HTTP surface: the router and shared application state.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::hub::HubHandle;
use crate::ws::ws_handler;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn home() -> &'static str {
    "uplink-relay websocket server"
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
