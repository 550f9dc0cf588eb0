// src/lib.rs

//! Chat server core: a WebSocket endpoint that fans each chat message out to
//! the other online members of the chat.

pub mod config;
pub mod database;
pub mod fanout;
pub mod memory;
pub mod models;
pub mod registry;
pub mod state;
pub mod websocket;

use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};

pub use state::ChatState;

/// Define the application routes.
pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<ChatState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len().await,
    }))
}
