// src/state.rs

use crate::config::WebSocketSettings;
use crate::database::ChatStore;
use crate::registry::Registry;
use std::sync::Arc;

/// The application's shared state, cloned into every request handler and connection worker.
#[derive(Clone)]
pub struct ChatState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn ChatStore>,
    pub websocket: Arc<WebSocketSettings>,
}

impl ChatState {
    pub fn new(store: Arc<dyn ChatStore>, websocket: WebSocketSettings) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            store,
            websocket: Arc::new(websocket),
        }
    }
}
