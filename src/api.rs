//! HTTP and WebSocket API

mod handlers;
mod types;
mod ws;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::engine::NegotiationEngine;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<NegotiationEngine>,
}

impl AppState {
    pub fn new(engine: NegotiationEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}
