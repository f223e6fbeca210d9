//! Barter Chat - negotiation engine for a barter marketplace
//!
//! Two participants exchange messages and priced proposals about an item.
//! Conversation state is a derived cache over an append-only message log.

mod api;
mod catalog;
mod config;
mod db;
mod directory;
mod engine;
mod error;
mod events;
mod expiration;
mod message_log;
mod presence;
mod state_machine;

use api::{create_router, AppState};
use catalog::{HttpCatalog, NoCatalog};
use config::Config;
use db::Database;
use engine::{ItemRegistry, NegotiationEngine, SystemClock, ValuationService};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "barter_chat=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    // Stored negotiation state is a cache over the log; fix any drift
    let repaired = db.repair_derived_states()?;
    if !repaired.is_empty() {
        tracing::warn!(count = repaired.len(), "Repaired conversations on startup");
    }

    // Item catalog backs both holder resolution and price suggestions
    let (registry, valuation): (Arc<dyn ItemRegistry>, Arc<dyn ValuationService>) =
        match &config.catalog_url {
            Some(url) => {
                let catalog = Arc::new(HttpCatalog::new(url.clone(), config.catalog_timeout)?);
                tracing::info!(url = %url, "Item catalog configured");
                let registry: Arc<dyn ItemRegistry> = catalog.clone();
                let valuation: Arc<dyn ValuationService> = catalog;
                (registry, valuation)
            }
            None => {
                tracing::warn!("No item catalog configured (set BARTER_CATALOG_URL)");
                let registry: Arc<dyn ItemRegistry> = Arc::new(NoCatalog);
                let valuation: Arc<dyn ValuationService> = Arc::new(NoCatalog);
                (registry, valuation)
            }
        };

    let engine = NegotiationEngine::new(db, registry, valuation, Arc::new(SystemClock));
    let state = AppState::new(engine);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Barter chat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
