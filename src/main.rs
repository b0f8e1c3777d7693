//! watchpost - detection event aggregation server
//!
//! Main entry point.

use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watchpost::{
    config_store::ConfigStore,
    state::{AppConfig, AppState},
    web_api,
};

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchpost=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting watchpost v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        database_url = %config.database_url,
        sources_file = ?config.sources_file,
        inference_permits = config.inference_permits,
        "Configuration loaded"
    );

    // Sources
    let config_store = match &config.sources_file {
        Some(path) => Arc::new(ConfigStore::load_from_file(path).await?),
        None => {
            tracing::warn!("SOURCES_FILE not set, starting with no sources");
            Arc::new(ConfigStore::new())
        }
    };

    let state = AppState::initialize(config, config_store).await?;

    let started = state.registry.autostart().await;
    tracing::info!(started = started, "Autostart complete");

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Finalize open events before exit
    state.registry.shutdown_all().await;
    tracing::info!("watchpost stopped");

    Ok(())
}
