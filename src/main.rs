use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;

use docqa::core::config::{AppPaths, ConfigService};
use docqa::core::logging;
use docqa::server;
use docqa::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = Arc::new(AppPaths::new());
    logging::init(&paths);

    let config_service = ConfigService::new(paths.clone());
    tracing::info!("Loading config from {}", config_service.config_path().display());
    tracing::info!(
        "Effective config: {}",
        config_service.redact_sensitive_values(&config_service.load_tree())
    );
    let config = config_service.load().context("Invalid configuration")?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::with_config(paths, config)?;

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    let addr = listener.local_addr()?;
    tracing::info!("Listening on {}", addr);

    let app: Router = server::router::router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
