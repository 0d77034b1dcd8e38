use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::server::handlers::{ask, documents, health};
use crate::state::AppState;

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Creates the application router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/status", get(health::get_status))
        .route("/api/ask", post(ask::ask))
        .route(
            "/api/documents",
            post(documents::ingest).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/index/reset", post(documents::reset_index))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
