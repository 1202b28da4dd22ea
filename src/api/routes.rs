//! Route table for the public API.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::{handlers, ApiState};

/// Build the full router.
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::get_health))
        .route("/ready", get(handlers::get_ready))
        .route("/status", get(handlers::get_status))
        .route("/events", get(handlers::get_events))
        .route("/events/stream", get(handlers::stream_events))
        .route("/events/:id", get(handlers::get_event))
        .route("/metrics", get(handlers::get_metrics))
        .route("/model/reload", post(handlers::post_model_reload))
        .route("/admin/cache/purge", post(handlers::post_purge_caches))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
