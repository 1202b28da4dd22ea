//! Public HTTP API.
//!
//! Surface: `/health`, `/ready`, `/status`, `/events`, `/events/{id}`,
//! `/events/stream` (SSE), `/metrics`, `POST /model/reload` (operator),
//! `POST /admin/cache/purge` (admin). Bearer JWT auth with roles; the
//! error envelope is `{error, message, request_id}`.

pub mod auth;
mod envelope;
pub mod handlers;
mod routes;

pub use envelope::{ApiFailure, ErrorBody};
pub use routes::api_router;

use std::sync::Arc;

use crate::config::AuthSettings;
use crate::runtime::Runtime;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<Runtime>,
    pub auth: AuthSettings,
    /// Model artifact path `POST /model/reload` re-reads.
    pub model_path: String,
}

/// Bind and serve the API until cancellation.
///
/// Binding failure maps to exit code 4 at the binary.
pub async fn serve(
    state: ApiState,
    addr: String,
    cancel: tokio_util::sync::CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::error::PipelineError::Internal(format!("bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "API listening");

    let app = api_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| crate::error::PipelineError::Internal(format!("server error: {e}")))?;
    Ok(())
}
