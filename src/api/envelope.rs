//! Error envelope for the public API.
//!
//! Every failure serializes as `{error, message, request_id}` with the
//! status mapping from the error taxonomy: Validation → 400, NotFound →
//! 404, RateLimited → 429 (+`Retry-After`), Unavailable and
//! DeadlineExceeded → 503, everything else → 500.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

use crate::error::PipelineError;

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub request_id: String,
}

/// Response-side wrapper for taxonomy errors.
#[derive(Debug)]
pub struct ApiFailure(pub PipelineError);

impl From<PipelineError> for ApiFailure {
    fn from(err: PipelineError) -> Self {
        ApiFailure(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::Unavailable(_) | PipelineError::DeadlineExceeded(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::SchemaMismatch { .. }
            | PipelineError::Corruption(_)
            | PipelineError::Transient(_)
            | PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            error: err.kind().to_string(),
            message: err.to_string(),
            request_id: Uuid::new_v4().to_string(),
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let PipelineError::RateLimited { retry_after_ms } = err {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validation_maps_to_400_with_body() {
        let resp = ApiFailure(PipelineError::Validation("bad".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"], "validation");
        assert!(v["request_id"].as_str().unwrap().len() > 10);
    }

    #[tokio::test]
    async fn rate_limited_carries_retry_after() {
        let resp = ApiFailure(PipelineError::RateLimited { retry_after_ms: 2500 }).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }

    #[tokio::test]
    async fn unavailable_maps_to_503() {
        let resp = ApiFailure(PipelineError::Unavailable("down".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
