//! HTTP adapter for the payout engine.
//!
//! Thin by design: argument marshalling, tenant-scope propagation and
//! pagination. Authentication and role checks live at the platform edge.

mod routes;

pub use routes::router;

use crate::batch::BatchProcessor;
use crate::connectors::ConnectorFactory;
use crate::error::PayoutError;
use crate::service::PayoutService;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PayoutService>,
    pub connectors: Arc<ConnectorFactory>,
    pub batches: Arc<BatchProcessor>,
}

/// Domain error to HTTP mapping.
pub struct ApiError(pub PayoutError);

impl From<PayoutError> for ApiError {
    fn from(e: PayoutError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PayoutError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PayoutError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PayoutError::NotAuthorized => StatusCode::FORBIDDEN,
            PayoutError::NotFound(_)
            | PayoutError::AlertNotFound(_)
            | PayoutError::BatchNotFound(_) => StatusCode::NOT_FOUND,
            PayoutError::DuplicateKeyCollision
            | PayoutError::NotCancellable(_)
            | PayoutError::NotRetryable(_)
            | PayoutError::InvalidTransition { .. }
            | PayoutError::AlreadyResolved
            | PayoutError::BatchState(_) => StatusCode::CONFLICT,
            PayoutError::Ledger(_) => StatusCode::BAD_GATEWAY,
            PayoutError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
