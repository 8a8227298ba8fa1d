//! The single error type every handler returns. Each variant maps to the
//! HTTP status named for it in the wire contract; `IntoResponse` does the
//! mapping so handlers just use `?`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication failed")]
    Auth,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A contract violation inside the matcher or book. Always a bug.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("durable store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ExchangeError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ExchangeError::Auth => StatusCode::UNAUTHORIZED,
            ExchangeError::Forbidden(_) => StatusCode::FORBIDDEN,
            ExchangeError::NotFound(_) => StatusCode::NOT_FOUND,
            ExchangeError::InvariantViolation(_) => {
                tracing::error!(error = %self, "invariant violation");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ExchangeError::Store(_) => {
                tracing::error!(error = %self, "durable store error on synchronous path");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
