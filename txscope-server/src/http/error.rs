//! API error types with IntoResponse
//!
//! Errors are converted to JSON responses with appropriate status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use txscope_core::{Abort, TxError};

use crate::db::RepoError;
use crate::models::ValidationError;
use crate::service::ServiceError;

/// API error type with automatic HTTP status mapping
#[derive(Debug)]
pub enum ApiError {
    /// Validation failed (400)
    Validation(ValidationError),

    /// Resource not found (404)
    NotFound { resource: &'static str, id: String },

    /// Request deadline passed before the work finished (504)
    Timeout,

    /// Unit of work failed (500, logged)
    Transaction(ServiceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Validation(e) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "validation_error",
                    "message": e.to_string()
                }),
            ),
            Self::NotFound { resource, id } => (
                StatusCode::NOT_FOUND,
                json!({
                    "error": "not_found",
                    "message": format!("{} '{}' not found", resource, id)
                }),
            ),
            Self::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({
                    "error": "timeout",
                    "message": "request timed out"
                }),
            ),
            Self::Transaction(e) => {
                // Log the actual error, return generic message
                tracing::error!(error = %e, "unit of work failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": "internal_error",
                        "message": "an internal error occurred"
                    }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        if cancelled(&e) {
            return Self::Timeout;
        }
        match e {
            TxError::Aborted(Abort::Work(RepoError::NotFound { resource, id })) => {
                Self::NotFound { resource, id }
            }
            e => Self::Transaction(e),
        }
    }
}

fn cancelled(e: &ServiceError) -> bool {
    match e {
        TxError::Begin(db) | TxError::Commit(db) => db.is_cancelled(),
        _ => matches!(e.work_error(), Some(RepoError::Db(db)) if db.is_cancelled()),
    }
}
