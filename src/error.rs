// Error handling module
// Defines error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::TokenError;
use crate::cache::ModelsError;

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or malformed client credentials
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Client credentials present but wrong
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No valid Copilot token could be obtained
    #[error("Copilot token unavailable: {0}")]
    TokenUnavailable(#[from] TokenError),

    /// Copilot API could not be reached
    #[error("Copilot API unreachable: {0}")]
    Upstream(String),

    /// Model catalog not cached yet
    #[error("Models unavailable: {0}")]
    ModelsUnavailable(#[from] ModelsError),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::AuthError(msg) => (StatusCode::UNAUTHORIZED, "auth_error", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            ApiError::TokenUnavailable(err) => {
                tracing::error!("Copilot token unavailable: {}", err);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "token_unavailable",
                    format!("Failed to get Copilot token: {}", err),
                )
            }
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
            ApiError::ModelsUnavailable(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "models_unavailable",
                format!("Failed to fetch models: {}", err),
            ),
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Internal(err) => {
                // Log internal errors
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}
