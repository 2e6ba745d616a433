//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use larder_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized(String),
    #[error("Insufficient permissions")]
    Forbidden(String),

    // Validation errors
    #[error("Invalid request: {0}")]
    InvalidInput(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound(String),

    // Configuration errors
    #[error("Endpoint is not configured")]
    NotConfigured(String),

    // Internal errors
    #[error("Upstream failure")]
    Upstream(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),

            // Validation
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg.clone()),
            ApiError::InvalidState(msg) => (StatusCode::BAD_REQUEST, "INVALID_STATE", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),

            // Configuration
            ApiError::NotConfigured(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "NOT_CONFIGURED",
                "Endpoint is not configured".to_string(),
            ),

            // Internal: detail stays in the logs
            ApiError::Upstream(_) | ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "UPSTREAM_FAILURE",
                "An upstream service failed".to_string(),
            ),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Unauthenticated(msg) => ApiError::Unauthorized(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::Unauthorized("invalid webhook signature".to_string())
            }
            BillingError::Forbidden(msg) => ApiError::Forbidden(msg),
            BillingError::InvalidInput(msg) => ApiError::InvalidInput(msg),
            BillingError::InvalidState(msg) => ApiError::InvalidState(msg),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::NotConfigured(msg) => {
                tracing::error!(detail = %msg, "Request hit an unconfigured endpoint");
                ApiError::NotConfigured(msg)
            }
            BillingError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            BillingError::UpstreamFailure(msg) => {
                tracing::error!(detail = %msg, "Upstream failure");
                ApiError::Upstream(msg)
            }
            BillingError::Config(msg) => {
                tracing::error!(detail = %msg, "Configuration error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
