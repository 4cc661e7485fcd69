//! Error handling module
//!
//! Provides unified error types for the engine and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Property server failure: {0}")]
    PropertyServerFailure(String),

    #[error("Claim conflict: {0}")]
    ConflictOnClaim(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::InvalidParameter(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_PARAMETER",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::NotAuthorized(msg) => (
                StatusCode::FORBIDDEN,
                "NOT_AUTHORIZED",
                msg.clone(),
                None,
            ),
            AppError::PropertyServerFailure(msg) => {
                error!("Property server failure: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PROPERTY_SERVER_FAILURE",
                    "The metadata store could not complete the request".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::ConflictOnClaim(msg) => (
                StatusCode::CONFLICT,
                "CLAIM_CONFLICT",
                msg.clone(),
                None,
            ),
            AppError::InvalidTransition(msg) => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                msg.clone(),
                None,
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::Config(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "A configuration error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PROPERTY_SERVER_FAILURE",
                    "A metadata store error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "POOL_EXHAUSTED",
                    "Metadata store connection pool exhausted".to_string(),
                    Some(e.to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for engine operations and API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create an invalid parameter error
pub fn invalid_parameter(msg: impl Into<String>) -> AppError {
    AppError::InvalidParameter(msg.into())
}

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Reject an empty identifier before it reaches the store
pub fn require_non_empty(value: &str, name: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(invalid_parameter(format!("{} must not be empty", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("step-1", "stepGuid").is_ok());
        let err = require_non_empty("   ", "stepGuid").unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter(ref m) if m.contains("stepGuid")));
    }

    #[test]
    fn test_claim_conflict_maps_to_409() {
        let response = AppError::ConflictOnClaim("held".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_authorized_maps_to_403() {
        let response = AppError::NotAuthorized("nope".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
