/// Unified error types for Aurora AppView
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the AppView
#[derive(Error, Debug)]
pub enum AppViewError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration errors
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Malformed request parameters or configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing viewer identity
    #[error("Authentication required: {0}")]
    Authentication(String),

    /// Unknown subject
    #[error("Not found: {0}")]
    NotFound(String),

    /// Binary decoding errors (frames, blocks, records)
    #[error("Decode error: {0}")]
    Decode(#[from] crate::car::DecodeError),

    /// Upstream repository server errors (HTTP)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Firehose socket errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for AppViewError {
    fn from(e: reqwest::Error) -> Self {
        AppViewError::Upstream(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppViewError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AppViewError::WebSocket(e.to_string())
    }
}

/// XRPC error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct XrpcErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert AppViewError to HTTP response
impl IntoResponse for AppViewError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            AppViewError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "InvalidRequest", msg.clone())
            }
            AppViewError::Authentication(msg) => (
                StatusCode::UNAUTHORIZED,
                "AuthenticationRequired",
                msg.clone(),
            ),
            AppViewError::NotFound(msg) => (StatusCode::NOT_FOUND, "NotFound", msg.clone()),
            other => {
                tracing::error!(error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalServerError",
                    "Internal server error".to_string(), // Don't leak details
                )
            }
        };

        let body = Json(XrpcErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for AppView operations
pub type AppViewResult<T> = Result<T, AppViewError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppViewError::Validation("bad limit".into()), StatusCode::BAD_REQUEST),
            (AppViewError::Authentication("no viewer".into()), StatusCode::UNAUTHORIZED),
            (AppViewError::NotFound("post".into()), StatusCode::NOT_FOUND),
            (AppViewError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn test_internal_errors_do_not_leak() {
        let response =
            AppViewError::Internal("/var/lib/appview/secret.sqlite locked".into()).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: XrpcErrorResponse = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body.error, "InternalServerError");
        assert!(!body.message.contains("/var/lib"));
    }
}
