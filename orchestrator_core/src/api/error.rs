//! API error types and responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use kubesmith_shared_types::ProvisionError;

/// Error details inside the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// API error rendered as `{success:false, error:{code, message}}`.
#[derive(Debug)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new("NOT_IMPLEMENTED", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorInfo,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.code.as_str() {
            "BAD_REQUEST" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "CONFLICT" => StatusCode::CONFLICT,
            "NOT_IMPLEMENTED" => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorEnvelope {
            success: false,
            error: ErrorInfo {
                code: self.code,
                message: self.message,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::InvalidSpec(msg) => ApiError::bad_request(format!("invalid spec: {msg}")),
            ProvisionError::NotFound(msg) => ApiError::not_found(msg),
            ProvisionError::ProvisionerNotFound(name) => {
                ApiError::not_found(format!("provisioner not found: {name}"))
            }
            ProvisionError::NotImplemented(msg) => ApiError::not_implemented(msg),
            ProvisionError::Conflict(msg) => ApiError::conflict(msg),
            ProvisionError::ConnectionFailed(msg) => {
                ApiError::internal_error(format!("connection failed: {msg}"))
            }
            ProvisionError::CommandFailed { message, .. } => {
                ApiError::internal_error(format!("command failed: {message}"))
            }
            ProvisionError::Repository(msg) => {
                ApiError::internal_error(format!("repository error: {msg}"))
            }
            ProvisionError::Internal(msg) => ApiError::internal_error(msg),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
