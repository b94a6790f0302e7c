//! HTTP error mapping.
//!
//! Every failure surfaces as a stable error object `{code, message,
//! details?}` with the status mapping fixed by the API contract.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::errors::{EngineError, ErrorKind};

/// Wire shape of an error.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API-facing error with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody { code: code.to_string(), message: message.into(), details: None },
            retry_after_secs: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, "archived", message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        let (status, retry_after) = match &err {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, None),
            EngineError::AuthorizationDenied { .. } => (StatusCode::FORBIDDEN, None),
            EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, None),
            EngineError::StateConflict(msg) if msg.contains("archived") => {
                (StatusCode::GONE, None)
            }
            EngineError::StateConflict(_) | EngineError::Cancelled(_) => {
                (StatusCode::CONFLICT, None)
            }
            EngineError::Expression(_) | EngineError::NoMatchingRoute { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, None)
            }
            EngineError::QueueFull { .. } => (StatusCode::TOO_MANY_REQUESTS, Some(2)),
            EngineError::RateLimit(_) | EngineError::LimitExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, Some(30))
            }
            EngineError::BudgetExceeded { .. } => (StatusCode::CONFLICT, None),
            EngineError::AgentUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            EngineError::Timeout(_)
            | EngineError::Internal(_)
            | EngineError::Database(_)
            | EngineError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        Self {
            status,
            body: ErrorBody { code: kind.as_str().to_string(), message, details: None },
            retry_after_secs: retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Internal detail never leaks raw database or serialization text.
        let body = if self.status == StatusCode::INTERNAL_SERVER_ERROR
            && self.body.code == ErrorKind::Internal.as_str()
        {
            ErrorBody {
                code: self.body.code,
                message: "internal error".to_string(),
                details: None,
            }
        } else {
            self.body
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
