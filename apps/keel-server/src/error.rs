//! HTTP error responses.
//!
//! ```text
//! EngineError ──code()──► ErrorCode ──status_for()──► StatusCode
//!                                │
//!                                ▼
//!     { "code": "INSUFFICIENT_STOCK", "message": "...",
//!       "details": [{ "field": ..., "message": ... }], "correlation_id": "..." }
//! ```

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keel_core::error::FieldError;
use keel_core::ErrorCode;
use keel_engine::{EngineError, EngineResult, RequestContext};
use serde::Serialize;
use tracing::{debug, error};

pub type ApiResult<T> = Result<T, ApiError>;

/// Body of every failed request.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError {
            code,
            message: message.into(),
            details: Vec::new(),
            correlation_id: None,
        }
    }

    /// A single-field validation failure.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        ApiError {
            details: vec![FieldError {
                field: field.to_string(),
                message: message.clone(),
            }],
            ..ApiError::new(ErrorCode::Validation, format!("{}: {}", field, message))
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.code)
    }
}

/// HTTP status for each taxonomy code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict | ErrorCode::InsufficientStock => StatusCode::CONFLICT,
        ErrorCode::InvalidTransition => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError {
            details: err.details(),
            ..ApiError::new(err.code(), err.to_string())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(ErrorCode::Validation, rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::new(ErrorCode::Validation, rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::new(ErrorCode::Validation, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = ?self.code, correlation_id = ?self.correlation_id, "{}", self.message);
        } else {
            debug!(code = ?self.code, correlation_id = ?self.correlation_id, "{}", self.message);
        }
        (status, axum::Json(self)).into_response()
    }
}

/// Attaches the request's correlation id to engine failures.
pub trait WithContext<T> {
    fn within(self, ctx: &RequestContext) -> ApiResult<T>;
}

impl<T> WithContext<T> for EngineResult<T> {
    fn within(self, ctx: &RequestContext) -> ApiResult<T> {
        self.map_err(|e| ApiError::from(e).with_correlation_id(&ctx.correlation_id))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{CoreError, ValidationError, ValidationErrors};

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::InsufficientStock), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorCode::InvalidTransition),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(ErrorCode::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorCode::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_validation_details_survive() {
        let mut errs = ValidationErrors::new();
        errs.push(ValidationError::Required {
            field: "reason".into(),
        });
        let api = ApiError::from(EngineError::from(errs)).with_correlation_id("req-1");
        assert_eq!(api.code, ErrorCode::Validation);
        assert_eq!(api.details.len(), 1);
        assert_eq!(api.details[0].field, "reason");

        let body = serde_json::to_value(&api).unwrap();
        assert_eq!(body["code"], "VALIDATION");
        assert_eq!(body["correlation_id"], "req-1");
    }

    #[test]
    fn test_engine_codes_pass_through() {
        let api = ApiError::from(EngineError::Core(CoreError::not_found("Order", "o-1")));
        assert_eq!(api.status(), StatusCode::NOT_FOUND);
        assert!(api.details.is_empty());
        let body = serde_json::to_value(&api).unwrap();
        assert!(body.get("details").is_none());
    }
}
