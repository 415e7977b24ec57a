//! Request extractors.
//!
//! `Json`, `Query` and `Path` wrap axum's own so that malformed input is
//! answered with an [`ApiError`] body instead of plain text.

use std::time::Duration;

use axum::extract::{FromRequest, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use keel_engine::context::SYSTEM_ACTOR;
use keel_engine::RequestContext;
use serde::Serialize;

use crate::error::ApiError;
use crate::AppState;

/// Caller identity. Authentication happens upstream.
pub const ACTOR_HEADER: &str = "x-actor-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Per-request deadline in milliseconds.
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct Query<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct Path<T>(pub T);

// =============================================================================
// Request Context
// =============================================================================

/// The engine context for one request, built from its headers.
///
/// The request id set by the server's request-id layer becomes the
/// correlation id. Contexts are cancelled when the server shuts down.
#[derive(Debug, Clone)]
pub struct Ctx(pub RequestContext);

impl FromRequestParts<AppState> for Ctx {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let ctx = context_from_headers(&parts.headers)?
            .with_cancellation(state.shutdown.child_token());
        Ok(Ctx(ctx))
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn context_from_headers(headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let actor = header(headers, ACTOR_HEADER).unwrap_or_else(|| SYSTEM_ACTOR.to_string());
    let mut ctx =
        RequestContext::new(actor).with_idempotency_key(header(headers, IDEMPOTENCY_HEADER));
    if let Some(id) = header(headers, REQUEST_ID_HEADER) {
        ctx = ctx.with_correlation_id(id);
    }
    if let Some(raw) = header(headers, TIMEOUT_HEADER) {
        let ms = raw
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| ApiError::invalid(TIMEOUT_HEADER, "must be a positive number of milliseconds"))?;
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }
    Ok(ctx)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use keel_core::ErrorCode;

    #[test]
    fn test_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("alice"));
        headers.insert(IDEMPOTENCY_HEADER, HeaderValue::from_static("adj-1"));
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));
        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("1500"));

        let ctx = context_from_headers(&headers).unwrap();
        assert_eq!(ctx.actor, "alice");
        assert_eq!(ctx.idempotency_key.as_deref(), Some("adj-1"));
        assert_eq!(ctx.correlation_id, "req-42");
        let left = ctx.remaining().unwrap();
        assert!(left <= Duration::from_millis(1500));
    }

    #[test]
    fn test_defaults_without_headers() {
        let ctx = context_from_headers(&HeaderMap::new()).unwrap();
        assert_eq!(ctx.actor, SYSTEM_ACTOR);
        assert!(ctx.idempotency_key.is_none());
        assert!(ctx.remaining().is_none());
        assert!(!ctx.correlation_id.is_empty());
    }

    #[test]
    fn test_bad_timeout_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("soon"));
        let err = context_from_headers(&headers).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.details[0].field, TIMEOUT_HEADER);
    }
}
