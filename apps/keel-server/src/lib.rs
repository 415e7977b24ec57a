//! # keel-server
//!
//! axum binding for the Keel ERP engine.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           keel-server                                   │
//! │                                                                         │
//! │  request ──► SetRequestId ──► TraceLayer ──► PropagateRequestId        │
//! │                                                   │                     │
//! │                                                   ▼                     │
//! │   /health              routes::health                                   │
//! │   /api/warehouses      routes::warehouses  ──► WarehouseService         │
//! │   /api/inventory       routes::inventory   ──► StockLedger, Registry    │
//! │   /api/transactions    routes::transactions──► TransactionJournal       │
//! │   /api/alerts          routes::alerts      ──► AlertEngine              │
//! │   /api/orders          routes::orders      ──► OrderService             │
//! │   /api/files           routes::files       ──► ObjectStore              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers are thin: build a [`RequestContext`](keel_engine::RequestContext)
//! from the headers ([`extract::Ctx`]), call one engine operation, return
//! its snapshot as JSON or an [`error::ApiError`].

pub mod error;
pub mod extract;
pub mod routes;

use std::sync::Arc;

use axum::http::{HeaderName, Request};
use axum::Router;
use keel_engine::Engine;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::extract::REQUEST_ID_HEADER;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Cancelled on shutdown; every request context derives from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        AppState {
            engine,
            shutdown: CancellationToken::new(),
        }
    }
}

/// The full application router with tracing and request ids.
pub fn router(state: AppState) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .merge(routes::health::router())
        .nest("/api/warehouses", routes::warehouses::router())
        .nest("/api/inventory", routes::inventory::router())
        .nest("/api/transactions", routes::transactions::router())
        .nest("/api/alerts", routes::alerts::router())
        .nest("/api/orders", routes::orders::router())
        .nest("/api/files", routes::files::router())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
                    let request_id = req
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    info_span!(
                        "http",
                        method = %req.method(),
                        uri = %req.uri(),
                        request_id = %request_id,
                    )
                }))
                .layer(PropagateRequestIdLayer::new(request_id))
                .layer(CorsLayer::permissive()),
        )
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Drives the router in-process.

    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use keel_engine::testing::TestEngine;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{router, AppState};
    use crate::extract::{ACTOR_HEADER, IDEMPOTENCY_HEADER};

    pub struct TestApp {
        pub t: TestEngine,
        pub state: AppState,
    }

    impl TestApp {
        pub async fn new() -> Self {
            Self::from_engine(TestEngine::new().await)
        }

        pub fn from_engine(t: TestEngine) -> Self {
            TestApp {
                state: AppState::new(Arc::clone(&t.engine)),
                t,
            }
        }

        pub async fn send(
            &self,
            method: Method,
            uri: &str,
            body: Option<Value>,
            headers: &[(&str, &str)],
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header(ACTOR_HEADER, "tester");
            for (name, value) in headers {
                builder = builder.header(*name, *value);
            }
            let request = match body {
                Some(json) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = router(self.state.clone()).oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, value)
        }

        pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
            self.send(Method::GET, uri, None, &[]).await
        }

        pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
            self.send(Method::POST, uri, Some(body), &[]).await
        }

        pub async fn post_keyed(&self, uri: &str, body: Value, key: &str) -> (StatusCode, Value) {
            self.send(Method::POST, uri, Some(body), &[(IDEMPOTENCY_HEADER, key)])
                .await
        }

        pub async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
            self.send(Method::PUT, uri, Some(body), &[]).await
        }

        pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
            self.send(Method::DELETE, uri, None, &[]).await
        }
    }
}
