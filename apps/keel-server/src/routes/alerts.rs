//! `/api/alerts`: low-stock alert configuration.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use keel_core::alert::LowStockAlert;
use keel_core::types::{Page, PageRequest};
use keel_db::AlertFilter;
use keel_engine::alerts::AlertUpdate;
use keel_engine::NewAlert;

use crate::error::{ApiResult, WithContext};
use crate::extract::{Ctx, Json, Path, Query};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create).get(list))
        .route("/{id}", get(get_one).put(update).delete(delete))
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Json(req): Json<NewAlert>,
) -> ApiResult<(StatusCode, Json<LowStockAlert>)> {
    let alert = state.engine.alerts.create(&ctx, req).await.within(&ctx)?;
    Ok((StatusCode::CREATED, Json(alert)))
}

async fn list(
    State(state): State<AppState>,
    Query(filter): Query<AlertFilter>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<LowStockAlert>>> {
    Ok(Json(state.engine.alerts.list(&filter, page).await?))
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<LowStockAlert>> {
    Ok(Json(state.engine.alerts.get(&id).await?))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<AlertUpdate>,
) -> ApiResult<Json<LowStockAlert>> {
    Ok(Json(state.engine.alerts.update(&ctx, &id, req).await.within(&ctx)?))
}

async fn delete(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.alerts.delete(&ctx, &id).await.within(&ctx)?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::test_support::TestApp;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_alert_crud() {
        let app = TestApp::new().await;

        let (status, alert) = app
            .post(
                "/api/alerts",
                json!({ "product_id": app.t.product.id, "threshold": 5 }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(alert["is_active"], true);
        let id = alert["id"].as_str().unwrap().to_string();

        let (status, updated) = app
            .put(
                &format!("/api/alerts/{}", id),
                json!({ "threshold": 8, "is_active": false }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["threshold"], 8);
        assert_eq!(updated["is_active"], false);

        let (_, page) = app
            .get(&format!("/api/alerts?product_id={}", app.t.product.id))
            .await;
        assert_eq!(page["total"], 1);

        let (status, _) = app.delete(&format!("/api/alerts/{}", id)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.get(&format!("/api/alerts/{}", id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_alert_needs_a_scope() {
        let app = TestApp::new().await;
        let (status, body) = app.post("/api/alerts", json!({ "threshold": 5 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION");

        let (status, _) = app
            .post(
                "/api/alerts",
                json!({ "warehouse_id": "no-such-warehouse", "threshold": 1 }),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
