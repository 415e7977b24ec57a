//! `/api/transactions`: the journal, approvals and reconciliation.

use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use keel_core::stock::{Decision, JournalEntry};
use keel_core::types::{Page, PageRequest, StockKey};
use keel_db::{JournalFilter, JournalStats};
use keel_engine::journal::Reconciliation;
use keel_engine::ledger::StockMovement;
use serde::Deserialize;

use crate::error::{ApiResult, WithContext};
use crate::extract::{Ctx, Json, Path, Query};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DecisionBody {
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(query))
        .route("/pending", get(pending))
        .route("/stats", get(stats))
        .route("/reconcile", get(reconcile))
        .route("/{id}", get(get_one))
        .route("/{id}/approve", post(approve))
        .route("/{id}/reject", post(reject))
}

async fn query(
    State(state): State<AppState>,
    Query(filter): Query<JournalFilter>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<JournalEntry>>> {
    Ok(Json(state.engine.journal.query(&filter, page).await?))
}

async fn pending(
    State(state): State<AppState>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<JournalEntry>>> {
    Ok(Json(state.engine.journal.pending(page).await?))
}

async fn stats(
    State(state): State<AppState>,
    Query(filter): Query<JournalFilter>,
) -> ApiResult<Json<JournalStats>> {
    Ok(Json(state.engine.journal.stats(&filter).await?))
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<JournalEntry>> {
    Ok(Json(state.engine.journal.get(&id).await?))
}

/// Rebuilds a record from its approved entries and compares.
async fn reconcile(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Query(key): Query<StockKey>,
) -> ApiResult<Json<Reconciliation>> {
    Ok(Json(state.engine.journal.replay(&ctx, &key).await.within(&ctx)?))
}

async fn approve(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<Json<StockMovement>> {
    decide(state, ctx, id, Decision::Approve, body).await
}

async fn reject(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<Json<StockMovement>> {
    decide(state, ctx, id, Decision::Reject, body).await
}

async fn decide(
    state: AppState,
    ctx: keel_engine::RequestContext,
    id: String,
    decision: Decision,
    body: DecisionBody,
) -> ApiResult<Json<StockMovement>> {
    let movement = state
        .engine
        .journal
        .decide(&ctx, &id, decision, body.notes)
        .await
        .within(&ctx)?;
    Ok(Json(movement))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::test_support::TestApp;
    use axum::http::StatusCode;
    use keel_engine::testing::TestEngine;
    use serde_json::json;

    #[tokio::test]
    async fn test_approval_round_trip() {
        let app = TestApp::from_engine(TestEngine::with_approval_threshold(5).await);
        app.t.stock(20).await;

        let body = json!({
            "product_id": app.t.product.id,
            "warehouse_id": app.t.warehouse.id,
            "delta": -6,
            "reason": "damaged pallet",
        });
        let (status, proposed) = app.post("/api/inventory/adjust", body).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let entry_id = proposed["entry"]["id"].as_str().unwrap().to_string();

        let (_, pending) = app.get("/api/transactions/pending").await;
        assert_eq!(pending["total"], 1);

        let (status, approved) = app
            .post(
                &format!("/api/transactions/{}/approve", entry_id),
                json!({ "notes": "checked" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["entry"]["status"], "approved");
        assert_eq!(approved["entry"]["approved_by"], "tester");
        assert_eq!(approved["record"]["on_hand"], 14);

        let (status, again) = app
            .post(&format!("/api/transactions/{}/reject", entry_id), json!({}))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(again["code"], "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_journal_query_and_reconcile() {
        let app = TestApp::new().await;
        app.t.stock(10).await;
        app.post(
            "/api/inventory/adjust",
            json!({
                "product_id": app.t.product.id,
                "warehouse_id": app.t.warehouse.id,
                "delta": -3,
                "reason": "shrinkage",
            }),
        )
        .await;

        let (status, page) = app
            .get(&format!("/api/transactions?product_id={}&kind=ADJUST", app.t.product.id))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["quantity"], -3);
        let id = page["items"][0]["id"].as_str().unwrap().to_string();

        let (status, entry) = app.get(&format!("/api/transactions/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entry["reason"], "shrinkage");

        let (status, recon) = app
            .get(&format!(
                "/api/transactions/reconcile?product_id={}&warehouse_id={}",
                app.t.product.id, app.t.warehouse.id
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(recon["consistent"], true);
        assert_eq!(recon["replayed_on_hand"], 7);

        let (status, _) = app.get("/api/transactions/no-such-entry").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
