//! `/api/warehouses`

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Router;
use keel_core::types::{Page, PageRequest, Warehouse};
use keel_db::WarehouseFilter;
use keel_engine::warehouses::{NewWarehouse, WarehouseStats, WarehouseUpdate};
use serde::Deserialize;

use crate::error::{ApiResult, WithContext};
use crate::extract::{Ctx, Json, Path, Query};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ManagerBody {
    pub manager_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create).get(list))
        .route("/code/{code}", get(get_by_code))
        .route("/{id}", get(get_one).put(update).delete(delete))
        .route("/{id}/activate", post(activate))
        .route("/{id}/deactivate", post(deactivate))
        .route("/{id}/manager", put(assign_manager).delete(remove_manager))
        .route("/{id}/stats", get(stats))
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Json(req): Json<NewWarehouse>,
) -> ApiResult<(StatusCode, Json<Warehouse>)> {
    let warehouse = state.engine.warehouses.create(&ctx, req).await.within(&ctx)?;
    Ok((StatusCode::CREATED, Json(warehouse)))
}

async fn list(
    State(state): State<AppState>,
    Query(filter): Query<WarehouseFilter>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<Warehouse>>> {
    Ok(Json(state.engine.warehouses.list(&filter, page).await?))
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Warehouse>> {
    Ok(Json(state.engine.warehouses.get(&id).await?))
}

async fn get_by_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<Warehouse>> {
    Ok(Json(state.engine.warehouses.get_by_code(&code).await?))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<WarehouseUpdate>,
) -> ApiResult<Json<Warehouse>> {
    let warehouse = state.engine.warehouses.update(&ctx, &id, req).await.within(&ctx)?;
    Ok(Json(warehouse))
}

async fn activate(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
) -> ApiResult<Json<Warehouse>> {
    let warehouse = state.engine.warehouses.set_active(&ctx, &id, true).await.within(&ctx)?;
    Ok(Json(warehouse))
}

async fn deactivate(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
) -> ApiResult<Json<Warehouse>> {
    let warehouse = state.engine.warehouses.set_active(&ctx, &id, false).await.within(&ctx)?;
    Ok(Json(warehouse))
}

async fn assign_manager(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(body): Json<ManagerBody>,
) -> ApiResult<Json<Warehouse>> {
    let warehouse = state
        .engine
        .warehouses
        .assign_manager(&ctx, &id, Some(body.manager_id))
        .await
        .within(&ctx)?;
    Ok(Json(warehouse))
}

async fn remove_manager(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
) -> ApiResult<Json<Warehouse>> {
    let warehouse = state
        .engine
        .warehouses
        .assign_manager(&ctx, &id, None)
        .await
        .within(&ctx)?;
    Ok(Json(warehouse))
}

async fn delete(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.warehouses.delete(&ctx, &id).await.within(&ctx)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stats(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<WarehouseStats>> {
    Ok(Json(state.engine.warehouses.stats(&id).await?))
}

// =============================================================================
// Unit Tests
// =============================================================================
