//! `/api/inventory`: stock movements, reads and reservations.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use keel_core::stock::{JournalStatus, Reservation, StockRecord};
use keel_core::types::{Page, PageRequest, ReferenceType, StockKey};
use keel_db::{StockFilter, StockTotals};
use keel_engine::ledger::{
    AdjustRequest, Availability, BulkAdjustResult, DrawdownRequest, ReservationMovement,
    ReserveRequest, RestockRequest, StockMovement, TransferOutcome, TransferRequest,
};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult, WithContext};
use crate::extract::{Ctx, Json, Path, Query};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LowStockQuery {
    pub warehouse_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub product_id: String,
    pub warehouse_id: Option<String>,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct BulkAdjustBody {
    pub items: Vec<AdjustRequest>,
}

/// Either a stock key or a reference must be given.
#[derive(Debug, Deserialize)]
pub struct ReservationQuery {
    pub product_id: Option<String>,
    pub warehouse_id: Option<String>,
    #[serde(default)]
    pub active_only: bool,
    pub reference_id: Option<String>,
    pub reference_type: Option<ReferenceType>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/stats", get(stats))
        .route("/low-stock", get(low_stock))
        .route("/availability", get(availability))
        .route("/stock/{product_id}/{warehouse_id}", get(get_record))
        .route("/adjust", post(adjust))
        .route("/restock", post(restock))
        .route("/reserve", post(reserve))
        .route("/transfer", post(transfer))
        .route("/bulk-adjust", post(bulk_adjust))
        .route("/reservations", get(list_reservations))
        .route("/reservations/{id}", get(get_reservation))
        .route("/reservations/{id}/release", post(release))
        .route("/reservations/{id}/consume", post(consume))
        .route("/reservations/{id}/cancel", post(cancel_reservation))
}

// =============================================================================
// Reads
// =============================================================================

async fn list(
    State(state): State<AppState>,
    Query(filter): Query<StockFilter>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<StockRecord>>> {
    Ok(Json(state.engine.ledger.list(&filter, page).await?))
}

async fn stats(
    State(state): State<AppState>,
    Query(filter): Query<StockFilter>,
) -> ApiResult<Json<StockTotals>> {
    Ok(Json(state.engine.ledger.stats(&filter).await?))
}

async fn low_stock(
    State(state): State<AppState>,
    Query(query): Query<LowStockQuery>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<StockRecord>>> {
    Ok(Json(state.engine.ledger.low_stock(query.warehouse_id, page).await?))
}

async fn availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<Json<Availability>> {
    let availability = state
        .engine
        .ledger
        .check_availability(&query.product_id, query.warehouse_id.as_deref(), query.quantity)
        .await?;
    Ok(Json(availability))
}

async fn get_record(
    State(state): State<AppState>,
    Path((product_id, warehouse_id)): Path<(String, String)>,
) -> ApiResult<Json<StockRecord>> {
    Ok(Json(state.engine.ledger.get(&product_id, &warehouse_id).await?))
}

// =============================================================================
// Movements
// =============================================================================

/// 202 when the movement waits for approval.
fn movement_status(movement: &StockMovement) -> StatusCode {
    match movement.entry.status {
        JournalStatus::Pending => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    }
}

async fn adjust(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Json(req): Json<AdjustRequest>,
) -> ApiResult<(StatusCode, Json<StockMovement>)> {
    let movement = state.engine.ledger.adjust(&ctx, req).await.within(&ctx)?;
    Ok((movement_status(&movement), Json(movement)))
}

async fn restock(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Json(req): Json<RestockRequest>,
) -> ApiResult<Json<StockMovement>> {
    Ok(Json(state.engine.ledger.restock(&ctx, req).await.within(&ctx)?))
}

async fn reserve(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Json(req): Json<ReserveRequest>,
) -> ApiResult<(StatusCode, Json<ReservationMovement>)> {
    let movement = state.engine.ledger.reserve(&ctx, req).await.within(&ctx)?;
    Ok((StatusCode::CREATED, Json(movement)))
}

async fn transfer(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Json<TransferOutcome>> {
    Ok(Json(state.engine.ledger.transfer(&ctx, req).await.within(&ctx)?))
}

async fn bulk_adjust(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Json(body): Json<BulkAdjustBody>,
) -> ApiResult<Json<Vec<BulkAdjustResult>>> {
    let results = state
        .engine
        .ledger
        .bulk_adjust(&ctx, body.items)
        .await
        .within(&ctx)?;
    Ok(Json(results))
}

// =============================================================================
// Reservations
// =============================================================================

async fn list_reservations(
    State(state): State<AppState>,
    Query(query): Query<ReservationQuery>,
) -> ApiResult<Json<Vec<Reservation>>> {
    let registry = &state.engine.registry;
    let reservations = match query {
        ReservationQuery {
            product_id: Some(product_id),
            warehouse_id: Some(warehouse_id),
            active_only,
            ..
        } => {
            let key = StockKey::new(product_id, warehouse_id);
            registry.list_by_stock(&key, active_only).await?
        }
        ReservationQuery {
            reference_id: Some(reference_id),
            reference_type: Some(reference_type),
            ..
        } => registry.list_by_reference(&reference_id, reference_type).await?,
        _ => {
            return Err(ApiError::invalid(
                "query",
                "give product_id and warehouse_id, or reference_id and reference_type",
            ))
        }
    };
    Ok(Json(reservations))
}

async fn get_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Reservation>> {
    Ok(Json(state.engine.registry.get(&id).await?))
}

async fn release(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<DrawdownRequest>,
) -> ApiResult<Json<ReservationMovement>> {
    Ok(Json(state.engine.ledger.release(&ctx, &id, req).await.within(&ctx)?))
}

async fn consume(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<DrawdownRequest>,
) -> ApiResult<Json<ReservationMovement>> {
    Ok(Json(state.engine.ledger.consume(&ctx, &id, req).await.within(&ctx)?))
}

async fn cancel_reservation(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<ReservationMovement>> {
    let movement = state
        .engine
        .registry
        .cancel(&ctx, &id, body.reason)
        .await
        .within(&ctx)?;
    Ok(Json(movement))
}

// =============================================================================
// Unit Tests
// =============================================================================
