//! `/api/orders`: order CRUD, lifecycle transitions, payments and reports.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use keel_core::order::{Order, OrderStatus, OrderType};
use keel_core::types::{Page, PageRequest, TimeRange};
use keel_core::Money;
use keel_db::{OrderFilter, OrderStats};
use keel_engine::orders::{
    CancelRequest, NewOrder, OrderAnalytics, OrderUpdate, PaymentRequest, RefundRequest,
    ReturnRequest, ShipRequest,
};
use keel_engine::RequestContext;
use serde::Deserialize;

use crate::error::{ApiResult, WithContext};
use crate::extract::{Ctx, Json, Path, Query};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct OrderListQuery {
    pub status: Option<OrderStatus>,
    pub customer_id: Option<String>,
    pub order_type: Option<OrderType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl From<OrderListQuery> for OrderFilter {
    fn from(q: OrderListQuery) -> Self {
        OrderFilter {
            status: q.status,
            customer_id: q.customer_id,
            order_type: q.order_type,
            created: TimeRange {
                from: q.from,
                to: q.to,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_top")]
    pub top: u32,
}

fn default_top() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
pub struct PartialRefundBody {
    pub amount: Money,
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create).get(list))
        .route("/search", get(search))
        .route("/stats", get(stats))
        .route("/analytics", get(analytics))
        .route("/number/{number}", get(get_by_number))
        .route("/{id}", get(get_one).put(update).delete(delete))
        .route("/{id}/submit", post(submit))
        .route("/{id}/confirm", post(confirm))
        .route("/{id}/process", post(process))
        .route("/{id}/ship", post(ship))
        .route("/{id}/partial-ship", post(partial_ship))
        .route("/{id}/deliver", post(deliver))
        .route("/{id}/return", post(return_items))
        .route("/{id}/cancel", post(cancel))
        .route("/{id}/complete", post(complete))
        .route("/{id}/payments", post(record_payment))
        .route("/{id}/refund", post(refund))
        .route("/{id}/partial-refund", post(partial_refund))
}

type OrderResponse = ApiResult<Json<Order>>;

fn respond(ctx: &RequestContext, result: keel_engine::EngineResult<Order>) -> OrderResponse {
    Ok(Json(result.within(ctx)?))
}

// =============================================================================
// CRUD and Reads
// =============================================================================

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Json(req): Json<NewOrder>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let order = state.engine.orders.create(&ctx, req).await.within(&ctx)?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<OrderListQuery>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<Order>>> {
    let filter = OrderFilter::from(query);
    Ok(Json(state.engine.orders.list(&filter, page).await?))
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Json<Page<Order>>> {
    Ok(Json(state.engine.orders.search(&query.q, page).await?))
}

async fn stats(State(state): State<AppState>, Query(range): Query<TimeRange>) -> ApiResult<Json<OrderStats>> {
    Ok(Json(state.engine.orders.stats(&range).await?))
}

async fn analytics(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<Json<OrderAnalytics>> {
    let range = TimeRange {
        from: query.from,
        to: query.to,
    };
    Ok(Json(state.engine.orders.analytics(&range, query.top).await?))
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> OrderResponse {
    Ok(Json(state.engine.orders.get(&id).await?))
}

async fn get_by_number(State(state): State<AppState>, Path(number): Path<String>) -> OrderResponse {
    Ok(Json(state.engine.orders.get_by_number(&number).await?))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<OrderUpdate>,
) -> OrderResponse {
    respond(&ctx, state.engine.orders.update(&ctx, &id, req).await)
}

async fn delete(State(state): State<AppState>, Ctx(ctx): Ctx, Path(id): Path<String>) -> OrderResponse {
    respond(&ctx, state.engine.orders.delete(&ctx, &id).await)
}

// =============================================================================
// Transitions
// =============================================================================

async fn submit(State(state): State<AppState>, Ctx(ctx): Ctx, Path(id): Path<String>) -> OrderResponse {
    respond(&ctx, state.engine.orders.submit(&ctx, &id).await)
}

async fn confirm(State(state): State<AppState>, Ctx(ctx): Ctx, Path(id): Path<String>) -> OrderResponse {
    respond(&ctx, state.engine.orders.confirm(&ctx, &id).await)
}

async fn process(State(state): State<AppState>, Ctx(ctx): Ctx, Path(id): Path<String>) -> OrderResponse {
    respond(&ctx, state.engine.orders.process(&ctx, &id).await)
}

async fn ship(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<ShipRequest>,
) -> OrderResponse {
    respond(&ctx, state.engine.orders.ship(&ctx, &id, req).await)
}

async fn partial_ship(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<ShipRequest>,
) -> OrderResponse {
    respond(&ctx, state.engine.orders.partial_ship(&ctx, &id, req).await)
}

async fn deliver(State(state): State<AppState>, Ctx(ctx): Ctx, Path(id): Path<String>) -> OrderResponse {
    respond(&ctx, state.engine.orders.deliver(&ctx, &id).await)
}

async fn return_items(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<ReturnRequest>,
) -> OrderResponse {
    respond(&ctx, state.engine.orders.return_items(&ctx, &id, req).await)
}

async fn cancel(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> OrderResponse {
    respond(&ctx, state.engine.orders.cancel(&ctx, &id, req).await)
}

async fn complete(State(state): State<AppState>, Ctx(ctx): Ctx, Path(id): Path<String>) -> OrderResponse {
    respond(&ctx, state.engine.orders.complete(&ctx, &id).await)
}

// =============================================================================
// Payments
// =============================================================================

async fn record_payment(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<PaymentRequest>,
) -> OrderResponse {
    respond(&ctx, state.engine.orders.record_payment(&ctx, &id, req).await)
}

async fn refund(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(req): Json<RefundRequest>,
) -> OrderResponse {
    respond(&ctx, state.engine.orders.refund(&ctx, &id, req).await)
}

async fn partial_refund(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
    Json(body): Json<PartialRefundBody>,
) -> OrderResponse {
    let result = state
        .engine
        .orders
        .partial_refund(&ctx, &id, body.amount, body.reason)
        .await;
    respond(&ctx, result)
}

// =============================================================================
// Unit Tests
// =============================================================================
