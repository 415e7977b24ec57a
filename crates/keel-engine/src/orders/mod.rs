//! # Order Service
//!
//! Orders from draft to a terminal status. Every status change that moves
//! stock runs in the same transaction as the order write, the customer
//! credit change and the stored idempotent response.
//!
//! ## State Machine
//! ```text
//! draft ─► pending ─► confirmed ─► processing ─► shipped ─► delivered ─► [completed]
//!   │         │           │  │          │          ▲  │         │
//!   │         │           │  └──────────┴─► partial_shipped     │
//!   ▼         ▼           ▼                        │  ▼         ▼
//! [cancelled] ◄───────────┴────────────────────────┘ returns_in_progress ─► [refunded]
//! ```
//!
//! ## Stock Effects
//! ```text
//! ┌─────────────┬───────────────────────────────────────────────────────────┐
//! │ confirm     │ RESERVE per tracked line, all or none; credit += total    │
//! │ ship        │ SHIPMENT (consume) per shipped line                       │
//! │ return      │ RESTOCK per line, or a written-off ADJUST with no delta   │
//! │ cancel      │ RELEASE remaining holds; optional RESTOCK of shipped      │
//! │             │ units; credit −= total − refunded                         │
//! └─────────────┴───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lock Phases
//! Idempotency key and order id first, then a pool read of the order to
//! learn its stock keys, then the stock keys. The transaction opens after
//! the last lock.

mod idempotency;
mod lifecycle;
mod payments;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::order::{
    FulfillmentStatus, Order, OrderItem, OrderItemInput, OrderPriority, OrderStatus, OrderTotals,
    OrderType, PaymentStatus,
};
use keel_core::stock::PRIORITY_DEFAULT;
use keel_core::types::{new_id, Page, PageRequest, Product, TimeRange};
use keel_core::validation::{validate_currency, validate_search_query, validate_text};
use keel_core::{CoreError, CoreResult, Money, ValidationError, ValidationErrors};
use keel_db::{DailyOrderTotals, OrderFilter, OrderRepository, OrderStats, TopProduct};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::config::OrderSettings;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::locks::LockKey;
use crate::shared::Shared;
pub(crate) use crate::sinks::audit_details as details;

use self::idempotency::Keyed;

/// Most lines one order may carry.
pub const MAX_ORDER_ITEMS: usize = 200;

const MAX_ADDRESS_LEN: usize = 500;
const MAX_NOTES_LEN: usize = 2_000;
const MAX_TRACKING_LEN: usize = 100;

/// Largest `top_n` accepted by [`OrderService::analytics`].
pub const MAX_TOP_PRODUCTS: u32 = 100;

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub customer_id: String,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub priority: OrderPriority,
    /// Default warehouse for lines that do not name one.
    pub warehouse_id: String,
    /// Defaults to the configured currency.
    #[serde(default)]
    pub currency: Option<String>,
    pub items: Vec<OrderItemInput>,
    #[serde(default)]
    pub shipping_amount: Money,
    /// Order-level discount on top of line discounts.
    #[serde(default)]
    pub discount_amount: Money,
    #[serde(default)]
    pub shipping_address: Option<String>,
    #[serde(default)]
    pub billing_address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub required_date: Option<DateTime<Utc>>,
}

impl NewOrder {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.customer_id.trim().is_empty() {
            errs.push(ValidationError::Required {
                field: "customer_id".into(),
            });
        }
        if self.warehouse_id.trim().is_empty() {
            errs.push(ValidationError::Required {
                field: "warehouse_id".into(),
            });
        }
        if let Some(currency) = &self.currency {
            errs.check(validate_currency(currency));
        }
        validate_items(&mut errs, &self.items);
        validate_money(&mut errs, Some(self.shipping_amount), Some(self.discount_amount));
        validate_details(
            &mut errs,
            self.shipping_address.as_deref(),
            self.billing_address.as_deref(),
            self.notes.as_deref(),
        );
        errs.into_result()
    }
}

/// Changes to a draft. Absent fields are left alone; `items` replaces
/// every line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    #[serde(default)]
    pub items: Option<Vec<OrderItemInput>>,
    #[serde(default)]
    pub priority: Option<OrderPriority>,
    #[serde(default)]
    pub shipping_amount: Option<Money>,
    #[serde(default)]
    pub discount_amount: Option<Money>,
    #[serde(default)]
    pub shipping_address: Option<String>,
    #[serde(default)]
    pub billing_address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub required_date: Option<DateTime<Utc>>,
}

impl OrderUpdate {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(items) = &self.items {
            validate_items(&mut errs, items);
        }
        validate_money(&mut errs, self.shipping_amount, self.discount_amount);
        validate_details(
            &mut errs,
            self.shipping_address.as_deref(),
            self.billing_address.as_deref(),
            self.notes.as_deref(),
        );
        errs.into_result()
    }
}

/// Units of one product. Spread over that product's lines in line order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipLine {
    pub product_id: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipRequest {
    /// Empty ships everything still unshipped.
    #[serde(default)]
    pub items: Vec<ShipLine>,
    #[serde(default)]
    pub tracking_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRequest {
    /// Empty returns every shipped unit not yet returned.
    #[serde(default)]
    pub items: Vec<ShipLine>,
    /// Put returned units back on hand; otherwise they are written off.
    #[serde(default)]
    pub restock: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
    /// Restock units already shipped.
    #[serde(default)]
    pub restock: bool,
    /// Refund everything paid and not yet refunded.
    #[serde(default)]
    pub refund_payment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Money,
    /// External payment reference, kept in the audit trail.
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Defaults to the full refundable amount.
    #[serde(default)]
    pub amount: Option<Money>,
    #[serde(default)]
    pub reason: Option<String>,
}

fn validate_items(errs: &mut ValidationErrors, items: &[OrderItemInput]) {
    if items.is_empty() || items.len() > MAX_ORDER_ITEMS {
        errs.push(ValidationError::OutOfRange {
            field: "items".into(),
            min: 1,
            max: MAX_ORDER_ITEMS as i64,
        });
    }
    for (i, item) in items.iter().enumerate() {
        if let Err(e) = item.validate() {
            errs.extend_prefixed(&format!("items[{}]", i), e);
        }
    }
}

fn validate_money(errs: &mut ValidationErrors, shipping: Option<Money>, discount: Option<Money>) {
    if shipping.is_some_and(|m| m.is_negative()) {
        errs.push(ValidationError::MustNotBeNegative {
            field: "shipping_amount".into(),
        });
    }
    if discount.is_some_and(|m| m.is_negative()) {
        errs.push(ValidationError::MustNotBeNegative {
            field: "discount_amount".into(),
        });
    }
}

fn validate_details(
    errs: &mut ValidationErrors,
    shipping_address: Option<&str>,
    billing_address: Option<&str>,
    notes: Option<&str>,
) {
    errs.check(validate_text("shipping_address", shipping_address, MAX_ADDRESS_LEN));
    errs.check(validate_text("billing_address", billing_address, MAX_ADDRESS_LEN));
    errs.check(validate_text("notes", notes, MAX_NOTES_LEN));
}

// =============================================================================
// Reports
// =============================================================================

/// Daily figures and best sellers over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAnalytics {
    pub range: TimeRange,
    pub daily: Vec<DailyOrderTotals>,
    pub top_products: Vec<TopProduct>,
}

// =============================================================================
// Order Service
// =============================================================================

#[derive(Debug, Clone)]
pub struct OrderService {
    shared: Shared,
    settings: OrderSettings,
    hard_limit: Duration,
}

/// Products by id, loaded before the transaction opens.
type Products = HashMap<String, Product>;

fn product<'p>(products: &'p Products, id: &str) -> EngineResult<&'p Product> {
    products
        .get(id)
        .ok_or_else(|| CoreError::Invariant(format!("product {} was not loaded", id)).into())
}

impl OrderService {
    pub fn new(shared: Shared, settings: OrderSettings, hard_limit: Duration) -> Self {
        OrderService {
            shared,
            settings,
            hard_limit,
        }
    }

    /// Catalog entries for `ids`, each looked up once.
    async fn load_products<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> EngineResult<Products> {
        let mut products = Products::new();
        for id in ids {
            if !products.contains_key(id) {
                let product = self.shared.catalog.require(id).await?;
                products.insert(id.to_string(), product);
            }
        }
        Ok(products)
    }

    /// Catalog entries for new lines. Inactive products cannot be ordered.
    async fn orderable_products(&self, items: &[OrderItemInput]) -> EngineResult<Products> {
        let ids: Vec<&str> = items.iter().map(|i| i.product_id.as_str()).collect();
        let products = self.load_products(ids).await?;
        let mut errs = ValidationErrors::new();
        for (i, item) in items.iter().enumerate() {
            if products.get(&item.product_id).is_some_and(|p| !p.is_active) {
                errs.push(ValidationError::Invalid {
                    field: format!("items[{}].product_id", i),
                    reason: format!("product {} is inactive", item.product_id),
                });
            }
        }
        errs.into_result()?;
        Ok(products)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Creates a draft. Lines are priced from the catalog; stock is not
    /// touched.
    #[instrument(skip_all, fields(customer_id = %req.customer_id, correlation_id = %ctx.correlation_id))]
    pub async fn create(&self, ctx: &RequestContext, req: NewOrder) -> EngineResult<Order> {
        let details = details(&req);
        let result = async {
            req.validate()?;
            self.shared
                .db
                .customers()
                .get_by_id(&req.customer_id)
                .await?
                .ok_or_else(|| EngineError::not_found("Customer", &req.customer_id))?;

            let mut warehouse_ids: Vec<&str> = req
                .items
                .iter()
                .filter_map(|i| i.warehouse_id.as_deref())
                .collect();
            warehouse_ids.push(&req.warehouse_id);
            warehouse_ids.sort_unstable();
            warehouse_ids.dedup();
            for id in warehouse_ids {
                let warehouse = self
                    .shared
                    .db
                    .warehouses()
                    .get_by_id(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("Warehouse", id))?;
                if !warehouse.is_active {
                    return Err(CoreError::WarehouseInactive {
                        warehouse_id: id.to_string(),
                    }
                    .into());
                }
            }
            let products = self.orderable_products(&req.items).await?;

            let keyed = Keyed::new(ctx.idempotency_key.as_deref(), "order.create", "", &req)?;
            let (req, products, keyed) = (&req, &products, keyed.as_ref());
            self.shared
                .retry
                .run("order.create", move || async move {
                    let locks = keyed.map(|k| LockKey::Idempotency(k.key.clone()));
                    let _guard = self.shared.locks.acquire(ctx, locks, PRIORITY_DEFAULT).await?;
                    if let Some(keyed) = keyed {
                        if let Some(order) = keyed.recall::<Order>(&self.shared.db).await? {
                            return Ok(order);
                        }
                    }
                    let mut tx = self.shared.db.begin().await?;
                    let order = ctx
                        .run(
                            "order.create",
                            self.hard_limit,
                            self.create_in(&mut tx, ctx, req, products, keyed),
                        )
                        .await?;
                    tx.commit().await?;
                    Ok(order)
                })
                .await
        }
        .await;
        let resource = result
            .as_ref()
            .map_or_else(|_| "order:new".to_string(), |o| o.id.clone());
        self.shared
            .sinks
            .conclude(ctx, "order.create", &resource, details, result)
    }

    async fn create_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        req: &NewOrder,
        products: &Products,
        keyed: Option<&Keyed>,
    ) -> EngineResult<Order> {
        let now = Utc::now();
        let id = new_id();
        let order_number = OrderRepository::next_number(&mut *conn, &self.settings.number_prefix).await?;

        let items = req
            .items
            .iter()
            .map(|input| {
                let warehouse_id = input.warehouse_id.as_deref().unwrap_or(&req.warehouse_id);
                let product = product(products, &input.product_id)?;
                Ok(OrderItem::price(&id, product, input, warehouse_id)?)
            })
            .collect::<EngineResult<Vec<_>>>()?;
        let totals = OrderTotals::compute(&items, req.shipping_amount, req.discount_amount)?;

        let mut order = Order {
            id,
            order_number,
            customer_id: req.customer_id.clone(),
            order_type: req.order_type,
            status: OrderStatus::Draft,
            priority: req.priority,
            payment_status: PaymentStatus::Pending,
            fulfillment_status: FulfillmentStatus::Unfulfilled,
            warehouse_id: req.warehouse_id.clone(),
            currency: req
                .currency
                .clone()
                .unwrap_or_else(|| self.settings.default_currency.clone()),
            subtotal: Money::zero(),
            tax_amount: Money::zero(),
            shipping_amount: Money::zero(),
            discount_amount: Money::zero(),
            total: Money::zero(),
            paid_amount: Money::zero(),
            refunded_amount: Money::zero(),
            shipping_address: req.shipping_address.clone(),
            billing_address: req.billing_address.clone(),
            tracking_number: None,
            notes: req.notes.clone(),
            cancellation_reason: None,
            created_by: ctx.actor.clone(),
            required_date: req.required_date,
            approved_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
            items,
        };
        order.set_totals(totals);
        order.check_invariants()?;

        OrderRepository::insert(&mut *conn, &order).await?;
        if let Some(keyed) = keyed {
            keyed.remember(&mut *conn, &order, now).await?;
        }
        debug!(order_id = %order.id, order_number = %order.order_number, total = %order.total, "Created draft order");
        Ok(order)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, id: &str) -> EngineResult<Order> {
        self.shared
            .db
            .orders()
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", id))
    }

    pub async fn get_by_number(&self, order_number: &str) -> EngineResult<Order> {
        self.shared
            .db
            .orders()
            .get_by_number(order_number)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", order_number))
    }

    pub async fn list(&self, filter: &OrderFilter, page: PageRequest) -> EngineResult<Page<Order>> {
        let (items, total) = self.shared.db.orders().list(filter, page).await?;
        Ok(Page::new(items, total, page))
    }

    /// Matches order numbers and customer names.
    pub async fn search(&self, query: &str, page: PageRequest) -> EngineResult<Page<Order>> {
        let query = validate_search_query(query)?;
        let (items, total) = self.shared.db.orders().search(&query, page).await?;
        Ok(Page::new(items, total, page))
    }

    pub async fn stats(&self, range: &TimeRange) -> EngineResult<OrderStats> {
        Ok(self.shared.db.orders().stats(range).await?)
    }

    pub async fn analytics(&self, range: &TimeRange, top_n: u32) -> EngineResult<OrderAnalytics> {
        if top_n == 0 || top_n > MAX_TOP_PRODUCTS {
            return Err(ValidationError::OutOfRange {
                field: "top".into(),
                min: 1,
                max: MAX_TOP_PRODUCTS as i64,
            }
            .into());
        }
        let orders = self.shared.db.orders();
        Ok(OrderAnalytics {
            range: *range,
            daily: orders.daily_totals(range).await?,
            top_products: orders.top_products(range, top_n).await?,
        })
    }
}

/// Spreads requested units over the lines of each product.
///
/// `room` is how many units a line can still take. Empty `lines` takes
/// everything every line has room for.
fn allocate(
    items: &[OrderItem],
    lines: &[ShipLine],
    room: impl Fn(&OrderItem) -> i64,
) -> CoreResult<Vec<(usize, i64)>> {
    let mut left: Vec<i64> = items.iter().map(|i| room(i).max(0)).collect();
    let mut plan = Vec::new();

    if lines.is_empty() {
        for (i, &q) in left.iter().enumerate() {
            if q > 0 {
                plan.push((i, q));
            }
        }
    }
    for (n, line) in lines.iter().enumerate() {
        if line.quantity < 1 {
            return Err(ValidationError::MustBePositive {
                field: format!("items[{}].quantity", n),
            }
            .into());
        }
        let mut need = line.quantity;
        for (i, item) in items.iter().enumerate() {
            if need == 0 {
                break;
            }
            if item.product_id != line.product_id {
                continue;
            }
            let take = need.min(left[i]);
            if take > 0 {
                plan.push((i, take));
                left[i] -= take;
                need -= take;
            }
        }
        if need > 0 {
            return Err(ValidationError::Invalid {
                field: format!("items[{}].quantity", n),
                reason: format!(
                    "only {} of {} units of product {} are eligible",
                    line.quantity - need,
                    line.quantity,
                    line.product_id
                ),
            }
            .into());
        }
    }

    if plan.is_empty() {
        return Err(ValidationError::Invalid {
            field: "items".into(),
            reason: "no eligible units".into(),
        }
        .into());
    }
    Ok(plan)
}

// =============================================================================
// Unit Tests
// =============================================================================
