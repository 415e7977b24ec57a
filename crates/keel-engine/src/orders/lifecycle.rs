//! Status transitions. Each one is a single locked unit of work that
//! loads the order inside the transaction, applies its stock and credit
//! effects through [`StockTx`], and writes the order back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_core::order::{
    FulfillmentStatus, Order, OrderAction, OrderItem, OrderItemStatus, OrderStatus, OrderType,
};
use keel_core::stock::{check_reserve, Drawdown, JournalKind, PRIORITY_DEFAULT};
use keel_core::types::{Customer, Reference, StockKey};
use keel_core::validation::{validate_reason, validate_text};
use keel_core::{CoreError, Money, ValidationError};
use keel_db::{CustomerRepository, OrderRepository};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use super::idempotency::Keyed;
use super::{
    allocate, details, product, CancelRequest, OrderService, OrderUpdate, PaymentRequest, Products,
    RefundRequest, ReturnRequest, ShipRequest, MAX_TRACKING_LEN,
};
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Amount, Cause, Effects, StockTx};
use crate::locks::LockKey;

// =============================================================================
// Transitions
// =============================================================================

/// A requested change to an existing order, with its payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub(super) enum Transition {
    Submit,
    Confirm,
    Process,
    Ship(ShipRequest),
    PartialShip(ShipRequest),
    Deliver,
    Return(ReturnRequest),
    Cancel(CancelRequest),
    Complete,
    Update(OrderUpdate),
    Delete,
    RecordPayment(PaymentRequest),
    Refund(RefundRequest),
    PartialRefund(RefundRequest),
}

impl Transition {
    pub(super) fn name(&self) -> &'static str {
        match self {
            Transition::Submit => "order.submit",
            Transition::Confirm => "order.confirm",
            Transition::Process => "order.process",
            Transition::Ship(_) => "order.ship",
            Transition::PartialShip(_) => "order.partial_ship",
            Transition::Deliver => "order.deliver",
            Transition::Return(_) => "order.return",
            Transition::Cancel(_) => "order.cancel",
            Transition::Complete => "order.complete",
            Transition::Update(_) => "order.update",
            Transition::Delete => "order.delete",
            Transition::RecordPayment(_) => "order.record_payment",
            Transition::Refund(_) => "order.refund",
            Transition::PartialRefund(_) => "order.partial_refund",
        }
    }

    fn touches_stock(&self) -> bool {
        matches!(
            self,
            Transition::Confirm
                | Transition::Ship(_)
                | Transition::PartialShip(_)
                | Transition::Return(_)
                | Transition::Cancel(_)
        )
    }

    /// Stock keys of the tracked lines this transition may move.
    fn stock_keys(&self, order: &Order) -> Vec<StockKey> {
        if !self.touches_stock() {
            return Vec::new();
        }
        order
            .items
            .iter()
            .filter(|i| i.track_inventory && i.status != OrderItemStatus::Cancelled)
            .map(|i| StockKey::new(&i.product_id, &i.warehouse_id))
            .collect()
    }

    /// Products the transition needs from the catalog.
    fn product_ids<'a>(&'a self, order: &'a Order) -> Vec<&'a str> {
        match self {
            Transition::Update(OrderUpdate {
                items: Some(items), ..
            }) => items.iter().map(|i| i.product_id.as_str()).collect(),
            t if t.touches_stock() => order
                .items
                .iter()
                .filter(|i| i.track_inventory)
                .map(|i| i.product_id.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// Public Transitions
// =============================================================================

impl OrderService {
    /// draft → pending. Checks the customer, their credit and the address.
    pub async fn submit(&self, ctx: &RequestContext, id: &str) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Submit).await
    }

    /// pending → confirmed. Reserves every tracked line or none, then
    /// charges the order total to the customer's credit.
    pub async fn confirm(&self, ctx: &RequestContext, id: &str) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Confirm).await
    }

    /// confirmed → processing.
    pub async fn process(&self, ctx: &RequestContext, id: &str) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Process).await
    }

    /// Ships the listed units, or everything unshipped. Ends in shipped
    /// when every line is complete, partial_shipped otherwise.
    pub async fn ship(&self, ctx: &RequestContext, id: &str, req: ShipRequest) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Ship(req)).await
    }

    /// Like [`ship`](Self::ship) but the units must be listed.
    pub async fn partial_ship(
        &self,
        ctx: &RequestContext,
        id: &str,
        req: ShipRequest,
    ) -> EngineResult<Order> {
        self.run(ctx, id, Transition::PartialShip(req)).await
    }

    /// shipped → delivered.
    pub async fn deliver(&self, ctx: &RequestContext, id: &str) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Deliver).await
    }

    /// Takes shipped units back, restocking them or writing them off.
    pub async fn return_items(
        &self,
        ctx: &RequestContext,
        id: &str,
        req: ReturnRequest,
    ) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Return(req)).await
    }

    /// Any of draft, pending, confirmed, processing, partial_shipped or
    /// shipped → cancelled.
    pub async fn cancel(&self, ctx: &RequestContext, id: &str, req: CancelRequest) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Cancel(req)).await
    }

    /// delivered or returns_in_progress → completed.
    pub async fn complete(&self, ctx: &RequestContext, id: &str) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Complete).await
    }

    /// Edits a draft and recomputes its totals.
    pub async fn update(&self, ctx: &RequestContext, id: &str, update: OrderUpdate) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Update(update)).await
    }

    /// Removes a draft or cancelled order. Returns its last state.
    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Delete).await
    }

    // =========================================================================
    // Unit of Work
    // =========================================================================

    #[instrument(skip_all, fields(order_id = %id, operation = transition.name(), correlation_id = %ctx.correlation_id))]
    pub(super) async fn run(
        &self,
        ctx: &RequestContext,
        id: &str,
        transition: Transition,
    ) -> EngineResult<Order> {
        let name = transition.name();
        let details = details(&transition);
        let result = async {
            let keyed = Keyed::new(ctx.idempotency_key.as_deref(), name, id, &transition)?;
            let (transition, keyed) = (&transition, keyed.as_ref());
            self.shared
                .retry
                .run(name, move || self.transition_once(ctx, id, transition, keyed))
                .await
        }
        .await;
        self.shared.sinks.conclude(ctx, name, id, details, result)
    }

    async fn transition_once(
        &self,
        ctx: &RequestContext,
        id: &str,
        transition: &Transition,
        keyed: Option<&Keyed>,
    ) -> EngineResult<Order> {
        let order_locks = keyed
            .map(|k| LockKey::Idempotency(k.key.clone()))
            .into_iter()
            .chain([LockKey::order(id)]);
        let _order_guard = self
            .shared
            .locks
            .acquire(ctx, order_locks, PRIORITY_DEFAULT)
            .await?;
        if let Some(keyed) = keyed {
            if let Some(order) = keyed.recall::<Order>(&self.shared.db).await? {
                return Ok(order);
            }
        }

        // Nothing changes the order while its lock is held, so this read
        // fixes the stock keys.
        let seen = self.get(id).await?;
        let products = self.load_products(transition.product_ids(&seen)).await?;
        let stock_locks = transition.stock_keys(&seen).into_iter().map(LockKey::Stock);
        let _stock_guard = self
            .shared
            .locks
            .acquire(ctx, stock_locks, seen.priority.reservation_priority())
            .await?;

        let mut tx = self.shared.db.begin().await?;
        let (order, effects) = ctx
            .run(
                transition.name(),
                self.hard_limit,
                self.transition_in(&mut tx, ctx, id, transition, &products, keyed),
            )
            .await?;
        tx.commit().await?;
        self.shared.publish(effects);
        Ok(order)
    }

    async fn transition_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        id: &str,
        transition: &Transition,
        products: &Products,
        keyed: Option<&Keyed>,
    ) -> EngineResult<(Order, Effects)> {
        let mut order = OrderRepository::load(&mut *conn, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Order", id))?;
        let before = order.status;
        let mut stx = StockTx::new(conn, ctx, Utc::now());

        match transition {
            Transition::Submit => self.submit_in(&mut stx, &mut order).await?,
            Transition::Confirm => self.confirm_in(&mut stx, &mut order, products).await?,
            Transition::Process => process_in(&mut stx, &mut order)?,
            Transition::Ship(req) => ship_in(&mut stx, &mut order, req, products).await?,
            Transition::PartialShip(req) => {
                if req.items.is_empty() {
                    return Err(ValidationError::Required {
                        field: "items".into(),
                    }
                    .into());
                }
                ship_in(&mut stx, &mut order, req, products).await?
            }
            Transition::Deliver => deliver_in(&mut stx, &mut order)?,
            Transition::Return(req) => return_in(&mut stx, &mut order, req, products).await?,
            Transition::Cancel(req) => cancel_in(&mut stx, &mut order, req, products).await?,
            Transition::Complete => order.apply(OrderAction::Complete, stx.now())?,
            Transition::Update(update) => update_in(&mut stx, &mut order, update, products).await?,
            Transition::Delete => {}
            Transition::RecordPayment(req) => order.record_payment(req.amount, stx.now())?,
            Transition::Refund(req) => self.refund_in(&mut stx, &mut order, req, false).await?,
            Transition::PartialRefund(req) => self.refund_in(&mut stx, &mut order, req, true).await?,
        }

        let now = stx.now();
        if let Transition::Delete = transition {
            if !matches!(order.status, OrderStatus::Draft | OrderStatus::Cancelled) {
                return Err(CoreError::invalid_transition("Order", id, order.status, "delete").into());
            }
            OrderRepository::delete(stx.conn(), id).await?;
        } else {
            order.updated_at = now;
            order.check_invariants()?;
            OrderRepository::update(stx.conn(), &order).await?;
        }
        if let Some(keyed) = keyed {
            keyed.remember(stx.conn(), &order, now).await?;
        }
        debug!(
            order_id = %order.id,
            from = %before,
            to = %order.status,
            "Order transition applied"
        );
        Ok((order, stx.into_effects()))
    }

    // =========================================================================
    // Customer Checks
    // =========================================================================

    async fn active_customer(&self, conn: &mut SqliteConnection, id: &str) -> EngineResult<Customer> {
        let customer = CustomerRepository::fetch(&mut *conn, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Customer", id))?;
        if !customer.is_active {
            return Err(CoreError::CustomerInactive {
                customer_id: id.to_string(),
            }
            .into());
        }
        Ok(customer)
    }

    fn check_credit(&self, customer: &Customer, required: Money) -> EngineResult<()> {
        if !self.settings.allow_over_credit_limit && customer.credit_available() < required {
            return Err(CoreError::CreditLimitExceeded {
                customer_id: customer.id.clone(),
                available: customer.credit_available(),
                required,
            }
            .into());
        }
        Ok(())
    }

    // =========================================================================
    // Submit / Confirm
    // =========================================================================

    async fn submit_in(&self, stx: &mut StockTx<'_>, order: &mut Order) -> EngineResult<()> {
        order.status.transition(&order.id, OrderAction::Submit)?;
        let customer = self.active_customer(stx.conn(), &order.customer_id).await?;
        self.check_credit(&customer, order.total)?;
        if order.order_type == OrderType::Sales
            && order
                .shipping_address
                .as_deref()
                .map_or(true, |a| a.trim().is_empty())
        {
            return Err(ValidationError::Required {
                field: "shipping_address".into(),
            }
            .into());
        }
        order.apply(OrderAction::Submit, stx.now())?;
        Ok(())
    }

    async fn confirm_in(
        &self,
        stx: &mut StockTx<'_>,
        order: &mut Order,
        products: &Products,
    ) -> EngineResult<()> {
        order.status.transition(&order.id, OrderAction::Confirm)?;
        let customer = self.active_customer(stx.conn(), &order.customer_id).await?;
        self.check_credit(&customer, order.total)?;

        // Check every key before reserving anything, summing lines that
        // share a key.
        let mut demand: BTreeMap<StockKey, i64> = BTreeMap::new();
        for item in order.items.iter().filter(|i| i.track_inventory) {
            *demand
                .entry(StockKey::new(&item.product_id, &item.warehouse_id))
                .or_default() += item.quantity;
        }
        for (key, quantity) in &demand {
            let product = product(products, &key.product_id)?;
            stx.active_warehouse(&key.warehouse_id).await?;
            let record = stx.record(key, product).await?;
            check_reserve(&record, *quantity, product.allow_backorder, stx.now())?;
        }

        let priority = order.priority.reservation_priority();
        let cause = Cause::new(
            format!("order {} confirmed", order.order_number),
            Some(Reference::order(&order.id)),
        );
        for item in order.items.iter_mut().filter(|i| i.track_inventory) {
            let product = product(products, &item.product_id)?;
            let movement = stx
                .reserve(product, &item.warehouse_id, item.quantity, priority, cause.clone())
                .await?;
            item.reservation_id = Some(movement.reservation.id);
        }

        let now = stx.now();
        let used = CustomerRepository::adjust_credit_used(stx.conn(), &order.customer_id, order.total, now).await?;
        debug!(customer_id = %order.customer_id, credit_used = %used, "Charged order to credit");
        order.approved_at = Some(now);
        order.apply(OrderAction::Confirm, now)?;
        Ok(())
    }
}

fn process_in(stx: &mut StockTx<'_>, order: &mut Order) -> EngineResult<()> {
    order.apply(OrderAction::Process, stx.now())?;
    for item in order
        .items
        .iter_mut()
        .filter(|i| i.status == OrderItemStatus::Pending)
    {
        item.status = OrderItemStatus::Allocated;
    }
    Ok(())
}

// =============================================================================
// Ship / Deliver
// =============================================================================

async fn ship_in(
    stx: &mut StockTx<'_>,
    order: &mut Order,
    req: &ShipRequest,
    products: &Products,
) -> EngineResult<()> {
    order.status.transition(&order.id, OrderAction::PartialShip)?;
    validate_text("tracking_number", req.tracking_number.as_deref(), MAX_TRACKING_LEN)?;

    let plan = allocate(&order.items, &req.items, |i| {
        if i.status == OrderItemStatus::Cancelled {
            0
        } else {
            i.unshipped()
        }
    })?;
    let cause = Cause::new(
        format!("order {} shipment", order.order_number),
        Some(Reference::order(&order.id)),
    );
    for (index, quantity) in plan {
        let item = &mut order.items[index];
        if item.track_inventory {
            let reservation_id = item.reservation_id.clone().ok_or_else(|| {
                CoreError::Invariant(format!("order item {} has no reservation", item.id))
            })?;
            let reservation = stx.reservation(&reservation_id).await?;
            let allow_backorder = product(products, &item.product_id)?.allow_backorder;
            stx.draw_down(
                &reservation,
                Amount::Exact(quantity),
                Drawdown::Consume,
                allow_backorder,
                cause.clone(),
            )
            .await?;
        }
        item.ship(quantity)?;
    }

    let now = stx.now();
    order.fulfillment_status = order.derive_fulfillment();
    let action = if order.fulfillment_status == FulfillmentStatus::Fulfilled {
        OrderAction::Ship
    } else {
        OrderAction::PartialShip
    };
    if let Some(tracking) = &req.tracking_number {
        order.tracking_number = Some(tracking.clone());
    }
    order.shipped_at = Some(now);
    order.apply(action, now)?;
    Ok(())
}

fn deliver_in(stx: &mut StockTx<'_>, order: &mut Order) -> EngineResult<()> {
    let now = stx.now();
    order.apply(OrderAction::Deliver, now)?;
    order.delivered_at = Some(now);
    for item in order
        .items
        .iter_mut()
        .filter(|i| i.status == OrderItemStatus::Shipped)
    {
        item.status = OrderItemStatus::Delivered;
    }
    Ok(())
}

// =============================================================================
// Return / Cancel
// =============================================================================

async fn return_in(
    stx: &mut StockTx<'_>,
    order: &mut Order,
    req: &ReturnRequest,
    products: &Products,
) -> EngineResult<()> {
    order.status.transition(&order.id, OrderAction::Return)?;
    validate_reason(&req.reason)?;

    let plan = allocate(&order.items, &req.items, |i| i.returnable())?;
    let cause = Cause::new(
        format!("order {} return: {}", order.order_number, req.reason),
        Some(Reference::order(&order.id)),
    );
    for (index, quantity) in plan {
        let item = &mut order.items[index];
        if item.track_inventory {
            if req.restock {
                let product = product(products, &item.product_id)?;
                stx.adjust(product, &item.warehouse_id, JournalKind::Restock, quantity, cause.clone())
                    .await?;
            } else {
                let key = StockKey::new(&item.product_id, &item.warehouse_id);
                stx.write_off(&key, quantity, cause.clone()).await?;
            }
        }
        item.return_units(quantity)?;
    }

    let now = stx.now();
    order.apply(OrderAction::Return, now)?;
    close_if_refunded(order, now)?;
    Ok(())
}

/// A fully returned order with nothing left to refund closes as refunded.
pub(super) fn close_if_refunded(order: &mut Order, now: DateTime<Utc>) -> EngineResult<()> {
    if order.status == OrderStatus::ReturnsInProgress
        && order.fully_returned()
        && order.refundable().is_zero()
    {
        order.apply(OrderAction::CloseRefunded, now)?;
    }
    Ok(())
}

async fn cancel_in(
    stx: &mut StockTx<'_>,
    order: &mut Order,
    req: &CancelRequest,
    products: &Products,
) -> EngineResult<()> {
    order.status.transition(&order.id, OrderAction::Cancel)?;
    let reason = req
        .reason
        .clone()
        .unwrap_or_else(|| "order cancelled".to_string());
    validate_reason(&reason)?;

    let now = stx.now();
    let credit = order.credit_outstanding();
    let cause = Cause::new(
        format!("order {} cancelled: {}", order.order_number, reason),
        Some(Reference::order(&order.id)),
    );
    for item in order.items.iter_mut() {
        if let Some(reservation_id) = item.reservation_id.clone() {
            let reservation = stx.reservation(&reservation_id).await?;
            if reservation.status.is_active() && reservation.remaining > 0 {
                stx.draw_down(&reservation, Amount::Remaining, Drawdown::Release, true, cause.clone())
                    .await?;
            }
        }
        if req.restock && item.track_inventory && item.returnable() > 0 {
            let quantity = item.returnable();
            let product = product(products, &item.product_id)?;
            stx.adjust(product, &item.warehouse_id, JournalKind::Restock, quantity, cause.clone())
                .await?;
            item.return_units(quantity)?;
        }
        if item.shipped_quantity == 0 {
            item.status = OrderItemStatus::Cancelled;
        }
    }

    let refundable = order.refundable();
    if req.refund_payment && refundable.is_positive() {
        order.refund(refundable, now)?;
    }
    let customer_id = order.customer_id.clone();
    release_credit(stx, &customer_id, credit).await?;

    order.cancellation_reason = Some(reason);
    order.cancelled_at = Some(now);
    order.fulfillment_status = order.derive_fulfillment();
    order.apply(OrderAction::Cancel, now)?;
    Ok(())
}

/// Gives `amount` of credit back to the customer.
pub(super) async fn release_credit(
    stx: &mut StockTx<'_>,
    customer_id: &str,
    amount: Money,
) -> EngineResult<()> {
    if amount.is_positive() {
        let now = stx.now();
        let used = CustomerRepository::adjust_credit_used(stx.conn(), customer_id, -amount, now).await?;
        debug!(customer_id, released = %amount, credit_used = %used, "Released customer credit");
    }
    Ok(())
}

// =============================================================================
// Update
// =============================================================================

async fn update_in(
    stx: &mut StockTx<'_>,
    order: &mut Order,
    update: &OrderUpdate,
    products: &Products,
) -> EngineResult<()> {
    if order.status != OrderStatus::Draft {
        return Err(CoreError::invalid_transition("Order", &order.id, order.status, "update").into());
    }
    update.validate()?;

    let order_discount = update
        .discount_amount
        .unwrap_or_else(|| order.order_discount());
    if let Some(inputs) = &update.items {
        let mut items = Vec::with_capacity(inputs.len());
        for input in inputs {
            let warehouse_id = input
                .warehouse_id
                .clone()
                .unwrap_or_else(|| order.warehouse_id.clone());
            stx.active_warehouse(&warehouse_id).await?;
            let product = product(products, &input.product_id)?;
            if !product.is_active {
                return Err(ValidationError::Invalid {
                    field: "items".into(),
                    reason: format!("product {} is inactive", product.id),
                }
                .into());
            }
            items.push(OrderItem::price(&order.id, product, input, &warehouse_id)?);
        }
        order.items = items;
    }
    if let Some(shipping) = update.shipping_amount {
        order.shipping_amount = shipping;
    }
    if let Some(priority) = update.priority {
        order.priority = priority;
    }
    if update.shipping_address.is_some() {
        order.shipping_address = update.shipping_address.clone();
    }
    if update.billing_address.is_some() {
        order.billing_address = update.billing_address.clone();
    }
    if update.notes.is_some() {
        order.notes = update.notes.clone();
    }
    if update.required_date.is_some() {
        order.required_date = update.required_date;
    }
    order.recompute_totals(order_discount)?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::ShipLine;
    use crate::testing::TestEngine;
    use keel_core::order::PaymentStatus;
    use keel_core::stock::ReservationStatus;
    use keel_core::types::{PageRequest, ReferenceType};
    use keel_core::ErrorCode;
    use keel_db::JournalFilter;

    fn lines(items: &[(&str, i64)]) -> Vec<ShipLine> {
        items
            .iter()
            .map(|(product_id, quantity)| ShipLine {
                product_id: product_id.to_string(),
                quantity: *quantity,
            })
            .collect()
    }

    fn ship(items: Vec<ShipLine>) -> ShipRequest {
        ShipRequest {
            items,
            tracking_number: Some("1Z999".into()),
        }
    }

    #[tokio::test]
    async fn test_partial_then_full_shipment() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        let (p1, p2) = (t.product.id.clone(), t.second_product.id.clone());
        t.stock(10).await;
        t.restock(&p2, &t.warehouse.id, 10).await;
        let order = t
            .confirmed_order(vec![t.line(&t.product, 5), t.line(&t.second_product, 2)])
            .await;
        assert_eq!(order.status, OrderStatus::Confirmed);
        let r1 = order.items[0].reservation_id.clone().unwrap();

        let order = t
            .engine
            .orders
            .partial_ship(&ctx, &order.id, ship(lines(&[(&p1, 3)])))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartialShipped);
        assert_eq!(order.fulfillment_status, FulfillmentStatus::Partial);
        assert_eq!(order.items[0].shipped_quantity, 3);
        assert_eq!(order.tracking_number.as_deref(), Some("1Z999"));
        let held = t.engine.registry.get(&r1).await.unwrap();
        assert_eq!((held.remaining, held.consumed), (2, 3));
        let record = t.engine.ledger.get(&p1, &t.warehouse.id).await.unwrap();
        assert_eq!((record.on_hand, record.reserved), (7, 2));

        let order = t
            .engine
            .orders
            .ship(&ctx, &order.id, ship(lines(&[(&p1, 2), (&p2, 2)])))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Shipped);
        assert_eq!(order.fulfillment_status, FulfillmentStatus::Fulfilled);
        assert_eq!(
            t.engine.registry.get(&r1).await.unwrap().status,
            ReservationStatus::Fulfilled
        );
        let record = t.engine.ledger.get(&p1, &t.warehouse.id).await.unwrap();
        assert_eq!((record.on_hand, record.reserved), (5, 0));

        let order = t.engine.orders.deliver(&ctx, &order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
        assert!(order.items.iter().all(|i| i.status == OrderItemStatus::Delivered));
        let order = t.engine.orders.complete(&ctx, &order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_ship_rejects_more_than_unshipped() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        t.stock(10).await;
        let order = t.confirmed_order(vec![t.line(&t.product, 2)]).await;

        let err = t
            .engine
            .orders
            .partial_ship(&ctx, &order.id, ship(lines(&[(&t.product.id, 3)])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let err = t
            .engine
            .orders
            .partial_ship(&ctx, &order.id, ShipRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let record = t.engine.ledger.get(&t.product.id, &t.warehouse.id).await.unwrap();
        assert_eq!((record.on_hand, record.reserved), (10, 2));
    }

    #[tokio::test]
    async fn test_cancel_after_confirm_restores_stock_and_credit() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        let mut premium = crate::testing::product("SKU-PREMIUM");
        premium.price = Money::from_cents(10_000);
        t.db.products().insert(&premium).await.unwrap();
        t.restock(&premium.id, &t.warehouse.id, 5).await;
        let before = t.credit_used().await;

        let mut req = t.new_order(vec![t.line(&premium, 1)]);
        req.shipping_amount = Money::from_cents(975);
        let order = t.engine.orders.create(&ctx, req).await.unwrap();
        assert_eq!(order.tax_amount, Money::from_cents(825));
        assert_eq!(order.total, Money::from_cents(11_800));
        t.engine.orders.submit(&ctx, &order.id).await.unwrap();
        let order = t.engine.orders.confirm(&ctx, &order.id).await.unwrap();
        assert_eq!(t.credit_used().await, before + Money::from_cents(11_800));
        let reservation_id = order.items[0].reservation_id.clone().unwrap();

        let order = t
            .engine
            .orders
            .cancel(
                &ctx,
                &order.id,
                CancelRequest {
                    reason: Some("customer changed mind".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancellation_reason.as_deref(), Some("customer changed mind"));
        assert!(order.cancelled_at.is_some());
        assert_eq!(order.items[0].status, OrderItemStatus::Cancelled);
        assert_eq!(t.credit_used().await, before);

        let reservation = t.engine.registry.get(&reservation_id).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Released);
        let record = t.engine.ledger.get(&premium.id, &t.warehouse.id).await.unwrap();
        assert_eq!((record.on_hand, record.reserved), (5, 0));

        let err = t
            .engine
            .orders
            .cancel(&ctx, &order.id, CancelRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
    }

    #[tokio::test]
    async fn test_failed_confirm_reserves_nothing() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        t.stock(10).await;
        t.restock(&t.second_product.id, &t.warehouse.id, 1).await;

        let order = t
            .engine
            .orders
            .create(
                &ctx,
                t.new_order(vec![t.line(&t.product, 2), t.line(&t.second_product, 5)]),
            )
            .await
            .unwrap();
        t.engine.orders.submit(&ctx, &order.id).await.unwrap();

        let err = t.engine.orders.confirm(&ctx, &order.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientStock);

        let order = t.engine.orders.get(&order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.items.iter().all(|i| i.reservation_id.is_none()));
        let held = t
            .engine
            .registry
            .list_by_reference(&order.id, ReferenceType::Order)
            .await
            .unwrap();
        assert!(held.is_empty());
        let record = t.engine.ledger.get(&t.product.id, &t.warehouse.id).await.unwrap();
        assert_eq!(record.reserved, 0);
        assert_eq!(t.credit_used().await, Money::zero());
    }

    #[tokio::test]
    async fn test_submit_checks_customer() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");

        let poor = t.new_customer(1_000).await;
        let mut req = t.new_order(vec![t.line(&t.product, 1)]);
        req.customer_id = poor.id.clone();
        let order = t.engine.orders.create(&ctx, req).await.unwrap();
        let err = t.engine.orders.submit(&ctx, &order.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let mut req = t.new_order(vec![t.line(&t.product, 1)]);
        req.shipping_address = Some("   ".into());
        let order = t.engine.orders.create(&ctx, req).await.unwrap();
        let err = t.engine.orders.submit(&ctx, &order.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let mut dormant = crate::testing::customer(1_000_000);
        dormant.is_active = false;
        t.db.customers().insert(&dormant).await.unwrap();
        let mut req = t.new_order(vec![t.line(&t.product, 1)]);
        req.customer_id = dormant.id.clone();
        let order = t.engine.orders.create(&ctx, req).await.unwrap();
        let err = t.engine.orders.submit(&ctx, &order.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        assert_eq!(
            t.engine.orders.get(&order.id).await.unwrap().status,
            OrderStatus::Draft
        );
    }

    #[tokio::test]
    async fn test_actions_out_of_order_are_rejected() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        let draft = t
            .engine
            .orders
            .create(&ctx, t.new_order(vec![t.line(&t.product, 1)]))
            .await
            .unwrap();

        for result in [
            t.engine.orders.confirm(&ctx, &draft.id).await,
            t.engine.orders.process(&ctx, &draft.id).await,
            t.engine.orders.deliver(&ctx, &draft.id).await,
            t.engine.orders.complete(&ctx, &draft.id).await,
            t.engine.orders.ship(&ctx, &draft.id, ShipRequest::default()).await,
        ] {
            assert_eq!(result.unwrap_err().code(), ErrorCode::InvalidTransition);
        }

        let err = t.engine.orders.submit(&ctx, "missing").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_returns_restock_or_write_off() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        t.stock(10).await;
        let order = t.confirmed_order(vec![t.line(&t.product, 4)]).await;
        let order = t.engine.orders.process(&ctx, &order.id).await.unwrap();
        assert!(order.items.iter().all(|i| i.status == OrderItemStatus::Allocated));
        t.engine.orders.ship(&ctx, &order.id, ShipRequest::default()).await.unwrap();
        t.engine.orders.deliver(&ctx, &order.id).await.unwrap();

        let order = t
            .engine
            .orders
            .return_items(
                &ctx,
                &order.id,
                ReturnRequest {
                    items: lines(&[(&t.product.id, 1)]),
                    restock: true,
                    reason: "wrong size".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::ReturnsInProgress);
        assert_eq!(order.items[0].returned_quantity, 1);
        let record = t.engine.ledger.get(&t.product.id, &t.warehouse.id).await.unwrap();
        assert_eq!(record.on_hand, 7);

        let order = t
            .engine
            .orders
            .return_items(
                &ctx,
                &order.id,
                ReturnRequest {
                    items: Vec::new(),
                    restock: false,
                    reason: "damaged in transit".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(order.items[0].returned_quantity, 4);
        assert_eq!(order.items[0].status, OrderItemStatus::Returned);
        // Nothing was paid, so nothing is left to refund.
        assert_eq!(order.status, OrderStatus::Refunded);
        let record = t.engine.ledger.get(&t.product.id, &t.warehouse.id).await.unwrap();
        assert_eq!(record.on_hand, 7);

        let entries = t
            .engine
            .journal
            .query(
                &JournalFilter {
                    reference_id: Some(order.id.clone()),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert!(entries
            .items
            .iter()
            .any(|e| e.reason.starts_with("written off: 3") && e.quantity == 0));

        let err = t
            .engine
            .orders
            .return_items(
                &ctx,
                &order.id,
                ReturnRequest {
                    items: Vec::new(),
                    restock: true,
                    reason: "again".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
    }

    #[tokio::test]
    async fn test_paid_return_waits_for_refund() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        t.stock(10).await;
        let order = t.confirmed_order(vec![t.line(&t.product, 1)]).await;
        t.engine
            .orders
            .record_payment(
                &ctx,
                &order.id,
                PaymentRequest {
                    amount: order.total,
                    reference: None,
                },
            )
            .await
            .unwrap();
        t.engine.orders.ship(&ctx, &order.id, ShipRequest::default()).await.unwrap();

        let returned = ReturnRequest {
            items: Vec::new(),
            restock: true,
            reason: "not needed".into(),
        };
        let order = t.engine.orders.return_items(&ctx, &order.id, returned).await.unwrap();
        assert_eq!(order.status, OrderStatus::ReturnsInProgress);

        let order = t
            .engine
            .orders
            .refund(&ctx, &order.id, RefundRequest::default())
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
        assert_eq!(t.credit_used().await, Money::zero());
    }

    #[tokio::test]
    async fn test_cancel_with_restock_after_partial_shipment() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        t.stock(10).await;
        let order = t.confirmed_order(vec![t.line(&t.product, 4)]).await;
        t.engine
            .orders
            .partial_ship(&ctx, &order.id, ship(lines(&[(&t.product.id, 2)])))
            .await
            .unwrap();

        let order = t
            .engine
            .orders
            .cancel(
                &ctx,
                &order.id,
                CancelRequest {
                    reason: None,
                    restock: true,
                    refund_payment: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancellation_reason.as_deref(), Some("order cancelled"));
        assert_eq!(order.items[0].returned_quantity, 2);
        assert_ne!(order.items[0].status, OrderItemStatus::Cancelled);

        let record = t.engine.ledger.get(&t.product.id, &t.warehouse.id).await.unwrap();
        assert_eq!((record.on_hand, record.reserved), (10, 0));
        assert_eq!(t.credit_used().await, Money::zero());
    }

    #[tokio::test]
    async fn test_keyed_transition_runs_once() {
        let t = TestEngine::new().await;
        t.stock(10).await;
        let order = t.confirmed_order(vec![t.line(&t.product, 4)]).await;
        let ctx = RequestContext::new("alice").with_idempotency_key(Some("ship-1".into()));
        let req = ship(lines(&[(&t.product.id, 1)]));

        let first = t.engine.orders.partial_ship(&ctx, &order.id, req.clone()).await.unwrap();
        let again = t.engine.orders.partial_ship(&ctx, &order.id, req).await.unwrap();
        assert_eq!(first, again);
        let stored = t.engine.orders.get(&order.id).await.unwrap();
        assert_eq!(stored.items[0].shipped_quantity, 1);

        let err = t
            .engine
            .orders
            .cancel(&ctx, &order.id, CancelRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(
            t.engine.orders.get(&order.id).await.unwrap().status,
            OrderStatus::PartialShipped
        );
    }

    #[tokio::test]
    async fn test_update_and_delete_drafts_only() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        let order = t
            .engine
            .orders
            .create(&ctx, t.new_order(vec![t.line(&t.product, 1)]))
            .await
            .unwrap();

        let order = t
            .engine
            .orders
            .update(
                &ctx,
                &order.id,
                OrderUpdate {
                    items: Some(vec![t.line(&t.product, 2), t.line(&t.second_product, 2)]),
                    shipping_amount: Some(Money::zero()),
                    notes: Some("leave at the gate".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.subtotal, Money::from_cents(5_000));
        assert_eq!(order.tax_amount, Money::from_cents(412));
        assert_eq!(order.total, Money::from_cents(5_412));
        assert_eq!(order.notes.as_deref(), Some("leave at the gate"));
        assert!(order.check_invariants().is_ok());

        t.engine.orders.submit(&ctx, &order.id).await.unwrap();
        let err = t
            .engine
            .orders
            .update(&ctx, &order.id, OrderUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        let err = t.engine.orders.delete(&ctx, &order.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);

        t.engine
            .orders
            .cancel(&ctx, &order.id, CancelRequest::default())
            .await
            .unwrap();
        let deleted = t.engine.orders.delete(&ctx, &order.id).await.unwrap();
        assert_eq!(deleted.status, OrderStatus::Cancelled);
        let err = t.engine.orders.get(&order.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_transitions_are_audited() {
        let (sinks, audit, _) = crate::testing::recording_sinks();
        let t = TestEngine::with_sinks(sinks).await;
        let ctx = RequestContext::new("alice");
        let order = t
            .engine
            .orders
            .create(&ctx, t.new_order(vec![t.line(&t.product, 1)]))
            .await
            .unwrap();
        t.engine.orders.submit(&ctx, &order.id).await.unwrap();
        let _ = t.engine.orders.deliver(&ctx, &order.id).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let events = audit.events();
        assert!(events
            .iter()
            .any(|e| e.action == "order.submit" && e.success && e.resource_id == order.id));
        assert!(events
            .iter()
            .any(|e| e.action == "order.deliver" && !e.success && e.actor == "alice"));
    }
}
