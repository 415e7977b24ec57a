//! # Orders
//!
//! Order and order-item types, the status machine, totals and payment
//! arithmetic. Stock and credit side effects live in keel-engine; this
//! module only decides what is legal and computes the numbers.
//!
//! ## Status Machine
//! ```text
//! draft ─submit─► pending ─confirm─► confirmed ─process─► processing
//!   │               │                   │                     │
//!   │               │                   ├──────ship───────────┤
//!   ▼               ▼                   ▼                     ▼
//! [cancelled] ◄─────┴──────cancel───────┴──────────── partial_shipped
//!                                                         │  ▲
//!                                                    ship │  │ partial_ship
//!                                                         ▼  │
//!                                 shipped ─deliver─► delivered ─complete─► [completed]
//!                                    │                   │
//!                                    └──────return───────┤
//!                                                        ▼
//!                                              returns_in_progress ─refund─► [refunded]
//! ```
//!
//! Every `(status, action)` pair is matched in [`OrderStatus::next`];
//! adding a status without deciding its transitions does not compile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError, ValidationErrors};
use crate::money::Money;
use crate::types::{new_id, Product};

// =============================================================================
// Order Status
// =============================================================================

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum OrderStatus {
    Draft,
    Pending,
    Confirmed,
    Processing,
    PartialShipped,
    Shipped,
    Delivered,
    Completed,
    Cancelled,
    ReturnsInProgress,
    Refunded,
}

/// A request to move an order to another status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum OrderAction {
    Submit,
    Confirm,
    Process,
    /// Shipment that leaves every item fully shipped.
    Ship,
    /// Shipment that leaves something unshipped.
    PartialShip,
    Deliver,
    Return,
    /// Closes a fully returned, fully refunded order.
    CloseRefunded,
    Complete,
    Cancel,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 11] = [
        OrderStatus::Draft,
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Processing,
        OrderStatus::PartialShipped,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::ReturnsInProgress,
        OrderStatus::Refunded,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::PartialShipped => "partial_shipped",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::ReturnsInProgress => "returns_in_progress",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Terminal statuses accept no further transitions.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// True once stock has been reserved for the order and not yet
    /// released by a cancel.
    pub const fn holds_stock(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Processing | OrderStatus::PartialShipped
        )
    }

    /// The status `action` leads to, or `None` if it is not allowed.
    pub const fn next(self, action: OrderAction) -> Option<OrderStatus> {
        use OrderAction as A;
        use OrderStatus as S;
        match (self, action) {
            (S::Draft, A::Submit) => Some(S::Pending),
            (S::Pending, A::Confirm) => Some(S::Confirmed),
            (S::Confirmed, A::Process) => Some(S::Processing),

            // Shipping may skip the optional Process step.
            (S::Confirmed | S::Processing | S::PartialShipped, A::Ship) => Some(S::Shipped),
            (S::Confirmed | S::Processing | S::PartialShipped, A::PartialShip) => {
                Some(S::PartialShipped)
            }

            (S::Shipped, A::Deliver) => Some(S::Delivered),

            (S::Shipped | S::Delivered | S::ReturnsInProgress, A::Return) => {
                Some(S::ReturnsInProgress)
            }
            (S::ReturnsInProgress, A::CloseRefunded) => Some(S::Refunded),

            (S::Delivered | S::ReturnsInProgress, A::Complete) => Some(S::Completed),

            (
                S::Draft
                | S::Pending
                | S::Confirmed
                | S::Processing
                | S::PartialShipped
                | S::Shipped,
                A::Cancel,
            ) => Some(S::Cancelled),

            (
                S::Draft
                | S::Pending
                | S::Confirmed
                | S::Processing
                | S::PartialShipped
                | S::Shipped
                | S::Delivered
                | S::Completed
                | S::Cancelled
                | S::ReturnsInProgress
                | S::Refunded,
                _,
            ) => None,
        }
    }

    /// Like [`OrderStatus::next`] but produces the taxonomy error.
    pub fn transition(self, order_id: &str, action: OrderAction) -> CoreResult<OrderStatus> {
        self.next(action).ok_or_else(|| {
            CoreError::invalid_transition("Order", order_id, self, action.as_str())
        })
    }
}

impl OrderAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Submit => "submit",
            OrderAction::Confirm => "confirm",
            OrderAction::Process => "process",
            OrderAction::Ship => "ship",
            OrderAction::PartialShip => "partial-ship",
            OrderAction::Deliver => "deliver",
            OrderAction::Return => "return",
            OrderAction::CloseRefunded => "refund",
            OrderAction::Complete => "complete",
            OrderAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s.to_lowercase())
            .ok_or_else(|| ValidationError::NotAllowed {
                field: "status".into(),
                allowed: OrderStatus::ALL.iter().map(|s| s.to_string()).collect(),
            })
    }
}

// =============================================================================
// Order Attributes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum OrderType {
    #[default]
    Sales,
    Purchase,
    Return,
    Exchange,
    Transfer,
    Adjustment,
}

/// Order priority. Maps onto reservation priority (1 = most urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum OrderPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl OrderPriority {
    pub const fn reservation_priority(&self) -> u8 {
        match self {
            OrderPriority::Urgent => 1,
            OrderPriority::High => 3,
            OrderPriority::Normal => 5,
            OrderPriority::Low => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum PaymentStatus {
    #[default]
    Pending,
    Partial,
    Paid,
    Refunded,
}

impl PaymentStatus {
    /// Derives payment status from the amounts.
    ///
    /// ```text
    /// refunded > 0 ∧ refunded = paid  → refunded
    /// paid ≥ total > 0                → paid
    /// paid > 0                        → partial
    /// otherwise                       → pending
    /// ```
    pub fn derive(total: Money, paid: Money, refunded: Money) -> Self {
        if refunded.is_positive() && refunded == paid {
            PaymentStatus::Refunded
        } else if paid.is_positive() && paid >= total {
            PaymentStatus::Paid
        } else if paid.is_positive() {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum FulfillmentStatus {
    #[default]
    Unfulfilled,
    Partial,
    Fulfilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum OrderItemStatus {
    #[default]
    Pending,
    Allocated,
    Shipped,
    Delivered,
    Returned,
    Cancelled,
}

// =============================================================================
// Order Item
// =============================================================================

/// One order line. Product details are snapshotted at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub product_id: String,
    pub variant_id: Option<String>,
    /// Warehouse the line is fulfilled from.
    pub warehouse_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    /// `unit_price × quantity`
    pub total_price: Money,
    pub tax_amount: Money,
    pub discount_amount: Money,
    /// `total_price + tax_amount − discount_amount`
    pub final_price: Money,
    pub weight_grams: Option<i64>,
    /// Snapshot of the product's inventory tracking flag.
    pub track_inventory: bool,
    pub status: OrderItemStatus,
    pub shipped_quantity: i64,
    pub returned_quantity: i64,
    /// Reservation backing this line while the order holds stock.
    pub reservation_id: Option<String>,
}

/// Caller input for an order line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderItemInput {
    pub product_id: String,
    #[serde(default)]
    pub variant_id: Option<String>,
    /// Defaults to the order's warehouse.
    #[serde(default)]
    pub warehouse_id: Option<String>,
    pub quantity: i64,
    /// Defaults to the product's list price.
    #[serde(default)]
    pub unit_price: Option<Money>,
    #[serde(default)]
    pub discount_amount: Money,
}

impl OrderItemInput {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.product_id.trim().is_empty() {
            errs.push(ValidationError::Required {
                field: "product_id".into(),
            });
        }
        if self.quantity < 1 {
            errs.push(ValidationError::MustBePositive {
                field: "quantity".into(),
            });
        }
        if let Some(price) = self.unit_price {
            if price.is_negative() {
                errs.push(ValidationError::MustNotBeNegative {
                    field: "unit_price".into(),
                });
            }
        }
        if self.discount_amount.is_negative() {
            errs.push(ValidationError::MustNotBeNegative {
                field: "discount_amount".into(),
            });
        }
        errs.into_result()
    }
}

impl OrderItem {
    /// Prices a line from catalog data.
    ///
    /// Tax is charged on the discounted line amount.
    pub fn price(
        order_id: &str,
        product: &Product,
        input: &OrderItemInput,
        warehouse_id: &str,
    ) -> CoreResult<OrderItem> {
        input.validate()?;
        let unit_price = input.unit_price.unwrap_or(product.price);
        let total_price = unit_price
            .checked_mul(input.quantity)
            .ok_or_else(|| CoreError::Invariant("line total overflow".into()))?;
        if input.discount_amount > total_price {
            return Err(ValidationError::Invalid {
                field: "discount_amount".into(),
                reason: "discount exceeds line total".into(),
            }
            .into());
        }
        let taxable = total_price - input.discount_amount;
        let tax_amount = taxable.calculate_tax(product.tax_rate());

        Ok(OrderItem {
            id: new_id(),
            order_id: order_id.to_string(),
            product_id: product.id.clone(),
            variant_id: input.variant_id.clone(),
            warehouse_id: warehouse_id.to_string(),
            sku: product.sku.clone(),
            name: product.name.clone(),
            quantity: input.quantity,
            unit_price,
            total_price,
            tax_amount,
            discount_amount: input.discount_amount,
            final_price: taxable + tax_amount,
            weight_grams: product.weight_grams.map(|w| w * input.quantity),
            track_inventory: product.track_inventory,
            status: OrderItemStatus::Pending,
            shipped_quantity: 0,
            returned_quantity: 0,
            reservation_id: None,
        })
    }

    #[inline]
    pub fn unshipped(&self) -> i64 {
        self.quantity - self.shipped_quantity
    }

    #[inline]
    pub fn returnable(&self) -> i64 {
        self.shipped_quantity - self.returned_quantity
    }

    /// Records a shipment of `qty` units of this line.
    pub fn ship(&mut self, qty: i64) -> CoreResult<()> {
        if qty < 1 || qty > self.unshipped() {
            return Err(ValidationError::OutOfRange {
                field: format!("items[{}].quantity", self.product_id),
                min: 1,
                max: self.unshipped(),
            }
            .into());
        }
        self.shipped_quantity += qty;
        if self.shipped_quantity == self.quantity {
            self.status = OrderItemStatus::Shipped;
        }
        Ok(())
    }

    /// Records a return of `qty` shipped units of this line.
    pub fn return_units(&mut self, qty: i64) -> CoreResult<()> {
        if qty < 1 || qty > self.returnable() {
            return Err(ValidationError::OutOfRange {
                field: format!("items[{}].quantity", self.product_id),
                min: 1,
                max: self.returnable(),
            }
            .into());
        }
        self.returned_quantity += qty;
        if self.returned_quantity == self.quantity {
            self.status = OrderItemStatus::Returned;
        }
        Ok(())
    }
}

// =============================================================================
// Totals
// =============================================================================

/// Computed monetary totals of an order.
///
/// `total = subtotal + tax + shipping − discount`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderTotals {
    pub subtotal: Money,
    pub tax_amount: Money,
    pub shipping_amount: Money,
    pub discount_amount: Money,
    pub total: Money,
}

impl OrderTotals {
    /// Sums the lines. Line discounts and the order-level discount both
    /// land in `discount_amount`.
    pub fn compute(
        items: &[OrderItem],
        shipping_amount: Money,
        order_discount: Money,
    ) -> CoreResult<OrderTotals> {
        let mut errs = ValidationErrors::new();
        if shipping_amount.is_negative() {
            errs.push(ValidationError::MustNotBeNegative {
                field: "shipping_amount".into(),
            });
        }
        if order_discount.is_negative() {
            errs.push(ValidationError::MustNotBeNegative {
                field: "discount_amount".into(),
            });
        }
        errs.into_result()?;

        let subtotal: Money = items.iter().map(|i| i.total_price).sum();
        let tax_amount: Money = items.iter().map(|i| i.tax_amount).sum();
        let line_discounts: Money = items.iter().map(|i| i.discount_amount).sum();
        let discount_amount = line_discounts + order_discount;
        let total = subtotal + tax_amount + shipping_amount - discount_amount;

        if total.is_negative() {
            return Err(ValidationError::Invalid {
                field: "discount_amount".into(),
                reason: "discount exceeds order value".into(),
            }
            .into());
        }

        Ok(OrderTotals {
            subtotal,
            tax_amount,
            shipping_amount,
            discount_amount,
            total,
        })
    }
}

// =============================================================================
// Order
// =============================================================================

/// An order with its lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Order {
    pub id: String,
    /// Unique human-readable number, e.g. `SO-000042`.
    pub order_number: String,
    pub customer_id: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub priority: OrderPriority,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    /// Default warehouse for lines that do not name one.
    pub warehouse_id: String,
    /// ISO 4217 code.
    pub currency: String,
    pub subtotal: Money,
    pub tax_amount: Money,
    pub shipping_amount: Money,
    pub discount_amount: Money,
    pub total: Money,
    pub paid_amount: Money,
    pub refunded_amount: Money,
    pub shipping_address: Option<String>,
    pub billing_address: Option<String>,
    pub tracking_number: Option<String>,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_by: String,
    #[ts(as = "Option<String>")]
    pub required_date: Option<DateTime<Utc>>,
    /// Confirmation time. Credit was charged iff this is set.
    #[ts(as = "Option<String>")]
    pub approved_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub shipped_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[cfg_attr(feature = "sqlx", sqlx(skip))]
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn totals(&self) -> OrderTotals {
        OrderTotals {
            subtotal: self.subtotal,
            tax_amount: self.tax_amount,
            shipping_amount: self.shipping_amount,
            discount_amount: self.discount_amount,
            total: self.total,
        }
    }

    pub fn set_totals(&mut self, totals: OrderTotals) {
        self.subtotal = totals.subtotal;
        self.tax_amount = totals.tax_amount;
        self.shipping_amount = totals.shipping_amount;
        self.discount_amount = totals.discount_amount;
        self.total = totals.total;
        self.payment_status = PaymentStatus::derive(self.total, self.paid_amount, self.refunded_amount);
    }

    /// Recomputes totals from the current lines and shipping, keeping the
    /// order-level part of the discount.
    pub fn recompute_totals(&mut self, order_discount: Money) -> CoreResult<()> {
        let totals = OrderTotals::compute(&self.items, self.shipping_amount, order_discount)?;
        self.set_totals(totals);
        Ok(())
    }

    /// Order-level discount (total discount minus line discounts).
    pub fn order_discount(&self) -> Money {
        let line: Money = self.items.iter().map(|i| i.discount_amount).sum();
        self.discount_amount - line
    }

    /// True once credit has been charged at confirmation.
    #[inline]
    pub fn credit_charged(&self) -> bool {
        self.approved_at.is_some()
    }

    /// Credit still held by this order: `total − refunded` after confirm.
    pub fn credit_outstanding(&self) -> Money {
        if self.credit_charged() && self.status != OrderStatus::Cancelled {
            self.total - self.refunded_amount
        } else {
            Money::zero()
        }
    }

    /// Amount that can still be refunded.
    #[inline]
    pub fn refundable(&self) -> Money {
        self.paid_amount - self.refunded_amount
    }

    /// Amount still owed.
    #[inline]
    pub fn balance_due(&self) -> Money {
        (self.total - (self.paid_amount - self.refunded_amount)).max(Money::zero())
    }

    /// Derives fulfillment status from item shipped quantities.
    pub fn derive_fulfillment(&self) -> FulfillmentStatus {
        let lines: Vec<&OrderItem> = self
            .items
            .iter()
            .filter(|i| i.status != OrderItemStatus::Cancelled)
            .collect();
        if !lines.is_empty() && lines.iter().all(|i| i.shipped_quantity == i.quantity) {
            FulfillmentStatus::Fulfilled
        } else if lines.iter().any(|i| i.shipped_quantity > 0) {
            FulfillmentStatus::Partial
        } else {
            FulfillmentStatus::Unfulfilled
        }
    }

    /// True when every shipped unit has come back.
    pub fn fully_returned(&self) -> bool {
        let shipped: i64 = self.items.iter().map(|i| i.shipped_quantity).sum();
        shipped > 0 && self.items.iter().all(|i| i.returned_quantity == i.shipped_quantity)
    }

    /// Applies `action` to the status.
    pub fn apply(&mut self, action: OrderAction, now: DateTime<Utc>) -> CoreResult<()> {
        self.status = self.status.transition(&self.id, action)?;
        self.updated_at = now;
        Ok(())
    }

    /// Records an incoming payment.
    ///
    /// Keeps `0 ≤ paid − refunded ≤ total`.
    pub fn record_payment(&mut self, amount: Money, now: DateTime<Utc>) -> CoreResult<()> {
        if !amount.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: "amount".into(),
            }
            .into());
        }
        if matches!(
            self.status,
            OrderStatus::Draft | OrderStatus::Cancelled | OrderStatus::Refunded
        ) {
            return Err(CoreError::invalid_transition(
                "Order",
                &self.id,
                self.status,
                "record payment",
            ));
        }
        let new_paid = self.paid_amount + amount;
        if new_paid - self.refunded_amount > self.total {
            return Err(ValidationError::Invalid {
                field: "amount".into(),
                reason: format!(
                    "payment of {} exceeds balance due {}",
                    amount,
                    self.balance_due()
                ),
            }
            .into());
        }
        self.paid_amount = new_paid;
        self.payment_status = PaymentStatus::derive(self.total, self.paid_amount, self.refunded_amount);
        self.updated_at = now;
        Ok(())
    }

    /// Records a refund. Keeps `refunded ≤ paid`.
    pub fn refund(&mut self, amount: Money, now: DateTime<Utc>) -> CoreResult<()> {
        if !amount.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: "amount".into(),
            }
            .into());
        }
        if amount > self.refundable() {
            return Err(ValidationError::Invalid {
                field: "amount".into(),
                reason: format!(
                    "refund of {} exceeds refundable amount {}",
                    amount,
                    self.refundable()
                ),
            }
            .into());
        }
        self.refunded_amount += amount;
        self.payment_status = PaymentStatus::derive(self.total, self.paid_amount, self.refunded_amount);
        self.updated_at = now;
        Ok(())
    }

    /// Checks the monetary invariants.
    pub fn check_invariants(&self) -> CoreResult<()> {
        let expected =
            self.subtotal + self.tax_amount + self.shipping_amount - self.discount_amount;
        if self.total != expected {
            return Err(CoreError::Invariant(format!(
                "order {} total {} != {}",
                self.id, self.total, expected
            )));
        }
        let net = self.paid_amount - self.refunded_amount;
        if net.is_negative() || net > self.total {
            return Err(CoreError::Invariant(format!(
                "order {} net paid {} outside 0..={}",
                self.id, net, self.total
            )));
        }
        for item in &self.items {
            if item.shipped_quantity > item.quantity || item.returned_quantity > item.shipped_quantity {
                return Err(CoreError::Invariant(format!(
                    "order {} item {} quantities out of range",
                    self.id, item.id
                )));
            }
        }
        Ok(())
    }
}

/// Formats an order number from a prefix and a sequence value.
///
/// ```rust
/// assert_eq!(keel_core::order::format_order_number("SO", 42), "SO-000042");
/// ```
pub fn format_order_number(prefix: &str, seq: i64) -> String {
    format!("{}-{:06}", prefix, seq)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, price: i64, tax_bps: u32) -> Product {
        let now = Utc::now();
        Product {
            id: id.into(),
            sku: format!("SKU-{}", id),
            name: format!("Product {}", id),
            price: Money::from_cents(price),
            tax_rate_bps: tax_bps,
            track_inventory: true,
            allow_backorder: false,
            min_stock_level: 0,
            max_stock_level: None,
            weight_grams: Some(100),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn input(product_id: &str, qty: i64) -> OrderItemInput {
        OrderItemInput {
            product_id: product_id.into(),
            variant_id: None,
            warehouse_id: None,
            quantity: qty,
            unit_price: None,
            discount_amount: Money::zero(),
        }
    }

    fn order_with(items: Vec<OrderItem>, shipping: i64) -> Order {
        let now = Utc::now();
        let mut order = Order {
            id: "o1".into(),
            order_number: format_order_number("SO", 1),
            customer_id: "c1".into(),
            order_type: OrderType::Sales,
            status: OrderStatus::Draft,
            priority: OrderPriority::Normal,
            payment_status: PaymentStatus::Pending,
            fulfillment_status: FulfillmentStatus::Unfulfilled,
            warehouse_id: "w1".into(),
            currency: "USD".into(),
            subtotal: Money::zero(),
            tax_amount: Money::zero(),
            shipping_amount: Money::from_cents(shipping),
            discount_amount: Money::zero(),
            total: Money::zero(),
            paid_amount: Money::zero(),
            refunded_amount: Money::zero(),
            shipping_address: None,
            billing_address: None,
            tracking_number: None,
            notes: None,
            cancellation_reason: None,
            created_by: "u".into(),
            required_date: None,
            approved_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
            items,
        };
        order.recompute_totals(Money::zero()).unwrap();
        order
    }

    #[test]
    fn test_happy_path_transitions() {
        use OrderAction::*;
        let mut s = OrderStatus::Draft;
        for (action, expected) in [
            (Submit, OrderStatus::Pending),
            (Confirm, OrderStatus::Confirmed),
            (Process, OrderStatus::Processing),
            (PartialShip, OrderStatus::PartialShipped),
            (Ship, OrderStatus::Shipped),
            (Deliver, OrderStatus::Delivered),
            (Complete, OrderStatus::Completed),
        ] {
            s = s.next(action).unwrap();
            assert_eq!(s, expected);
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(OrderStatus::Draft.next(OrderAction::Confirm), None);
        assert_eq!(OrderStatus::Delivered.next(OrderAction::Cancel), None);
        assert_eq!(OrderStatus::Cancelled.next(OrderAction::Submit), None);
        assert_eq!(OrderStatus::Pending.next(OrderAction::Ship), None);

        let err = OrderStatus::Completed
            .transition("o1", OrderAction::Cancel)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidTransition);
        assert_eq!(err.to_string(), "Order o1 is completed, cannot cancel");
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        let actions = [
            OrderAction::Submit,
            OrderAction::Confirm,
            OrderAction::Process,
            OrderAction::Ship,
            OrderAction::PartialShip,
            OrderAction::Deliver,
            OrderAction::Return,
            OrderAction::CloseRefunded,
            OrderAction::Complete,
            OrderAction::Cancel,
        ];
        for status in OrderStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for action in actions {
                assert_eq!(status.next(action), None, "{} {:?}", status, action);
            }
        }
    }

    #[test]
    fn test_ship_from_confirmed_or_processing() {
        for from in [OrderStatus::Confirmed, OrderStatus::Processing] {
            assert_eq!(from.next(OrderAction::PartialShip), Some(OrderStatus::PartialShipped));
            assert_eq!(from.next(OrderAction::Ship), Some(OrderStatus::Shipped));
        }
        assert_eq!(
            OrderStatus::PartialShipped.next(OrderAction::Ship),
            Some(OrderStatus::Shipped)
        );
        assert_eq!(OrderStatus::Shipped.next(OrderAction::Ship), None);
        assert_eq!(OrderStatus::Delivered.next(OrderAction::PartialShip), None);
    }

    #[test]
    fn test_return_path() {
        let s = OrderStatus::Delivered.next(OrderAction::Return).unwrap();
        assert_eq!(s, OrderStatus::ReturnsInProgress);
        assert_eq!(s.next(OrderAction::CloseRefunded), Some(OrderStatus::Refunded));
    }

    #[test]
    fn test_priority_mapping() {
        assert_eq!(OrderPriority::Urgent.reservation_priority(), 1);
        assert_eq!(OrderPriority::Normal.reservation_priority(), 5);
        assert!(
            OrderPriority::High.reservation_priority() < OrderPriority::Low.reservation_priority()
        );
    }

    #[test]
    fn test_item_pricing() {
        let p = product("p1", 5000, 1000);
        let mut inp = input("p1", 2);
        inp.discount_amount = Money::from_cents(1000);
        let item = OrderItem::price("o1", &p, &inp, "w1").unwrap();
        assert_eq!(item.total_price.cents(), 10000);
        // 10% on (100.00 − 10.00)
        assert_eq!(item.tax_amount.cents(), 900);
        assert_eq!(item.final_price.cents(), 9900);
        assert_eq!(item.weight_grams, Some(200));
        assert_eq!(item.sku, "SKU-p1");
    }

    #[test]
    fn test_totals_close() {
        // 100.00 + 10% tax + 8.00 shipping = 118.00
        let p = product("p1", 10000, 1000);
        let item = OrderItem::price("o1", &p, &input("p1", 1), "w1").unwrap();
        let order = order_with(vec![item], 800);
        assert_eq!(order.total, "118.00".parse().unwrap());
        order.check_invariants().unwrap();
    }

    #[test]
    fn test_negative_total_rejected() {
        let p = product("p1", 100, 0);
        let item = OrderItem::price("o1", &p, &input("p1", 1), "w1").unwrap();
        let err = OrderTotals::compute(&[item], Money::zero(), Money::from_cents(500)).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_item_input_validation_aggregates() {
        let bad = OrderItemInput {
            product_id: " ".into(),
            variant_id: None,
            warehouse_id: None,
            quantity: 0,
            unit_price: Some(Money::from_cents(-1)),
            discount_amount: Money::zero(),
        };
        assert_eq!(bad.validate().unwrap_err().len(), 3);
    }

    #[test]
    fn test_payment_status_derivation() {
        let t = Money::from_cents(1000);
        assert_eq!(PaymentStatus::derive(t, Money::zero(), Money::zero()), PaymentStatus::Pending);
        assert_eq!(
            PaymentStatus::derive(t, Money::from_cents(400), Money::zero()),
            PaymentStatus::Partial
        );
        assert_eq!(PaymentStatus::derive(t, t, Money::zero()), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::derive(t, t, t), PaymentStatus::Refunded);
        assert_eq!(
            PaymentStatus::derive(t, t, Money::from_cents(100)),
            PaymentStatus::Paid
        );
    }

    #[test]
    fn test_payments_and_refunds() {
        let p = product("p1", 10000, 0);
        let item = OrderItem::price("o1", &p, &input("p1", 1), "w1").unwrap();
        let mut order = order_with(vec![item], 0);
        let now = Utc::now();

        // Draft orders take no payment.
        assert!(order.record_payment(Money::from_cents(100), now).is_err());

        order.status = OrderStatus::Confirmed;
        order.record_payment(Money::from_cents(6000), now).unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Partial);
        assert!(order.record_payment(Money::from_cents(4001), now).is_err());
        order.record_payment(Money::from_cents(4000), now).unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Paid);

        order.refund(Money::from_cents(2500), now).unwrap();
        assert_eq!(order.refundable().cents(), 7500);
        // Net paid dropped, so another payment fits again.
        order.record_payment(Money::from_cents(2500), now).unwrap();
        assert!(order.refund(Money::from_cents(10_001), now).is_err());
        order.refund(Money::from_cents(10_000), now).unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
        order.check_invariants().unwrap();
    }

    #[test]
    fn test_partial_shipment_fulfillment() {
        let p1 = product("p1", 100, 0);
        let p2 = product("p2", 100, 0);
        let mut order = order_with(
            vec![
                OrderItem::price("o1", &p1, &input("p1", 5), "w1").unwrap(),
                OrderItem::price("o1", &p2, &input("p2", 2), "w1").unwrap(),
            ],
            0,
        );
        assert_eq!(order.derive_fulfillment(), FulfillmentStatus::Unfulfilled);

        order.items[0].ship(3).unwrap();
        assert_eq!(order.derive_fulfillment(), FulfillmentStatus::Partial);
        assert!(order.items[0].ship(3).is_err());

        order.items[0].ship(2).unwrap();
        order.items[1].ship(2).unwrap();
        assert_eq!(order.derive_fulfillment(), FulfillmentStatus::Fulfilled);
        assert_eq!(order.items[0].status, OrderItemStatus::Shipped);
    }

    #[test]
    fn test_returns_bounded_by_shipped() {
        let p1 = product("p1", 100, 0);
        let mut order = order_with(
            vec![OrderItem::price("o1", &p1, &input("p1", 3), "w1").unwrap()],
            0,
        );
        assert!(order.items[0].return_units(1).is_err());
        order.items[0].ship(3).unwrap();
        order.items[0].return_units(2).unwrap();
        assert!(!order.fully_returned());
        order.items[0].return_units(1).unwrap();
        assert!(order.fully_returned());
        assert_eq!(order.items[0].status, OrderItemStatus::Returned);
    }

    #[test]
    fn test_credit_outstanding() {
        let p = product("p1", 10000, 0);
        let mut order = order_with(
            vec![OrderItem::price("o1", &p, &input("p1", 1), "w1").unwrap()],
            0,
        );
        assert_eq!(order.credit_outstanding(), Money::zero());
        order.status = OrderStatus::Confirmed;
        order.approved_at = Some(Utc::now());
        order.record_payment(Money::from_cents(10000), Utc::now()).unwrap();
        order.refund(Money::from_cents(3000), Utc::now()).unwrap();
        assert_eq!(order.credit_outstanding().cents(), 7000);
    }
}
