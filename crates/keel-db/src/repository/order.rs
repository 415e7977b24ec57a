//! # Order Repository
//!
//! Orders, their lines, order-number counters and the reporting queries.
//!
//! ## Line Numbering
//! Lines keep the `line_no` they were inserted with. Removing a line from a
//! draft deletes its row; new lines are appended after the current maximum,
//! so `UNIQUE (order_id, line_no)` never collides during an update.

use keel_core::order::{format_order_number, Order, OrderItem, OrderStatus, OrderType};
use keel_core::types::{PageRequest, TimeRange};
use keel_core::Money;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::{push_page, Where};

const COLUMNS: &str = "id, order_number, customer_id, order_type, status, priority, \
     payment_status, fulfillment_status, warehouse_id, currency, subtotal, tax_amount, \
     shipping_amount, discount_amount, total, paid_amount, refunded_amount, shipping_address, \
     billing_address, tracking_number, notes, cancellation_reason, created_by, required_date, \
     approved_at, shipped_at, delivered_at, cancelled_at, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, product_id, variant_id, warehouse_id, sku, name, \
     quantity, unit_price, total_price, tax_amount, discount_amount, final_price, weight_grams, \
     track_inventory, status, shipped_quantity, returned_quantity, reservation_id";

/// Statuses excluded from revenue figures.
const NON_REVENUE: &str = "('draft', 'cancelled')";

/// Filter for [`OrderRepository::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub customer_id: Option<String>,
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub created: TimeRange,
}

impl OrderFilter {
    fn push(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        let mut w = Where::new();
        if let Some(status) = self.status {
            w.next(qb);
            qb.push("status = ").push_bind(status);
        }
        if let Some(customer_id) = &self.customer_id {
            w.next(qb);
            qb.push("customer_id = ").push_bind(customer_id.clone());
        }
        if let Some(order_type) = self.order_type {
            w.next(qb);
            qb.push("order_type = ").push_bind(order_type);
        }
        push_range(qb, &mut w, &self.created);
    }
}

fn push_range(qb: &mut QueryBuilder<'_, Sqlite>, w: &mut Where, range: &TimeRange) {
    if let Some(from) = range.from {
        w.next(qb);
        qb.push("created_at >= ").push_bind(from);
    }
    if let Some(to) = range.to {
        w.next(qb);
        qb.push("created_at < ").push_bind(to);
    }
}

/// Order counts and money totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderStats {
    pub total_orders: i64,
    pub by_status: BTreeMap<String, i64>,
    /// Σ total over orders that are neither draft nor cancelled.
    pub revenue: Money,
    /// Σ (paid − refunded).
    pub net_paid: Money,
    /// Σ balance due over orders that are neither draft nor cancelled.
    pub outstanding: Money,
}

/// One day of order analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyOrderTotals {
    /// `YYYY-MM-DD` (UTC).
    pub day: String,
    pub orders: i64,
    pub revenue: Money,
}

/// A best-selling product over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopProduct {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub revenue: Money,
}

/// Repository for orders.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Allocates the next order number for `prefix`, e.g. `SO-000042`.
    pub async fn next_number(conn: &mut SqliteConnection, prefix: &str) -> DbResult<String> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO counters (name, value) VALUES (?1, 1)
            ON CONFLICT (name) DO UPDATE SET value = value + 1
            RETURNING value
            "#,
        )
        .bind(format!("order_number:{}", prefix))
        .fetch_one(&mut *conn)
        .await?;
        Ok(format_order_number(prefix, seq))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn insert(conn: &mut SqliteConnection, order: &Order) -> DbResult<()> {
        debug!(id = %order.id, number = %order.order_number, items = order.items.len(), "Inserting order");

        sqlx::query(&format!(
            "INSERT INTO orders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
             ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
            COLUMNS
        ))
        .bind(&order.id)
        .bind(&order.order_number)
        .bind(&order.customer_id)
        .bind(order.order_type)
        .bind(order.status)
        .bind(order.priority)
        .bind(order.payment_status)
        .bind(order.fulfillment_status)
        .bind(&order.warehouse_id)
        .bind(&order.currency)
        .bind(order.subtotal)
        .bind(order.tax_amount)
        .bind(order.shipping_amount)
        .bind(order.discount_amount)
        .bind(order.total)
        .bind(order.paid_amount)
        .bind(order.refunded_amount)
        .bind(&order.shipping_address)
        .bind(&order.billing_address)
        .bind(&order.tracking_number)
        .bind(&order.notes)
        .bind(&order.cancellation_reason)
        .bind(&order.created_by)
        .bind(order.required_date)
        .bind(order.approved_at)
        .bind(order.shipped_at)
        .bind(order.delivered_at)
        .bind(order.cancelled_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } if field.ends_with("order_number") => {
                DbError::duplicate("order_number", &order.order_number)
            }
            other => other,
        })?;

        for item in &order.items {
            Self::upsert_item(conn, item).await?;
        }
        Ok(())
    }

    /// Writes the order row and reconciles its lines.
    pub async fn update(conn: &mut SqliteConnection, order: &Order) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = ?2, priority = ?3, payment_status = ?4, fulfillment_status = ?5,
                subtotal = ?6, tax_amount = ?7, shipping_amount = ?8, discount_amount = ?9,
                total = ?10, paid_amount = ?11, refunded_amount = ?12, shipping_address = ?13,
                billing_address = ?14, tracking_number = ?15, notes = ?16,
                cancellation_reason = ?17, required_date = ?18, approved_at = ?19,
                shipped_at = ?20, delivered_at = ?21, cancelled_at = ?22, updated_at = ?23,
                warehouse_id = ?24
            WHERE id = ?1
            "#,
        )
        .bind(&order.id)
        .bind(order.status)
        .bind(order.priority)
        .bind(order.payment_status)
        .bind(order.fulfillment_status)
        .bind(order.subtotal)
        .bind(order.tax_amount)
        .bind(order.shipping_amount)
        .bind(order.discount_amount)
        .bind(order.total)
        .bind(order.paid_amount)
        .bind(order.refunded_amount)
        .bind(&order.shipping_address)
        .bind(&order.billing_address)
        .bind(&order.tracking_number)
        .bind(&order.notes)
        .bind(&order.cancellation_reason)
        .bind(order.required_date)
        .bind(order.approved_at)
        .bind(order.shipped_at)
        .bind(order.delivered_at)
        .bind(order.cancelled_at)
        .bind(order.updated_at)
        .bind(&order.warehouse_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Order", &order.id));
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM order_items WHERE order_id = ");
        qb.push_bind(order.id.clone());
        if !order.items.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut ids = qb.separated(", ");
            for item in &order.items {
                ids.push_bind(item.id.clone());
            }
            ids.push_unseparated(")");
        }
        qb.build().execute(&mut *conn).await?;

        for item in &order.items {
            Self::upsert_item(conn, item).await?;
        }
        Ok(())
    }

    async fn upsert_item(conn: &mut SqliteConnection, item: &OrderItem) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_items (
                id, order_id, line_no, product_id, variant_id, warehouse_id, sku, name,
                quantity, unit_price, total_price, tax_amount, discount_amount, final_price,
                weight_grams, track_inventory, status, shipped_quantity, returned_quantity,
                reservation_id
            ) VALUES (
                ?1, ?2,
                (SELECT COALESCE(MAX(line_no), 0) + 1 FROM order_items WHERE order_id = ?2),
                ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
            )
            ON CONFLICT (id) DO UPDATE SET
                quantity = excluded.quantity,
                unit_price = excluded.unit_price,
                total_price = excluded.total_price,
                tax_amount = excluded.tax_amount,
                discount_amount = excluded.discount_amount,
                final_price = excluded.final_price,
                weight_grams = excluded.weight_grams,
                warehouse_id = excluded.warehouse_id,
                status = excluded.status,
                shipped_quantity = excluded.shipped_quantity,
                returned_quantity = excluded.returned_quantity,
                reservation_id = excluded.reservation_id
            "#,
        )
        .bind(&item.id)
        .bind(&item.order_id)
        .bind(&item.product_id)
        .bind(&item.variant_id)
        .bind(&item.warehouse_id)
        .bind(&item.sku)
        .bind(&item.name)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.total_price)
        .bind(item.tax_amount)
        .bind(item.discount_amount)
        .bind(item.final_price)
        .bind(item.weight_grams)
        .bind(item.track_inventory)
        .bind(item.status)
        .bind(item.shipped_quantity)
        .bind(item.returned_quantity)
        .bind(&item.reservation_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM orders WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Order", id));
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, id: &str) -> DbResult<Option<Order>> {
        let order = Self::row(&self.pool, "id", id).await?;
        self.with_items(order).await
    }

    pub async fn get_by_number(&self, order_number: &str) -> DbResult<Option<Order>> {
        let order = Self::row(&self.pool, "order_number", order_number).await?;
        self.with_items(order).await
    }

    /// Loads an order with its lines inside the caller's transaction.
    pub async fn load(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Order>> {
        let Some(mut order) = Self::row(&mut *conn, "id", id).await? else {
            return Ok(None);
        };
        order.items = Self::items(&mut *conn, id).await?;
        Ok(Some(order))
    }

    /// Resolves an order number to its id.
    pub async fn id_for_number(&self, order_number: &str) -> DbResult<Option<String>> {
        let id: Option<String> = sqlx::query_scalar("SELECT id FROM orders WHERE order_number = ?1")
            .bind(order_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn row<'e, E: SqliteExecutor<'e>>(
        exec: E,
        column: &'static str,
        value: &str,
    ) -> DbResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE {} = ?1",
            COLUMNS, column
        ))
        .bind(value)
        .fetch_optional(exec)
        .await?;
        Ok(order)
    }

    async fn items<'e, E: SqliteExecutor<'e>>(exec: E, order_id: &str) -> DbResult<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(&format!(
            "SELECT {} FROM order_items WHERE order_id = ?1 ORDER BY line_no",
            ITEM_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(exec)
        .await?;
        Ok(items)
    }

    async fn with_items(&self, order: Option<Order>) -> DbResult<Option<Order>> {
        match order {
            Some(mut order) => {
                order.items = Self::items(&self.pool, &order.id).await?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    /// Fills the lines of a page of orders with one query.
    async fn attach_items(&self, orders: &mut [Order]) -> DbResult<()> {
        if orders.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM order_items WHERE order_id IN (",
            ITEM_COLUMNS
        ));
        let mut ids = qb.separated(", ");
        for order in orders.iter() {
            ids.push_bind(order.id.clone());
        }
        ids.push_unseparated(") ORDER BY order_id, line_no");
        let items = qb.build_query_as::<OrderItem>().fetch_all(&self.pool).await?;

        let mut by_order: HashMap<String, Vec<OrderItem>> = HashMap::new();
        for item in items {
            by_order.entry(item.order_id.clone()).or_default().push(item);
        }
        for order in orders.iter_mut() {
            order.items = by_order.remove(&order.id).unwrap_or_default();
        }
        Ok(())
    }

    /// Lists orders newest first.
    pub async fn list(&self, filter: &OrderFilter, page: PageRequest) -> DbResult<(Vec<Order>, i64)> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM orders", COLUMNS));
        filter.push(&mut qb);
        qb.push(" ORDER BY created_at DESC, id");
        push_page(&mut qb, page);
        let mut orders = qb.build_query_as::<Order>().fetch_all(&self.pool).await?;
        self.attach_items(&mut orders).await?;

        let mut count: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM orders");
        filter.push(&mut count);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        Ok((orders, total))
    }

    /// Matches the order number, or the customer's name or email.
    pub async fn search(&self, query: &str, page: PageRequest) -> DbResult<(Vec<Order>, i64)> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let condition = " WHERE order_number LIKE ?1 ESCAPE '\\' \
             OR customer_id IN (SELECT id FROM customers \
                                WHERE name LIKE ?1 ESCAPE '\\' OR email LIKE ?1 ESCAPE '\\')";

        let mut orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders{} ORDER BY created_at DESC, id LIMIT ?2 OFFSET ?3",
            COLUMNS, condition
        ))
        .bind(&pattern)
        .bind(i64::from(page.effective_limit()))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await?;
        self.attach_items(&mut orders).await?;

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM orders{}", condition))
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await?;

        Ok((orders, total))
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub async fn stats(&self, range: &TimeRange) -> DbResult<OrderStats> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT status, COUNT(*), \
             COALESCE(SUM(CASE WHEN status IN {0} THEN 0 ELSE total END), 0), \
             COALESCE(SUM(paid_amount - refunded_amount), 0), \
             COALESCE(SUM(CASE WHEN status IN {0} THEN 0 \
                          ELSE MAX(total - (paid_amount - refunded_amount), 0) END), 0) \
             FROM orders",
            NON_REVENUE
        ));
        push_range(&mut qb, &mut Where::new(), range);
        qb.push(" GROUP BY status");
        let groups = qb
            .build_query_as::<(OrderStatus, i64, i64, i64, i64)>()
            .fetch_all(&self.pool)
            .await?;

        let mut stats = OrderStats::default();
        for (status, count, revenue, net_paid, outstanding) in groups {
            stats.total_orders += count;
            stats.by_status.insert(status.to_string(), count);
            stats.revenue += Money::from_cents(revenue);
            stats.net_paid += Money::from_cents(net_paid);
            stats.outstanding += Money::from_cents(outstanding);
        }
        Ok(stats)
    }

    /// Order count and revenue per UTC day.
    pub async fn daily_totals(&self, range: &TimeRange) -> DbResult<Vec<DailyOrderTotals>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT substr(created_at, 1, 10) AS day, COUNT(*), COALESCE(SUM(total), 0) \
             FROM orders WHERE status NOT IN {}",
            NON_REVENUE
        ));
        push_range(&mut qb, &mut Where::continuing(), range);
        qb.push(" GROUP BY day ORDER BY day");
        let rows = qb
            .build_query_as::<(String, i64, i64)>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(day, orders, revenue)| DailyOrderTotals {
                day,
                orders,
                revenue: Money::from_cents(revenue),
            })
            .collect())
    }

    /// Products ranked by units sold.
    pub async fn top_products(&self, range: &TimeRange, limit: u32) -> DbResult<Vec<TopProduct>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT i.product_id, i.sku, i.name, SUM(i.quantity) AS qty, SUM(i.final_price) \
             FROM order_items i JOIN orders o ON o.id = i.order_id \
             WHERE o.status NOT IN {}",
            NON_REVENUE
        ));
        if let Some(from) = range.from {
            qb.push(" AND o.created_at >= ").push_bind(from);
        }
        if let Some(to) = range.to {
            qb.push(" AND o.created_at < ").push_bind(to);
        }
        qb.push(" GROUP BY i.product_id, i.sku, i.name ORDER BY qty DESC, i.sku LIMIT ")
            .push_bind(i64::from(limit.max(1)));
        let rows = qb
            .build_query_as::<(String, String, String, i64, i64)>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(product_id, sku, name, quantity, revenue)| TopProduct {
                product_id,
                sku,
                name,
                quantity,
                revenue: Money::from_cents(revenue),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{customer, memory_db, seeded};
    use chrono::Utc;
    use keel_core::order::{
        FulfillmentStatus, OrderItemInput, OrderPriority, OrderTotals, PaymentStatus,
    };
    use keel_core::types::{new_id, Product, Warehouse};

    fn draft(number: &str, customer_id: &str, p: &Product, w: &Warehouse, qty: i64) -> Order {
        let now = Utc::now();
        let id = new_id();
        let input = OrderItemInput {
            product_id: p.id.clone(),
            variant_id: None,
            warehouse_id: None,
            quantity: qty,
            unit_price: None,
            discount_amount: Money::zero(),
        };
        let items = vec![OrderItem::price(&id, p, &input, &w.id).unwrap()];
        let totals = OrderTotals::compute(&items, Money::zero(), Money::zero()).unwrap();
        let mut order = Order {
            id,
            order_number: number.to_string(),
            customer_id: customer_id.to_string(),
            order_type: OrderType::Sales,
            status: OrderStatus::Draft,
            priority: OrderPriority::Normal,
            payment_status: PaymentStatus::Pending,
            fulfillment_status: FulfillmentStatus::Unfulfilled,
            warehouse_id: w.id.clone(),
            currency: "USD".into(),
            subtotal: Money::zero(),
            tax_amount: Money::zero(),
            shipping_amount: Money::zero(),
            discount_amount: Money::zero(),
            total: Money::zero(),
            paid_amount: Money::zero(),
            refunded_amount: Money::zero(),
            shipping_address: None,
            billing_address: None,
            tracking_number: None,
            notes: None,
            cancellation_reason: None,
            created_by: "tester".into(),
            required_date: None,
            approved_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
            items,
        };
        order.set_totals(totals);
        order
    }

    #[tokio::test]
    async fn test_order_numbers_increase() {
        let db = memory_db().await;
        let mut tx = db.begin().await.unwrap();
        let a = OrderRepository::next_number(&mut tx, "SO").await.unwrap();
        let b = OrderRepository::next_number(&mut tx, "SO").await.unwrap();
        let c = OrderRepository::next_number(&mut tx, "PO").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(a, "SO-000001");
        assert_eq!(b, "SO-000002");
        assert_eq!(c, "PO-000001");
    }

    #[tokio::test]
    async fn test_insert_load_update_items() {
        let db = memory_db().await;
        let (p, w) = seeded(&db).await;
        let c = customer(100_000);
        db.customers().insert(&c).await.unwrap();

        let mut order = draft("SO-000001", &c.id, &p, &w, 4);
        let mut tx = db.begin().await.unwrap();
        OrderRepository::insert(&mut tx, &order).await.unwrap();
        tx.commit().await.unwrap();

        let got = db.orders().get_by_number("SO-000001").await.unwrap().unwrap();
        assert_eq!(got, order);

        // Replace the line with a new one and ship a unit of it.
        let input = OrderItemInput {
            product_id: p.id.clone(),
            variant_id: None,
            warehouse_id: None,
            quantity: 2,
            unit_price: None,
            discount_amount: Money::zero(),
        };
        let mut line = OrderItem::price(&order.id, &p, &input, &w.id).unwrap();
        line.shipped_quantity = 1;
        order.items = vec![line];
        order.recompute_totals(Money::zero()).unwrap();

        let mut tx = db.begin().await.unwrap();
        OrderRepository::update(&mut tx, &order).await.unwrap();
        let loaded = OrderRepository::load(&mut tx, &order.id).await.unwrap().unwrap();
        tx.commit().await.unwrap();

        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].quantity, 2);
        assert_eq!(loaded.items[0].shipped_quantity, 1);
        assert_eq!(loaded.total, order.total);
    }

    #[tokio::test]
    async fn test_list_search_and_stats() {
        let db = memory_db().await;
        let (p, w) = seeded(&db).await;
        let c = customer(100_000);
        db.customers().insert(&c).await.unwrap();

        let mut confirmed = draft("SO-000001", &c.id, &p, &w, 2);
        confirmed.status = OrderStatus::Confirmed;
        let open = draft("SO-000002", &c.id, &p, &w, 1);

        let mut tx = db.begin().await.unwrap();
        OrderRepository::insert(&mut tx, &confirmed).await.unwrap();
        OrderRepository::insert(&mut tx, &open).await.unwrap();
        tx.commit().await.unwrap();

        let filter = OrderFilter {
            status: Some(OrderStatus::Confirmed),
            ..Default::default()
        };
        let (orders, total) = db.orders().list(&filter, PageRequest::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(orders[0].items.len(), 1);

        let (found, total) = db.orders().search("000002", PageRequest::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].id, open.id);
        let (_, total) = db.orders().search("acme", PageRequest::default()).await.unwrap();
        assert_eq!(total, 2);

        let stats = db.orders().stats(&TimeRange::default()).await.unwrap();
        assert_eq!(stats.total_orders, 2);
        assert_eq!(stats.by_status.get("draft"), Some(&1));
        assert_eq!(stats.revenue, confirmed.total);
        assert_eq!(stats.outstanding, confirmed.total);

        let daily = db.orders().daily_totals(&TimeRange::default()).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].orders, 1);

        let top = db.orders().top_products(&TimeRange::default(), 5).await.unwrap();
        assert_eq!(top[0].quantity, 2);
        assert_eq!(top[0].sku, p.sku);
    }
}
