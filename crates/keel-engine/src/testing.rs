//! In-process harness for engine tests: a migrated scratch database, a
//! wired [`Engine`] and a small seeded catalog.
//!
//! Panics freely; only compiled for tests and the `testing` feature.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use keel_core::order::{Order, OrderItemInput};
use keel_core::types::{new_id, Customer, Product, StockKey, Warehouse, WarehouseType};
use keel_core::Money;
use keel_db::{Database, DbConfig};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::catalog::DbCatalog;
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::ledger::RestockRequest;
use crate::orders::NewOrder;
use crate::sinks::{AuditEvent, AuditSink, ErrorEvent, ErrorReporter, SinkError, Sinks};
use crate::Engine;

/// Credit limit of the default customer, in cents.
pub const DEFAULT_CREDIT_LIMIT: i64 = 1_000_000;

/// A tracked product priced at 12.50 with 8.25% tax.
pub fn product(sku: &str) -> Product {
    let now = Utc::now();
    Product {
        id: new_id(),
        sku: sku.to_string(),
        name: format!("Product {}", sku),
        price: Money::from_cents(1250),
        tax_rate_bps: 825,
        track_inventory: true,
        allow_backorder: false,
        min_stock_level: 2,
        max_stock_level: None,
        weight_grams: Some(100),
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn warehouse(code: &str) -> Warehouse {
    let now = Utc::now();
    Warehouse {
        id: new_id(),
        code: code.to_string(),
        name: format!("Warehouse {}", code),
        warehouse_type: WarehouseType::Distribution,
        is_active: true,
        capacity: Some(10_000),
        manager_id: None,
        address: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn customer(credit_limit_cents: i64) -> Customer {
    let now = Utc::now();
    Customer {
        id: new_id(),
        name: "Acme Corp".to_string(),
        email: Some("buyer@acme.test".to_string()),
        is_active: true,
        credit_limit: Money::from_cents(credit_limit_cents),
        credit_used: Money::zero(),
        created_at: now,
        updated_at: now,
    }
}

// =============================================================================
// Test Engine
// =============================================================================

pub struct TestEngine {
    /// Shared so an HTTP router can hold the same engine.
    pub engine: Arc<Engine>,
    pub db: Database,
    pub product: Product,
    pub second_product: Product,
    pub warehouse: Warehouse,
    pub second_warehouse: Warehouse,
    pub customer: Customer,
    _dir: TempDir,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::build(EngineConfig::default(), None, None).await
    }

    /// Background alert workers and sweeper running.
    pub async fn started() -> Self {
        let t = Self::new().await;
        t.engine.start();
        t
    }

    pub async fn with_approval_threshold(threshold: i64) -> Self {
        let mut config = EngineConfig::default();
        config.ledger.approval_threshold = threshold;
        Self::build(config, None, None).await
    }

    /// File-backed database with `connections` pooled connections.
    pub async fn with_pool(connections: u32) -> Self {
        Self::build(EngineConfig::default(), Some(connections), None).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        Self::build(config, None, None).await
    }

    pub async fn with_sinks(sinks: Sinks) -> Self {
        Self::build(EngineConfig::default(), None, Some(sinks)).await
    }

    async fn build(mut config: EngineConfig, pool: Option<u32>, sinks: Option<Sinks>) -> Self {
        let dir = tempfile::tempdir().expect("scratch dir");
        config.storage.root = dir.path().join("objects");

        let db_config = match pool {
            Some(connections) => DbConfig::new(dir.path().join("keel.db")).max_connections(connections),
            None => DbConfig::in_memory(),
        };
        let db = Database::new(db_config).await.expect("scratch database");

        let (first, second) = (product("SKU-1"), product("SKU-2"));
        let (main, spare) = (warehouse("WH-1"), warehouse("WH-2"));
        let buyer = customer(DEFAULT_CREDIT_LIMIT);
        for p in [&first, &second] {
            db.products().insert(p).await.expect("insert product");
        }
        for w in [&main, &spare] {
            db.warehouses().insert(w).await.expect("insert warehouse");
        }
        db.customers().insert(&buyer).await.expect("insert customer");

        let sinks = sinks.unwrap_or_else(|| Sinks::tracing(config.sinks.error_sample_rate));
        let engine = Engine::with_parts(config, db.clone(), DbCatalog::new(db.clone()), sinks)
            .expect("engine");

        TestEngine {
            engine: Arc::new(engine),
            db,
            product: first,
            second_product: second,
            warehouse: main,
            second_warehouse: spare,
            customer: buyer,
            _dir: dir,
        }
    }

    // =========================================================================
    // Stock
    // =========================================================================

    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product.id, &self.warehouse.id)
    }

    /// Restocks the default product in the default warehouse.
    pub async fn stock(&self, quantity: i64) {
        self.restock(&self.product.id, &self.warehouse.id, quantity).await;
    }

    pub async fn restock(&self, product_id: &str, warehouse_id: &str, quantity: i64) {
        self.engine
            .ledger
            .restock(
                &RequestContext::new("setup"),
                RestockRequest {
                    product_id: product_id.to_string(),
                    warehouse_id: warehouse_id.to_string(),
                    quantity,
                    reason: "initial stock".into(),
                    reference: None,
                },
            )
            .await
            .expect("restock");
    }

    pub async fn backorder_product(&self) -> Product {
        let mut p = product("SKU-BACK");
        p.allow_backorder = true;
        self.db.products().insert(&p).await.expect("insert product");
        p
    }

    /// A service line: sold but never stocked.
    pub async fn untracked_product(&self) -> Product {
        let mut p = product("SKU-SERVICE");
        p.track_inventory = false;
        self.db.products().insert(&p).await.expect("insert product");
        p
    }

    // =========================================================================
    // Orders
    // =========================================================================

    pub async fn new_customer(&self, credit_limit_cents: i64) -> Customer {
        let c = customer(credit_limit_cents);
        self.db.customers().insert(&c).await.expect("insert customer");
        c
    }

    /// Credit currently used by the default customer.
    pub async fn credit_used(&self) -> Money {
        self.db
            .customers()
            .get_by_id(&self.customer.id)
            .await
            .expect("customer")
            .expect("customer exists")
            .credit_used
    }

    pub fn line(&self, product: &Product, quantity: i64) -> OrderItemInput {
        OrderItemInput {
            product_id: product.id.clone(),
            variant_id: None,
            warehouse_id: None,
            quantity,
            unit_price: None,
            discount_amount: Money::zero(),
        }
    }

    /// Sales order for the default customer from the default warehouse,
    /// with 5.00 shipping.
    pub fn new_order(&self, items: Vec<OrderItemInput>) -> NewOrder {
        NewOrder {
            customer_id: self.customer.id.clone(),
            order_type: Default::default(),
            priority: Default::default(),
            warehouse_id: self.warehouse.id.clone(),
            currency: None,
            items,
            shipping_amount: Money::from_cents(500),
            discount_amount: Money::zero(),
            shipping_address: Some("1 Harbour Road, Portsmouth".into()),
            billing_address: None,
            notes: None,
            required_date: None,
        }
    }

    /// Creates, submits and confirms an order.
    pub async fn confirmed_order(&self, items: Vec<OrderItemInput>) -> Order {
        let ctx = RequestContext::new("setup");
        let orders = &self.engine.orders;
        let order = orders.create(&ctx, self.new_order(items)).await.expect("create");
        orders.submit(&ctx, &order.id).await.expect("submit");
        orders.confirm(&ctx, &order.id).await.expect("confirm")
    }
}

// =============================================================================
// Recording Sinks
// =============================================================================

#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingErrorReporter {
    events: Mutex<Vec<ErrorEvent>>,
}

impl RecordingErrorReporter {
    pub fn events(&self) -> Vec<ErrorEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ErrorReporter for RecordingErrorReporter {
    async fn report(&self, event: ErrorEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Sinks that keep every event for inspection.
pub fn recording_sinks() -> (Sinks, Arc<RecordingAuditSink>, Arc<RecordingErrorReporter>) {
    let audit = Arc::new(RecordingAuditSink::default());
    let errors = Arc::new(RecordingErrorReporter::default());
    (Sinks::new(audit.clone(), errors.clone()), audit, errors)
}
