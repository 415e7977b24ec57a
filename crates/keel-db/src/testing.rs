//! Fixtures shared by the repository tests.

use chrono::Utc;
use keel_core::types::{new_id, Customer, Product, Warehouse, WarehouseType};
use keel_core::Money;

use crate::{Database, DbConfig};

/// A migrated, private in-memory database.
pub(crate) async fn memory_db() -> Database {
    Database::new(DbConfig::in_memory())
        .await
        .expect("in-memory database")
}

pub(crate) fn product(sku: &str) -> Product {
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

pub(crate) fn customer(credit_limit_cents: i64) -> Customer {
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

pub(crate) fn warehouse(code: &str) -> Warehouse {
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

/// Inserts a product and a warehouse and returns both.
pub(crate) async fn seeded(db: &Database) -> (Product, Warehouse) {
    let p = product("SKU-1");
    let w = warehouse("WH-1");
    db.products().insert(&p).await.expect("insert product");
    db.warehouses().insert(&w).await.expect("insert warehouse");
    (p, w)
}
