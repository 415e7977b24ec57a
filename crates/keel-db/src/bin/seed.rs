//! # Seed Data Generator
//!
//! Populates the database with demo warehouses, products, customers and
//! opening stock for development.
//!
//! ## Usage
//! ```bash
//! # Seed ./keel_dev.db with 200 products (default)
//! cargo run -p keel-db --bin seed
//!
//! # Custom amount and path
//! cargo run -p keel-db --bin seed -- --count 1000 --db ./data/keel.db
//! ```
//!
//! Opening stock is written as one RESTOCK journal entry per stock record,
//! so journal replay reproduces the seeded balances.

use chrono::Utc;
use keel_core::stock::{JournalEntry, JournalKind, StockRecord};
use keel_core::types::{new_id, Customer, Product, StockKey, Warehouse, WarehouseType};
use keel_core::Money;
use keel_db::{Database, DbConfig, JournalRepository, StockRepository};
use std::env;

/// Demo warehouses: (code, name, type, capacity)
const WAREHOUSES: &[(&str, &str, WarehouseType, i64)] = &[
    ("WH-EAST", "East Distribution Center", WarehouseType::Distribution, 50_000),
    ("WH-WEST", "West Fulfillment Hub", WarehouseType::Fulfillment, 30_000),
    ("ST-MAIN", "Main Street Store", WarehouseType::Retail, 2_000),
    ("RT-01", "Returns Processing", WarehouseType::Return, 5_000),
];

/// Product families for realistic test data
const FAMILIES: &[(&str, &[&str])] = &[
    ("FST", &["Hex Bolt", "Wood Screw", "Lock Nut", "Flat Washer", "Anchor"]),
    ("TLS", &["Claw Hammer", "Tape Measure", "Utility Knife", "Spirit Level", "Pliers"]),
    ("ELC", &["Extension Cord", "LED Bulb", "Wall Switch", "Junction Box", "Wire Nut"]),
    ("PLB", &["PVC Elbow", "Ball Valve", "Pipe Tape", "Hose Clamp", "P-Trap"]),
];

/// Size variants: (label, price addon in cents)
const SIZES: &[(&str, i64)] = &[
    ("Small", 0),
    ("Medium", 150),
    ("Large", 300),
    ("Bulk Pack", 900),
];

/// Tax rates in basis points
const TAX_RATES: &[u32] = &[0, 500, 825, 1000];

/// Demo customers: (name, email, credit limit in cents)
const CUSTOMERS: &[(&str, &str, i64)] = &[
    ("Acme Construction", "purchasing@acme.test", 5_000_000),
    ("Northside Hardware", "orders@northside.test", 1_000_000),
    ("Walk-in Customer", "", 0),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 200;
    let mut db_path = String::from("./keel_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Keel ERP Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of products to generate (default: 200)");
                println!("  -d, --db <PATH>    Database file path (default: ./keel_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Keel ERP Seed Data Generator");
    println!("============================");
    println!("Database: {}", db_path);
    println!("Products: {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database, migrations applied");

    let existing = db.products().count().await?;
    if existing > 0 {
        println!("⚠ Database already has {} products", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    // Warehouses
    let mut warehouses = Vec::new();
    for (code, name, warehouse_type, capacity) in WAREHOUSES {
        let now = Utc::now();
        let warehouse = Warehouse {
            id: new_id(),
            code: code.to_string(),
            name: name.to_string(),
            warehouse_type: *warehouse_type,
            is_active: true,
            capacity: Some(*capacity),
            manager_id: None,
            address: None,
            created_at: now,
            updated_at: now,
        };
        db.warehouses().insert(&warehouse).await?;
        warehouses.push(warehouse);
    }
    println!("✓ Created {} warehouses", warehouses.len());

    // Customers
    for (name, email, limit) in CUSTOMERS {
        let now = Utc::now();
        let customer = Customer {
            id: new_id(),
            name: name.to_string(),
            email: (!email.is_empty()).then(|| email.to_string()),
            is_active: true,
            credit_limit: Money::from_cents(*limit),
            credit_used: Money::zero(),
            created_at: now,
            updated_at: now,
        };
        db.customers().insert(&customer).await?;
    }
    println!("✓ Created {} customers", CUSTOMERS.len());

    // Products and opening stock
    println!();
    println!("Generating products...");
    let start = std::time::Instant::now();
    let mut generated = 0;
    let mut stocked = 0;

    'outer: for (family_idx, (family, names)) in FAMILIES.iter().enumerate() {
        for (name_idx, name) in names.iter().enumerate() {
            for (size_idx, (size, addon)) in SIZES.iter().enumerate() {
                if generated >= count {
                    break 'outer;
                }
                let seed = family_idx * 1000 + name_idx * 20 + size_idx;
                let product = generate_product(family, name, size, *addon, seed);

                if let Err(e) = db.products().insert(&product).await {
                    eprintln!("Failed to insert {}: {}", product.sku, e);
                    continue;
                }
                generated += 1;

                for (w_idx, warehouse) in warehouses.iter().enumerate() {
                    let quantity = ((seed * 7 + w_idx * 13) % 120) as i64;
                    if quantity == 0 || warehouse.warehouse_type == WarehouseType::Return {
                        continue;
                    }
                    open_stock(&db, &product, warehouse, quantity).await?;
                    stocked += 1;
                }
            }
        }
    }

    let elapsed = start.elapsed();
    println!();
    println!("✓ Generated {} products in {:?}", generated, elapsed);
    println!("✓ Opened {} stock records", stocked);
    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Writes an opening balance as a RESTOCK entry plus its stock record.
async fn open_stock(
    db: &Database,
    product: &Product,
    warehouse: &Warehouse,
    quantity: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let now = Utc::now();
    let key = StockKey::new(&product.id, &warehouse.id);
    let empty = StockRecord::empty(&key, product.min_stock_level, product.max_stock_level, now);
    let record = empty.apply(quantity, 0, product.allow_backorder, now)?;
    let entry = JournalEntry::new(&key, JournalKind::Restock, quantity, 0, "opening balance", "seed", now);

    let mut tx = db.begin().await?;
    StockRepository::save(&mut tx, &record).await?;
    JournalRepository::append(&mut tx, &entry).await?;
    tx.commit().await?;
    Ok(())
}

/// Generates a single product with realistic data.
fn generate_product(family: &str, name: &str, size: &str, price_addon: i64, seed: usize) -> Product {
    let now = Utc::now();

    let sku = format!(
        "{}-{}-{:04}",
        family,
        name.replace([' ', '-'], "").chars().take(3).collect::<String>().to_uppercase(),
        seed
    );

    // $2.49 - $14.48 plus the size addon
    let base_price = 249 + ((seed * 37) % 1200) as i64;

    Product {
        id: new_id(),
        sku,
        name: format!("{} {}", name, size),
        price: Money::from_cents(base_price + price_addon),
        tax_rate_bps: TAX_RATES[seed % TAX_RATES.len()],
        track_inventory: true,
        allow_backorder: seed % 11 == 0,
        min_stock_level: 5 + (seed % 10) as i64,
        max_stock_level: Some(500),
        weight_grams: Some(50 + (seed % 900) as i64),
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}
