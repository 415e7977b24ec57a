//! # keel-db: Database Layer for Keel ERP
//!
//! This crate provides database access for the Keel ERP back-end.
//! It uses SQLite with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Keel ERP Data Flow                               │
//! │                                                                         │
//! │  keel-engine (InventoryLedger::reserve)                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     keel-db (THIS CRATE)                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ StockRepo     │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ JournalRepo   │    │ 001_initial_ │  │   │
//! │  │   │ begin() → tx  │    │ OrderRepo     │    │ schema.sql   │  │   │
//! │  │   │               │    │ ...           │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keel_db::{Database, DbConfig, StockRepository};
//!
//! let db = Database::new(DbConfig::new("keel.db")).await?;
//!
//! // Reads go straight to the pool
//! let record = db.stock().get(&key).await?;
//!
//! // Writes join a transaction
//! let mut tx = db.begin().await?;
//! StockRepository::save(&mut tx, &record).await?;
//! tx.commit().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::alert::{AlertFilter, AlertRepository};
pub use repository::customer::CustomerRepository;
pub use repository::idempotency::{IdempotencyRecord, IdempotencyRepository};
pub use repository::journal::{JournalFilter, JournalRepository, JournalStats};
pub use repository::order::{
    DailyOrderTotals, OrderFilter, OrderRepository, OrderStats, TopProduct,
};
pub use repository::product::ProductRepository;
pub use repository::reservation::ReservationRepository;
pub use repository::stock::{StockFilter, StockRepository, StockTotals};
pub use repository::warehouse::{WarehouseFilter, WarehouseRepository, WarehouseStockTotals};
