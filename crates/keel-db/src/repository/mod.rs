//! # Repository Module
//!
//! Database repository implementations for Keel ERP.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Two Ways In                                          │
//! │                                                                         │
//! │  Reads (no lock, consistent snapshot)                                  │
//! │       db.stock().get(&key)            ──► &SqlitePool                  │
//! │                                                                         │
//! │  Writes (inside the engine's unit of work)                             │
//! │       let mut tx = db.begin().await?;                                  │
//! │       StockRepository::load(&mut *tx, &key)                            │
//! │       StockRepository::save(&mut *tx, &record)                         │
//! │       JournalRepository::append(&mut *tx, entry)                       │
//! │       tx.commit().await?;                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Associated functions that take `&mut SqliteConnection` join whatever
//! transaction the caller opened. Methods on `&self` read from the pool and
//! must not be called while the caller holds an open transaction on a
//! single-connection pool.
//!
//! ## Available Repositories
//!
//! - [`ProductRepository`] - Product catalog rows
//! - [`CustomerRepository`] - Customers and signed credit adjustments
//! - [`WarehouseRepository`] - Warehouses and per-warehouse stats
//! - [`StockRepository`] - Stock records
//! - [`ReservationRepository`] - Reservations
//! - [`JournalRepository`] - Append-only transaction journal
//! - [`AlertRepository`] - Low-stock alert configurations
//! - [`OrderRepository`] - Orders, items, counters
//! - [`IdempotencyRepository`] - Stored responses of keyed requests

pub mod alert;
pub mod customer;
pub mod idempotency;
pub mod journal;
pub mod order;
pub mod product;
pub mod reservation;
pub mod stock;
pub mod warehouse;

pub use alert::AlertRepository;
pub use customer::CustomerRepository;
pub use idempotency::IdempotencyRepository;
pub use journal::JournalRepository;
pub use order::OrderRepository;
pub use product::ProductRepository;
pub use reservation::ReservationRepository;
pub use stock::StockRepository;
pub use warehouse::WarehouseRepository;

use keel_core::types::{PageRequest, Reference, ReferenceType};
use sqlx::{QueryBuilder, Sqlite};

use crate::error::{DbError, DbResult};

/// Appends `LIMIT/OFFSET` for a page request.
pub(crate) fn push_page(qb: &mut QueryBuilder<'_, Sqlite>, page: PageRequest) {
    qb.push(" LIMIT ")
        .push_bind(page.effective_limit() as i64)
        .push(" OFFSET ")
        .push_bind(page.offset as i64);
}

/// Appends ` WHERE ` before the first condition and ` AND ` after it.
pub(crate) struct Where {
    first: bool,
}

impl Where {
    pub(crate) fn new() -> Self {
        Where { first: true }
    }

    /// For a query whose base SQL already has a `WHERE` clause.
    pub(crate) fn continuing() -> Self {
        Where { first: false }
    }

    pub(crate) fn next<'q>(&mut self, qb: &mut QueryBuilder<'q, Sqlite>) {
        qb.push(if self.first { " WHERE " } else { " AND " });
        self.first = false;
    }
}

/// Rebuilds an optional reference from its two columns.
pub(crate) fn reference_from_columns(
    table: &str,
    id: Option<String>,
    ref_type: Option<ReferenceType>,
) -> DbResult<Option<Reference>> {
    match (id, ref_type) {
        (Some(id), Some(t)) => Ok(Some(Reference::new(id, t))),
        (None, None) => Ok(None),
        _ => Err(DbError::decode(table, "reference_id and reference_type must be set together")),
    }
}
