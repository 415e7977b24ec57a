//! # Stock Repository
//!
//! One row per (product, warehouse). Rows are created lazily on the first
//! inbound movement and are never deleted while journal entries reference
//! them.
//!
//! The engine loads and saves records inside its unit of work with
//! [`StockRepository::load`] and [`StockRepository::save`]. Readers use the
//! pool-backed methods, which see the last committed state.

use keel_core::stock::StockRecord;
use keel_core::types::{PageRequest, StockKey};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};

use crate::error::DbResult;
use crate::repository::{push_page, Where};

const COLUMNS: &str =
    "product_id, warehouse_id, on_hand, reserved, min_level, max_level, created_at, updated_at";

/// Filter for [`StockRepository::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StockFilter {
    pub product_id: Option<String>,
    pub warehouse_id: Option<String>,
    /// `available ≤ min_level`
    #[serde(default)]
    pub low_stock: bool,
    /// `available ≤ 0`
    #[serde(default)]
    pub out_of_stock: bool,
    /// `reserved > 0`
    #[serde(default)]
    pub has_reservations: bool,
}

impl StockFilter {
    fn push(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        let mut w = Where::new();
        if let Some(product_id) = &self.product_id {
            w.next(qb);
            qb.push("product_id = ").push_bind(product_id.clone());
        }
        if let Some(warehouse_id) = &self.warehouse_id {
            w.next(qb);
            qb.push("warehouse_id = ").push_bind(warehouse_id.clone());
        }
        if self.low_stock {
            w.next(qb);
            qb.push("on_hand - reserved <= min_level");
        }
        if self.out_of_stock {
            w.next(qb);
            qb.push("on_hand - reserved <= 0");
        }
        if self.has_reservations {
            w.next(qb);
            qb.push("reserved > 0");
        }
    }
}

/// Totals across a set of stock records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StockTotals {
    pub records: i64,
    pub on_hand_units: i64,
    pub reserved_units: i64,
    pub available_units: i64,
    pub low_stock_count: i64,
    pub out_of_stock_count: i64,
}

/// Repository for stock records.
#[derive(Debug, Clone)]
pub struct StockRepository {
    pool: SqlitePool,
}

impl StockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        StockRepository { pool }
    }

    /// Last committed record for a key.
    pub async fn get(&self, key: &StockKey) -> DbResult<Option<StockRecord>> {
        Self::load(&self.pool, key).await
    }

    /// Loads a record through any executor. Inside the engine this is the
    /// unit of work's transaction.
    pub async fn load<'e, E: SqliteExecutor<'e>>(
        exec: E,
        key: &StockKey,
    ) -> DbResult<Option<StockRecord>> {
        let record = sqlx::query_as::<_, StockRecord>(&format!(
            "SELECT {} FROM stock_records WHERE product_id = ?1 AND warehouse_id = ?2",
            COLUMNS
        ))
        .bind(&key.product_id)
        .bind(&key.warehouse_id)
        .fetch_optional(exec)
        .await?;
        Ok(record)
    }

    /// Inserts or overwrites the record's quantities.
    pub async fn save(conn: &mut SqliteConnection, record: &StockRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_records (
                product_id, warehouse_id, on_hand, reserved, min_level, max_level,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (product_id, warehouse_id) DO UPDATE SET
                on_hand = excluded.on_hand,
                reserved = excluded.reserved,
                min_level = excluded.min_level,
                max_level = excluded.max_level,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.product_id)
        .bind(&record.warehouse_id)
        .bind(record.on_hand)
        .bind(record.reserved)
        .bind(record.min_level)
        .bind(record.max_level)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Lists records ordered by (product, warehouse), which keeps pages
    /// stable across calls.
    pub async fn list(
        &self,
        filter: &StockFilter,
        page: PageRequest,
    ) -> DbResult<(Vec<StockRecord>, i64)> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM stock_records", COLUMNS));
        filter.push(&mut qb);
        qb.push(" ORDER BY product_id, warehouse_id");
        push_page(&mut qb, page);
        let items = qb.build_query_as::<StockRecord>().fetch_all(&self.pool).await?;

        let mut count: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM stock_records");
        filter.push(&mut count);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        Ok((items, total))
    }

    /// Every warehouse's record for one product.
    pub async fn list_for_product(&self, product_id: &str) -> DbResult<Vec<StockRecord>> {
        let records = sqlx::query_as::<_, StockRecord>(&format!(
            "SELECT {} FROM stock_records WHERE product_id = ?1 ORDER BY warehouse_id",
            COLUMNS
        ))
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Aggregates over the records matching `filter`.
    pub async fn totals(&self, filter: &StockFilter) -> DbResult<StockTotals> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT
                COUNT(*)                                                       AS records,
                COALESCE(SUM(on_hand), 0)                                      AS on_hand_units,
                COALESCE(SUM(reserved), 0)                                     AS reserved_units,
                COALESCE(SUM(on_hand - reserved), 0)                           AS available_units,
                COALESCE(SUM(CASE WHEN on_hand - reserved <= min_level THEN 1 ELSE 0 END), 0)
                                                                               AS low_stock_count,
                COALESCE(SUM(CASE WHEN on_hand - reserved <= 0 THEN 1 ELSE 0 END), 0)
                                                                               AS out_of_stock_count
            FROM stock_records
            "#,
        );
        filter.push(&mut qb);
        let totals = qb.build_query_as::<StockTotals>().fetch_one(&self.pool).await?;
        Ok(totals)
    }
}
