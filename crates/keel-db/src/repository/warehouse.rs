//! # Warehouse Repository
//!
//! Warehouses plus the aggregate queries behind warehouse stats.

use keel_core::types::{PageRequest, Warehouse, WarehouseType};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::{push_page, Where};

const COLUMNS: &str = "id, code, name, warehouse_type, is_active, capacity, manager_id, address, \
     created_at, updated_at";

/// Filter for [`WarehouseRepository::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarehouseFilter {
    pub warehouse_type: Option<WarehouseType>,
    pub is_active: Option<bool>,
}

/// Stock aggregates for one warehouse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WarehouseStockTotals {
    pub total_products: i64,
    pub on_hand_units: i64,
    pub reserved_units: i64,
    pub low_stock_count: i64,
    pub out_of_stock_count: i64,
}

/// Repository for warehouse database operations.
#[derive(Debug, Clone)]
pub struct WarehouseRepository {
    pool: SqlitePool,
}

impl WarehouseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        WarehouseRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Warehouse>> {
        Self::fetch(&self.pool, id).await
    }

    /// Fetches a warehouse through any executor.
    pub async fn fetch<'e, E: SqliteExecutor<'e>>(
        exec: E,
        id: &str,
    ) -> DbResult<Option<Warehouse>> {
        let warehouse = sqlx::query_as::<_, Warehouse>(&format!(
            "SELECT {} FROM warehouses WHERE id = ?1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(exec)
        .await?;
        Ok(warehouse)
    }

    pub async fn get_by_code(&self, code: &str) -> DbResult<Option<Warehouse>> {
        let warehouse = sqlx::query_as::<_, Warehouse>(&format!(
            "SELECT {} FROM warehouses WHERE code = ?1",
            COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(warehouse)
    }

    pub async fn insert(&self, warehouse: &Warehouse) -> DbResult<()> {
        debug!(id = %warehouse.id, code = %warehouse.code, "Inserting warehouse");

        sqlx::query(
            r#"
            INSERT INTO warehouses (
                id, code, name, warehouse_type, is_active, capacity, manager_id, address,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&warehouse.id)
        .bind(&warehouse.code)
        .bind(&warehouse.name)
        .bind(warehouse.warehouse_type)
        .bind(warehouse.is_active)
        .bind(warehouse.capacity)
        .bind(&warehouse.manager_id)
        .bind(&warehouse.address)
        .bind(warehouse.created_at)
        .bind(warehouse.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                field,
                value: warehouse.code.clone(),
            },
            other => other,
        })?;

        Ok(())
    }

    /// Writes every mutable column of the warehouse.
    pub async fn update(&self, warehouse: &Warehouse) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE warehouses SET
                name = ?2, warehouse_type = ?3, is_active = ?4, capacity = ?5,
                manager_id = ?6, address = ?7, updated_at = ?8
            WHERE id = ?1
            "#,
        )
        .bind(&warehouse.id)
        .bind(&warehouse.name)
        .bind(warehouse.warehouse_type)
        .bind(warehouse.is_active)
        .bind(warehouse.capacity)
        .bind(&warehouse.manager_id)
        .bind(&warehouse.address)
        .bind(warehouse.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Warehouse", &warehouse.id));
        }
        Ok(())
    }

    /// Deletes a warehouse. Fails with a foreign key violation while stock
    /// history references it.
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM low_stock_alerts WHERE warehouse_id = ?1 AND product_id IS NULL")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        let result = sqlx::query("DELETE FROM warehouses WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Warehouse", id));
        }
        Ok(())
    }

    /// Number of stock records held at the warehouse.
    pub async fn stock_record_count<'e, E: SqliteExecutor<'e>>(exec: E, id: &str) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM stock_records WHERE warehouse_id = ?1")
                .bind(id)
                .fetch_one(exec)
                .await?;
        Ok(count)
    }

    pub async fn list(
        &self,
        filter: &WarehouseFilter,
        page: PageRequest,
    ) -> DbResult<(Vec<Warehouse>, i64)> {
        fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &WarehouseFilter) {
            let mut w = Where::new();
            if let Some(t) = filter.warehouse_type {
                w.next(qb);
                qb.push("warehouse_type = ").push_bind(t);
            }
            if let Some(active) = filter.is_active {
                w.next(qb);
                qb.push("is_active = ").push_bind(active);
            }
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM warehouses", COLUMNS));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY code");
        push_page(&mut qb, page);
        let items = qb.build_query_as::<Warehouse>().fetch_all(&self.pool).await?;

        let mut count: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM warehouses");
        push_filter(&mut count, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        Ok((items, total))
    }

    /// Stock aggregates for the warehouse.
    pub async fn stock_totals(&self, id: &str) -> DbResult<WarehouseStockTotals> {
        let totals = sqlx::query_as::<_, WarehouseStockTotals>(
            r#"
            SELECT
                COUNT(*)                                                   AS total_products,
                COALESCE(SUM(on_hand), 0)                                  AS on_hand_units,
                COALESCE(SUM(reserved), 0)                                 AS reserved_units,
                COALESCE(SUM(CASE WHEN on_hand - reserved <= min_level THEN 1 ELSE 0 END), 0)
                                                                           AS low_stock_count,
                COALESCE(SUM(CASE WHEN on_hand - reserved <= 0 THEN 1 ELSE 0 END), 0)
                                                                           AS out_of_stock_count
            FROM stock_records
            WHERE warehouse_id = ?1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, warehouse};

    #[tokio::test]
    async fn test_insert_get_by_code() {
        let db = memory_db().await;
        let w = warehouse("WH-EAST");
        db.warehouses().insert(&w).await.unwrap();

        let got = db.warehouses().get_by_code("WH-EAST").await.unwrap().unwrap();
        assert_eq!(got.id, w.id);
        assert_eq!(got.warehouse_type, WarehouseType::Distribution);
    }

    #[tokio::test]
    async fn test_duplicate_code_reports_value() {
        let db = memory_db().await;
        db.warehouses().insert(&warehouse("WH-1")).await.unwrap();
        let err = db.warehouses().insert(&warehouse("WH-1")).await.unwrap_err();
        match err {
            DbError::UniqueViolation { value, .. } => assert_eq!(value, "WH-1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_filters_by_active() {
        let db = memory_db().await;
        let mut inactive = warehouse("WH-OLD");
        inactive.is_active = false;
        db.warehouses().insert(&inactive).await.unwrap();
        db.warehouses().insert(&warehouse("WH-NEW")).await.unwrap();

        let filter = WarehouseFilter {
            is_active: Some(true),
            ..Default::default()
        };
        let (items, total) = db
            .warehouses()
            .list(&filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].code, "WH-NEW");
    }

    #[tokio::test]
    async fn test_empty_stock_totals() {
        let db = memory_db().await;
        let w = warehouse("WH-2");
        db.warehouses().insert(&w).await.unwrap();
        let totals = db.warehouses().stock_totals(&w.id).await.unwrap();
        assert_eq!(totals, WarehouseStockTotals::default());
    }
}
