//! # Product Repository
//!
//! Catalog rows. The inventory and order cores read products through the
//! engine's `ProductCatalog`; writes happen through the seed binary and
//! tests.

use keel_core::types::{PageRequest, Product};
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use crate::repository::{push_page, Where};

const COLUMNS: &str = "id, sku, name, price, tax_rate_bps, track_inventory, allow_backorder, \
     min_stock_level, max_stock_level, weight_grams, is_active, created_at, updated_at";

/// Repository for product database operations.
#[derive(Debug, Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProductRepository { pool }
    }

    /// Gets a product by its ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Product>> {
        Self::fetch(&self.pool, id).await
    }

    /// Gets a product by SKU.
    pub async fn get_by_sku(&self, sku: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products WHERE sku = ?1",
            COLUMNS
        ))
        .bind(sku)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    /// Fetches a product through any executor.
    pub async fn fetch<'e, E: SqliteExecutor<'e>>(exec: E, id: &str) -> DbResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products WHERE id = ?1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(exec)
        .await?;
        Ok(product)
    }

    pub async fn exists(&self, id: &str) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM products WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Inserts a new product.
    pub async fn insert(&self, product: &Product) -> DbResult<()> {
        debug!(id = %product.id, sku = %product.sku, "Inserting product");

        sqlx::query(
            r#"
            INSERT INTO products (
                id, sku, name, price, tax_rate_bps, track_inventory, allow_backorder,
                min_stock_level, max_stock_level, weight_grams, is_active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&product.id)
        .bind(&product.sku)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.tax_rate_bps)
        .bind(product.track_inventory)
        .bind(product.allow_backorder)
        .bind(product.min_stock_level)
        .bind(product.max_stock_level)
        .bind(product.weight_grams)
        .bind(product.is_active)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Updates mutable catalog fields.
    pub async fn update(&self, product: &Product) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE products SET
                name = ?2, price = ?3, tax_rate_bps = ?4, track_inventory = ?5,
                allow_backorder = ?6, min_stock_level = ?7, max_stock_level = ?8,
                weight_grams = ?9, is_active = ?10, updated_at = ?11
            WHERE id = ?1
            "#,
        )
        .bind(&product.id)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.tax_rate_bps)
        .bind(product.track_inventory)
        .bind(product.allow_backorder)
        .bind(product.min_stock_level)
        .bind(product.max_stock_level)
        .bind(product.weight_grams)
        .bind(product.is_active)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::DbError::not_found("Product", &product.id));
        }
        Ok(())
    }

    /// Lists products ordered by SKU.
    pub async fn list(&self, active_only: bool, page: PageRequest) -> DbResult<(Vec<Product>, i64)> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM products", COLUMNS));
        let mut count: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM products");
        if active_only {
            Where::new().next(&mut qb);
            qb.push("is_active = 1");
            Where::new().next(&mut count);
            count.push("is_active = 1");
        }
        qb.push(" ORDER BY sku");
        push_page(&mut qb, page);

        let items = qb.build_query_as::<Product>().fetch_all(&self.pool).await?;
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok((items, total))
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, product};
    use crate::DbError;
    use keel_core::Money;

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let db = memory_db().await;
        let p = product("BOLT-M8");
        db.products().insert(&p).await.unwrap();

        let got = db.products().get_by_id(&p.id).await.unwrap().unwrap();
        assert_eq!(got.sku, "BOLT-M8");
        assert_eq!(got.price, Money::from_cents(1250));
        assert_eq!(got.tax_rate_bps, 825);
        assert!(db.products().exists(&p.id).await.unwrap());
        assert!(db.products().get_by_sku("BOLT-M8").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_sku_rejected() {
        let db = memory_db().await;
        db.products().insert(&product("DUP")).await.unwrap();
        let err = db.products().insert(&product("DUP")).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let db = memory_db().await;
        for i in 0..5 {
            db.products().insert(&product(&format!("SKU-{}", i))).await.unwrap();
        }
        let (items, total) = db.products().list(true, PageRequest::new(2, 2)).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].sku, "SKU-2");
    }
}
