//! # Customer Repository
//!
//! Customers and their credit. The order core never writes an absolute
//! `credit_used`; it only applies signed deltas with
//! [`CustomerRepository::adjust_credit_used`].

use chrono::{DateTime, Utc};
use keel_core::types::{Customer, PageRequest};
use keel_core::Money;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::push_page;

const COLUMNS: &str =
    "id, name, email, is_active, credit_limit, credit_used, created_at, updated_at";

/// Repository for customer database operations.
#[derive(Debug, Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CustomerRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Customer>> {
        Self::fetch(&self.pool, id).await
    }

    /// Fetches a customer through any executor.
    pub async fn fetch<'e, E: SqliteExecutor<'e>>(
        exec: E,
        id: &str,
    ) -> DbResult<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(&format!(
            "SELECT {} FROM customers WHERE id = ?1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(exec)
        .await?;
        Ok(customer)
    }

    pub async fn insert(&self, customer: &Customer) -> DbResult<()> {
        debug!(id = %customer.id, "Inserting customer");

        sqlx::query(
            r#"
            INSERT INTO customers (
                id, name, email, is_active, credit_limit, credit_used, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&customer.id)
        .bind(&customer.name)
        .bind(&customer.email)
        .bind(customer.is_active)
        .bind(customer.credit_limit)
        .bind(customer.credit_used)
        .bind(customer.created_at)
        .bind(customer.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Applies a signed delta to `credit_used` inside the caller's
    /// transaction and returns the new value.
    pub async fn adjust_credit_used(
        conn: &mut SqliteConnection,
        id: &str,
        delta: Money,
        now: DateTime<Utc>,
    ) -> DbResult<Money> {
        debug!(customer_id = %id, delta = %delta, "Adjusting credit used");

        let used: Option<Money> = sqlx::query_scalar(
            r#"
            UPDATE customers SET credit_used = credit_used + ?2, updated_at = ?3
            WHERE id = ?1
            RETURNING credit_used
            "#,
        )
        .bind(id)
        .bind(delta)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        used.ok_or_else(|| DbError::not_found("Customer", id))
    }

    pub async fn list(&self, page: PageRequest) -> DbResult<(Vec<Customer>, i64)> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM customers ORDER BY name", COLUMNS));
        push_page(&mut qb, page);
        let items = qb.build_query_as::<Customer>().fetch_all(&self.pool).await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers")
            .fetch_one(&self.pool)
            .await?;
        Ok((items, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{customer, memory_db};

    #[tokio::test]
    async fn test_signed_credit_adjustments() {
        let db = memory_db().await;
        let c = customer(100_000);
        db.customers().insert(&c).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let used = CustomerRepository::adjust_credit_used(
            &mut tx,
            &c.id,
            Money::from_cents(11_800),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(used.cents(), 11_800);
        let used = CustomerRepository::adjust_credit_used(
            &mut tx,
            &c.id,
            Money::from_cents(-11_800),
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(used.is_zero());
        tx.commit().await.unwrap();

        let got = db.customers().get_by_id(&c.id).await.unwrap().unwrap();
        assert_eq!(got.credit_available().cents(), 100_000);
    }

    #[tokio::test]
    async fn test_unknown_customer() {
        let db = memory_db().await;
        let mut tx = db.begin().await.unwrap();
        let err = CustomerRepository::adjust_credit_used(&mut tx, "nope", Money::zero(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
