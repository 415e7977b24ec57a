//! # Alert Repository
//!
//! Low-stock alert configurations. Either scope column may be NULL, which
//! makes that side a wildcard.

use chrono::{DateTime, Utc};
use keel_core::alert::{AlertKind, LowStockAlert};
use keel_core::types::{PageRequest, StockKey};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::{push_page, Where};

const COLUMNS: &str = "id, product_id, warehouse_id, threshold, cooldown_secs, is_active, \
     last_fired_at, last_fired_kind, created_at, updated_at";

/// Filter for [`AlertRepository::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    pub is_active: Option<bool>,
    pub product_id: Option<String>,
    pub warehouse_id: Option<String>,
}

/// Repository for alert configurations.
#[derive(Debug, Clone)]
pub struct AlertRepository {
    pool: SqlitePool,
}

impl AlertRepository {
    pub fn new(pool: SqlitePool) -> Self {
        AlertRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<LowStockAlert>> {
        let alert = sqlx::query_as::<_, LowStockAlert>(&format!(
            "SELECT {} FROM low_stock_alerts WHERE id = ?1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(alert)
    }

    pub async fn insert(&self, alert: &LowStockAlert) -> DbResult<()> {
        debug!(id = %alert.id, threshold = alert.threshold, "Inserting low-stock alert");

        sqlx::query(
            r#"
            INSERT INTO low_stock_alerts (
                id, product_id, warehouse_id, threshold, cooldown_secs, is_active,
                last_fired_at, last_fired_kind, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.product_id)
        .bind(&alert.warehouse_id)
        .bind(alert.threshold)
        .bind(alert.cooldown_secs)
        .bind(alert.is_active)
        .bind(alert.last_fired_at)
        .bind(alert.last_fired_kind)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes threshold, cooldown and the active flag.
    pub async fn update(&self, alert: &LowStockAlert) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE low_stock_alerts SET
                threshold = ?2, cooldown_secs = ?3, is_active = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(&alert.id)
        .bind(alert.threshold)
        .bind(alert.cooldown_secs)
        .bind(alert.is_active)
        .bind(alert.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Alert", &alert.id));
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM low_stock_alerts WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Alert", id));
        }
        Ok(())
    }

    pub async fn list(
        &self,
        filter: &AlertFilter,
        page: PageRequest,
    ) -> DbResult<(Vec<LowStockAlert>, i64)> {
        fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AlertFilter) {
            let mut w = Where::new();
            if let Some(active) = filter.is_active {
                w.next(qb);
                qb.push("is_active = ").push_bind(active);
            }
            if let Some(p) = &filter.product_id {
                w.next(qb);
                qb.push("product_id = ").push_bind(p.clone());
            }
            if let Some(wh) = &filter.warehouse_id {
                w.next(qb);
                qb.push("warehouse_id = ").push_bind(wh.clone());
            }
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM low_stock_alerts", COLUMNS));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at, id");
        push_page(&mut qb, page);
        let items = qb.build_query_as::<LowStockAlert>().fetch_all(&self.pool).await?;

        let mut count: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM low_stock_alerts");
        push_filter(&mut count, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        Ok((items, total))
    }

    /// Active alerts whose scope covers `key`.
    pub async fn matching(&self, key: &StockKey) -> DbResult<Vec<LowStockAlert>> {
        let alerts = sqlx::query_as::<_, LowStockAlert>(&format!(
            "SELECT {} FROM low_stock_alerts \
             WHERE is_active = 1 \
               AND (product_id IS NULL OR product_id = ?1) \
               AND (warehouse_id IS NULL OR warehouse_id = ?2)",
            COLUMNS
        ))
        .bind(&key.product_id)
        .bind(&key.warehouse_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }

    /// Records a fire if nobody else has since `seen_last_fired_at`.
    ///
    /// Returns false when another worker fired the alert first.
    pub async fn mark_fired(
        &self,
        id: &str,
        seen_last_fired_at: Option<DateTime<Utc>>,
        kind: AlertKind,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE low_stock_alerts SET
                last_fired_at = ?2, last_fired_kind = ?3, updated_at = ?2
            WHERE id = ?1 AND last_fired_at IS ?4
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(kind)
        .bind(seen_last_fired_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
