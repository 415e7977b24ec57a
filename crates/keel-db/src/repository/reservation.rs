//! # Reservation Repository
//!
//! Reservations are stored flat: the optional reference becomes two
//! nullable columns and the status is a snake_case TEXT column.

use chrono::{DateTime, Utc};
use keel_core::stock::{Reservation, ReservationStatus};
use keel_core::types::{ReferenceType, StockKey};
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::reference_from_columns;

const COLUMNS: &str = "id, product_id, warehouse_id, quantity, remaining, consumed, released, \
     reason, priority, reference_id, reference_type, status, created_by, created_at, updated_at, \
     closed_at";

#[derive(Debug, sqlx::FromRow)]
struct ReservationRow {
    id: String,
    product_id: String,
    warehouse_id: String,
    quantity: i64,
    remaining: i64,
    consumed: i64,
    released: i64,
    reason: String,
    priority: i64,
    reference_id: Option<String>,
    reference_type: Option<ReferenceType>,
    status: ReservationStatus,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = DbError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let priority = u8::try_from(row.priority)
            .map_err(|_| DbError::decode("reservations", format!("priority {}", row.priority)))?;
        Ok(Reservation {
            reference: reference_from_columns("reservations", row.reference_id, row.reference_type)?,
            id: row.id,
            product_id: row.product_id,
            warehouse_id: row.warehouse_id,
            quantity: row.quantity,
            remaining: row.remaining,
            consumed: row.consumed,
            released: row.released,
            reason: row.reason,
            priority,
            status: row.status,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            closed_at: row.closed_at,
        })
    }
}

fn convert(rows: Vec<ReservationRow>) -> DbResult<Vec<Reservation>> {
    rows.into_iter().map(Reservation::try_from).collect()
}

/// Repository for reservations.
#[derive(Debug, Clone)]
pub struct ReservationRepository {
    pool: SqlitePool,
}

impl ReservationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ReservationRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<Reservation>> {
        Self::fetch(&self.pool, id).await
    }

    /// Fetches a reservation through any executor.
    pub async fn fetch<'e, E: SqliteExecutor<'e>>(
        exec: E,
        id: &str,
    ) -> DbResult<Option<Reservation>> {
        let row = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {} FROM reservations WHERE id = ?1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(exec)
        .await?;
        row.map(Reservation::try_from).transpose()
    }

    pub async fn insert(conn: &mut SqliteConnection, r: &Reservation) -> DbResult<()> {
        debug!(id = %r.id, key = %r.key(), quantity = r.quantity, "Inserting reservation");

        let (reference_id, reference_type) = match &r.reference {
            Some(reference) => (Some(reference.id.as_str()), Some(reference.ref_type)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO reservations (
                id, product_id, warehouse_id, quantity, remaining, consumed, released,
                reason, priority, reference_id, reference_type, status, created_by,
                created_at, updated_at, closed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&r.id)
        .bind(&r.product_id)
        .bind(&r.warehouse_id)
        .bind(r.quantity)
        .bind(r.remaining)
        .bind(r.consumed)
        .bind(r.released)
        .bind(&r.reason)
        .bind(i64::from(r.priority))
        .bind(reference_id)
        .bind(reference_type)
        .bind(r.status)
        .bind(&r.created_by)
        .bind(r.created_at)
        .bind(r.updated_at)
        .bind(r.closed_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Writes the draw-down columns of an existing reservation.
    pub async fn update(conn: &mut SqliteConnection, r: &Reservation) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE reservations SET
                remaining = ?2, consumed = ?3, released = ?4, status = ?5,
                updated_at = ?6, closed_at = ?7
            WHERE id = ?1
            "#,
        )
        .bind(&r.id)
        .bind(r.remaining)
        .bind(r.consumed)
        .bind(r.released)
        .bind(r.status)
        .bind(r.updated_at)
        .bind(r.closed_at)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Reservation", &r.id));
        }
        Ok(())
    }

    /// Reservations on one stock key, oldest first.
    pub async fn list_by_stock(
        &self,
        key: &StockKey,
        active_only: bool,
    ) -> DbResult<Vec<Reservation>> {
        let sql = if active_only {
            format!(
                "SELECT {} FROM reservations \
                 WHERE product_id = ?1 AND warehouse_id = ?2 AND status = 'active' \
                 ORDER BY priority, created_at",
                COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM reservations \
                 WHERE product_id = ?1 AND warehouse_id = ?2 \
                 ORDER BY created_at",
                COLUMNS
            )
        };
        let rows = sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(&key.product_id)
            .bind(&key.warehouse_id)
            .fetch_all(&self.pool)
            .await?;
        convert(rows)
    }

    pub async fn list_by_reference(
        &self,
        reference_id: &str,
        reference_type: ReferenceType,
    ) -> DbResult<Vec<Reservation>> {
        Self::by_reference(&self.pool, reference_id, reference_type).await
    }

    /// Reservations backing one reference through any executor.
    pub async fn by_reference<'e, E: SqliteExecutor<'e>>(
        exec: E,
        reference_id: &str,
        reference_type: ReferenceType,
    ) -> DbResult<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {} FROM reservations WHERE reference_id = ?1 AND reference_type = ?2 \
             ORDER BY created_at",
            COLUMNS
        ))
        .bind(reference_id)
        .bind(reference_type)
        .fetch_all(exec)
        .await?;
        convert(rows)
    }

    /// Active reservations of an expiring reference type created before
    /// `cutoff`.
    pub async fn expirable(&self, cutoff: DateTime<Utc>, limit: u32) -> DbResult<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {} FROM reservations \
             WHERE status = 'active' AND reference_type = ?1 AND created_at < ?2 \
             ORDER BY created_at LIMIT ?3",
            COLUMNS
        ))
        .bind(ReferenceType::Quote)
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    /// Σ remaining over active reservations on a key.
    pub async fn sum_active_remaining<'e, E: SqliteExecutor<'e>>(
        exec: E,
        key: &StockKey,
    ) -> DbResult<i64> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(remaining), 0) FROM reservations \
             WHERE product_id = ?1 AND warehouse_id = ?2 AND status = 'active'",
        )
        .bind(&key.product_id)
        .bind(&key.warehouse_id)
        .fetch_one(exec)
        .await?;
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::StockRepository;
    use crate::testing::{memory_db, seeded};
    use chrono::Duration;
    use keel_core::stock::{Drawdown, StockRecord};
    use keel_core::types::Reference;

    #[tokio::test]
    async fn test_insert_draw_down_and_sum() {
        let db = memory_db().await;
        let (p, w) = seeded(&db).await;
        let key = StockKey::new(&p.id, &w.id);
        let now = Utc::now();

        let mut record = StockRecord::empty(&key, 0, None, now);
        record.on_hand = 10;
        record.reserved = 3;
        let r = Reservation::new(&key, 3, 5, "order", Some(Reference::order("o1")), "tester", now);

        let mut tx = db.begin().await.unwrap();
        StockRepository::save(&mut tx, &record).await.unwrap();
        ReservationRepository::insert(&mut tx, &r).await.unwrap();
        let consumed = r.draw_down(2, Drawdown::Consume, now).unwrap();
        ReservationRepository::update(&mut tx, &consumed).await.unwrap();
        let sum = ReservationRepository::sum_active_remaining(&mut *tx, &key)
            .await
            .unwrap();
        assert_eq!(sum, 1);
        tx.commit().await.unwrap();

        let got = db.reservations().get(&r.id).await.unwrap().unwrap();
        assert_eq!((got.remaining, got.consumed, got.released), (1, 2, 0));
        assert_eq!(got.reference, Some(Reference::order("o1")));
        assert_eq!(got.priority, 5);

        let by_ref = db
            .reservations()
            .list_by_reference("o1", ReferenceType::Order)
            .await
            .unwrap();
        assert_eq!(by_ref.len(), 1);
    }

    #[tokio::test]
    async fn test_only_quotes_are_expirable() {
        let db = memory_db().await;
        let (p, w) = seeded(&db).await;
        let key = StockKey::new(&p.id, &w.id);
        let old = Utc::now() - Duration::days(2);

        let mut record = StockRecord::empty(&key, 0, None, old);
        record.on_hand = 10;
        record.reserved = 2;
        let quote = Reservation::new(&key, 1, 5, "quote", Some(Reference::quote("q1")), "t", old);
        let order = Reservation::new(&key, 1, 5, "order", Some(Reference::order("o1")), "t", old);

        let mut tx = db.begin().await.unwrap();
        StockRepository::save(&mut tx, &record).await.unwrap();
        ReservationRepository::insert(&mut tx, &quote).await.unwrap();
        ReservationRepository::insert(&mut tx, &order).await.unwrap();
        tx.commit().await.unwrap();

        let due = db
            .reservations()
            .expirable(Utc::now() - Duration::days(1), 100)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, quote.id);

        let active = db.reservations().list_by_stock(&key, true).await.unwrap();
        assert_eq!(active.len(), 2);
    }
}
