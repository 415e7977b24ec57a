//! # Journal Repository
//!
//! Append-only storage for [`JournalEntry`]. Rows are never updated except
//! to record an approval decision on a pending entry.
//!
//! ## Ordering
//! ```text
//! seq (INTEGER PRIMARY KEY AUTOINCREMENT)
//!   │
//!   ├── global append order, never reused
//!   └── per (product, warehouse): strictly increasing, the replay order
//!
//! Query results are newest first: created_at DESC, seq DESC
//! ```

use chrono::{DateTime, Utc};
use keel_core::stock::{JournalEntry, JournalKind, JournalStatus};
use keel_core::types::{PageRequest, ReferenceType, StockKey};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::{push_page, reference_from_columns, Where};

const COLUMNS: &str = "seq, id, product_id, warehouse_id, kind, quantity, reserved_delta, reason, \
     reference_id, reference_type, reservation_id, correlation_id, idempotency_key, status, \
     created_by, created_at, approved_by, approved_at, approval_notes";

#[derive(Debug, sqlx::FromRow)]
struct JournalRow {
    seq: i64,
    id: String,
    product_id: String,
    warehouse_id: String,
    kind: JournalKind,
    quantity: i64,
    reserved_delta: i64,
    reason: String,
    reference_id: Option<String>,
    reference_type: Option<ReferenceType>,
    reservation_id: Option<String>,
    correlation_id: Option<String>,
    idempotency_key: Option<String>,
    status: JournalStatus,
    created_by: String,
    created_at: DateTime<Utc>,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    approval_notes: Option<String>,
}

impl TryFrom<JournalRow> for JournalEntry {
    type Error = DbError;

    fn try_from(row: JournalRow) -> Result<Self, Self::Error> {
        Ok(JournalEntry {
            reference: reference_from_columns(
                "journal_entries",
                row.reference_id,
                row.reference_type,
            )?,
            id: row.id,
            seq: row.seq,
            product_id: row.product_id,
            warehouse_id: row.warehouse_id,
            kind: row.kind,
            quantity: row.quantity,
            reserved_delta: row.reserved_delta,
            reason: row.reason,
            reservation_id: row.reservation_id,
            correlation_id: row.correlation_id,
            idempotency_key: row.idempotency_key,
            status: row.status,
            created_by: row.created_by,
            created_at: row.created_at,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            approval_notes: row.approval_notes,
        })
    }
}

fn convert(rows: Vec<JournalRow>) -> DbResult<Vec<JournalEntry>> {
    rows.into_iter().map(JournalEntry::try_from).collect()
}

/// Filter for [`JournalRepository::query`] and [`JournalRepository::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalFilter {
    pub product_id: Option<String>,
    pub warehouse_id: Option<String>,
    pub kind: Option<JournalKind>,
    pub reference_id: Option<String>,
    pub reference_type: Option<ReferenceType>,
    pub correlation_id: Option<String>,
    pub status: Option<JournalStatus>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub to: Option<DateTime<Utc>>,
}

impl JournalFilter {
    fn push(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        let mut w = Where::new();
        if let Some(v) = &self.product_id {
            w.next(qb);
            qb.push("product_id = ").push_bind(v.clone());
        }
        if let Some(v) = &self.warehouse_id {
            w.next(qb);
            qb.push("warehouse_id = ").push_bind(v.clone());
        }
        if let Some(kind) = self.kind {
            w.next(qb);
            qb.push("kind = ").push_bind(kind);
        }
        if let Some(v) = &self.reference_id {
            w.next(qb);
            qb.push("reference_id = ").push_bind(v.clone());
        }
        if let Some(t) = self.reference_type {
            w.next(qb);
            qb.push("reference_type = ").push_bind(t);
        }
        if let Some(v) = &self.correlation_id {
            w.next(qb);
            qb.push("correlation_id = ").push_bind(v.clone());
        }
        if let Some(status) = self.status {
            w.next(qb);
            qb.push("status = ").push_bind(status);
        }
        if let Some(from) = self.from {
            w.next(qb);
            qb.push("created_at >= ").push_bind(from);
        }
        if let Some(to) = self.to {
            w.next(qb);
            qb.push("created_at < ").push_bind(to);
        }
    }
}

/// Counts and net movement over a filtered set of entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalStats {
    pub total: i64,
    pub by_kind: BTreeMap<String, i64>,
    pub by_status: BTreeMap<String, i64>,
    /// Σ on-hand deltas of approved entries.
    pub net_on_hand_delta: i64,
}

/// Repository for the transaction journal.
#[derive(Debug, Clone)]
pub struct JournalRepository {
    pool: SqlitePool,
}

impl JournalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        JournalRepository { pool }
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// A repeated idempotency key fails with
    /// `UniqueViolation { field: "idempotency_key" }`.
    pub async fn append(conn: &mut SqliteConnection, entry: &JournalEntry) -> DbResult<i64> {
        debug!(
            id = %entry.id,
            key = %entry.key(),
            kind = %entry.kind,
            quantity = entry.quantity,
            reserved_delta = entry.reserved_delta,
            "Appending journal entry"
        );

        let (reference_id, reference_type) = match &entry.reference {
            Some(r) => (Some(r.id.as_str()), Some(r.ref_type)),
            None => (None, None),
        };

        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO journal_entries (
                id, product_id, warehouse_id, kind, quantity, reserved_delta, reason,
                reference_id, reference_type, reservation_id, correlation_id, idempotency_key,
                status, created_by, created_at, approved_by, approved_at, approval_notes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            RETURNING seq
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.product_id)
        .bind(&entry.warehouse_id)
        .bind(entry.kind)
        .bind(entry.quantity)
        .bind(entry.reserved_delta)
        .bind(&entry.reason)
        .bind(reference_id)
        .bind(reference_type)
        .bind(&entry.reservation_id)
        .bind(&entry.correlation_id)
        .bind(&entry.idempotency_key)
        .bind(entry.status)
        .bind(&entry.created_by)
        .bind(entry.created_at)
        .bind(&entry.approved_by)
        .bind(entry.approved_at)
        .bind(&entry.approval_notes)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } if field.ends_with("idempotency_key") => {
                DbError::UniqueViolation {
                    field: "idempotency_key".to_string(),
                    value: entry.idempotency_key.clone().unwrap_or_default(),
                }
            }
            other => other,
        })?;

        Ok(seq)
    }

    /// Records the approval decision on a pending entry.
    pub async fn record_decision(conn: &mut SqliteConnection, entry: &JournalEntry) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE journal_entries SET
                status = ?2, approved_by = ?3, approved_at = ?4, approval_notes = ?5
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(&entry.id)
        .bind(entry.status)
        .bind(&entry.approved_by)
        .bind(entry.approved_at)
        .bind(&entry.approval_notes)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Pending journal entry", &entry.id));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<JournalEntry>> {
        Self::fetch(&self.pool, id).await
    }

    /// Fetches an entry through any executor.
    pub async fn fetch<'e, E: SqliteExecutor<'e>>(
        exec: E,
        id: &str,
    ) -> DbResult<Option<JournalEntry>> {
        let row = sqlx::query_as::<_, JournalRow>(&format!(
            "SELECT {} FROM journal_entries WHERE id = ?1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(exec)
        .await?;
        row.map(JournalEntry::try_from).transpose()
    }

    /// Entries written under one idempotency key. A ledger operation writes
    /// one entry per key; a transfer writes both legs under derived keys.
    pub async fn by_idempotency_key<'e, E: SqliteExecutor<'e>>(
        exec: E,
        key: &str,
    ) -> DbResult<Option<JournalEntry>> {
        let row = sqlx::query_as::<_, JournalRow>(&format!(
            "SELECT {} FROM journal_entries WHERE idempotency_key = ?1",
            COLUMNS
        ))
        .bind(key)
        .fetch_optional(exec)
        .await?;
        row.map(JournalEntry::try_from).transpose()
    }

    /// Filtered entries, newest first.
    pub async fn query(
        &self,
        filter: &JournalFilter,
        page: PageRequest,
    ) -> DbResult<(Vec<JournalEntry>, i64)> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM journal_entries", COLUMNS));
        filter.push(&mut qb);
        qb.push(" ORDER BY created_at DESC, seq DESC");
        push_page(&mut qb, page);
        let rows = qb.build_query_as::<JournalRow>().fetch_all(&self.pool).await?;

        let mut count: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM journal_entries");
        filter.push(&mut count);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        Ok((convert(rows)?, total))
    }

    /// Pending entries awaiting a decision, oldest first.
    pub async fn pending(&self, page: PageRequest) -> DbResult<(Vec<JournalEntry>, i64)> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM journal_entries WHERE status = 'pending' ORDER BY seq",
            COLUMNS
        ));
        push_page(&mut qb, page);
        let rows = qb.build_query_as::<JournalRow>().fetch_all(&self.pool).await?;
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM journal_entries WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok((convert(rows)?, total))
    }

    /// Every entry of one key in replay order.
    pub async fn entries_for_key<'e, E: SqliteExecutor<'e>>(
        exec: E,
        key: &StockKey,
    ) -> DbResult<Vec<JournalEntry>> {
        let rows = sqlx::query_as::<_, JournalRow>(&format!(
            "SELECT {} FROM journal_entries WHERE product_id = ?1 AND warehouse_id = ?2 ORDER BY seq",
            COLUMNS
        ))
        .bind(&key.product_id)
        .bind(&key.warehouse_id)
        .fetch_all(exec)
        .await?;
        convert(rows)
    }

    /// Σ (on-hand delta, reserved delta) of approved entries on a key.
    ///
    /// `kinds` restricts the sum when non-empty; `up_to` is an inclusive
    /// upper bound on `created_at`.
    pub async fn sum(
        &self,
        key: &StockKey,
        kinds: &[JournalKind],
        up_to: Option<DateTime<Utc>>,
    ) -> DbResult<(i64, i64)> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COALESCE(SUM(quantity), 0), COALESCE(SUM(reserved_delta), 0) \
             FROM journal_entries WHERE status = 'approved' AND product_id = ",
        );
        qb.push_bind(key.product_id.clone())
            .push(" AND warehouse_id = ")
            .push_bind(key.warehouse_id.clone());
        if !kinds.is_empty() {
            qb.push(" AND kind IN (");
            let mut separated = qb.separated(", ");
            for kind in kinds {
                separated.push_bind(*kind);
            }
            separated.push_unseparated(")");
        }
        if let Some(up_to) = up_to {
            qb.push(" AND created_at <= ").push_bind(up_to);
        }
        let sums = qb
            .build_query_as::<(i64, i64)>()
            .fetch_one(&self.pool)
            .await?;
        Ok(sums)
    }

    pub async fn stats(&self, filter: &JournalFilter) -> DbResult<JournalStats> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT kind, status, COUNT(*), \
             COALESCE(SUM(CASE WHEN status = 'approved' THEN quantity ELSE 0 END), 0) \
             FROM journal_entries",
        );
        filter.push(&mut qb);
        qb.push(" GROUP BY kind, status");
        let groups = qb
            .build_query_as::<(JournalKind, JournalStatus, i64, i64)>()
            .fetch_all(&self.pool)
            .await?;

        let mut stats = JournalStats::default();
        for (kind, status, count, net) in groups {
            stats.total += count;
            *stats.by_kind.entry(kind.to_string()).or_insert(0) += count;
            *stats.by_status.entry(status.to_string()).or_insert(0) += count;
            stats.net_on_hand_delta += net;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, seeded};
    use keel_core::stock::Decision;
    use keel_core::types::Reference;

    async fn append(db: &crate::Database, entry: &JournalEntry) -> DbResult<i64> {
        let mut tx = db.begin().await?;
        let seq = JournalRepository::append(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(seq)
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_seq() {
        let db = memory_db().await;
        let (p, w) = seeded(&db).await;
        let key = StockKey::new(&p.id, &w.id);
        let now = Utc::now();

        let a = JournalEntry::new(&key, JournalKind::Adjust, 10, 0, "count", "t", now);
        let b = JournalEntry::new(&key, JournalKind::Reserve, 0, 3, "order", "t", now)
            .with_reference(Some(Reference::order("o1")));
        let sa = append(&db, &a).await.unwrap();
        let sb = append(&db, &b).await.unwrap();
        assert!(sb > sa);

        let entries = JournalRepository::entries_for_key(db.pool(), &key).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, sa);
        assert_eq!(entries[1].reference, Some(Reference::order("o1")));
        assert_eq!(keel_core::stock::replay(&entries), (10, 3));
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key() {
        let db = memory_db().await;
        let (p, w) = seeded(&db).await;
        let key = StockKey::new(&p.id, &w.id);
        let now = Utc::now();

        let a = JournalEntry::new(&key, JournalKind::Adjust, 1, 0, "r", "t", now)
            .with_idempotency_key(Some("k-1".into()));
        let b = JournalEntry::new(&key, JournalKind::Adjust, 1, 0, "r", "t", now)
            .with_idempotency_key(Some("k-1".into()));
        append(&db, &a).await.unwrap();
        match append(&db, &b).await.unwrap_err() {
            DbError::UniqueViolation { field, value } => {
                assert_eq!(field, "idempotency_key");
                assert_eq!(value, "k-1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decision_and_sums() {
        let db = memory_db().await;
        let (p, w) = seeded(&db).await;
        let key = StockKey::new(&p.id, &w.id);
        let now = Utc::now();

        append(&db, &JournalEntry::new(&key, JournalKind::Restock, 20, 0, "po", "t", now))
            .await
            .unwrap();
        let pending =
            JournalEntry::new(&key, JournalKind::Adjust, -15, 0, "shrinkage", "t", now).pending();
        append(&db, &pending).await.unwrap();

        assert_eq!(db.journal().sum(&key, &[], None).await.unwrap(), (20, 0));
        let (waiting, total) = db.journal().pending(PageRequest::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(waiting[0].id, pending.id);

        let decided = pending
            .decide(Decision::Approve, "manager", Some("ok".into()), Utc::now())
            .unwrap();
        let mut tx = db.begin().await.unwrap();
        JournalRepository::record_decision(&mut tx, &decided).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(db.journal().sum(&key, &[], None).await.unwrap(), (5, 0));
        assert_eq!(
            db.journal()
                .sum(&key, &[JournalKind::Restock], None)
                .await
                .unwrap(),
            (20, 0)
        );

        let mut tx = db.begin().await.unwrap();
        let err = JournalRepository::record_decision(&mut tx, &decided)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_query_newest_first_and_stats() {
        let db = memory_db().await;
        let (p, w) = seeded(&db).await;
        let key = StockKey::new(&p.id, &w.id);
        let t0 = Utc::now();

        for (i, kind) in [JournalKind::Restock, JournalKind::Adjust, JournalKind::Adjust]
            .into_iter()
            .enumerate()
        {
            let at = t0 + chrono::Duration::seconds(i as i64);
            append(&db, &JournalEntry::new(&key, kind, 5, 0, "r", "t", at))
                .await
                .unwrap();
        }

        let filter = JournalFilter {
            kind: Some(JournalKind::Adjust),
            ..Default::default()
        };
        let (entries, total) = db.journal().query(&filter, PageRequest::default()).await.unwrap();
        assert_eq!(total, 2);
        assert!(entries[0].created_at > entries[1].created_at);

        let stats = db.journal().stats(&JournalFilter::default()).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind.get("ADJUST"), Some(&2));
        assert_eq!(stats.by_status.get("approved"), Some(&3));
        assert_eq!(stats.net_on_hand_delta, 15);
    }
}
