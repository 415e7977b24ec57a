//! # Transaction Journal
//!
//! Read side of the journal plus the approval workflow for pending entries.
//! Entries are written only by the ledger; this service never inserts.
//!
//! ## Approval
//! ```text
//!            adjust(delta ≤ −threshold)
//!                       │
//!                       ▼
//!                ┌────────────┐  approve (under key lock) ┌──────────┐
//!                │  PENDING   │──────────────────────────►│ APPROVED │─► record updated
//!                │ no effect  │                           └──────────┘
//!                └─────┬──────┘  reject                   ┌──────────┐
//!                      └─────────────────────────────────►│ REJECTED │─► kept for audit
//!                                                         └──────────┘
//! ```
//!
//! An approval that would break the record's invariants fails and leaves
//! the entry pending.

use chrono::{DateTime, Utc};
use keel_core::stock::{replay, Decision, JournalEntry, JournalKind, JournalStatus, PRIORITY_DEFAULT};
use keel_core::types::{Page, PageRequest, Product, StockKey};
use keel_core::validation::validate_text;
use keel_db::{JournalFilter, JournalRepository, JournalStats, StockRepository};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{info, instrument};

use crate::config::LedgerSettings;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Effects, StockMovement, StockTx};
use crate::shared::Shared;

/// Result of rebuilding a record from its journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub product_id: String,
    pub warehouse_id: String,
    pub entries: usize,
    pub replayed_on_hand: i64,
    pub replayed_reserved: i64,
    /// Live values; `None` when no record exists yet.
    pub live_on_hand: Option<i64>,
    pub live_reserved: Option<i64>,
    pub consistent: bool,
}

#[derive(Debug, Clone)]
pub struct TransactionJournal {
    shared: Shared,
    settings: LedgerSettings,
}

impl TransactionJournal {
    pub fn new(shared: Shared, settings: LedgerSettings) -> Self {
        TransactionJournal { shared, settings }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Newest first.
    pub async fn query(&self, filter: &JournalFilter, page: PageRequest) -> EngineResult<Page<JournalEntry>> {
        let (items, total) = self.shared.db.journal().query(filter, page).await?;
        Ok(Page::new(items, total, page))
    }

    pub async fn get(&self, id: &str) -> EngineResult<JournalEntry> {
        self.shared
            .db
            .journal()
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Journal entry", id))
    }

    /// Entries awaiting approval, oldest first.
    pub async fn pending(&self, page: PageRequest) -> EngineResult<Page<JournalEntry>> {
        let (items, total) = self.shared.db.journal().pending(page).await?;
        Ok(Page::new(items, total, page))
    }

    pub async fn stats(&self, filter: &JournalFilter) -> EngineResult<JournalStats> {
        Ok(self.shared.db.journal().stats(filter).await?)
    }

    /// Σ of approved deltas on a key, optionally limited to some kinds and
    /// to entries created at or before `up_to`.
    pub async fn sum(
        &self,
        key: &StockKey,
        kinds: &[JournalKind],
        up_to: Option<DateTime<Utc>>,
    ) -> EngineResult<(i64, i64)> {
        Ok(self.shared.db.journal().sum(key, kinds, up_to).await?)
    }

    /// Rebuilds a key's quantities from its approved entries and compares
    /// them with the live record.
    ///
    /// Reads under the key lock so the two sides are from the same commit.
    pub async fn replay(&self, ctx: &RequestContext, key: &StockKey) -> EngineResult<Reconciliation> {
        let _guard = self.shared.locks.acquire_stock(ctx, key).await?;
        let mut conn = self.shared.db.pool().acquire().await?;
        let entries = JournalRepository::entries_for_key(&mut *conn, key).await?;
        let record = StockRepository::load(&mut *conn, key).await?;

        let (on_hand, reserved) = replay(&entries);
        let (live_on_hand, live_reserved) = match &record {
            Some(r) => (Some(r.on_hand), Some(r.reserved)),
            None => (None, None),
        };
        let consistent = match &record {
            Some(r) => r.on_hand == on_hand && r.reserved == reserved,
            None => on_hand == 0 && reserved == 0,
        };
        Ok(Reconciliation {
            product_id: key.product_id.clone(),
            warehouse_id: key.warehouse_id.clone(),
            entries: entries.len(),
            replayed_on_hand: on_hand,
            replayed_reserved: reserved,
            live_on_hand,
            live_reserved,
            consistent,
        })
    }

    // =========================================================================
    // Approval
    // =========================================================================

    pub async fn approve(
        &self,
        ctx: &RequestContext,
        id: &str,
        notes: Option<String>,
    ) -> EngineResult<StockMovement> {
        self.decide(ctx, id, Decision::Approve, notes).await
    }

    pub async fn reject(
        &self,
        ctx: &RequestContext,
        id: &str,
        notes: Option<String>,
    ) -> EngineResult<StockMovement> {
        self.decide(ctx, id, Decision::Reject, notes).await
    }

    /// Decides a pending entry. Approval applies the delta under the key
    /// lock; rejection only records the decision.
    #[instrument(skip_all, fields(entry_id = %id, ?decision, correlation_id = %ctx.correlation_id))]
    pub async fn decide(
        &self,
        ctx: &RequestContext,
        id: &str,
        decision: Decision,
        notes: Option<String>,
    ) -> EngineResult<StockMovement> {
        let action = match decision {
            Decision::Approve => "journal.approve",
            Decision::Reject => "journal.reject",
        };
        let details = json!({ "decision": decision, "notes": notes });
        let result = async {
            validate_text("notes", notes.as_deref(), 1000)?;
            let seen = self.get(id).await?;
            let product = self.shared.catalog.require(&seen.product_id).await?;
            let key = seen.key();
            let (product, key, notes) = (&product, &key, &notes);
            self.shared
                .retry
                .run(action, move || async move {
                    let locks = Shared::stock_lock_keys(ctx, [key.clone()]);
                    let _guard = self.shared.locks.acquire(ctx, locks, PRIORITY_DEFAULT).await?;
                    let mut tx = self.shared.db.begin().await?;
                    let (movement, effects) = ctx
                        .run(
                            action,
                            self.settings.hard_limit(),
                            self.decide_in(&mut tx, ctx, id, decision, notes.clone(), product),
                        )
                        .await?;
                    tx.commit().await?;
                    self.shared.publish(effects);
                    Ok(movement)
                })
                .await
        }
        .await;

        if let Ok(movement) = &result {
            info!(
                entry_id = %movement.entry.id,
                status = %movement.entry.status,
                approver = %ctx.actor,
                "Journal entry decided"
            );
        }
        self.shared.sinks.conclude(ctx, action, id, details, result)
    }

    async fn decide_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        id: &str,
        decision: Decision,
        notes: Option<String>,
        product: &Product,
    ) -> EngineResult<(StockMovement, Effects)> {
        let entry = JournalRepository::fetch(&mut *conn, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Journal entry", id))?;
        let now = Utc::now();
        let decided = entry.decide(decision, &ctx.actor, notes, now)?;

        let mut stx = StockTx::new(conn, ctx, now);
        let movement = match decided.status {
            JournalStatus::Approved => stx.approve(product, decided).await?,
            _ => {
                JournalRepository::record_decision(stx.conn(), &decided).await?;
                let record = stx.record(&decided.key(), product).await?;
                StockMovement {
                    entry: decided,
                    record,
                }
            }
        };
        Ok((movement, stx.into_effects()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AdjustRequest;
    use crate::testing::TestEngine;
    use keel_core::ErrorCode;

    fn shrink(t: &TestEngine, delta: i64) -> AdjustRequest {
        AdjustRequest {
            product_id: t.product.id.clone(),
            warehouse_id: t.warehouse.id.clone(),
            delta,
            reason: "damaged pallet".into(),
            reference: None,
        }
    }

    #[tokio::test]
    async fn test_approve_applies_delta() {
        let t = TestEngine::with_approval_threshold(50).await;
        let ctx = RequestContext::new("clerk");
        t.stock(100).await;
        let pending = t.engine.ledger.adjust(&ctx, shrink(&t, -60)).await.unwrap();

        let listed = t.engine.journal.pending(PageRequest::default()).await.unwrap();
        assert_eq!(listed.total, 1);
        assert_eq!(listed.items[0].id, pending.entry.id);

        let manager = RequestContext::new("manager");
        let approved = t
            .engine
            .journal
            .approve(&manager, &pending.entry.id, Some("confirmed".into()))
            .await
            .unwrap();
        assert_eq!(approved.entry.status, JournalStatus::Approved);
        assert_eq!(approved.entry.approved_by.as_deref(), Some("manager"));
        assert_eq!(approved.record.on_hand, 40);

        let rec = t.engine.journal.replay(&ctx, &t.key()).await.unwrap();
        assert!(rec.consistent);
        assert_eq!(rec.replayed_on_hand, 40);

        let err = t
            .engine
            .journal
            .approve(&manager, &pending.entry.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
    }

    #[tokio::test]
    async fn test_reject_keeps_entry_without_effect() {
        let t = TestEngine::with_approval_threshold(50).await;
        let ctx = RequestContext::new("clerk");
        t.stock(100).await;
        let pending = t.engine.ledger.adjust(&ctx, shrink(&t, -70)).await.unwrap();

        let rejected = t
            .engine
            .journal
            .reject(&ctx, &pending.entry.id, Some("miscount".into()))
            .await
            .unwrap();
        assert_eq!(rejected.entry.status, JournalStatus::Rejected);
        assert_eq!(rejected.record.on_hand, 100);

        let stored = t.engine.journal.get(&pending.entry.id).await.unwrap();
        assert_eq!(stored.status, JournalStatus::Rejected);
        assert_eq!(stored.approval_notes.as_deref(), Some("miscount"));

        let stats = t.engine.journal.stats(&JournalFilter::default()).await.unwrap();
        assert_eq!(stats.by_status.get("rejected"), Some(&1));
        assert_eq!(stats.net_on_hand_delta, 100);
        assert!(t.engine.journal.replay(&ctx, &t.key()).await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_approval_that_no_longer_fits_stays_pending() {
        let t = TestEngine::with_approval_threshold(50).await;
        let ctx = RequestContext::new("clerk");
        t.stock(100).await;
        let pending = t.engine.ledger.adjust(&ctx, shrink(&t, -60)).await.unwrap();
        t.engine.ledger.adjust(&ctx, shrink(&t, -45)).await.unwrap();

        let err = t
            .engine
            .journal
            .approve(&ctx, &pending.entry.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientStock);
        let stored = t.engine.journal.get(&pending.entry.id).await.unwrap();
        assert_eq!(stored.status, JournalStatus::Pending);
    }

    #[tokio::test]
    async fn test_query_and_sum() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("clerk");
        t.stock(10).await;
        t.engine.ledger.adjust(&ctx, shrink(&t, -3)).await.unwrap();

        let page = t
            .engine
            .journal
            .query(
                &JournalFilter {
                    product_id: Some(t.product.id.clone()),
                    kind: Some(JournalKind::Adjust),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].quantity, -3);

        let (on_hand, _) = t.engine.journal.sum(&t.key(), &[], None).await.unwrap();
        assert_eq!(on_hand, 7);
        let (restocked, _) = t
            .engine
            .journal
            .sum(&t.key(), &[JournalKind::Restock], None)
            .await
            .unwrap();
        assert_eq!(restocked, 10);

        let err = t.engine.journal.get("missing").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
