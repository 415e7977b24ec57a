//! # Stock Ledger
//!
//! Per-(product, warehouse) on-hand and reserved quantities. Every mutation
//! is one unit of work that writes the stock record, the reservation (if
//! any) and exactly one journal entry per logical act, all in one SQLite
//! transaction.
//!
//! ## Unit of Work
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  retry.run(op) ──────────────────────────────────────────────┐          │
//! │    │                                                         │ Busy     │
//! │    ▼                                                         │          │
//! │  locks.acquire(sorted keys, priority)                        │          │
//! │    │                                                         │          │
//! │    ▼                                                         │          │
//! │  BEGIN ─► replay check ─► load ─► check_* ─► save + append ──┘          │
//! │    │      (idempotency)            (keel-core)                          │
//! │    ▼                                                                    │
//! │  COMMIT ─► publish StockChange ─► AlertEngine queue                     │
//! │         └► audit event ─────────► Sinks                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All locks are taken before `BEGIN`, and no pool connection is acquired
//! while a transaction is open.

use chrono::{DateTime, Utc};
use keel_core::stock::{
    check_adjust, check_reserve, check_transfer_out, Drawdown, JournalEntry, JournalKind,
    Reservation, StockChange, StockRecord, PRIORITY_DEFAULT,
};
use keel_core::types::{
    new_id, Page, PageRequest, Product, Reference, ReferenceType, StockKey, Warehouse,
};
use keel_core::validation::{
    validate_delta, validate_priority, validate_quantity, validate_reason,
};
use keel_core::{CoreError, ErrorCode, ValidationError, ValidationErrors};
use keel_db::{
    JournalRepository, ReservationRepository, StockFilter, StockRepository, StockTotals,
    WarehouseRepository,
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::config::LedgerSettings;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::shared::Shared;
use crate::sinks::audit_details as details;

/// Largest batch accepted by [`StockLedger::bulk_adjust`].
pub const MAX_BULK_ITEMS: usize = 100;

fn default_priority() -> i64 {
    PRIORITY_DEFAULT as i64
}

// =============================================================================
// Requests
// =============================================================================

/// Signed change to on-hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustRequest {
    pub product_id: String,
    pub warehouse_id: String,
    pub delta: i64,
    pub reason: String,
    #[serde(default)]
    pub reference: Option<Reference>,
}

impl AdjustRequest {
    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product_id, &self.warehouse_id)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        errs.check(validate_delta(self.delta));
        errs.check(validate_reason(&self.reason));
        errs.into_result()
    }
}

/// Inbound goods (receipts, returns put back on the shelf).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestockRequest {
    pub product_id: String,
    pub warehouse_id: String,
    pub quantity: i64,
    pub reason: String,
    #[serde(default)]
    pub reference: Option<Reference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub product_id: String,
    pub warehouse_id: String,
    pub quantity: i64,
    /// 1 (most urgent) to 10.
    #[serde(default = "default_priority")]
    pub priority: i64,
    pub reason: String,
    #[serde(default)]
    pub reference: Option<Reference>,
}

/// Release or consume part of a reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownRequest {
    pub quantity: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub product_id: String,
    pub from_warehouse_id: String,
    pub to_warehouse_id: String,
    pub quantity: i64,
    pub reason: String,
    #[serde(default)]
    pub reference: Option<Reference>,
}

impl TransferRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        errs.check(validate_quantity("quantity", self.quantity));
        errs.check(validate_reason(&self.reason));
        if self.from_warehouse_id == self.to_warehouse_id {
            errs.push(ValidationError::Invalid {
                field: "to_warehouse_id".into(),
                reason: "must differ from from_warehouse_id".into(),
            });
        }
        errs.into_result()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// A journal entry and the record it left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMovement {
    pub entry: JournalEntry,
    pub record: StockRecord,
}

/// A reservation change with its journal entry and resulting record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationMovement {
    pub reservation: Reservation,
    pub entry: JournalEntry,
    pub record: StockRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub transfer_id: String,
    pub out_entry: JournalEntry,
    pub in_entry: JournalEntry,
    pub source: StockRecord,
    pub destination: StockRecord,
}

/// One warehouse's share of an availability check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseAvailability {
    pub warehouse_id: String,
    pub on_hand: i64,
    pub reserved: i64,
    pub available: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Availability {
    pub product_id: String,
    pub requested: i64,
    pub total_available: i64,
    pub allow_backorder: bool,
    /// True when one warehouse can cover the request, or backorder is on.
    pub can_fulfill: bool,
    /// First warehouse whose available covers the request.
    pub fulfilling_warehouse_id: Option<String>,
    pub warehouses: Vec<WarehouseAvailability>,
}

/// Why one bulk item failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkAdjustResult {
    pub index: usize,
    pub product_id: String,
    pub warehouse_id: String,
    pub outcome: Result<JournalEntry, BulkFailure>,
}

// =============================================================================
// Transaction-scoped Operations
// =============================================================================

/// What a unit of work did, published after commit.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub changes: Vec<StockChange>,
    pub entries: Vec<JournalEntry>,
}

/// Reason, reference and idempotency key of one movement.
#[derive(Debug, Clone)]
pub(crate) struct Cause {
    pub reason: String,
    pub reference: Option<Reference>,
    pub idempotency_key: Option<String>,
}

impl Cause {
    pub(crate) fn new(reason: impl Into<String>, reference: Option<Reference>) -> Self {
        Cause {
            reason: reason.into(),
            reference,
            idempotency_key: None,
        }
    }

    pub(crate) fn keyed(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }
}

/// How much of a reservation to draw down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Amount {
    Exact(i64),
    Remaining,
}

/// Ledger operations bound to an open transaction.
///
/// The caller holds the stock locks for every key touched.
pub(crate) struct StockTx<'c> {
    conn: &'c mut SqliteConnection,
    actor: String,
    correlation_id: String,
    now: DateTime<Utc>,
    effects: Effects,
}

impl<'c> StockTx<'c> {
    pub(crate) fn new(conn: &'c mut SqliteConnection, ctx: &RequestContext, now: DateTime<Utc>) -> Self {
        StockTx {
            conn,
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
            now,
            effects: Effects::default(),
        }
    }

    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.conn
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn into_effects(self) -> Effects {
        self.effects
    }

    pub(crate) async fn active_warehouse(&mut self, id: &str) -> EngineResult<Warehouse> {
        let warehouse = WarehouseRepository::fetch(&mut *self.conn, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Warehouse", id))?;
        if !warehouse.is_active {
            return Err(CoreError::WarehouseInactive {
                warehouse_id: id.to_string(),
            }
            .into());
        }
        Ok(warehouse)
    }

    /// Current record, or an empty one seeded with the product's levels.
    pub(crate) async fn record(&mut self, key: &StockKey, product: &Product) -> EngineResult<StockRecord> {
        Ok(match StockRepository::load(&mut *self.conn, key).await? {
            Some(record) => record,
            None => StockRecord::empty(
                key,
                product.min_stock_level,
                product.max_stock_level,
                self.now,
            ),
        })
    }

    async fn existing_record(&mut self, key: &StockKey) -> EngineResult<StockRecord> {
        StockRepository::load(&mut *self.conn, key)
            .await?
            .ok_or_else(|| EngineError::Core(CoreError::Invariant(format!("no stock record for {}", key))))
    }

    pub(crate) async fn reservation(&mut self, id: &str) -> EngineResult<Reservation> {
        ReservationRepository::fetch(&mut *self.conn, id)
            .await?
            .ok_or_else(|| EngineError::not_found("Reservation", id))
    }

    fn entry(
        &self,
        key: &StockKey,
        kind: JournalKind,
        quantity: i64,
        reserved_delta: i64,
        cause: &Cause,
    ) -> JournalEntry {
        JournalEntry::new(key, kind, quantity, reserved_delta, &cause.reason, &self.actor, self.now)
            .with_reference(cause.reference.clone())
            .with_correlation(&self.correlation_id)
            .with_idempotency_key(cause.idempotency_key.clone())
    }

    /// Saves `after`, appends `entry` and remembers the change.
    async fn write(
        &mut self,
        before: &StockRecord,
        after: StockRecord,
        mut entry: JournalEntry,
    ) -> EngineResult<StockMovement> {
        StockRepository::save(&mut *self.conn, &after).await?;
        entry.seq = JournalRepository::append(&mut *self.conn, &entry).await?;
        debug!(
            kind = %entry.kind,
            key = %after.key(),
            seq = entry.seq,
            on_hand = after.on_hand,
            reserved = after.reserved,
            "Journaled stock movement"
        );
        self.effects
            .changes
            .push(StockChange::between(entry.kind, before, &after));
        self.effects.entries.push(entry.clone());
        Ok(StockMovement { entry, record: after })
    }

    /// ADJUST or RESTOCK of on-hand.
    pub(crate) async fn adjust(
        &mut self,
        product: &Product,
        warehouse_id: &str,
        kind: JournalKind,
        delta: i64,
        cause: Cause,
    ) -> EngineResult<StockMovement> {
        self.active_warehouse(warehouse_id).await?;
        let key = StockKey::new(&product.id, warehouse_id);
        let before = self.record(&key, product).await?;
        let after = check_adjust(&before, delta, product.allow_backorder, self.now)?;
        let entry = self.entry(&key, kind, delta, 0, &cause);
        self.write(&before, after, entry).await
    }

    /// Journals an adjustment as pending without touching the record.
    pub(crate) async fn propose(
        &mut self,
        product: &Product,
        warehouse_id: &str,
        delta: i64,
        cause: Cause,
    ) -> EngineResult<StockMovement> {
        self.active_warehouse(warehouse_id).await?;
        let key = StockKey::new(&product.id, warehouse_id);
        let record = self.record(&key, product).await?;
        let mut entry = self.entry(&key, JournalKind::Adjust, delta, 0, &cause).pending();
        entry.seq = JournalRepository::append(&mut *self.conn, &entry).await?;
        debug!(entry_id = %entry.id, delta, key = %key, "Adjustment awaits approval");
        Ok(StockMovement { entry, record })
    }

    /// Applies an approved pending entry. `decided` is the entry after the
    /// decision.
    pub(crate) async fn approve(
        &mut self,
        product: &Product,
        decided: JournalEntry,
    ) -> EngineResult<StockMovement> {
        self.active_warehouse(&decided.warehouse_id).await?;
        let key = decided.key();
        let before = self.record(&key, product).await?;
        let after = check_adjust(&before, decided.quantity, product.allow_backorder, self.now)?;
        StockRepository::save(&mut *self.conn, &after).await?;
        JournalRepository::record_decision(&mut *self.conn, &decided).await?;
        self.effects
            .changes
            .push(StockChange::between(decided.kind, &before, &after));
        self.effects.entries.push(decided.clone());
        Ok(StockMovement {
            entry: decided,
            record: after,
        })
    }

    pub(crate) async fn reserve(
        &mut self,
        product: &Product,
        warehouse_id: &str,
        quantity: i64,
        priority: u8,
        cause: Cause,
    ) -> EngineResult<ReservationMovement> {
        self.active_warehouse(warehouse_id).await?;
        let key = StockKey::new(&product.id, warehouse_id);
        let before = self.record(&key, product).await?;
        let after = check_reserve(&before, quantity, product.allow_backorder, self.now)?;
        // The reservation row references the stock record.
        StockRepository::save(&mut *self.conn, &after).await?;

        let reservation = Reservation::new(
            &key,
            quantity,
            priority,
            &cause.reason,
            cause.reference.clone(),
            &self.actor,
            self.now,
        );
        ReservationRepository::insert(&mut *self.conn, &reservation).await?;

        let entry = self
            .entry(&key, JournalKind::Reserve, 0, quantity, &cause)
            .with_reservation(&reservation.id);
        let movement = self.write(&before, after, entry).await?;
        Ok(ReservationMovement {
            reservation,
            entry: movement.entry,
            record: movement.record,
        })
    }

    /// Releases, expires or consumes part of a reservation.
    pub(crate) async fn draw_down(
        &mut self,
        reservation: &Reservation,
        amount: Amount,
        how: Drawdown,
        allow_backorder: bool,
        cause: Cause,
    ) -> EngineResult<ReservationMovement> {
        let quantity = match amount {
            Amount::Exact(q) => q,
            Amount::Remaining => reservation.remaining,
        };
        if how == Drawdown::Consume {
            self.active_warehouse(&reservation.warehouse_id).await?;
        }
        let next = reservation.draw_down(quantity, how, self.now)?;

        let key = reservation.key();
        let before = self.existing_record(&key).await?;
        let (kind, on_hand_delta) = match how {
            Drawdown::Consume => (JournalKind::Shipment, -quantity),
            Drawdown::Release | Drawdown::Expire => (JournalKind::Release, 0),
        };
        // Lowering reserved alone cannot uncover a reservation.
        let backorder = allow_backorder || how != Drawdown::Consume;
        let after = before.apply(on_hand_delta, -quantity, backorder, self.now)?;
        ReservationRepository::update(&mut *self.conn, &next).await?;

        let entry = self
            .entry(&key, kind, on_hand_delta, -quantity, &cause)
            .with_reservation(&reservation.id);
        let movement = self.write(&before, after, entry).await?;
        Ok(ReservationMovement {
            reservation: next,
            entry: movement.entry,
            record: movement.record,
        })
    }

    pub(crate) async fn transfer(
        &mut self,
        product: &Product,
        from_warehouse_id: &str,
        to_warehouse_id: &str,
        quantity: i64,
        cause: Cause,
    ) -> EngineResult<TransferOutcome> {
        self.active_warehouse(from_warehouse_id).await?;
        self.active_warehouse(to_warehouse_id).await?;

        let from = StockKey::new(&product.id, from_warehouse_id);
        let to = StockKey::new(&product.id, to_warehouse_id);
        let source_before = self.record(&from, product).await?;
        let source_after = check_transfer_out(&source_before, quantity, self.now)?;
        let dest_before = self.record(&to, product).await?;
        let dest_after = dest_before.apply(quantity, 0, product.allow_backorder, self.now)?;

        let transfer_id = new_id();
        let reference = cause
            .reference
            .clone()
            .or_else(|| Some(Reference::new(&transfer_id, ReferenceType::Transfer)));
        let leg = |suffix: &str| Cause {
            reason: cause.reason.clone(),
            reference: reference.clone(),
            idempotency_key: cause
                .idempotency_key
                .as_ref()
                .map(|k| format!("{}:{}", k, suffix)),
        };

        let out_entry = self
            .entry(&from, JournalKind::TransferOut, -quantity, 0, &leg("out"))
            .with_correlation(&transfer_id);
        let in_entry = self
            .entry(&to, JournalKind::TransferIn, quantity, 0, &leg("in"))
            .with_correlation(&transfer_id);

        let out = self.write(&source_before, source_after, out_entry).await?;
        let inn = self.write(&dest_before, dest_after, in_entry).await?;
        Ok(TransferOutcome {
            transfer_id,
            out_entry: out.entry,
            in_entry: inn.entry,
            source: out.record,
            destination: inn.record,
        })
    }

    /// Journals units leaving the books without a stock movement.
    pub(crate) async fn write_off(
        &mut self,
        key: &StockKey,
        quantity: i64,
        cause: Cause,
    ) -> EngineResult<JournalEntry> {
        let cause = Cause {
            reason: format!("written off: {} x {}", quantity, cause.reason),
            ..cause
        };
        let mut entry = self.entry(key, JournalKind::Adjust, 0, 0, &cause);
        entry.seq = JournalRepository::append(&mut *self.conn, &entry).await?;
        self.effects.entries.push(entry.clone());
        Ok(entry)
    }
}

/// The entry already written under the caller's idempotency key, if any.
///
/// A key reused for a different movement is a conflict.
pub(crate) async fn replayed(
    conn: &mut SqliteConnection,
    key: Option<&str>,
    same: impl FnOnce(&JournalEntry) -> bool,
) -> EngineResult<Option<JournalEntry>> {
    let Some(key) = key else {
        return Ok(None);
    };
    match JournalRepository::by_idempotency_key(&mut *conn, key).await? {
        None => Ok(None),
        Some(entry) if same(&entry) => {
            debug!(idempotency_key = key, entry_id = %entry.id, "Replaying stock operation");
            Ok(Some(entry))
        }
        Some(_) => Err(EngineError::IdempotencyMismatch {
            key: key.to_string(),
        }),
    }
}

async fn current_record(
    conn: &mut SqliteConnection,
    key: &StockKey,
    product: &Product,
) -> EngineResult<StockRecord> {
    Ok(StockRepository::load(&mut *conn, key).await?.unwrap_or_else(|| {
        StockRecord::empty(key, product.min_stock_level, product.max_stock_level, Utc::now())
    }))
}

// =============================================================================
// Stock Ledger
// =============================================================================

/// Public face of the ledger.
#[derive(Debug, Clone)]
pub struct StockLedger {
    shared: Shared,
    settings: LedgerSettings,
}

impl StockLedger {
    pub fn new(shared: Shared, settings: LedgerSettings) -> Self {
        StockLedger { shared, settings }
    }

    // =========================================================================
    // Adjust / Restock
    // =========================================================================

    /// Changes on-hand by a signed delta. Large decreases are journaled as
    /// pending and change nothing until approved.
    #[instrument(skip_all, fields(
        product_id = %req.product_id,
        warehouse_id = %req.warehouse_id,
        correlation_id = %ctx.correlation_id
    ))]
    pub async fn adjust(&self, ctx: &RequestContext, req: AdjustRequest) -> EngineResult<StockMovement> {
        let result = async {
            req.validate()?;
            let product = self.shared.tracked_product(&req.product_id).await?;
            let (req, product) = (&req, &product);
            self.shared
                .retry
                .run("ledger.adjust", move || self.adjust_once(ctx, req, product))
                .await
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "ledger.adjust", &req.key().to_string(), details(&req), result)
    }

    async fn adjust_once(
        &self,
        ctx: &RequestContext,
        req: &AdjustRequest,
        product: &Product,
    ) -> EngineResult<StockMovement> {
        let keys = Shared::stock_lock_keys(ctx, [req.key()]);
        let _guard = self.shared.locks.acquire(ctx, keys, PRIORITY_DEFAULT).await?;
        let mut tx = self.shared.db.begin().await?;
        let (movement, effects) = ctx
            .run(
                "ledger.adjust",
                self.settings.hard_limit(),
                self.adjust_in(&mut tx, ctx, req, product),
            )
            .await?;
        tx.commit().await?;
        self.shared.publish(effects);
        Ok(movement)
    }

    async fn adjust_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        req: &AdjustRequest,
        product: &Product,
    ) -> EngineResult<(StockMovement, Effects)> {
        let same = |e: &JournalEntry| {
            e.kind == JournalKind::Adjust
                && e.key() == req.key()
                && e.quantity == req.delta
                && e.reason == req.reason
        };
        if let Some(entry) = replayed(conn, ctx.idempotency_key.as_deref(), same).await? {
            let record = current_record(conn, &req.key(), product).await?;
            return Ok((StockMovement { entry, record }, Effects::default()));
        }

        let cause = Cause::new(&req.reason, req.reference.clone()).keyed(ctx.idempotency_key.clone());
        let mut stx = StockTx::new(conn, ctx, Utc::now());
        let movement = if self.settings.requires_approval(req.delta) {
            stx.propose(product, &req.warehouse_id, req.delta, cause).await?
        } else {
            stx.adjust(product, &req.warehouse_id, JournalKind::Adjust, req.delta, cause)
                .await?
        };
        Ok((movement, stx.into_effects()))
    }

    /// Books inbound goods as a RESTOCK entry.
    #[instrument(skip_all, fields(
        product_id = %req.product_id,
        warehouse_id = %req.warehouse_id,
        correlation_id = %ctx.correlation_id
    ))]
    pub async fn restock(&self, ctx: &RequestContext, req: RestockRequest) -> EngineResult<StockMovement> {
        let key = StockKey::new(&req.product_id, &req.warehouse_id);
        let result = async {
            let mut errs = ValidationErrors::new();
            errs.check(validate_quantity("quantity", req.quantity));
            errs.check(validate_reason(&req.reason));
            errs.into_result()?;
            let product = self.shared.tracked_product(&req.product_id).await?;
            let (req, product, key) = (&req, &product, &key);
            self.shared
                .retry
                .run("ledger.restock", move || async move {
                    let locks = Shared::stock_lock_keys(ctx, [key.clone()]);
                    let _guard = self.shared.locks.acquire(ctx, locks, PRIORITY_DEFAULT).await?;
                    let mut tx = self.shared.db.begin().await?;
                    let (movement, effects) = ctx
                        .run(
                            "ledger.restock",
                            self.settings.hard_limit(),
                            self.restock_in(&mut tx, ctx, req, product),
                        )
                        .await?;
                    tx.commit().await?;
                    self.shared.publish(effects);
                    Ok(movement)
                })
                .await
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "ledger.restock", &key.to_string(), details(&req), result)
    }

    async fn restock_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        req: &RestockRequest,
        product: &Product,
    ) -> EngineResult<(StockMovement, Effects)> {
        let key = StockKey::new(&req.product_id, &req.warehouse_id);
        let same = |e: &JournalEntry| {
            e.kind == JournalKind::Restock && e.key() == key && e.quantity == req.quantity
        };
        if let Some(entry) = replayed(conn, ctx.idempotency_key.as_deref(), same).await? {
            let record = current_record(conn, &key, product).await?;
            return Ok((StockMovement { entry, record }, Effects::default()));
        }
        let cause = Cause::new(&req.reason, req.reference.clone()).keyed(ctx.idempotency_key.clone());
        let mut stx = StockTx::new(conn, ctx, Utc::now());
        let movement = stx
            .adjust(product, &req.warehouse_id, JournalKind::Restock, req.quantity, cause)
            .await?;
        Ok((movement, stx.into_effects()))
    }

    // =========================================================================
    // Reserve / Release / Consume
    // =========================================================================

    /// Places a soft hold. `priority` also orders waiters on a contended key.
    #[instrument(skip_all, fields(
        product_id = %req.product_id,
        warehouse_id = %req.warehouse_id,
        quantity = req.quantity,
        correlation_id = %ctx.correlation_id
    ))]
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        req: ReserveRequest,
    ) -> EngineResult<ReservationMovement> {
        let key = StockKey::new(&req.product_id, &req.warehouse_id);
        let result = async {
            let mut errs = ValidationErrors::new();
            errs.check(validate_quantity("quantity", req.quantity));
            let priority = errs.check(validate_priority(req.priority));
            errs.check(validate_reason(&req.reason));
            errs.into_result()?;
            let priority = priority.unwrap_or(PRIORITY_DEFAULT);

            let product = self.shared.tracked_product(&req.product_id).await?;
            let (req, product, key) = (&req, &product, &key);
            self.shared
                .retry
                .run("ledger.reserve", move || async move {
                    let locks = Shared::stock_lock_keys(ctx, [key.clone()]);
                    let _guard = self.shared.locks.acquire(ctx, locks, priority).await?;
                    let mut tx = self.shared.db.begin().await?;
                    let (movement, effects) = ctx
                        .run(
                            "ledger.reserve",
                            self.settings.hard_limit(),
                            self.reserve_in(&mut tx, ctx, req, product, priority),
                        )
                        .await?;
                    tx.commit().await?;
                    self.shared.publish(effects);
                    Ok(movement)
                })
                .await
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "ledger.reserve", &key.to_string(), details(&req), result)
    }

    async fn reserve_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        req: &ReserveRequest,
        product: &Product,
        priority: u8,
    ) -> EngineResult<(ReservationMovement, Effects)> {
        let key = StockKey::new(&req.product_id, &req.warehouse_id);
        let same = |e: &JournalEntry| {
            e.kind == JournalKind::Reserve && e.key() == key && e.reserved_delta == req.quantity
        };
        if let Some(entry) = replayed(conn, ctx.idempotency_key.as_deref(), same).await? {
            let reservation_id = entry.reservation_id.clone().unwrap_or_default();
            let reservation = ReservationRepository::fetch(&mut *conn, &reservation_id)
                .await?
                .ok_or_else(|| EngineError::not_found("Reservation", &reservation_id))?;
            let record = current_record(conn, &key, product).await?;
            return Ok((
                ReservationMovement {
                    reservation,
                    entry,
                    record,
                },
                Effects::default(),
            ));
        }

        let cause = Cause::new(&req.reason, req.reference.clone()).keyed(ctx.idempotency_key.clone());
        let mut stx = StockTx::new(conn, ctx, Utc::now());
        let movement = stx
            .reserve(product, &req.warehouse_id, req.quantity, priority, cause)
            .await?;
        Ok((movement, stx.into_effects()))
    }

    /// Returns part of a reservation to available.
    #[instrument(skip_all, fields(reservation_id = %reservation_id, correlation_id = %ctx.correlation_id))]
    pub async fn release(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
        req: DrawdownRequest,
    ) -> EngineResult<ReservationMovement> {
        let result = async {
            let mut errs = ValidationErrors::new();
            errs.check(validate_quantity("quantity", req.quantity));
            errs.check(validate_reason(&req.reason));
            errs.into_result()?;
            self.draw_down(
                ctx,
                "ledger.release",
                reservation_id,
                Amount::Exact(req.quantity),
                Drawdown::Release,
                &req.reason,
            )
            .await
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "ledger.release", reservation_id, details(&req), result)
    }

    /// Ships part of a reservation: lowers reserved and on-hand together.
    #[instrument(skip_all, fields(reservation_id = %reservation_id, correlation_id = %ctx.correlation_id))]
    pub async fn consume(
        &self,
        ctx: &RequestContext,
        reservation_id: &str,
        req: DrawdownRequest,
    ) -> EngineResult<ReservationMovement> {
        let result = async {
            let mut errs = ValidationErrors::new();
            errs.check(validate_quantity("quantity", req.quantity));
            errs.check(validate_reason(&req.reason));
            errs.into_result()?;
            self.draw_down(
                ctx,
                "ledger.consume",
                reservation_id,
                Amount::Exact(req.quantity),
                Drawdown::Consume,
                &req.reason,
            )
            .await
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "ledger.consume", reservation_id, details(&req), result)
    }

    /// Shared body of release, consume, cancel and expire. Not audited;
    /// callers conclude.
    pub(crate) async fn draw_down(
        &self,
        ctx: &RequestContext,
        operation: &str,
        reservation_id: &str,
        amount: Amount,
        how: Drawdown,
        reason: &str,
    ) -> EngineResult<ReservationMovement> {
        let seen = self
            .shared
            .db
            .reservations()
            .get(reservation_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Reservation", reservation_id))?;
        let allow_backorder = match how {
            Drawdown::Consume => self.shared.catalog.require(&seen.product_id).await?.allow_backorder,
            _ => true,
        };
        let key = seen.key();
        let key = &key;
        self.shared
            .retry
            .run(operation, move || async move {
                let locks = Shared::stock_lock_keys(ctx, [key.clone()]);
                let _guard = self.shared.locks.acquire(ctx, locks, PRIORITY_DEFAULT).await?;
                let mut tx = self.shared.db.begin().await?;
                let (movement, effects) = ctx
                    .run(
                        operation,
                        self.settings.hard_limit(),
                        self.draw_down_in(&mut tx, ctx, reservation_id, amount, how, allow_backorder, reason),
                    )
                    .await?;
                tx.commit().await?;
                self.shared.publish(effects);
                Ok(movement)
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn draw_down_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        reservation_id: &str,
        amount: Amount,
        how: Drawdown,
        allow_backorder: bool,
        reason: &str,
    ) -> EngineResult<(ReservationMovement, Effects)> {
        let kind = match how {
            Drawdown::Consume => JournalKind::Shipment,
            _ => JournalKind::Release,
        };
        let same = |e: &JournalEntry| {
            e.kind == kind
                && e.reservation_id.as_deref() == Some(reservation_id)
                && match amount {
                    Amount::Exact(q) => e.reserved_delta == -q,
                    Amount::Remaining => true,
                }
        };
        if let Some(entry) = replayed(conn, ctx.idempotency_key.as_deref(), same).await? {
            let reservation = ReservationRepository::fetch(&mut *conn, reservation_id)
                .await?
                .ok_or_else(|| EngineError::not_found("Reservation", reservation_id))?;
            let record = StockRepository::load(&mut *conn, &reservation.key())
                .await?
                .ok_or_else(|| EngineError::not_found("Stock record", &reservation.key().to_string()))?;
            return Ok((
                ReservationMovement {
                    reservation,
                    entry,
                    record,
                },
                Effects::default(),
            ));
        }

        let mut stx = StockTx::new(conn, ctx, Utc::now());
        let reservation = stx.reservation(reservation_id).await?;
        let cause = Cause::new(reason, reservation.reference.clone())
            .keyed(ctx.idempotency_key.clone());
        let movement = stx
            .draw_down(&reservation, amount, how, allow_backorder, cause)
            .await?;
        Ok((movement, stx.into_effects()))
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    /// Moves available units between warehouses as a TRANSFER_OUT and
    /// TRANSFER_IN pair sharing one correlation id. Both legs commit or
    /// neither does.
    #[instrument(skip_all, fields(
        product_id = %req.product_id,
        from = %req.from_warehouse_id,
        to = %req.to_warehouse_id,
        correlation_id = %ctx.correlation_id
    ))]
    pub async fn transfer(&self, ctx: &RequestContext, req: TransferRequest) -> EngineResult<TransferOutcome> {
        let resource = format!("{}:{}->{}", req.product_id, req.from_warehouse_id, req.to_warehouse_id);
        let result = async {
            req.validate()?;
            let product = self.shared.tracked_product(&req.product_id).await?;
            let (req, product) = (&req, &product);
            self.shared
                .retry
                .run("ledger.transfer", move || async move {
                    let keys = [
                        StockKey::new(&req.product_id, &req.from_warehouse_id),
                        StockKey::new(&req.product_id, &req.to_warehouse_id),
                    ];
                    let locks = Shared::stock_lock_keys(ctx, keys);
                    let _guard = self.shared.locks.acquire(ctx, locks, PRIORITY_DEFAULT).await?;
                    let mut tx = self.shared.db.begin().await?;
                    let (outcome, effects) = ctx
                        .run(
                            "ledger.transfer",
                            self.settings.hard_limit(),
                            self.transfer_in(&mut tx, ctx, req, product),
                        )
                        .await?;
                    tx.commit().await?;
                    self.shared.publish(effects);
                    Ok(outcome)
                })
                .await
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "ledger.transfer", &resource, details(&req), result)
    }

    async fn transfer_in(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        req: &TransferRequest,
        product: &Product,
    ) -> EngineResult<(TransferOutcome, Effects)> {
        let from = StockKey::new(&req.product_id, &req.from_warehouse_id);
        let to = StockKey::new(&req.product_id, &req.to_warehouse_id);
        let out_key = ctx.idempotency_key.as_ref().map(|k| format!("{}:out", k));
        let same = |e: &JournalEntry| {
            e.kind == JournalKind::TransferOut && e.key() == from && e.quantity == -req.quantity
        };
        if let Some(out_entry) = replayed(conn, out_key.as_deref(), same).await? {
            let in_key = ctx.idempotency_key.as_ref().map(|k| format!("{}:in", k));
            let in_entry = match in_key {
                Some(k) => JournalRepository::by_idempotency_key(&mut *conn, &k).await?,
                None => None,
            }
            .ok_or_else(|| CoreError::Invariant("transfer replay without inbound leg".into()))?;
            let source = current_record(conn, &from, product).await?;
            let destination = current_record(conn, &to, product).await?;
            return Ok((
                TransferOutcome {
                    transfer_id: out_entry.correlation_id.clone().unwrap_or_default(),
                    out_entry,
                    in_entry,
                    source,
                    destination,
                },
                Effects::default(),
            ));
        }

        let cause = Cause::new(&req.reason, req.reference.clone()).keyed(ctx.idempotency_key.clone());
        let mut stx = StockTx::new(conn, ctx, Utc::now());
        let outcome = stx
            .transfer(
                product,
                &req.from_warehouse_id,
                &req.to_warehouse_id,
                req.quantity,
                cause,
            )
            .await?;
        Ok((outcome, stx.into_effects()))
    }

    // =========================================================================
    // Bulk
    // =========================================================================

    /// Independent adjustments. A failed item does not undo earlier ones.
    #[instrument(skip_all, fields(items = items.len(), correlation_id = %ctx.correlation_id))]
    pub async fn bulk_adjust(
        &self,
        ctx: &RequestContext,
        items: Vec<AdjustRequest>,
    ) -> EngineResult<Vec<BulkAdjustResult>> {
        if items.is_empty() || items.len() > MAX_BULK_ITEMS {
            return Err(ValidationError::OutOfRange {
                field: "items".into(),
                min: 1,
                max: MAX_BULK_ITEMS as i64,
            }
            .into());
        }

        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let item_ctx = ctx.clone().with_idempotency_key(
                ctx.idempotency_key
                    .as_ref()
                    .map(|k| format!("{}:{}", k, index)),
            );
            let (product_id, warehouse_id) = (item.product_id.clone(), item.warehouse_id.clone());
            let outcome = self
                .adjust(&item_ctx, item)
                .await
                .map(|m| m.entry)
                .map_err(|e| BulkFailure {
                    code: e.code(),
                    message: e.to_string(),
                });
            results.push(BulkAdjustResult {
                index,
                product_id,
                warehouse_id,
                outcome,
            });
        }
        Ok(results)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Last committed record. Never blocks on stock locks.
    pub async fn get(&self, product_id: &str, warehouse_id: &str) -> EngineResult<StockRecord> {
        let key = StockKey::new(product_id, warehouse_id);
        self.shared
            .db
            .stock()
            .get(&key)
            .await?
            .ok_or_else(|| EngineError::not_found("Stock record", &key.to_string()))
    }

    pub async fn list(&self, filter: &StockFilter, page: PageRequest) -> EngineResult<Page<StockRecord>> {
        let (items, total) = self.shared.db.stock().list(filter, page).await?;
        Ok(Page::new(items, total, page))
    }

    /// Records with `available ≤ min_level`.
    pub async fn low_stock(
        &self,
        warehouse_id: Option<String>,
        page: PageRequest,
    ) -> EngineResult<Page<StockRecord>> {
        let filter = StockFilter {
            warehouse_id,
            low_stock: true,
            ..Default::default()
        };
        self.list(&filter, page).await
    }

    pub async fn stats(&self, filter: &StockFilter) -> EngineResult<StockTotals> {
        Ok(self.shared.db.stock().totals(filter).await?)
    }

    /// Whether `quantity` units can be reserved, per warehouse.
    pub async fn check_availability(
        &self,
        product_id: &str,
        warehouse_id: Option<&str>,
        quantity: i64,
    ) -> EngineResult<Availability> {
        validate_quantity("quantity", quantity)?;
        let product = self.shared.catalog.require(product_id).await?;
        let records = self.shared.db.stock().list_for_product(product_id).await?;

        let warehouses: Vec<WarehouseAvailability> = records
            .iter()
            .filter(|r| warehouse_id.map_or(true, |w| r.warehouse_id == w))
            .map(|r| WarehouseAvailability {
                warehouse_id: r.warehouse_id.clone(),
                on_hand: r.on_hand,
                reserved: r.reserved,
                available: r.available(),
            })
            .collect();
        let total_available = warehouses.iter().map(|w| w.available.max(0)).sum();
        let fulfilling_warehouse_id = warehouses
            .iter()
            .find(|w| w.available >= quantity)
            .map(|w| w.warehouse_id.clone());
        let can_fulfill = fulfilling_warehouse_id.is_some()
            || (product.allow_backorder && (warehouse_id.is_some() || !warehouses.is_empty()));

        Ok(Availability {
            product_id: product_id.to_string(),
            requested: quantity,
            total_available,
            allow_backorder: product.allow_backorder,
            can_fulfill,
            fulfilling_warehouse_id,
            warehouses,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
