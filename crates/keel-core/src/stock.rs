//! # Stock Types and Rules
//!
//! Stock records, reservations and journal entries, plus the pure rules
//! that decide whether a stock movement is allowed.
//!
//! ## Quantities
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 One StockRecord per (product, warehouse)               │
//! │                                                                         │
//! │   on_hand   ████████████████████████████████  10                        │
//! │   reserved  ██████████                         3  (Σ active remaining)  │
//! │   available           ██████████████████████   7  (on_hand − reserved)  │
//! │                                                                         │
//! │   Invariants                                                            │
//! │   • on_hand ≥ 0 always                                                  │
//! │   • reserved ≥ 0 always                                                 │
//! │   • reserved ≤ on_hand unless the product allows backorder              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Journal Deltas
//! ```text
//! kind           on_hand delta   reserved delta
//! ─────────────  ─────────────   ──────────────
//! ADJUST         ±n              0
//! RESERVE        0               +n
//! RELEASE        0               −n
//! SHIPMENT       −n              −n
//! TRANSFER_OUT   −n              0
//! TRANSFER_IN    +n              0
//! RESTOCK        +n              0
//! ```
//!
//! Replaying approved entries in sequence order must reproduce the live
//! record; [`replay`] is that fold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{new_id, Reference, StockKey};

/// Lowest (most urgent) reservation priority.
pub const PRIORITY_MIN: u8 = 1;
/// Highest (least urgent) reservation priority.
pub const PRIORITY_MAX: u8 = 10;
/// Priority used when the caller gives none.
pub const PRIORITY_DEFAULT: u8 = 5;

// =============================================================================
// Stock Record
// =============================================================================

/// Live stock state for one (product, warehouse).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct StockRecord {
    pub product_id: String,
    pub warehouse_id: String,
    pub on_hand: i64,
    pub reserved: i64,
    pub min_level: i64,
    pub max_level: Option<i64>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// Empty record for a key that has never been stocked.
    pub fn empty(key: &StockKey, min_level: i64, max_level: Option<i64>, now: DateTime<Utc>) -> Self {
        StockRecord {
            product_id: key.product_id.clone(),
            warehouse_id: key.warehouse_id.clone(),
            on_hand: 0,
            reserved: 0,
            min_level,
            max_level,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product_id, &self.warehouse_id)
    }

    /// `on_hand − reserved`. Negative only under backorder.
    #[inline]
    pub fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }

    #[inline]
    pub fn is_out_of_stock(&self) -> bool {
        self.available() <= 0
    }

    #[inline]
    pub fn is_low_stock(&self) -> bool {
        self.available() <= self.min_level
    }

    /// Returns the record after applying the deltas, or the reason it
    /// cannot be applied.
    ///
    /// This is the single gate every ledger mutation passes through.
    pub fn apply(
        &self,
        on_hand_delta: i64,
        reserved_delta: i64,
        allow_backorder: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<StockRecord> {
        let on_hand = self.on_hand.checked_add(on_hand_delta);
        let reserved = self.reserved.checked_add(reserved_delta);
        let (on_hand, reserved) = match (on_hand, reserved) {
            (Some(o), Some(r)) => (o, r),
            _ => return Err(CoreError::Invariant("stock quantity overflow".into())),
        };

        let requested = (-on_hand_delta).max(reserved_delta).max(0);

        if on_hand < 0 {
            return Err(self.insufficient(self.on_hand, requested));
        }
        if reserved < 0 {
            return Err(CoreError::Invariant(format!(
                "reserved would drop below zero for {}",
                self.key()
            )));
        }
        if !allow_backorder && reserved > on_hand {
            return Err(self.insufficient(self.available().max(0), requested));
        }

        Ok(StockRecord {
            on_hand,
            reserved,
            updated_at: now,
            ..self.clone()
        })
    }

    fn insufficient(&self, available: i64, requested: i64) -> CoreError {
        CoreError::InsufficientStock {
            product_id: self.product_id.clone(),
            warehouse_id: self.warehouse_id.clone(),
            available,
            requested,
        }
    }
}

/// Checks a plain on-hand adjustment.
pub fn check_adjust(
    record: &StockRecord,
    delta: i64,
    allow_backorder: bool,
    now: DateTime<Utc>,
) -> CoreResult<StockRecord> {
    if delta == 0 {
        return Err(ValidationError::Invalid {
            field: "quantity".into(),
            reason: "adjustment delta must not be zero".into(),
        }
        .into());
    }
    record.apply(delta, 0, allow_backorder, now)
}

/// Checks a reservation of `quantity` units.
///
/// Succeeds when `available ≥ quantity` or the product allows backorder.
pub fn check_reserve(
    record: &StockRecord,
    quantity: i64,
    allow_backorder: bool,
    now: DateTime<Utc>,
) -> CoreResult<StockRecord> {
    validate_quantity("quantity", quantity)?;
    if !allow_backorder && record.available() < quantity {
        return Err(record.insufficient(record.available().max(0), quantity));
    }
    record.apply(0, quantity, allow_backorder, now)
}

/// Checks the outbound leg of a transfer: only unreserved stock moves.
/// Backorder never applies to transfers.
pub fn check_transfer_out(
    record: &StockRecord,
    quantity: i64,
    now: DateTime<Utc>,
) -> CoreResult<StockRecord> {
    validate_quantity("quantity", quantity)?;
    if record.available() < quantity {
        return Err(record.insufficient(record.available().max(0), quantity));
    }
    record.apply(-quantity, 0, false, now)
}

fn validate_quantity(field: &str, quantity: i64) -> Result<(), ValidationError> {
    if quantity < 1 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Reservation
// =============================================================================

/// Lifecycle of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ReservationStatus {
    /// Holding stock.
    Active,
    /// Closed by shipment of everything it held.
    Fulfilled,
    /// Closed by release or cancel.
    Released,
    /// Closed by the TTL sweep.
    Expired,
}

impl ReservationStatus {
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Active)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Fulfilled => "fulfilled",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        })
    }
}

/// A soft hold on stock.
///
/// Accounting invariant: `consumed + released == quantity − remaining`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Reservation {
    pub id: String,
    pub product_id: String,
    pub warehouse_id: String,
    /// Initial quantity.
    pub quantity: i64,
    pub remaining: i64,
    pub consumed: i64,
    pub released: i64,
    pub reason: String,
    /// 1-10, lower is more urgent.
    pub priority: u8,
    pub reference: Option<Reference>,
    pub status: ReservationStatus,
    pub created_by: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,
}

/// How a reservation's remaining quantity is being reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drawdown {
    Release,
    Consume,
    Expire,
}

impl Reservation {
    pub fn new(
        key: &StockKey,
        quantity: i64,
        priority: u8,
        reason: impl Into<String>,
        reference: Option<Reference>,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Reservation {
            id: new_id(),
            product_id: key.product_id.clone(),
            warehouse_id: key.warehouse_id.clone(),
            quantity,
            remaining: quantity,
            consumed: 0,
            released: 0,
            reason: reason.into(),
            priority,
            reference,
            status: ReservationStatus::Active,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product_id, &self.warehouse_id)
    }

    /// Returns the reservation after drawing down `quantity`.
    ///
    /// Requires `1 ≤ quantity ≤ remaining` and an active reservation.
    /// When `remaining` reaches zero the reservation closes; the closing
    /// status records how it closed.
    pub fn draw_down(
        &self,
        quantity: i64,
        how: Drawdown,
        now: DateTime<Utc>,
    ) -> CoreResult<Reservation> {
        if !self.status.is_active() {
            return Err(CoreError::invalid_transition(
                "Reservation",
                &self.id,
                self.status,
                match how {
                    Drawdown::Release => "release",
                    Drawdown::Consume => "consume",
                    Drawdown::Expire => "expire",
                },
            ));
        }
        validate_quantity("quantity", quantity)?;
        if quantity > self.remaining {
            return match how {
                Drawdown::Consume => Err(CoreError::InsufficientStock {
                    product_id: self.product_id.clone(),
                    warehouse_id: self.warehouse_id.clone(),
                    available: self.remaining,
                    requested: quantity,
                }),
                _ => Err(ValidationError::OutOfRange {
                    field: "quantity".into(),
                    min: 1,
                    max: self.remaining,
                }
                .into()),
            };
        }

        let mut next = self.clone();
        next.remaining -= quantity;
        match how {
            Drawdown::Consume => next.consumed += quantity,
            Drawdown::Release | Drawdown::Expire => next.released += quantity,
        }
        next.updated_at = now;

        if next.remaining == 0 {
            next.status = match how {
                Drawdown::Expire => ReservationStatus::Expired,
                _ if next.released == 0 => ReservationStatus::Fulfilled,
                _ => ReservationStatus::Released,
            };
            next.closed_at = Some(now);
        }
        Ok(next)
    }

    /// True if the TTL sweep may expire this reservation at `cutoff`.
    pub fn is_expirable(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_active()
            && self.created_at < cutoff
            && self
                .reference
                .as_ref()
                .map(|r| r.ref_type.expires())
                .unwrap_or(false)
    }
}

/// Orders competing reservation requests: lower priority number first,
/// then earlier request time.
pub fn reservation_order(a: (u8, DateTime<Utc>), b: (u8, DateTime<Utc>)) -> std::cmp::Ordering {
    a.0.cmp(&b.0).then(a.1.cmp(&b.1))
}

// =============================================================================
// Journal
// =============================================================================

/// Kind of stock-changing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum JournalKind {
    Adjust,
    Reserve,
    Release,
    TransferOut,
    TransferIn,
    Shipment,
    Restock,
}

impl JournalKind {
    pub const ALL: [JournalKind; 7] = [
        JournalKind::Adjust,
        JournalKind::Reserve,
        JournalKind::Release,
        JournalKind::TransferOut,
        JournalKind::TransferIn,
        JournalKind::Shipment,
        JournalKind::Restock,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            JournalKind::Adjust => "ADJUST",
            JournalKind::Reserve => "RESERVE",
            JournalKind::Release => "RELEASE",
            JournalKind::TransferOut => "TRANSFER_OUT",
            JournalKind::TransferIn => "TRANSFER_IN",
            JournalKind::Shipment => "SHIPMENT",
            JournalKind::Restock => "RESTOCK",
        }
    }
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JournalKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JournalKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::NotAllowed {
                field: "kind".into(),
                allowed: JournalKind::ALL.iter().map(|k| k.to_string()).collect(),
            })
    }
}

/// Approval state of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum JournalStatus {
    /// Awaiting a decision; contributes nothing to live balances.
    Pending,
    /// Counted in live balances.
    Approved,
    /// Retained for audit; contributes nothing.
    Rejected,
}

impl fmt::Display for JournalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JournalStatus::Pending => "pending",
            JournalStatus::Approved => "approved",
            JournalStatus::Rejected => "rejected",
        })
    }
}

impl std::str::FromStr for JournalStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JournalStatus::Pending),
            "approved" => Ok(JournalStatus::Approved),
            "rejected" => Ok(JournalStatus::Rejected),
            _ => Err(ValidationError::NotAllowed {
                field: "status".into(),
                allowed: vec!["pending".into(), "approved".into(), "rejected".into()],
            }),
        }
    }
}

/// Decision on a pending journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Decision {
    Approve,
    Reject,
}

/// Immutable record of one stock-affecting act.
///
/// `seq` is assigned by the store on append and strictly increases; per
/// key that gives the total order the ledger replays in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct JournalEntry {
    pub id: String,
    pub seq: i64,
    pub product_id: String,
    pub warehouse_id: String,
    pub kind: JournalKind,
    /// Delta applied to `on_hand`.
    pub quantity: i64,
    /// Delta applied to `reserved`.
    pub reserved_delta: i64,
    pub reason: String,
    pub reference: Option<Reference>,
    pub reservation_id: Option<String>,
    /// Shared by both legs of a transfer.
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub status: JournalStatus,
    pub created_by: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    #[ts(as = "Option<String>")]
    pub approved_at: Option<DateTime<Utc>>,
    pub approval_notes: Option<String>,
}

impl JournalEntry {
    /// Starts a new approved entry. `seq` is filled in by the store.
    pub fn new(
        key: &StockKey,
        kind: JournalKind,
        quantity: i64,
        reserved_delta: i64,
        reason: impl Into<String>,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        JournalEntry {
            id: new_id(),
            seq: 0,
            product_id: key.product_id.clone(),
            warehouse_id: key.warehouse_id.clone(),
            kind,
            quantity,
            reserved_delta,
            reason: reason.into(),
            reference: None,
            reservation_id: None,
            correlation_id: None,
            idempotency_key: None,
            status: JournalStatus::Approved,
            created_by: created_by.into(),
            created_at: now,
            approved_by: None,
            approved_at: None,
            approval_notes: None,
        }
    }

    pub fn with_reference(mut self, reference: Option<Reference>) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_reservation(mut self, reservation_id: impl Into<String>) -> Self {
        self.reservation_id = Some(reservation_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn pending(mut self) -> Self {
        self.status = JournalStatus::Pending;
        self
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product_id, &self.warehouse_id)
    }

    /// Marks the decision on a pending entry.
    pub fn decide(
        &self,
        decision: Decision,
        approver: impl Into<String>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<JournalEntry> {
        if self.status != JournalStatus::Pending {
            return Err(CoreError::invalid_transition(
                "Journal entry",
                &self.id,
                self.status,
                "decide",
            ));
        }
        let mut next = self.clone();
        next.status = match decision {
            Decision::Approve => JournalStatus::Approved,
            Decision::Reject => JournalStatus::Rejected,
        };
        next.approved_by = Some(approver.into());
        next.approved_at = Some(now);
        next.approval_notes = notes;
        Ok(next)
    }
}

/// Rebuilds `(on_hand, reserved)` from journal entries.
///
/// Only approved entries count; pending and rejected ones contribute
/// nothing.
pub fn replay<'a>(entries: impl IntoIterator<Item = &'a JournalEntry>) -> (i64, i64) {
    entries
        .into_iter()
        .filter(|e| e.status == JournalStatus::Approved)
        .fold((0, 0), |(on_hand, reserved), e| {
            (on_hand + e.quantity, reserved + e.reserved_delta)
        })
}

// =============================================================================
// Post-commit Notification
// =============================================================================

/// Emitted after a ledger mutation commits. Consumed by the alert engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockChange {
    pub product_id: String,
    pub warehouse_id: String,
    pub kind: JournalKind,
    pub old_available: i64,
    pub new_available: i64,
    pub on_hand: i64,
    pub reserved: i64,
    #[ts(as = "String")]
    pub at: DateTime<Utc>,
}

impl StockChange {
    pub fn between(kind: JournalKind, before: &StockRecord, after: &StockRecord) -> Self {
        StockChange {
            product_id: after.product_id.clone(),
            warehouse_id: after.warehouse_id.clone(),
            kind,
            old_available: before.available(),
            new_available: after.available(),
            on_hand: after.on_hand,
            reserved: after.reserved,
            at: after.updated_at,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(&self.product_id, &self.warehouse_id)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(on_hand: i64, reserved: i64) -> StockRecord {
        let mut r = StockRecord::empty(&StockKey::new("p", "w"), 2, None, Utc::now());
        r.on_hand = on_hand;
        r.reserved = reserved;
        r
    }

    #[test]
    fn test_available() {
        let r = record(10, 3);
        assert_eq!(r.available(), 7);
        assert!(!r.is_out_of_stock());
        assert!(record(5, 5).is_out_of_stock());
        assert!(record(3, 1).is_low_stock());
    }

    #[test]
    fn test_reserve_rejects_oversell() {
        let r = record(5, 4);
        let err = check_reserve(&r, 2, false, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            CoreError::InsufficientStock {
                product_id: "p".into(),
                warehouse_id: "w".into(),
                available: 1,
                requested: 2,
            }
        );
    }

    #[test]
    fn test_reserve_with_backorder() {
        let r = record(5, 4);
        let next = check_reserve(&r, 2, true, Utc::now()).unwrap();
        assert_eq!(next.reserved, 6);
        assert_eq!(next.available(), -1);
    }

    #[test]
    fn test_reserve_requires_positive_quantity() {
        let err = check_reserve(&record(5, 0), 0, false, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_adjust_cannot_uncover_reservations() {
        let r = record(10, 8);
        assert!(check_adjust(&r, -2, false, Utc::now()).is_ok());
        assert!(check_adjust(&r, -3, false, Utc::now()).is_err());
        // Backorder relaxes reservation backing but never on_hand ≥ 0.
        assert!(check_adjust(&r, -3, true, Utc::now()).is_ok());
        assert!(check_adjust(&r, -11, true, Utc::now()).is_err());
        assert!(check_adjust(&r, 0, false, Utc::now()).is_err());
    }

    #[test]
    fn test_transfer_out_uses_available_only() {
        let r = record(10, 6);
        assert_eq!(check_transfer_out(&r, 4, Utc::now()).unwrap().on_hand, 6);
        assert!(check_transfer_out(&r, 5, Utc::now()).is_err());
    }

    #[test]
    fn test_reservation_consume_closes_as_fulfilled() {
        let now = Utc::now();
        let r = Reservation::new(&StockKey::new("p", "w"), 3, 5, "order", None, "u", now);
        let r = r.draw_down(3, Drawdown::Consume, now).unwrap();
        assert_eq!(r.remaining, 0);
        assert_eq!(r.consumed, 3);
        assert_eq!(r.status, ReservationStatus::Fulfilled);
        assert!(r.closed_at.is_some());

        let err = r.draw_down(1, Drawdown::Release, now).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_reservation_accounting() {
        let now = Utc::now();
        let r = Reservation::new(&StockKey::new("p", "w"), 5, 5, "order", None, "u", now);
        let r = r.draw_down(2, Drawdown::Consume, now).unwrap();
        let r = r.draw_down(1, Drawdown::Release, now).unwrap();
        assert_eq!(r.remaining, 2);
        assert_eq!(r.consumed + r.released, r.quantity - r.remaining);
        assert!(r.draw_down(3, Drawdown::Release, now).is_err());

        let r = r.draw_down(2, Drawdown::Release, now).unwrap();
        assert_eq!(r.status, ReservationStatus::Released);
    }

    #[test]
    fn test_consume_beyond_remaining_is_insufficient_stock() {
        let now = Utc::now();
        let r = Reservation::new(&StockKey::new("p", "w"), 2, 5, "order", None, "u", now);
        let err = r.draw_down(3, Drawdown::Consume, now).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientStock { .. }));
    }

    #[test]
    fn test_only_quotes_expire() {
        let then = Utc::now() - chrono::Duration::hours(48);
        let key = StockKey::new("p", "w");
        let quote = Reservation::new(&key, 1, 5, "q", Some(Reference::quote("q1")), "u", then);
        let order = Reservation::new(&key, 1, 5, "o", Some(Reference::order("o1")), "u", then);
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        assert!(quote.is_expirable(cutoff));
        assert!(!order.is_expirable(cutoff));
    }

    #[test]
    fn test_priority_ordering() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        use std::cmp::Ordering::*;
        assert_eq!(reservation_order((1, t1), (5, t0)), Less);
        assert_eq!(reservation_order((5, t0), (5, t1)), Less);
    }

    #[test]
    fn test_replay_ignores_pending_and_rejected() {
        let now = Utc::now();
        let key = StockKey::new("p", "w");
        let a = JournalEntry::new(&key, JournalKind::Adjust, 10, 0, "count", "u", now);
        let r = JournalEntry::new(&key, JournalKind::Reserve, 0, 3, "order", "u", now);
        let s = JournalEntry::new(&key, JournalKind::Shipment, -3, -3, "ship", "u", now);
        let p = JournalEntry::new(&key, JournalKind::Adjust, -7, 0, "shrink", "u", now).pending();
        let rej = p.decide(Decision::Reject, "boss", None, now).unwrap();

        assert_eq!(replay([&a, &r, &s, &p, &rej]), (7, 0));
    }

    #[test]
    fn test_decide_only_once() {
        let now = Utc::now();
        let p = JournalEntry::new(&StockKey::new("p", "w"), JournalKind::Adjust, -50, 0, "x", "u", now)
            .pending();
        let approved = p.decide(Decision::Approve, "boss", Some("ok".into()), now).unwrap();
        assert_eq!(approved.status, JournalStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("boss"));
        assert!(approved.decide(Decision::Reject, "boss", None, now).is_err());
    }

    #[test]
    fn test_journal_kind_wire_format() {
        assert_eq!(
            serde_json::to_string(&JournalKind::TransferOut).unwrap(),
            "\"TRANSFER_OUT\""
        );
        assert_eq!("shipment".parse::<JournalKind>().unwrap(), JournalKind::Shipment);
    }
}
