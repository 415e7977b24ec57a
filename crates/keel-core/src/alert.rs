//! # Low-Stock Alerts
//!
//! Alert configurations and the pure firing rule.
//!
//! ## Firing Rule
//! ```text
//! new_available ≤ threshold ?
//!      │ no ──► nothing
//!      ▼ yes
//! kind = OUT_OF_STOCK if new_available ≤ 0 else LOW_STOCK
//!      │
//!      ├── old_available > threshold        (crossed downward)  ──► fire
//!      ├── last fired longer ago than cooldown                   ──► fire
//!      └── otherwise                                             ──► suppressed
//! ```
//!
//! A product-only alert watches that product in every warehouse, a
//! warehouse-only alert watches every product in that warehouse.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::{ValidationError, ValidationErrors};
use crate::stock::StockChange;
use crate::types::{new_id, StockKey};

/// Default cooldown between repeated fires of one alert.
pub const DEFAULT_COOLDOWN_SECS: i64 = 3600;

/// Which condition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum AlertKind {
    /// `0 < available ≤ threshold`
    LowStock,
    /// `available ≤ 0`
    OutOfStock,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertKind::LowStock => "LOW_STOCK",
            AlertKind::OutOfStock => "OUT_OF_STOCK",
        })
    }
}

/// An alert configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct LowStockAlert {
    pub id: String,
    pub product_id: Option<String>,
    pub warehouse_id: Option<String>,
    pub threshold: i64,
    pub cooldown_secs: i64,
    pub is_active: bool,
    #[ts(as = "Option<String>")]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_fired_kind: Option<AlertKind>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl LowStockAlert {
    /// Builds a validated alert. At least one scope must be set.
    pub fn new(
        product_id: Option<String>,
        warehouse_id: Option<String>,
        threshold: i64,
        cooldown_secs: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationErrors> {
        let alert = LowStockAlert {
            id: new_id(),
            product_id,
            warehouse_id,
            threshold,
            cooldown_secs: cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
            is_active: true,
            last_fired_at: None,
            last_fired_kind: None,
            created_at: now,
            updated_at: now,
        };
        alert.validate()?;
        Ok(alert)
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.product_id.is_none() && self.warehouse_id.is_none() {
            errs.push(ValidationError::Invalid {
                field: "scope".into(),
                reason: "product_id or warehouse_id must be set".into(),
            });
        }
        if self.threshold < 0 {
            errs.push(ValidationError::MustNotBeNegative {
                field: "threshold".into(),
            });
        }
        if self.cooldown_secs < 0 {
            errs.push(ValidationError::MustNotBeNegative {
                field: "cooldown_secs".into(),
            });
        }
        errs.into_result()
    }

    /// True if this alert's scope covers `key`. A missing side is a wildcard.
    pub fn matches(&self, key: &StockKey) -> bool {
        self.product_id
            .as_deref()
            .map_or(true, |p| p == key.product_id)
            && self
                .warehouse_id
                .as_deref()
                .map_or(true, |w| w == key.warehouse_id)
    }

    /// Decides whether `change` fires this alert at `now`.
    pub fn evaluate(&self, change: &StockChange, now: DateTime<Utc>) -> Option<AlertKind> {
        if !self.is_active || !self.matches(&change.key()) {
            return None;
        }
        if change.new_available > self.threshold {
            return None;
        }

        let kind = if change.new_available <= 0 {
            AlertKind::OutOfStock
        } else {
            AlertKind::LowStock
        };

        let crossed = change.old_available > self.threshold;
        let cooled_down = match self.last_fired_at {
            None => true,
            Some(at) => now - at >= Duration::seconds(self.cooldown_secs),
        };
        if crossed || cooled_down {
            Some(kind)
        } else {
            None
        }
    }

    /// Records a fire.
    pub fn mark_fired(&mut self, kind: AlertKind, now: DateTime<Utc>) {
        self.last_fired_at = Some(now);
        self.last_fired_kind = Some(kind);
        self.updated_at = now;
    }
}

/// A fired alert, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AlertEvent {
    pub id: String,
    pub alert_id: String,
    pub kind: AlertKind,
    pub product_id: String,
    pub warehouse_id: String,
    pub available: i64,
    pub threshold: i64,
    #[ts(as = "String")]
    pub fired_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(alert: &LowStockAlert, kind: AlertKind, change: &StockChange, now: DateTime<Utc>) -> Self {
        AlertEvent {
            id: new_id(),
            alert_id: alert.id.clone(),
            kind,
            product_id: change.product_id.clone(),
            warehouse_id: change.warehouse_id.clone(),
            available: change.new_available,
            threshold: alert.threshold,
            fired_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stock::JournalKind;

    fn change(old: i64, new: i64) -> StockChange {
        StockChange {
            product_id: "p".into(),
            warehouse_id: "w".into(),
            kind: JournalKind::Adjust,
            old_available: old,
            new_available: new,
            on_hand: new,
            reserved: 0,
            at: Utc::now(),
        }
    }

    fn alert() -> LowStockAlert {
        LowStockAlert::new(Some("p".into()), Some("w".into()), 5, None, Utc::now()).unwrap()
    }

    #[test]
    fn test_scope_required() {
        let err = LowStockAlert::new(None, None, 5, None, Utc::now()).unwrap_err();
        assert_eq!(err.fields()[0].field, "scope");
        assert!(LowStockAlert::new(None, Some("w".into()), -1, None, Utc::now()).is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        let mut a = alert();
        a.product_id = None;
        assert!(a.matches(&StockKey::new("anything", "w")));
        assert!(!a.matches(&StockKey::new("anything", "w2")));
    }

    #[test]
    fn test_dedup_within_cooldown() {
        let t0 = Utc::now();
        let mut a = alert();

        // 10 → 4 crosses the threshold.
        assert_eq!(a.evaluate(&change(10, 4), t0), Some(AlertKind::LowStock));
        a.mark_fired(AlertKind::LowStock, t0);

        // 4 → 3 within the hour is suppressed.
        let t1 = t0 + Duration::minutes(10);
        assert_eq!(a.evaluate(&change(4, 3), t1), None);

        // An hour later 3 → 2 fires again.
        let t2 = t0 + Duration::hours(1);
        assert_eq!(a.evaluate(&change(3, 2), t2), Some(AlertKind::LowStock));
    }

    #[test]
    fn test_out_of_stock_waits_for_cooldown() {
        let t0 = Utc::now();
        let mut a = alert();

        assert_eq!(a.evaluate(&change(10, 4), t0), Some(AlertKind::LowStock));
        a.mark_fired(AlertKind::LowStock, t0);

        // 4 → 0 inside the hour is still the same alert re-firing.
        let t1 = t0 + Duration::minutes(10);
        assert_eq!(a.evaluate(&change(4, 0), t1), None);

        // Restocked past the threshold and drained again: a fresh crossing.
        assert_eq!(a.evaluate(&change(8, 0), t1), Some(AlertKind::OutOfStock));

        // Once the cooldown has passed, staying empty fires again.
        let t2 = t0 + Duration::hours(1);
        assert_eq!(a.evaluate(&change(0, 0), t2), Some(AlertKind::OutOfStock));
    }

    #[test]
    fn test_inactive_or_above_threshold_never_fires() {
        let mut a = alert();
        assert_eq!(a.evaluate(&change(10, 6), Utc::now()), None);
        a.is_active = false;
        assert_eq!(a.evaluate(&change(10, 1), Utc::now()), None);
    }
}
