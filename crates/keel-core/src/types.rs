//! # Domain Types
//!
//! Shared entities read by the inventory and order cores.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Product      │   │    Warehouse    │   │    Customer     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  id (UUID)      │   │  id (UUID)      │       │
//! │  │  sku (business) │   │  code (unique)  │   │  credit_limit   │       │
//! │  │  allow_backorder│   │  type, active   │   │  credit_used    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    StockKey     │   │    Reference    │   │  Page / PageReq │       │
//! │  │ (product, wh)   │   │ id + order/     │   │  limit, offset  │       │
//! │  │ lock ordering   │   │ quote/transfer  │   │  total          │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Every entity has:
//! - `id`: UUID v4 in canonical text form, immutable, used for relations
//! - Business ID: (sku, warehouse code, order number), human-readable

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::ValidationError;
use crate::money::Money;

/// Generates a new canonical UUID v4 identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate represented in basis points (825 bps = 8.25%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxRate(u32);

impl TaxRate {
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }
}

// =============================================================================
// Product
// =============================================================================

/// A product as the core sees it.
///
/// Product master data is owned by the catalog. The inventory and order
/// cores only read these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Product {
    pub id: String,

    /// Stock Keeping Unit - business identifier.
    pub sku: String,

    pub name: String,

    /// List price in minor units.
    pub price: Money,

    /// Tax rate in basis points.
    pub tax_rate_bps: u32,

    /// When false, orders for this product never touch the ledger.
    pub track_inventory: bool,

    /// Authoritative backorder switch for Reserve/Consume decisions.
    pub allow_backorder: bool,

    /// Low-stock threshold copied onto new stock records.
    pub min_stock_level: i64,

    pub max_stock_level: Option<i64>,

    pub weight_grams: Option<i64>,

    pub is_active: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Product {
    #[inline]
    pub fn tax_rate(&self) -> TaxRate {
        TaxRate::from_bps(self.tax_rate_bps)
    }
}

// =============================================================================
// Customer
// =============================================================================

/// Customer snapshot with the credit fields the order core updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub credit_limit: Money,
    pub credit_used: Money,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// `credit_limit − credit_used`; negative when over the limit.
    #[inline]
    pub fn credit_available(&self) -> Money {
        self.credit_limit - self.credit_used
    }
}

// =============================================================================
// Warehouse
// =============================================================================

/// Kind of warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum WarehouseType {
    Retail,
    Wholesale,
    Distribution,
    Fulfillment,
    Return,
}

impl WarehouseType {
    pub const ALL: [WarehouseType; 5] = [
        WarehouseType::Retail,
        WarehouseType::Wholesale,
        WarehouseType::Distribution,
        WarehouseType::Fulfillment,
        WarehouseType::Return,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            WarehouseType::Retail => "retail",
            WarehouseType::Wholesale => "wholesale",
            WarehouseType::Distribution => "distribution",
            WarehouseType::Fulfillment => "fulfillment",
            WarehouseType::Return => "return",
        }
    }
}

impl fmt::Display for WarehouseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WarehouseType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WarehouseType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.to_lowercase())
            .ok_or_else(|| ValidationError::NotAllowed {
                field: "type".to_string(),
                allowed: WarehouseType::ALL.iter().map(|t| t.to_string()).collect(),
            })
    }
}

/// A stocking location.
///
/// Deactivated warehouses stay queryable but reject new stock movements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Warehouse {
    pub id: String,
    /// Unique short code, e.g. `"WH-EAST"`.
    pub code: String,
    pub name: String,
    pub warehouse_type: WarehouseType,
    pub is_active: bool,
    /// Optional capacity in units.
    pub capacity: Option<i64>,
    pub manager_id: Option<String>,
    pub address: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// References
// =============================================================================

/// What a reservation or journal entry is backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ReferenceType {
    Order,
    Quote,
    Transfer,
}

impl ReferenceType {
    /// Only quotes are swept by the reservation TTL.
    #[inline]
    pub const fn expires(&self) -> bool {
        matches!(self, ReferenceType::Quote)
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferenceType::Order => "order",
            ReferenceType::Quote => "quote",
            ReferenceType::Transfer => "transfer",
        })
    }
}

/// Reference id plus its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Reference {
    pub id: String,
    #[serde(rename = "type")]
    pub ref_type: ReferenceType,
}

impl Reference {
    pub fn new(id: impl Into<String>, ref_type: ReferenceType) -> Self {
        Reference {
            id: id.into(),
            ref_type,
        }
    }

    pub fn order(id: impl Into<String>) -> Self {
        Reference::new(id, ReferenceType::Order)
    }

    pub fn quote(id: impl Into<String>) -> Self {
        Reference::new(id, ReferenceType::Quote)
    }
}

// =============================================================================
// Stock Key
// =============================================================================

/// Identity of a stock record: one per (product, warehouse).
///
/// `Ord` sorts by product then warehouse. Multi-key operations lock keys in
/// this order, so two transfers crossing the same pair of warehouses always
/// take the lower warehouse id first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockKey {
    pub product_id: String,
    pub warehouse_id: String,
}

impl StockKey {
    pub fn new(product_id: impl Into<String>, warehouse_id: impl Into<String>) -> Self {
        StockKey {
            product_id: product_id.into(),
            warehouse_id: warehouse_id.into(),
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.product_id, self.warehouse_id)
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// Maximum page size accepted from callers.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Offset pagination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PageRequest {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl PageRequest {
    pub fn new(limit: u32, offset: u32) -> Self {
        PageRequest { limit, offset }
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: u32,
    pub offset: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, req: PageRequest) -> Self {
        Page {
            items,
            total,
            limit: req.effective_limit(),
            offset: req.offset,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Inclusive-exclusive UTC time window used by list filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_key_ordering() {
        let mut keys = vec![
            StockKey::new("p1", "w2"),
            StockKey::new("p0", "w9"),
            StockKey::new("p1", "w1"),
        ];
        keys.sort();
        assert_eq!(keys[0], StockKey::new("p0", "w9"));
        assert_eq!(keys[1], StockKey::new("p1", "w1"));
        assert_eq!(keys[2], StockKey::new("p1", "w2"));
    }

    #[test]
    fn test_warehouse_type_parse() {
        assert_eq!("Retail".parse::<WarehouseType>().unwrap(), WarehouseType::Retail);
        assert_eq!(
            "fulfillment".parse::<WarehouseType>().unwrap(),
            WarehouseType::Fulfillment
        );
        assert!("garage".parse::<WarehouseType>().is_err());
    }

    #[test]
    fn test_reference_expiry() {
        assert!(ReferenceType::Quote.expires());
        assert!(!ReferenceType::Order.expires());
        assert!(!ReferenceType::Transfer.expires());
    }

    #[test]
    fn test_page_limit_clamped() {
        assert_eq!(PageRequest::new(0, 0).effective_limit(), 1);
        assert_eq!(PageRequest::new(10_000, 0).effective_limit(), MAX_PAGE_SIZE);
        assert_eq!(PageRequest::default().effective_limit(), 50);
    }

    #[test]
    fn test_credit_available() {
        let now = Utc::now();
        let c = Customer {
            id: new_id(),
            name: "Acme".into(),
            email: None,
            is_active: true,
            credit_limit: Money::from_cents(50_000),
            credit_used: Money::from_cents(11_800),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(c.credit_available().cents(), 38_200);
    }
}
