//! # keel-core: Pure Business Logic for Keel ERP
//!
//! Domain types and the rules that decide whether a stock or order
//! operation is legal. Everything here is synchronous and I/O-free;
//! callers pass the current time in.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Keel ERP Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 keel-server (axum HTTP binding)                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   keel-engine: journal, ledger, registry, alerts, orders        │   │
//! │  │   locks, retries, deadlines, one SQLite transaction per op      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ keel-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌──────────┐ │   │
//! │  │   │  money  │ │  stock  │ │  order  │ │  alert  │ │validation│ │   │
//! │  │   │  Money  │ │ Record  │ │ Status  │ │ firing  │ │  fields  │ │   │
//! │  │   │  tax    │ │ Journal │ │ totals  │ │  rule   │ │          │ │   │
//! │  │   └─────────┘ └─────────┘ └─────────┘ └─────────┘ └──────────┘ │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO CLOCK                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  keel-db (SQLite repositories)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Products, customers, warehouses, references, paging
//! - [`money`] - Integer money and tax math
//! - [`stock`] - Stock records, reservations, journal entries, replay
//! - [`alert`] - Low-stock alert configuration and firing rule
//! - [`order`] - Order status machine, totals and payments
//! - [`error`] - Error taxonomy, domain and validation errors
//! - [`validation`] - Field validators
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use keel_core::stock::StockRecord;
//! use keel_core::types::StockKey;
//!
//! let key = StockKey::new("p-1", "w-1");
//! let empty = StockRecord::empty(&key, 5, None, Utc::now());
//!
//! let stocked = empty.apply(10, 0, false, Utc::now()).unwrap();
//! let held = stocked.apply(0, 3, false, Utc::now()).unwrap();
//! assert_eq!(held.available(), 7);
//!
//! // Reserving past on-hand is refused without backorder.
//! assert!(held.apply(0, 8, false, Utc::now()).is_err());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod alert;
pub mod error;
pub mod money;
pub mod order;
pub mod stock;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ErrorCode, Severity, ValidationError, ValidationErrors};
pub use money::Money;
pub use types::*;
