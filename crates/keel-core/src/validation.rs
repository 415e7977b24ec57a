//! # Validation Module
//!
//! Field validators shared by the engine and the HTTP binding.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: HTTP binding (axum extractors)                               │
//! │  └── Type validation (deserialization)                                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: keel-engine services                                         │
//! │  └── THIS MODULE: field rules, aggregated into ValidationErrors        │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── CHECK constraints (on_hand >= 0, remaining <= quantity)           │
//! │  ├── UNIQUE constraints (sku, warehouse code, order number)            │
//! │  └── Foreign key constraints                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Validators return a single [`ValidationError`]; callers collect them with
//! [`ValidationErrors::check`](crate::error::ValidationErrors::check) so a
//! request reports every bad field at once.
//!
//! ```rust
//! use keel_core::error::ValidationErrors;
//! use keel_core::validation::{validate_quantity, validate_sku};
//!
//! let mut errs = ValidationErrors::new();
//! errs.check(validate_sku("has space"));
//! errs.check(validate_quantity("quantity", 0));
//! assert_eq!(errs.len(), 2);
//! ```

use crate::error::ValidationError;
use crate::stock::{PRIORITY_MAX, PRIORITY_MIN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Largest quantity accepted in a single stock operation or order line.
pub const MAX_QUANTITY: i64 = 1_000_000;

/// Longest free-text reason or note.
pub const MAX_REASON_LEN: usize = 500;

// =============================================================================
// String Validators
// =============================================================================

fn identifier(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }
    Ok(())
}

/// Validates a SKU (Stock Keeping Unit).
///
/// ## Rules
/// - Must not be empty
/// - At most 50 characters
/// - Letters, digits, hyphens and underscores only
///
/// ```rust
/// use keel_core::validation::validate_sku;
///
/// assert!(validate_sku("BOLT-M8").is_ok());
/// assert!(validate_sku("").is_err());
/// ```
pub fn validate_sku(sku: &str) -> ValidationResult<()> {
    identifier("sku", sku, 50)
}

/// Validates a warehouse code such as `WH-EAST`. Same alphabet as SKUs,
/// at most 20 characters.
pub fn validate_warehouse_code(code: &str) -> ValidationResult<()> {
    identifier("code", code, 20)
}

/// Validates a display name (warehouse, customer, product).
pub fn validate_name(field: &str, name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.len() > 200 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 200,
        });
    }

    Ok(())
}

/// Validates an optional free-text field (reason, notes, address).
pub fn validate_text(field: &str, text: Option<&str>, max: usize) -> ValidationResult<()> {
    match text {
        Some(t) if t.len() > max => Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        }),
        _ => Ok(()),
    }
}

/// Validates a stock-operation reason. Required, at most 500 characters.
pub fn validate_reason(reason: &str) -> ValidationResult<()> {
    if reason.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "reason".to_string(),
        });
    }
    validate_text("reason", Some(reason), MAX_REASON_LEN)
}

/// Validates an ISO 4217 currency code (three uppercase letters).
pub fn validate_currency(code: &str) -> ValidationResult<()> {
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: "must be a three-letter ISO 4217 code".to_string(),
        });
    }
    Ok(())
}

/// Validates a search query.
///
/// ## Returns
/// The trimmed query string.
pub fn validate_search_query(query: &str) -> ValidationResult<String> {
    let query = query.trim();

    if query.is_empty() {
        return Err(ValidationError::Required {
            field: "q".to_string(),
        });
    }

    if query.len() > 100 {
        return Err(ValidationError::TooLong {
            field: "q".to_string(),
            max: 100,
        });
    }

    Ok(query.to_string())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a quantity that must be in `1..=MAX_QUANTITY`.
pub fn validate_quantity(field: &str, qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }

    if qty > MAX_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 1,
            max: MAX_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a signed adjustment delta: non-zero and within
/// `±MAX_QUANTITY`.
pub fn validate_delta(delta: i64) -> ValidationResult<()> {
    if delta == 0 || delta.abs() > MAX_QUANTITY {
        return Err(ValidationError::Invalid {
            field: "delta".to_string(),
            reason: format!("must be non-zero and within ±{}", MAX_QUANTITY),
        });
    }
    Ok(())
}

/// Validates a reservation priority (1 = most urgent, 10 = least).
pub fn validate_priority(priority: i64) -> ValidationResult<u8> {
    if priority < PRIORITY_MIN as i64 || priority > PRIORITY_MAX as i64 {
        return Err(ValidationError::OutOfRange {
            field: "priority".to_string(),
            min: PRIORITY_MIN as i64,
            max: PRIORITY_MAX as i64,
        });
    }
    Ok(priority as u8)
}

/// Validates a tax rate in basis points (0% to 100%).
pub fn validate_tax_rate_bps(bps: u32) -> ValidationResult<()> {
    if bps > 10000 {
        return Err(ValidationError::OutOfRange {
            field: "tax_rate_bps".to_string(),
            min: 0,
            max: 10000,
        });
    }

    Ok(())
}

/// Validates a non-negative level (threshold, min/max stock, capacity).
pub fn validate_level(field: &str, level: i64) -> ValidationResult<()> {
    if level < 0 {
        return Err(ValidationError::MustNotBeNegative {
            field: field.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// UUID Validators
// =============================================================================

/// Validates a canonical UUID string.
///
/// ```rust
/// use keel_core::validation::validate_uuid;
///
/// assert!(validate_uuid("product_id", "550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_uuid("product_id", "not-a-uuid").is_err());
/// ```
pub fn validate_uuid(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_sku() {
        assert!(validate_sku("BOLT-M8").is_ok());
        assert!(validate_sku("widget_1").is_ok());

        assert!(validate_sku("").is_err());
        assert!(validate_sku("   ").is_err());
        assert!(validate_sku("has space").is_err());
        assert!(validate_sku(&"A".repeat(51)).is_err());
    }

    #[test]
    fn test_validate_warehouse_code() {
        assert!(validate_warehouse_code("WH-EAST").is_ok());
        let err = validate_warehouse_code(&"W".repeat(21)).unwrap_err();
        assert_eq!(err.field(), "code");
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity("quantity", 1).is_ok());
        assert!(validate_quantity("quantity", MAX_QUANTITY).is_ok());
        assert!(validate_quantity("quantity", 0).is_err());
        assert!(validate_quantity("quantity", -1).is_err());
        assert!(validate_quantity("quantity", MAX_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_validate_delta() {
        assert!(validate_delta(-5).is_ok());
        assert!(validate_delta(0).is_err());
        assert!(validate_delta(-MAX_QUANTITY - 1).is_err());
    }

    #[test]
    fn test_validate_priority() {
        assert_eq!(validate_priority(1).unwrap(), 1);
        assert_eq!(validate_priority(10).unwrap(), 10);
        assert!(validate_priority(0).is_err());
        assert!(validate_priority(11).is_err());
    }

    #[test]
    fn test_validate_currency() {
        assert!(validate_currency("USD").is_ok());
        assert!(validate_currency("usd").is_err());
        assert!(validate_currency("US").is_err());
    }

    #[test]
    fn test_validate_reason_and_text() {
        assert!(validate_reason("cycle count").is_ok());
        assert!(validate_reason(" ").is_err());
        assert!(validate_text("notes", None, 10).is_ok());
        assert!(validate_text("notes", Some("0123456789X"), 10).is_err());
    }

    #[test]
    fn test_validate_search_query() {
        assert_eq!(validate_search_query("  SO-0001 ").unwrap(), "SO-0001");
        assert!(validate_search_query("").is_err());
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("id", "550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_uuid("id", "").is_err());
        assert!(validate_uuid("id", "123").is_err());
    }
}
