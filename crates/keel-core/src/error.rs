//! # Error Types
//!
//! Domain-specific error types and the stable error taxonomy for keel-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  keel-core errors (this file)                                          │
//! │  ├── ErrorCode        - Stable taxonomy code (NOT_FOUND, CONFLICT ...) │
//! │  ├── CoreError        - Business rule violations                       │
//! │  ├── ValidationError  - A single field failure                         │
//! │  └── ValidationErrors - All field failures of one request              │
//! │                                                                         │
//! │  keel-db errors          └── DbError      - SQLite failures            │
//! │  keel-engine errors      └── EngineError  - Unit-of-work failures      │
//! │  keel-server errors      └── ApiError     - What HTTP clients see      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → EngineError → ApiError → Client   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every error in the workspace resolves to exactly one [`ErrorCode`]. The
//! code is what clients branch on; the message is for humans.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use ts_rs::TS;

// =============================================================================
// Error Taxonomy
// =============================================================================

/// Stable error codes surfaced to every caller.
///
/// Serialized as `SCREAMING_SNAKE_CASE` (`INSUFFICIENT_STOCK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum ErrorCode {
    /// Referenced entity absent.
    NotFound,
    /// Malformed input, with per-field details.
    Validation,
    /// Duplicate key, state conflict, idempotency-key mismatch.
    Conflict,
    /// Reserve/consume/adjust would violate non-negativity or reservation backing.
    InsufficientStock,
    /// Order/reservation/warehouse state does not permit the requested action.
    InvalidTransition,
    /// Originates in the auth layer.
    Unauthorized,
    /// Originates in the auth layer.
    Forbidden,
    /// Originates in the throttling layer.
    RateLimit,
    /// Deadline exceeded.
    Timeout,
    /// Downstream collaborator transiently unreachable.
    Unavailable,
    /// Unexpected invariant violation.
    Internal,
}

/// How loud an error is. Errors at [`Severity::Error`] and above are
/// forwarded to the error reporting sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorCode {
    /// Returns the wire form of the code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::InsufficientStock => "INSUFFICIENT_STOCK",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Default severity for the code.
    ///
    /// Caller mistakes are warnings. Infrastructure trouble is an error,
    /// and a broken invariant is critical.
    pub const fn severity(&self) -> Severity {
        match self {
            ErrorCode::NotFound | ErrorCode::Validation => Severity::Info,
            ErrorCode::Conflict
            | ErrorCode::InsufficientStock
            | ErrorCode::InvalidTransition
            | ErrorCode::Unauthorized
            | ErrorCode::Forbidden
            | ErrorCode::RateLimit => Severity::Warning,
            ErrorCode::Timeout | ErrorCode::Unavailable => Severity::Error,
            ErrorCode::Internal => Severity::Critical,
        }
    }

    /// Returns true for codes a unit of work may be retried on.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::Unavailable)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Core business logic errors.
///
/// These represent business rule violations detected by pure code. The
/// engine wraps them without losing the variant so the taxonomy code and
/// message survive all the way to the client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// Entity cannot be found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Insufficient stock to complete a stock operation.
    ///
    /// ## When This Occurs
    /// - Reserving more than `available` without backorder
    /// - Adjusting `on_hand` below zero or below `reserved`
    /// - Transferring more than the source's `available`
    /// - Consuming more than a reservation's `remaining`
    ///
    /// ```text
    /// on_hand=5 reserved=4 ──► Reserve(2)
    ///      │
    ///      ▼
    /// InsufficientStock { available: 1, requested: 2 }
    /// ```
    #[error("Insufficient stock for product {product_id} at warehouse {warehouse_id}: available {available}, requested {requested}")]
    InsufficientStock {
        product_id: String,
        warehouse_id: String,
        available: i64,
        requested: i64,
    },

    /// The entity's current state does not allow the action.
    ///
    /// ## When This Occurs
    /// - Confirming a draft order (must be submitted first)
    /// - Releasing a closed reservation
    /// - Deciding an already-decided journal entry
    #[error("{entity} {id} is {state}, cannot {action}")]
    InvalidTransition {
        entity: String,
        id: String,
        state: String,
        action: String,
    },

    /// Warehouse is deactivated and rejects new stock movements.
    #[error("Warehouse {warehouse_id} is inactive")]
    WarehouseInactive { warehouse_id: String },

    /// Customer is deactivated.
    #[error("Customer {customer_id} is inactive")]
    CustomerInactive { customer_id: String },

    /// Customer credit does not cover the order.
    #[error("Credit limit exceeded for customer {customer_id}: available {available}, required {required}")]
    CreditLimitExceeded {
        customer_id: String,
        available: crate::money::Money,
        required: crate::money::Money,
    },

    /// Duplicate or conflicting state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Input failed validation (one or more fields).
    #[error("{0}")]
    Validation(ValidationErrors),

    /// An internal invariant does not hold.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates an InvalidTransition error.
    pub fn invalid_transition(
        entity: impl Into<String>,
        id: impl Into<String>,
        state: impl fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        CoreError::InvalidTransition {
            entity: entity.into(),
            id: id.into(),
            state: state.to_string(),
            action: action.into(),
        }
    }

    /// Maps the error onto the stable taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::NotFound { .. } => ErrorCode::NotFound,
            CoreError::InsufficientStock { .. } => ErrorCode::InsufficientStock,
            CoreError::InvalidTransition { .. }
            | CoreError::WarehouseInactive { .. }
            | CoreError::CustomerInactive { .. } => ErrorCode::InvalidTransition,
            CoreError::CreditLimitExceeded { .. } | CoreError::Conflict(_) => ErrorCode::Conflict,
            CoreError::Validation(_) => ErrorCode::Validation,
            CoreError::Invariant(_) => ErrorCode::Internal,
        }
    }
}

impl From<ValidationError> for CoreError {
    fn from(err: ValidationError) -> Self {
        CoreError::Validation(ValidationErrors::from(err))
    }
}

impl From<ValidationErrors> for CoreError {
    fn from(errs: ValidationErrors) -> Self {
        CoreError::Validation(errs)
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// A single input validation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Invalid format (e.g., invalid UUID, invalid decimal).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// A combination of fields is invalid.
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ValidationError {
    /// Name of the offending field.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::Required { field }
            | ValidationError::TooLong { field, .. }
            | ValidationError::OutOfRange { field, .. }
            | ValidationError::MustBePositive { field }
            | ValidationError::MustNotBeNegative { field }
            | ValidationError::InvalidFormat { field, .. }
            | ValidationError::NotAllowed { field, .. }
            | ValidationError::Invalid { field, .. } => field,
        }
    }
}

/// Field-level detail carried in error responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Every field failure found in one request.
///
/// Validators push into this instead of returning on the first failure so
/// callers see all problems at once.
///
/// ```rust
/// use keel_core::error::{ValidationError, ValidationErrors};
///
/// let mut errs = ValidationErrors::new();
/// errs.check::<()>(Err(ValidationError::Required { field: "sku".into() }));
/// errs.check(Ok(()));
/// assert_eq!(errs.len(), 1);
/// assert!(errs.into_result().is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ValidationError) {
        self.errors.push(err);
    }

    /// Records the error side of a validator result.
    pub fn check<T>(&mut self, result: Result<T, ValidationError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    /// Prefixes field names of a nested validation (e.g. `items[2].quantity`).
    pub fn extend_prefixed(&mut self, prefix: &str, other: ValidationErrors) {
        for err in other.errors {
            let field = format!("{}.{}", prefix, err.field());
            let message = err.to_string();
            self.errors.push(ValidationError::Invalid {
                field,
                reason: message,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.errors.iter()
    }

    /// Field details for error responses.
    pub fn fields(&self) -> Vec<FieldError> {
        self.errors
            .iter()
            .map(|e| FieldError {
                field: e.field().to_string(),
                message: e.to_string(),
            })
            .collect()
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<ValidationError> for ValidationErrors {
    fn from(err: ValidationError) -> Self {
        ValidationErrors { errors: vec![err] }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed: ")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InsufficientStock {
            product_id: "p1".to_string(),
            warehouse_id: "w1".to_string(),
            available: 1,
            requested: 2,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient stock for product p1 at warehouse w1: available 1, requested 2"
        );
        assert_eq!(err.code(), ErrorCode::InsufficientStock);
    }

    #[test]
    fn test_codes_and_severity() {
        assert_eq!(
            CoreError::WarehouseInactive {
                warehouse_id: "w".into()
            }
            .code(),
            ErrorCode::InvalidTransition
        );
        assert_eq!(CoreError::Invariant("x".into()).code(), ErrorCode::Internal);
        assert_eq!(ErrorCode::Internal.severity(), Severity::Critical);
        assert!(ErrorCode::Unavailable.severity() >= Severity::Error);
        assert!(ErrorCode::Validation.severity() < Severity::Error);
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(!ErrorCode::Conflict.is_retryable());
    }

    #[test]
    fn test_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::InsufficientStock).unwrap();
        assert_eq!(json, "\"INSUFFICIENT_STOCK\"");
        assert_eq!(ErrorCode::RateLimit.as_str(), "RATE_LIMIT");
    }

    #[test]
    fn test_validation_errors_aggregate() {
        let mut errs = ValidationErrors::new();
        errs.push(ValidationError::Required {
            field: "sku".to_string(),
        });
        errs.push(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });

        let fields = errs.fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field, "sku");
        assert_eq!(fields[1].message, "quantity must be positive");

        let core: CoreError = errs.into();
        assert_eq!(core.code(), ErrorCode::Validation);
        assert!(core.to_string().contains("sku is required"));
    }

    #[test]
    fn test_prefixed_fields() {
        let mut inner = ValidationErrors::new();
        inner.push(ValidationError::MustBePositive {
            field: "quantity".into(),
        });
        let mut outer = ValidationErrors::new();
        outer.extend_prefixed("items[1]", inner);
        assert_eq!(outer.fields()[0].field, "items[1].quantity");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "sku".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
