//! # Engine Error Types
//!
//! Error types for units of work run by the engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Engine Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │   Domain        │  │    Storage      │  │     Execution           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Core(..)       │  │  Db(..)         │  │  Timeout                │ │
//! │  │  Idempotency    │  │  ObjectStore    │  │  Cancelled              │ │
//! │  │  Mismatch       │  │  Unavailable    │  │  Internal               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐                                                    │
//! │  │ Configuration   │   Every variant resolves to one ErrorCode via      │
//! │  │                 │   EngineError::code(); the server maps that code   │
//! │  │  InvalidConfig  │   to an HTTP status.                               │
//! │  │  ConfigLoad     │                                                    │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use keel_core::error::FieldError;
use keel_core::{CoreError, ErrorCode, Severity};
use keel_db::DbError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error type covering every way a unit of work can fail.
#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Domain Errors
    // =========================================================================
    /// Business rule violation detected by keel-core.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An idempotency key was replayed with a different payload.
    #[error("Idempotency key '{key}' was already used for a different request")]
    IdempotencyMismatch { key: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Database failure.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Object key absent from the store.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// A collaborator cannot be reached or is not available in this build.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Deadline or lock hard limit exceeded.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// The request was cancelled before the unit of work committed.
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    /// Unexpected failure inside the engine.
    #[error("Internal engine error: {0}")]
    Internal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoad(String),
}

impl EngineError {
    /// Maps the error onto the stable taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Core(e) => e.code(),
            EngineError::Db(e) => e.code(),
            EngineError::IdempotencyMismatch { .. } => ErrorCode::Conflict,
            EngineError::ObjectNotFound(_) => ErrorCode::NotFound,
            EngineError::Unavailable(_) => ErrorCode::Unavailable,
            EngineError::Timeout { .. } | EngineError::Cancelled { .. } => ErrorCode::Timeout,
            EngineError::Internal(_)
            | EngineError::InvalidConfig(_)
            | EngineError::ConfigLoad(_) => ErrorCode::Internal,
        }
    }

    pub fn severity(&self) -> Severity {
        self.code().severity()
    }

    /// True for storage failures a fresh unit of work may get past.
    ///
    /// Lock and deadline timeouts are not retried: the budget is spent.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Db(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Field-level details for validation failures.
    pub fn details(&self) -> Vec<FieldError> {
        match self {
            EngineError::Core(CoreError::Validation(errs)) => errs.fields(),
            _ => Vec::new(),
        }
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        EngineError::Core(CoreError::not_found(entity, id))
    }

    pub(crate) fn timeout(operation: &str, after: std::time::Duration) -> Self {
        EngineError::Timeout {
            operation: operation.to_string(),
            after_ms: after.as_millis() as u64,
        }
    }
}

impl From<keel_core::ValidationErrors> for EngineError {
    fn from(errs: keel_core::ValidationErrors) -> Self {
        EngineError::Core(CoreError::Validation(errs))
    }
}

impl From<keel_core::ValidationError> for EngineError {
    fn from(err: keel_core::ValidationError) -> Self {
        EngineError::Core(CoreError::from(err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization failed: {}", err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => EngineError::ObjectNotFound(err.to_string()),
            _ => EngineError::Unavailable(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Db(DbError::from(err))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ValidationError;

    #[test]
    fn test_codes() {
        let err = EngineError::from(CoreError::WarehouseInactive {
            warehouse_id: "w".into(),
        });
        assert_eq!(err.code(), ErrorCode::InvalidTransition);

        let err = EngineError::from(DbError::Busy("database is locked".into()));
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert!(err.is_retryable());

        let err = EngineError::timeout("ledger.adjust", std::time::Duration::from_secs(30));
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "ledger.adjust timed out after 30000ms");

        let err = EngineError::IdempotencyMismatch { key: "k".into() };
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[test]
    fn test_details_only_for_validation() {
        let err = EngineError::from(ValidationError::Required {
            field: "reason".into(),
        });
        assert_eq!(err.details().len(), 1);
        assert_eq!(err.details()[0].field, "reason");
        assert!(EngineError::Internal("x".into()).details().is_empty());
    }
}
