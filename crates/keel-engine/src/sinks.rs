//! # Audit and Error Sinks
//!
//! Cross-cutting outputs of every mutation. Emission is spawned off the
//! request path; a sink failure is logged and never fails the operation.
//!
//! ```text
//! ┌──────────────┐  result   ┌──────────┐  spawn  ┌────────────────────┐
//! │ unit of work │──────────►│  Sinks   │────────►│ AuditSink::record  │
//! └──────────────┘           │ observe()│         └────────────────────┘
//!                            │          │  severity ≥ error, sampled
//!                            │          │────────►┌────────────────────┐
//!                            └──────────┘         │ErrorReporter::report│
//!                                                 └────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{ErrorCode, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};

/// Keys whose values are replaced before an error event leaves the process.
const REDACTED_KEYS: &[&str] = &["password", "token", "secret", "authorization", "api_key"];

// =============================================================================
// Events
// =============================================================================

/// One audited action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: String,
    /// Dotted operation name, e.g. `ledger.adjust`.
    pub action: String,
    pub resource_id: String,
    pub success: bool,
    pub code: Option<ErrorCode>,
    pub details: Value,
    pub correlation_id: String,
    pub at: DateTime<Utc>,
}

/// A structured error event for the reporting pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub severity: Severity,
    pub code: ErrorCode,
    /// Error type within the code, e.g. the operation that failed.
    pub error_type: String,
    pub message: String,
    /// Hex SHA-256 over code and message; groups repeats of one failure.
    pub fingerprint: String,
    pub correlation_id: String,
    pub data: Value,
    pub at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn fingerprint(code: ErrorCode, message: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(code.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(message.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Failure inside a sink.
#[derive(Debug, thiserror::Error)]
#[error("sink failed: {0}")]
pub struct SinkError(pub String);

// =============================================================================
// Traits
// =============================================================================

/// Append-only audit log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError>;
}

/// Error reporting pipeline.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, event: ErrorEvent) -> Result<(), SinkError>;
}

// =============================================================================
// Tracing Implementations
// =============================================================================

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError> {
        info!(
            target: "audit",
            actor = %event.actor,
            action = %event.action,
            resource_id = %event.resource_id,
            success = event.success,
            code = ?event.code,
            correlation_id = %event.correlation_id,
            details = %event.details,
            "audit"
        );
        Ok(())
    }
}

/// Writes sampled, redacted error events to the `error_report` target.
#[derive(Debug)]
pub struct TracingErrorReporter {
    sample_rate: f64,
    seen: AtomicU64,
}

impl TracingErrorReporter {
    pub fn new(sample_rate: f64) -> Self {
        TracingErrorReporter {
            sample_rate: sample_rate.clamp(0.0, 1.0),
            seen: AtomicU64::new(0),
        }
    }

    /// Deterministic sampling: keeps `sample_rate` of events, evenly spread.
    fn sampled(&self) -> bool {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) as f64;
        ((n + 1.0) * self.sample_rate).floor() > (n * self.sample_rate).floor()
    }
}

impl Default for TracingErrorReporter {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl ErrorReporter for TracingErrorReporter {
    async fn report(&self, event: ErrorEvent) -> Result<(), SinkError> {
        if !self.sampled() {
            return Ok(());
        }
        error!(
            target: "error_report",
            severity = ?event.severity,
            code = %event.code,
            error_type = %event.error_type,
            fingerprint = %event.fingerprint,
            correlation_id = %event.correlation_id,
            data = %redact(event.data),
            "{}",
            event.message
        );
        Ok(())
    }
}

/// Serializes a request for an audit record. A value that cannot be
/// serialized is logged and audited as `null`.
pub fn audit_details(value: &impl Serialize) -> Value {
    match serde_json::to_value(value) {
        Ok(details) => details,
        Err(e) => {
            warn!(error = %e, "Audit details could not be serialized");
            Value::Null
        }
    }
}

/// Replaces sensitive values anywhere in `value`.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if REDACTED_KEYS.contains(&k.to_lowercase().as_str()) {
                        (k, Value::String("[redacted]".into()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}

// =============================================================================
// Sinks Handle
// =============================================================================

/// The pair of sinks every service reports through.
#[derive(Clone)]
pub struct Sinks {
    audit: Arc<dyn AuditSink>,
    errors: Arc<dyn ErrorReporter>,
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

impl Sinks {
    pub fn new(audit: Arc<dyn AuditSink>, errors: Arc<dyn ErrorReporter>) -> Self {
        Sinks { audit, errors }
    }

    /// Tracing-backed sinks.
    pub fn tracing(error_sample_rate: f64) -> Self {
        Sinks::new(
            Arc::new(TracingAuditSink),
            Arc::new(TracingErrorReporter::new(error_sample_rate)),
        )
    }

    /// Records the outcome of `action` on `resource_id`: one audit event
    /// always, one error event when the failure is severe enough.
    pub fn observe<T>(
        &self,
        ctx: &RequestContext,
        action: &str,
        resource_id: &str,
        details: Value,
        result: &EngineResult<T>,
    ) {
        let now = Utc::now();
        let event = AuditEvent {
            actor: ctx.actor.clone(),
            action: action.to_string(),
            resource_id: resource_id.to_string(),
            success: result.is_ok(),
            code: result.as_ref().err().map(EngineError::code),
            details: details.clone(),
            correlation_id: ctx.correlation_id.clone(),
            at: now,
        };
        let audit = Arc::clone(&self.audit);
        tokio::spawn(async move {
            if let Err(e) = audit.record(event).await {
                warn!(error = %e, "Audit sink failed");
            }
        });

        if let Err(err) = result {
            if err.severity() >= Severity::Error {
                self.report(ctx, action, err, details);
            }
        }
    }

    /// Logs the outcome of a mutation, records it, and hands it back.
    pub fn conclude<T>(
        &self,
        ctx: &RequestContext,
        action: &str,
        resource_id: &str,
        details: Value,
        result: EngineResult<T>,
    ) -> EngineResult<T> {
        match &result {
            Ok(_) => info!(
                action,
                resource_id,
                actor = %ctx.actor,
                correlation_id = %ctx.correlation_id,
                "Committed"
            ),
            Err(e) if e.severity() >= Severity::Error => error!(
                action,
                resource_id,
                code = %e.code(),
                correlation_id = %ctx.correlation_id,
                error = %e,
                "Failed"
            ),
            Err(e) => warn!(
                action,
                resource_id,
                code = %e.code(),
                correlation_id = %ctx.correlation_id,
                error = %e,
                "Rejected"
            ),
        }
        self.observe(ctx, action, resource_id, details, &result);
        result
    }

    /// Forwards an error event regardless of the audit trail.
    pub fn report(&self, ctx: &RequestContext, action: &str, err: &EngineError, data: Value) {
        let message = err.to_string();
        let event = ErrorEvent {
            severity: err.severity(),
            code: err.code(),
            error_type: action.to_string(),
            fingerprint: ErrorEvent::fingerprint(err.code(), &message),
            message,
            correlation_id: ctx.correlation_id.clone(),
            data,
            at: Utc::now(),
        };
        let errors = Arc::clone(&self.errors);
        tokio::spawn(async move {
            if let Err(e) = errors.report(event).await {
                warn!(error = %e, "Error reporter failed");
            }
        });
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingAuditSink, RecordingErrorReporter};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_audit_details_degrade_to_null() {
        assert_eq!(audit_details(&json!({ "sku": "A-1" })), json!({ "sku": "A-1" }));

        // Tuple map keys have no JSON form.
        let mut unkeyable = std::collections::BTreeMap::new();
        unkeyable.insert((1u8, 2u8), 3u8);
        assert_eq!(audit_details(&unkeyable), Value::Null);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = ErrorEvent::fingerprint(ErrorCode::Unavailable, "database is locked");
        let b = ErrorEvent::fingerprint(ErrorCode::Unavailable, "database is locked");
        let c = ErrorEvent::fingerprint(ErrorCode::Timeout, "database is locked");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_redact_nested() {
        let v = redact(json!({"user": "bo", "Password": "x", "nested": [{"token": "t"}]}));
        assert_eq!(v["user"], "bo");
        assert_eq!(v["Password"], "[redacted]");
        assert_eq!(v["nested"][0]["token"], "[redacted]");
    }

    #[test]
    fn test_sampling_spreads_evenly() {
        let reporter = TracingErrorReporter::new(0.25);
        let kept = (0..100).filter(|_| reporter.sampled()).count();
        assert_eq!(kept, 25);

        let none = TracingErrorReporter::new(0.0);
        assert!((0..10).all(|_| !none.sampled()));
    }

    #[tokio::test]
    async fn test_observe_audits_and_reports_severe_errors() {
        let audit = Arc::new(RecordingAuditSink::default());
        let errors = Arc::new(RecordingErrorReporter::default());
        let sinks = Sinks::new(audit.clone(), errors.clone());
        let ctx = RequestContext::new("alice");

        sinks.observe(&ctx, "ledger.adjust", "p@w", json!({}), &Ok::<_, EngineError>(()));
        let not_found: EngineResult<()> = Err(EngineError::not_found("Order", "o1"));
        sinks.observe(&ctx, "order.get", "o1", json!({}), &not_found);
        let busy: EngineResult<()> = Err(EngineError::Unavailable("store down".into()));
        sinks.observe(&ctx, "storage.put", "k", json!({}), &busy);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = audit.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().any(|e| e.success && e.action == "ledger.adjust"));
        assert!(events
            .iter()
            .any(|e| !e.success && e.code == Some(ErrorCode::NotFound)));

        let reported = errors.events();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].code, ErrorCode::Unavailable);
        assert_eq!(reported[0].correlation_id, ctx.correlation_id);
    }
}
