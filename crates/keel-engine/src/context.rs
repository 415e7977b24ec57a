//! # Request Context
//!
//! Carries who is acting, the correlation id, an optional idempotency key,
//! the caller's deadline and a cancellation token through a unit of work.
//!
//! ## Cancellation Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  lock wait ──► BEGIN ──► reads/writes ──► COMMIT ──► post-commit hooks  │
//! │  └──────────── ctx.run() guards this span ───────┘                      │
//! │                                                                         │
//! │  Cancel or deadline inside the span: the future is dropped, the        │
//! │  transaction rolls back on drop, nothing persists.                     │
//! │  COMMIT itself is never interrupted.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::time::Duration;

use keel_core::types::new_id;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// Actor used when a caller does not identify itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Per-request execution context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub actor: String,
    pub correlation_id: String,
    pub idempotency_key: Option<String>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::system()
    }
}

impl RequestContext {
    pub fn new(actor: impl Into<String>) -> Self {
        RequestContext {
            actor: actor.into(),
            correlation_id: new_id(),
            idempotency_key: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Context for background work (sweeps, seeding).
    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR)
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    /// Sets a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Ties the context to an outer token, e.g. server shutdown.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline. `None` means no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The smaller of `limit` and the time left before the deadline.
    pub fn budget(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(limit),
            None => limit,
        }
    }

    /// Runs `work` unless the request is cancelled or `limit` (capped by
    /// the deadline) elapses first.
    ///
    /// `work` is dropped on cancel or timeout, so any transaction it holds
    /// rolls back.
    pub async fn run<T, F>(&self, operation: &str, limit: Duration, work: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        let budget = self.budget(limit);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled {
                operation: operation.to_string(),
            }),
            result = tokio::time::timeout(budget, work) => {
                result.unwrap_or_else(|_| Err(EngineError::timeout(operation, budget)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = RequestContext::new("alice");
        let out = ctx
            .run("op", Duration::from_secs(1), async { Ok::<_, EngineError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(ctx.actor, "alice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_caps_limit() {
        let ctx = RequestContext::system().with_timeout(Duration::from_millis(100));
        let err = ctx
            .run("slow", Duration::from_secs(30), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, EngineError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { after_ms, .. } if after_ms <= 100));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        let ctx = RequestContext::system().with_cancellation(token.clone());
        token.cancel();
        let err = ctx
            .run("op", Duration::from_secs(1), async { Ok::<_, EngineError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }

    #[test]
    fn test_blank_idempotency_key_is_ignored() {
        let ctx = RequestContext::system().with_idempotency_key(Some("  ".into()));
        assert!(ctx.idempotency_key.is_none());
        assert!(ctx.remaining().is_none());
    }
}
