//! # Reservation Registry
//!
//! Lookup, cancellation and TTL expiry of reservations. Every quantity
//! change goes through the ledger so the record and the journal move with
//! it.
//!
//! ## Expiry Sweep
//! ```text
//! ┌──────────────┐ tick ┌────────────────────────────┐ per reservation ┌────────────┐
//! │ExpirySweeper │─────►│ expirable(now − ttl, batch)│────────────────►│ draw_down  │
//! │ (interval)   │      │ quote references only      │   Expire, all   │ (ledger)   │
//! └──────┬───────┘      └────────────────────────────┘   remaining     └────────────┘
//!        │ shutdown token
//!        ▼
//!      stop
//! ```
//!
//! Order-backed reservations never expire; they live until the order
//! consumes or releases them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::stock::{Drawdown, Reservation};
use keel_core::types::{ReferenceType, StockKey};
use keel_core::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ReservationSettings;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Amount, ReservationMovement, StockLedger};
use crate::shared::Shared;

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    /// Closed by someone else between listing and expiry.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct ReservationRegistry {
    shared: Shared,
    ledger: StockLedger,
    settings: ReservationSettings,
}

impl ReservationRegistry {
    pub fn new(shared: Shared, ledger: StockLedger, settings: ReservationSettings) -> Self {
        ReservationRegistry {
            shared,
            ledger,
            settings,
        }
    }

    pub async fn get(&self, id: &str) -> EngineResult<Reservation> {
        self.shared
            .db
            .reservations()
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Reservation", id))
    }

    /// Reservations on one key; active ones in release order.
    pub async fn list_by_stock(&self, key: &StockKey, active_only: bool) -> EngineResult<Vec<Reservation>> {
        Ok(self
            .shared
            .db
            .reservations()
            .list_by_stock(key, active_only)
            .await?)
    }

    pub async fn list_by_reference(
        &self,
        reference_id: &str,
        reference_type: ReferenceType,
    ) -> EngineResult<Vec<Reservation>> {
        Ok(self
            .shared
            .db
            .reservations()
            .list_by_reference(reference_id, reference_type)
            .await?)
    }

    /// Releases everything a reservation still holds.
    #[instrument(skip_all, fields(reservation_id = %id, correlation_id = %ctx.correlation_id))]
    pub async fn cancel(
        &self,
        ctx: &RequestContext,
        id: &str,
        reason: Option<String>,
    ) -> EngineResult<ReservationMovement> {
        let reason = reason.unwrap_or_else(|| "reservation cancelled".to_string());
        let details = json!({ "reason": reason });
        let result = self
            .ledger
            .draw_down(
                ctx,
                "reservation.cancel",
                id,
                Amount::Remaining,
                Drawdown::Release,
                &reason,
            )
            .await;
        self.shared
            .sinks
            .conclude(ctx, "reservation.cancel", id, details, result)
    }

    /// Expires quote reservations older than the TTL as of `now`.
    pub async fn expire_sweep(&self, ctx: &RequestContext, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let ttl = chrono::Duration::seconds(self.settings.quote_ttl_secs as i64);
        let cutoff = now - ttl;
        let candidates = self
            .shared
            .db
            .reservations()
            .expirable(cutoff, self.settings.sweep_batch_size)
            .await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..Default::default()
        };
        for reservation in candidates.iter().filter(|r| r.is_expirable(cutoff)) {
            let result = self
                .ledger
                .draw_down(
                    ctx,
                    "reservation.expire",
                    &reservation.id,
                    Amount::Remaining,
                    Drawdown::Expire,
                    "quote expired",
                )
                .await;
            match &result {
                Ok(_) => report.expired += 1,
                Err(e) if e.code() == ErrorCode::InvalidTransition => {
                    debug!(reservation_id = %reservation.id, "Reservation closed before expiry");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(reservation_id = %reservation.id, error = %e, "Failed to expire reservation");
                    report.failed += 1;
                }
            }
            if !matches!(&result, Err(e) if e.code() == ErrorCode::InvalidTransition) {
                self.shared.sinks.observe(
                    ctx,
                    "reservation.expire",
                    &reservation.id,
                    json!({ "remaining": reservation.remaining }),
                    &result,
                );
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "Reservation expiry sweep finished"
            );
        }
        Ok(report)
    }
}

// =============================================================================
// Background Sweeper
// =============================================================================

/// Runs [`ReservationRegistry::expire_sweep`] on an interval until
/// shutdown.
pub struct ExpirySweeper {
    registry: ReservationRegistry,
    interval: Duration,
    shutdown: CancellationToken,
}

impl ExpirySweeper {
    pub fn new(registry: ReservationRegistry, interval: Duration, shutdown: CancellationToken) -> Self {
        ExpirySweeper {
            registry,
            interval,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "Reservation sweeper starting");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let ctx = RequestContext::system().with_cancellation(self.shutdown.child_token());
                    if let Err(e) = self.registry.expire_sweep(&ctx, Utc::now()).await {
                        error!(error = %e, "Reservation expiry sweep failed");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
        info!("Reservation sweeper stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
