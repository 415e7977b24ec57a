//! # Alert Engine
//!
//! Evaluates committed stock changes against low-stock alert configurations
//! and broadcasts the alerts that fire.
//!
//! ## Flow
//! ```text
//! ┌─────────────┐ try_send ┌──────────────┐        ┌───────────────────────┐
//! │ StockLedger │─────────►│ bounded mpsc │───────►│ worker 1..N           │
//! │ post-commit │  (drop + │  queue       │        │  matching alerts      │
//! └─────────────┘   warn   └──────────────┘        │  evaluate()           │
//!                   when full)                     │  mark_fired (CAS)     │
//!                                                  └───────────┬───────────┘
//!                                                              │ broadcast
//!                                                              ▼
//!                                                  ┌───────────────────────┐
//!                                                  │ subscribers (SSE, ..) │
//!                                                  └───────────────────────┘
//! ```
//!
//! Alerting is fire-and-forget: the ledger never waits on this module and
//! never holds a stock lock while it runs. Two workers racing on the same
//! alert are settled by the compare-and-set in `mark_fired`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::alert::{AlertEvent, LowStockAlert};
use keel_core::stock::StockChange;
use keel_core::types::{Page, PageRequest};
use keel_db::{AlertFilter, Database};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::AlertSettings;
use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::sinks::{audit_details, Sinks};

// =============================================================================
// Change Notifier
// =============================================================================

/// Sending half of the post-commit change queue.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: mpsc::Sender<StockChange>,
    dropped: Arc<AtomicU64>,
}

impl ChangeNotifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StockChange>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ChangeNotifier {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queues a change without waiting. A full queue drops the change.
    pub fn publish(&self, change: StockChange) {
        match self.tx.try_send(change) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(change)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    product_id = %change.product_id,
                    warehouse_id = %change.warehouse_id,
                    dropped,
                    "Alert queue full, stock change dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(change)) => {
                debug!(key = %change.key(), "Alert engine stopped, stock change ignored");
            }
        }
    }

    /// Changes dropped under backpressure since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Input for [`AlertEngine::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub warehouse_id: Option<String>,
    pub threshold: i64,
    #[serde(default)]
    pub cooldown_secs: Option<i64>,
}

/// Partial update for [`AlertEngine::update`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertUpdate {
    #[serde(default)]
    pub threshold: Option<i64>,
    #[serde(default)]
    pub cooldown_secs: Option<i64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

// =============================================================================
// Alert Engine
// =============================================================================

/// Alert configuration store plus the evaluation worker pool.
#[derive(Clone)]
pub struct AlertEngine {
    inner: Arc<AlertInner>,
}

struct AlertInner {
    db: Database,
    events: broadcast::Sender<AlertEvent>,
    default_cooldown_secs: i64,
    sinks: Sinks,
    fired: AtomicU64,
}

impl AlertEngine {
    pub fn new(db: Database, settings: &AlertSettings, sinks: Sinks) -> Self {
        let (events, _) = broadcast::channel(settings.broadcast_capacity.max(1));
        AlertEngine {
            inner: Arc::new(AlertInner {
                db,
                events,
                default_cooldown_secs: settings.default_cooldown_secs,
                sinks,
                fired: AtomicU64::new(0),
            }),
        }
    }

    /// Starts `workers` tasks sharing one receiver. They exit when the
    /// queue closes or `shutdown` is cancelled.
    pub fn spawn_workers(
        &self,
        rx: mpsc::Receiver<StockChange>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..workers.max(1))
            .map(|worker| {
                let engine = self.clone();
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(worker, "Alert worker started");
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => None,
                            change = async { rx.lock().await.recv().await } => change,
                        };
                        let Some(change) = next else { break };
                        if let Err(e) = engine.process(&change, Utc::now()).await {
                            warn!(worker, key = %change.key(), error = %e, "Alert evaluation failed");
                        }
                    }
                    debug!(worker, "Alert worker stopped");
                })
            })
            .collect()
    }

    /// Evaluates one change at `now` and returns the alerts it fired.
    pub async fn process(
        &self,
        change: &StockChange,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<AlertEvent>> {
        let alerts = self.inner.db.alerts().matching(&change.key()).await?;
        let mut fired = Vec::new();
        for alert in alerts {
            let Some(kind) = alert.evaluate(change, now) else {
                continue;
            };
            let won = self
                .inner
                .db
                .alerts()
                .mark_fired(&alert.id, alert.last_fired_at, kind, now)
                .await?;
            if !won {
                debug!(alert_id = %alert.id, "Alert already fired by another worker");
                continue;
            }

            let event = AlertEvent::new(&alert, kind, change, now);
            info!(
                alert_id = %alert.id,
                kind = %kind,
                product_id = %event.product_id,
                warehouse_id = %event.warehouse_id,
                available = event.available,
                threshold = event.threshold,
                "Stock alert fired"
            );
            self.inner.fired.fetch_add(1, Ordering::Relaxed);
            // No subscribers is not an error.
            let _ = self.inner.events.send(event.clone());
            fired.push(event);
        }
        Ok(fired)
    }

    /// Receives every alert fired from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.inner.events.subscribe()
    }

    /// Alerts fired since start.
    pub fn fired_count(&self) -> u64 {
        self.inner.fired.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Configuration CRUD
    // =========================================================================

    #[instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub async fn create(&self, ctx: &RequestContext, req: NewAlert) -> EngineResult<LowStockAlert> {
        let details = audit_details(&req);
        let result = self.create_inner(req).await;
        let resource = result.as_ref().map(|a| a.id.clone()).unwrap_or_default();
        self.inner
            .sinks
            .conclude(ctx, "alert.create", &resource, details, result)
    }

    async fn create_inner(&self, req: NewAlert) -> EngineResult<LowStockAlert> {
        let alert = LowStockAlert::new(
            req.product_id,
            req.warehouse_id,
            req.threshold,
            Some(req.cooldown_secs.unwrap_or(self.inner.default_cooldown_secs)),
            Utc::now(),
        )?;
        if let Some(product_id) = &alert.product_id {
            if !self.inner.db.products().exists(product_id).await? {
                return Err(EngineError::not_found("Product", product_id));
            }
        }
        if let Some(warehouse_id) = &alert.warehouse_id {
            if self.inner.db.warehouses().get_by_id(warehouse_id).await?.is_none() {
                return Err(EngineError::not_found("Warehouse", warehouse_id));
            }
        }
        self.inner.db.alerts().insert(&alert).await?;
        Ok(alert)
    }

    pub async fn get(&self, id: &str) -> EngineResult<LowStockAlert> {
        self.inner
            .db
            .alerts()
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Alert", id))
    }

    pub async fn list(
        &self,
        filter: &AlertFilter,
        page: PageRequest,
    ) -> EngineResult<Page<LowStockAlert>> {
        let (items, total) = self.inner.db.alerts().list(filter, page).await?;
        Ok(Page::new(items, total, page))
    }

    #[instrument(skip_all, fields(alert_id = %id, correlation_id = %ctx.correlation_id))]
    pub async fn update(
        &self,
        ctx: &RequestContext,
        id: &str,
        update: AlertUpdate,
    ) -> EngineResult<LowStockAlert> {
        let details = audit_details(&update);
        let result = async {
            let mut alert = self.get(id).await?;
            if let Some(threshold) = update.threshold {
                alert.threshold = threshold;
            }
            if let Some(cooldown) = update.cooldown_secs {
                alert.cooldown_secs = cooldown;
            }
            if let Some(active) = update.is_active {
                alert.is_active = active;
            }
            alert.validate()?;
            alert.updated_at = Utc::now();
            self.inner.db.alerts().update(&alert).await?;
            Ok::<_, EngineError>(alert)
        }
        .await;
        self.inner
            .sinks
            .conclude(ctx, "alert.update", id, details, result)
    }

    #[instrument(skip_all, fields(alert_id = %id, correlation_id = %ctx.correlation_id))]
    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> EngineResult<()> {
        let result = self
            .inner
            .db
            .alerts()
            .delete(id)
            .await
            .map_err(EngineError::from);
        self.inner
            .sinks
            .conclude(ctx, "alert.delete", id, json!({}), result)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AdjustRequest;
    use crate::testing::TestEngine;
    use chrono::Duration;
    use keel_core::alert::AlertKind;
    use keel_core::stock::JournalKind;
    use keel_core::ErrorCode;

    fn change(product_id: &str, warehouse_id: &str, old: i64, new: i64) -> StockChange {
        StockChange {
            product_id: product_id.into(),
            warehouse_id: warehouse_id.into(),
            kind: JournalKind::Adjust,
            old_available: old,
            new_available: new,
            on_hand: new,
            reserved: 0,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_low_stock_dedup_within_cooldown() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        let (p, w) = (t.product.id.clone(), t.warehouse.id.clone());
        t.engine
            .alerts
            .create(
                &ctx,
                NewAlert {
                    product_id: Some(p.clone()),
                    warehouse_id: Some(w.clone()),
                    threshold: 5,
                    cooldown_secs: Some(3600),
                },
            )
            .await
            .unwrap();

        let t0 = Utc::now();
        let fired = t.engine.alerts.process(&change(&p, &w, 10, 4), t0).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, AlertKind::LowStock);

        let t1 = t0 + Duration::minutes(10);
        let fired = t.engine.alerts.process(&change(&p, &w, 4, 3), t1).await.unwrap();
        assert!(fired.is_empty());

        let t2 = t0 + Duration::hours(1);
        let fired = t.engine.alerts.process(&change(&p, &w, 3, 2), t2).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(t.engine.alerts.fired_count(), 2);
    }

    #[tokio::test]
    async fn test_wildcard_alert_and_out_of_stock() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        let w = t.warehouse.id.clone();
        t.engine
            .alerts
            .create(
                &ctx,
                NewAlert {
                    product_id: None,
                    warehouse_id: Some(w.clone()),
                    threshold: 3,
                    cooldown_secs: None,
                },
            )
            .await
            .unwrap();

        let fired = t
            .engine
            .alerts
            .process(&change(&t.product.id, &w, 5, 0), Utc::now())
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, AlertKind::OutOfStock);

        let other = t
            .engine
            .alerts
            .process(&change(&t.product.id, "elsewhere", 5, 0), Utc::now())
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_change_reaches_subscribers() {
        let t = TestEngine::started().await;
        let ctx = RequestContext::new("alice");
        let mut events = t.engine.alerts.subscribe();
        t.engine
            .alerts
            .create(
                &ctx,
                NewAlert {
                    product_id: Some(t.product.id.clone()),
                    warehouse_id: Some(t.warehouse.id.clone()),
                    threshold: 5,
                    cooldown_secs: None,
                },
            )
            .await
            .unwrap();

        t.stock(10).await;
        t.engine
            .ledger
            .adjust(
                &ctx,
                AdjustRequest {
                    product_id: t.product.id.clone(),
                    warehouse_id: t.warehouse.id.clone(),
                    delta: -6,
                    reason: "cycle count".into(),
                    reference: None,
                },
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, AlertKind::LowStock);
        assert_eq!(event.available, 4);
        t.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_crud_validation() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");

        let err = t
            .engine
            .alerts
            .create(
                &ctx,
                NewAlert {
                    product_id: None,
                    warehouse_id: None,
                    threshold: 1,
                    cooldown_secs: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let alert = t
            .engine
            .alerts
            .create(
                &ctx,
                NewAlert {
                    product_id: Some(t.product.id.clone()),
                    warehouse_id: None,
                    threshold: 2,
                    cooldown_secs: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(alert.cooldown_secs, 3600);

        let updated = t
            .engine
            .alerts
            .update(
                &ctx,
                &alert.id,
                AlertUpdate {
                    threshold: Some(7),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.threshold, 7);
        assert!(!updated.is_active);

        let err = t
            .engine
            .alerts
            .update(
                &ctx,
                &alert.id,
                AlertUpdate {
                    threshold: Some(-1),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        t.engine.alerts.delete(&ctx, &alert.id).await.unwrap();
        let err = t.engine.alerts.get(&alert.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
