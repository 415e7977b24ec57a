//! # keel-engine: Inventory and Order Services for Keel ERP
//!
//! Every stock movement and order transition runs as one unit of work:
//! locks taken in a fixed order, one SQLite transaction, a journal entry
//! per movement, and post-commit notifications to the alert engine.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                     │
//! │                                                                         │
//! │   OrderService ──┐                                                      │
//! │   (orders/)      │   StockTx                                            │
//! │                  ├─────────────► StockLedger ──► journal + stock rows  │
//! │   Reservation ───┤               (ledger.rs)         │                  │
//! │   Registry       │                                   │ commit           │
//! │                  │                                   ▼                  │
//! │   Warehouse ─────┘                         ChangeNotifier (mpsc)        │
//! │   Service                                            │                  │
//! │                                                      ▼                  │
//! │   TransactionJournal                       AlertEngine workers          │
//! │   (reads, approvals, replay)               └─► broadcast AlertEvent     │
//! │                                                                         │
//! │   Cross-cutting: LockTable · RetryPolicy · Sinks · RequestContext      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - TOML + environment configuration
//! - [`context`] - Per-request actor, correlation id, deadline
//! - [`locks`] - Ordered per-key locks with soft/hard hold limits
//! - [`ledger`] - Stock movements and the shared unit of work
//! - [`journal`] - Journal reads, approvals and replay
//! - [`registry`] - Reservation reads, cancel and the expiry sweep
//! - [`alerts`] - Low-stock alert configuration and evaluation
//! - [`warehouses`] - Warehouse administration
//! - [`orders`] - Order lifecycle, payments and reporting
//! - [`storage`] - Object storage for images and documents
//! - [`sinks`] - Audit and error reporting
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keel_engine::{Engine, EngineConfig, RequestContext};
//!
//! let config = EngineConfig::load(None)?;
//! let db = keel_db::Database::new(config.database.db_config()).await?;
//! let engine = Engine::new(config, db)?;
//! engine.start();
//!
//! let ctx = RequestContext::new("alice");
//! let order = engine.orders.confirm(&ctx, &order_id).await?;
//!
//! engine.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod alerts;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod locks;
pub mod orders;
pub mod registry;
pub mod retry;
pub mod shared;
pub mod sinks;
pub mod storage;
pub mod warehouses;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use alerts::{AlertEngine, ChangeNotifier, NewAlert};
pub use catalog::{DbCatalog, ProductCatalog};
pub use config::EngineConfig;
pub use context::RequestContext;
pub use error::{EngineError, EngineResult};
pub use journal::TransactionJournal;
pub use ledger::StockLedger;
pub use orders::OrderService;
pub use registry::{ExpirySweeper, ReservationRegistry};
pub use sinks::Sinks;
pub use storage::{LocalObjectStore, ObjectStore};
pub use warehouses::WarehouseService;

use std::sync::Arc;

use keel_core::stock::StockChange;
use keel_db::Database;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::locks::LockTable;
use crate::retry::RetryPolicy;
use crate::shared::Shared;

// =============================================================================
// Engine
// =============================================================================

/// Every service wired to one database, lock table and alert queue.
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub db: Database,
    pub ledger: StockLedger,
    pub journal: TransactionJournal,
    pub registry: ReservationRegistry,
    pub alerts: AlertEngine,
    pub warehouses: WarehouseService,
    pub orders: OrderService,
    pub storage: Arc<dyn ObjectStore>,
    locks: Arc<LockTable>,
    notifier: ChangeNotifier,
    changes: Mutex<Option<mpsc::Receiver<StockChange>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("locks", &self.locks)
            .field("tasks", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Wires the engine with the database-backed catalog and tracing sinks.
    pub fn new(config: EngineConfig, db: Database) -> EngineResult<Self> {
        let sinks = Sinks::tracing(config.sinks.error_sample_rate);
        let catalog = DbCatalog::new(db.clone());
        Self::with_parts(config, db, catalog, sinks)
    }

    pub fn with_parts(
        config: EngineConfig,
        db: Database,
        catalog: Arc<dyn ProductCatalog>,
        sinks: Sinks,
    ) -> EngineResult<Self> {
        config.validate()?;
        let storage = storage::from_config(&config.storage)?;
        let locks = LockTable::new(config.ledger.soft_limit(), config.ledger.hard_limit());
        let (notifier, changes) = ChangeNotifier::channel(config.alerts.queue_capacity);
        let shared = Shared {
            db: db.clone(),
            catalog,
            locks: Arc::clone(&locks),
            retry: RetryPolicy::from(&config.retry),
            notifier: notifier.clone(),
            sinks: sinks.clone(),
        };

        let ledger = StockLedger::new(shared.clone(), config.ledger.clone());
        let journal = TransactionJournal::new(shared.clone(), config.ledger.clone());
        let registry =
            ReservationRegistry::new(shared.clone(), ledger.clone(), config.reservations.clone());
        let alerts = AlertEngine::new(db.clone(), &config.alerts, sinks);
        let warehouses = WarehouseService::new(shared.clone());
        let orders = OrderService::new(shared, config.orders.clone(), config.ledger.hard_limit());

        Ok(Engine {
            config: Arc::new(config),
            db,
            ledger,
            journal,
            registry,
            alerts,
            warehouses,
            orders,
            storage,
            locks,
            notifier,
            changes: Mutex::new(Some(changes)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the alert workers and, when configured, the expiry sweeper.
    /// Calling it again does nothing.
    pub fn start(&self) {
        let Some(changes) = self.changes.lock().take() else {
            warn!("Engine already started");
            return;
        };
        let mut tasks = self.tasks.lock();
        tasks.extend(self.alerts.spawn_workers(
            changes,
            self.config.alerts.workers,
            self.shutdown.child_token(),
        ));

        let interval = self.config.reservations.sweep_interval_secs;
        if interval > 0 {
            let sweeper = ExpirySweeper::new(
                self.registry.clone(),
                std::time::Duration::from_secs(interval),
                self.shutdown.child_token(),
            );
            tasks.push(sweeper.spawn());
        }
        info!(
            alert_workers = self.config.alerts.workers,
            sweep_interval_secs = interval,
            "Engine started"
        );
    }

    /// Stops background tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(dropped_changes = self.notifier.dropped(), "Engine stopped");
    }

    /// Lock table shared by every service.
    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEngine;

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_joins() {
        let t = TestEngine::new().await;
        t.engine.start();
        t.engine.start();
        assert_eq!(
            t.engine.tasks.lock().len(),
            t.engine.config.alerts.workers + 1
        );
        t.engine.shutdown().await;
        assert!(t.engine.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let t = TestEngine::new().await;
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        let err = Engine::new(config, t.db.clone()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}
