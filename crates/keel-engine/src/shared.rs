//! Collaborators every service holds: the database, the product catalog,
//! the lock table, the retry policy, the alert queue and the sinks.

use std::sync::Arc;

use keel_core::types::{Product, StockKey};
use keel_core::ValidationError;
use keel_db::Database;
use tracing::debug;

use crate::alerts::ChangeNotifier;
use crate::catalog::ProductCatalog;
use crate::context::RequestContext;
use crate::error::EngineResult;
use crate::ledger::Effects;
use crate::locks::{LockKey, LockTable};
use crate::retry::RetryPolicy;
use crate::sinks::Sinks;

#[derive(Clone)]
pub struct Shared {
    pub db: Database,
    pub catalog: Arc<dyn ProductCatalog>,
    pub locks: Arc<LockTable>,
    pub retry: RetryPolicy,
    pub notifier: ChangeNotifier,
    pub sinks: Sinks,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("retry", &self.retry)
            .field("locks", &self.locks.active_keys())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Product that may move through the ledger.
    pub(crate) async fn tracked_product(&self, id: &str) -> EngineResult<Product> {
        let product = self.catalog.require(id).await?;
        if !product.track_inventory {
            return Err(ValidationError::Invalid {
                field: "product_id".into(),
                reason: format!("product {} does not track inventory", product.sku),
            }
            .into());
        }
        Ok(product)
    }

    /// Lock set for a stock operation: the request's idempotency key (when
    /// present) plus every stock key touched.
    pub(crate) fn stock_lock_keys(
        ctx: &RequestContext,
        keys: impl IntoIterator<Item = StockKey>,
    ) -> Vec<LockKey> {
        ctx.idempotency_key
            .iter()
            .map(|k| LockKey::Idempotency(k.clone()))
            .chain(keys.into_iter().map(LockKey::Stock))
            .collect()
    }

    /// Hands committed changes to the alert engine.
    pub(crate) fn publish(&self, effects: Effects) {
        if effects.entries.is_empty() {
            return;
        }
        debug!(
            entries = effects.entries.len(),
            changes = effects.changes.len(),
            "Publishing committed stock changes"
        );
        for change in effects.changes {
            self.notifier.publish(change);
        }
    }
}
