//! # Lock Table
//!
//! In-process exclusive locks keyed by stock key, order id or idempotency
//! key. Mutations on one key serialize; disjoint keys run in parallel.
//!
//! ## Acquisition Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Lock Ordering                                    │
//! │                                                                         │
//! │  1. Idempotency(key)   ─┐                                              │
//! │  2. Order(id)           ├─ acquired in phases, in this order            │
//! │  3. Stock(p@w) ...     ─┘  keys inside one call are sorted ascending   │
//! │                                                                         │
//! │  All locks are taken BEFORE a database transaction is opened.          │
//! │                                                                         │
//! │  Waiters on a busy key form a heap:                                    │
//! │    (priority, arrival) ── lower priority number first, then FIFO       │
//! │  The releasing holder hands the key straight to the next waiter.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Holding a guard past the soft limit logs a warning on release. Waiting
//! is bounded by the request budget; see [`LockTable::acquire`].

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use keel_core::stock::PRIORITY_DEFAULT;
use keel_core::types::StockKey;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};

// =============================================================================
// Lock Keys
// =============================================================================

/// A lockable resource. Variant order is the global acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Idempotency(String),
    Order(String),
    Stock(StockKey),
}

impl LockKey {
    pub fn stock(product_id: &str, warehouse_id: &str) -> Self {
        LockKey::Stock(StockKey::new(product_id, warehouse_id))
    }

    pub fn order(id: &str) -> Self {
        LockKey::Order(id.to_string())
    }
}

impl From<StockKey> for LockKey {
    fn from(key: StockKey) -> Self {
        LockKey::Stock(key)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Idempotency(k) => write!(f, "idempotency:{}", k),
            LockKey::Order(id) => write!(f, "order:{}", id),
            LockKey::Stock(key) => write!(f, "stock:{}", key),
        }
    }
}

// =============================================================================
// Waiters
// =============================================================================

struct Waiter {
    priority: u8,
    seq: u64,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct KeyState {
    held: bool,
    waiters: BinaryHeap<Reverse<Waiter>>,
}

/// Counters exposed on the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    pub acquired: u64,
    pub contended: u64,
    pub soft_limit_overruns: u64,
    pub timeouts: u64,
}

// =============================================================================
// Lock Table
// =============================================================================

/// Table of per-key exclusive locks.
pub struct LockTable {
    keys: DashMap<LockKey, KeyState>,
    seq: AtomicU64,
    soft_limit: Duration,
    hard_limit: Duration,
    stats: Mutex<LockStats>,
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("keys", &self.keys.len())
            .field("soft_limit", &self.soft_limit)
            .field("hard_limit", &self.hard_limit)
            .finish()
    }
}

impl LockTable {
    pub fn new(soft_limit: Duration, hard_limit: Duration) -> Arc<Self> {
        Arc::new(LockTable {
            keys: DashMap::new(),
            seq: AtomicU64::new(0),
            soft_limit,
            hard_limit,
            stats: Mutex::new(LockStats::default()),
        })
    }

    pub fn hard_limit(&self) -> Duration {
        self.hard_limit
    }

    pub fn stats(&self) -> LockStats {
        *self.stats.lock()
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.keys.len()
    }

    /// Acquires every key in ascending order and returns one guard for all
    /// of them.
    ///
    /// Waiting is bounded by the smaller of the hard limit and the
    /// request's remaining deadline, and aborts on cancellation. On failure
    /// any keys already taken are released.
    pub async fn acquire(
        self: &Arc<Self>,
        ctx: &RequestContext,
        keys: impl IntoIterator<Item = LockKey>,
        priority: u8,
    ) -> EngineResult<LockGuard> {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guard = LockGuard {
            table: Arc::clone(self),
            keys: Vec::with_capacity(keys.len()),
            acquired_at: Instant::now(),
        };
        if keys.is_empty() {
            return Ok(guard);
        }

        let budget = ctx.budget(self.hard_limit);
        let wait = async {
            for key in keys {
                self.lock_one(&key, priority).await;
                guard.keys.push(key);
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                return Err(EngineError::Cancelled { operation: "lock wait".into() });
            }
            waited = tokio::time::timeout(budget, wait) => {
                if waited.is_err() {
                    self.stats.lock().timeouts += 1;
                    warn!(budget_ms = budget.as_millis() as u64, "Timed out waiting for locks");
                    return Err(EngineError::timeout("lock wait", budget));
                }
            }
        }

        guard.acquired_at = Instant::now();
        Ok(guard)
    }

    /// Convenience for a single stock key at default priority.
    pub async fn acquire_stock(
        self: &Arc<Self>,
        ctx: &RequestContext,
        key: &StockKey,
    ) -> EngineResult<LockGuard> {
        self.acquire(ctx, [LockKey::Stock(key.clone())], PRIORITY_DEFAULT)
            .await
    }

    async fn lock_one(&self, key: &LockKey, priority: u8) {
        let rx = {
            let mut state = self.keys.entry(key.clone()).or_default();
            if !state.held {
                state.held = true;
                self.stats.lock().acquired += 1;
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Reverse(Waiter {
                priority,
                seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
                grant: tx,
            }));
            rx
        };

        {
            let mut stats = self.stats.lock();
            stats.contended += 1;
        }
        debug!(key = %key, priority, "Waiting for lock");

        let mut pending = PendingGrant {
            table: self,
            key,
            rx: Some(rx),
        };
        pending.wait().await;
        self.stats.lock().acquired += 1;
    }

    /// Hands `key` to the next live waiter, or frees it.
    fn release(&self, key: &LockKey) {
        if let Some(mut state) = self.keys.get_mut(key) {
            while let Some(Reverse(waiter)) = state.waiters.pop() {
                if waiter.grant.send(()).is_ok() {
                    return;
                }
            }
            state.held = false;
        }
        self.keys
            .remove_if(key, |_, state| !state.held && state.waiters.is_empty());
    }
}

/// A queued acquisition. If dropped after the key was handed over but
/// before the grant was observed, the key is passed on again.
struct PendingGrant<'a> {
    table: &'a LockTable,
    key: &'a LockKey,
    rx: Option<oneshot::Receiver<()>>,
}

impl PendingGrant<'_> {
    async fn wait(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            // The sender is only dropped by a failed handoff, which never
            // happens to a live receiver.
            let _ = rx.await;
        }
        self.rx = None;
    }
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.table.release(self.key);
            }
        }
    }
}

// =============================================================================
// Guard
// =============================================================================

/// Holds a set of keys until dropped.
#[must_use = "locks are released when the guard is dropped"]
pub struct LockGuard {
    table: Arc<LockTable>,
    keys: Vec<LockKey>,
    acquired_at: Instant,
}

impl LockGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("keys", &self.keys).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let held = self.acquired_at.elapsed();
        if held > self.table.soft_limit {
            self.table.stats.lock().soft_limit_overruns += 1;
            warn!(
                keys = ?self.keys.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                held_ms = held.as_millis() as u64,
                soft_limit_ms = self.table.soft_limit.as_millis() as u64,
                "Locks held past soft limit"
            );
        }
        for key in self.keys.iter().rev() {
            self.table.release(key);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn table() -> Arc<LockTable> {
        LockTable::new(Duration::from_secs(5), Duration::from_secs(30))
    }

    #[test]
    fn test_key_order_puts_orders_before_stock() {
        let mut keys = vec![
            LockKey::stock("p", "w2"),
            LockKey::order("o1"),
            LockKey::stock("p", "w1"),
            LockKey::Idempotency("k".into()),
        ];
        keys.sort();
        assert_eq!(keys[0], LockKey::Idempotency("k".into()));
        assert_eq!(keys[1], LockKey::order("o1"));
        assert_eq!(keys[2], LockKey::stock("p", "w1"));
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = table();
        let ctx = RequestContext::system();
        let key = LockKey::stock("p", "w");

        let first = locks.acquire(&ctx, [key.clone()], 5).await.unwrap();

        let locks2 = Arc::clone(&locks);
        let ctx2 = ctx.clone();
        let key2 = key.clone();
        let second = tokio::spawn(async move {
            let _g = locks2.acquire(&ctx2, [key2], 5).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        drop(first);
        second.await.unwrap();
        assert_eq!(locks.active_keys(), 0);
        assert_eq!(locks.stats().contended, 1);
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_block() {
        let locks = table();
        let ctx = RequestContext::system();
        let _a = locks.acquire(&ctx, [LockKey::stock("p", "a")], 5).await.unwrap();
        let _b = locks.acquire(&ctx, [LockKey::stock("p", "b")], 5).await.unwrap();
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_waiters_are_served_by_priority_then_arrival() {
        let locks = table();
        let ctx = RequestContext::system();
        let key = LockKey::stock("p", "w");
        let holder = locks.acquire(&ctx, [key.clone()], 5).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for (name, priority) in [("low-a", 8u8), ("urgent", 1), ("low-b", 8), ("normal", 5)] {
            let locks = Arc::clone(&locks);
            let ctx = ctx.clone();
            let key = key.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire(&ctx, [key], priority).await.unwrap();
                tx.send(name).unwrap();
            }));
            // Fix arrival order.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(holder);
        for h in handles {
            h.await.unwrap();
        }
        let mut order = Vec::new();
        while let Ok(name) = rx.try_recv() {
            order.push(name);
        }
        assert_eq!(order, vec!["urgent", "normal", "low-a", "low-b"]);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_frees_nothing_it_did_not_take() {
        let locks = LockTable::new(Duration::from_millis(10), Duration::from_millis(50));
        let ctx = RequestContext::system();
        let busy = LockKey::stock("p", "b");
        let _held = locks.acquire(&ctx, [busy.clone()], 5).await.unwrap();

        let err = locks
            .acquire(&ctx, [LockKey::stock("p", "a"), busy], 5)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
        assert_eq!(locks.stats().timeouts, 1);

        // "a" was taken first and must have been released again.
        let _a = locks.acquire(&ctx, [LockKey::stock("p", "a")], 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_leak_the_key() {
        let locks = table();
        let ctx = RequestContext::system();
        let key = LockKey::order("o1");
        let holder = locks.acquire(&ctx, [key.clone()], 5).await.unwrap();

        let short = RequestContext::system().with_timeout(Duration::from_millis(20));
        assert!(locks.acquire(&short, [key.clone()], 5).await.is_err());

        drop(holder);
        let again = tokio::time::timeout(
            Duration::from_secs(1),
            locks.acquire(&ctx, [key], 5),
        )
        .await;
        assert!(again.is_ok());
    }
}
