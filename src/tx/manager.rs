//! Transaction manager
//!
//! Tracks the transactions a node coordinates, drives their state machine
//! and rolls back the ones that outlive their deadline.

use crate::common::{
    timestamp_now_millis, AbortReason, CacheConfig, Error, EventBus, GridEvent, TxIsolation,
    METRICS,
};
use crate::grid::protocol::PeerRequest;
use crate::grid::transport::Transport;
use crate::grid::NodeId;
use crate::tx::{TxId, TxState};
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Shared state of one transaction
#[derive(Debug)]
pub struct TxContext {
    id: TxId,
    cache: String,
    isolation: TxIsolation,
    deadline: Instant,
    deadline_ms: u64,
    state: watch::Sender<TxState>,
    /// Set once every primary prepared; a decided transaction is no longer
    /// rolled back by the deadline reaper.
    decided: AtomicBool,
    participants: Mutex<BTreeSet<NodeId>>,
    abort_key: Mutex<Option<String>>,
}

impl TxContext {
    fn new(cache: &str, isolation: TxIsolation, timeout: Duration) -> Self {
        let (state, _) = watch::channel(TxState::Active);
        Self {
            id: uuid::Uuid::new_v4(),
            cache: cache.to_string(),
            isolation,
            deadline: Instant::now() + timeout,
            deadline_ms: timestamp_now_millis() + timeout.as_millis() as u64,
            state,
            decided: AtomicBool::new(false),
            participants: Mutex::new(BTreeSet::new()),
            abort_key: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn isolation(&self) -> TxIsolation {
        self.isolation
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Deadline as Unix milliseconds, for lock leases at primaries
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn state(&self) -> TxState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TxState> {
        self.state.subscribe()
    }

    /// Move along the state machine; returns false for an illegal move.
    pub fn transition(&self, to: TxState) -> bool {
        self.state.send_if_modified(|state| {
            let allowed = match (*state, to) {
                (TxState::Active, TxState::Preparing) => true,
                (TxState::Preparing, TxState::Committed) => true,
                (current, TxState::RolledBack(_)) => {
                    !current.is_terminal() && !self.decided.load(Ordering::SeqCst)
                }
                _ => false,
            };
            if allowed {
                *state = to;
            }
            allowed
        })
    }

    /// Commit point. Succeeds only from PREPARING, atomically with respect
    /// to a concurrent rollback.
    pub fn decide(&self) -> bool {
        let mut decided = false;
        self.state.send_if_modified(|state| {
            if *state == TxState::Preparing {
                self.decided.store(true, Ordering::SeqCst);
                decided = true;
            }
            false
        });
        decided
    }

    pub fn is_decided(&self) -> bool {
        self.decided.load(Ordering::SeqCst)
    }

    /// Terminal failure after the commit point
    pub(crate) fn force_rolled_back(&self, reason: AbortReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = TxState::RolledBack(reason);
            true
        })
    }

    pub fn add_participant(&self, node: NodeId) {
        self.participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node);
    }

    pub fn participants(&self) -> Vec<NodeId> {
        self.participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    fn record_abort_key(&self, key: Option<String>) {
        let mut slot = self.abort_key.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = key;
        }
    }

    /// The error callers see once the transaction is rolled back
    pub fn aborted_error(&self, key: Option<&str>) -> Error {
        let reason = match self.state() {
            TxState::RolledBack(reason) => reason,
            _ => AbortReason::Explicit,
        };
        let key = key.map(str::to_string).or_else(|| {
            self.abort_key
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        });
        Error::TransactionAborted {
            tx: self.id,
            key,
            reason,
        }
    }
}

pub struct TxManager {
    node: NodeId,
    transport: Arc<Transport>,
    events: EventBus,
    active: Mutex<HashMap<TxId, Arc<TxContext>>>,
}

impl TxManager {
    pub fn new(node: NodeId, transport: Arc<Transport>, events: EventBus) -> Self {
        Self {
            node,
            transport,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<TxId, Arc<TxContext>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn begin(&self, cache: &CacheConfig, isolation: TxIsolation, timeout: Duration) -> Arc<TxContext> {
        let ctx = Arc::new(TxContext::new(&cache.name, isolation, timeout));
        self.active().insert(ctx.id(), Arc::clone(&ctx));
        METRICS.active_transactions.inc();
        tracing::debug!(tx = %ctx.id(), cache = %cache.name, node = self.node, "Transaction started");
        ctx
    }

    pub fn get(&self, id: TxId) -> Option<Arc<TxContext>> {
        self.active().get(&id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    fn finish(&self, id: TxId) {
        if self.active().remove(&id).is_some() {
            METRICS.active_transactions.dec();
        }
    }

    /// Record a successful commit
    pub fn committed(&self, ctx: &TxContext) {
        METRICS.tx_committed.inc();
        self.finish(ctx.id());
        tracing::debug!(tx = %ctx.id(), "Transaction committed");
    }

    /// Roll back `ctx` and tell every participant to drop its locks and
    /// staged writes. Returns false if the transaction was already terminal
    /// or past its commit point.
    pub async fn rollback(&self, ctx: &TxContext, reason: AbortReason, key: Option<String>) -> bool {
        if !ctx.transition(TxState::RolledBack(reason)) {
            return false;
        }
        ctx.record_abort_key(key.clone());
        self.release_participants(ctx).await;
        self.rolled_back(ctx, reason, key);
        true
    }

    /// Report a transaction that failed after its commit point
    pub(crate) async fn fail_decided(&self, ctx: &TxContext, reason: AbortReason, key: Option<String>) {
        if !ctx.force_rolled_back(reason) {
            return;
        }
        ctx.record_abort_key(key.clone());
        self.release_participants(ctx).await;
        self.rolled_back(ctx, reason, key);
    }

    async fn release_participants(&self, ctx: &TxContext) {
        let req = PeerRequest::Rollback {
            cache: ctx.cache().to_string(),
            tx: ctx.id(),
        };
        let sends = ctx.participants().into_iter().map(|primary| {
            let req = &req;
            async move {
                if let Err(e) = self.transport.request(self.node, primary, req).await {
                    // The primary's lock lease reclaims what we could not release
                    tracing::debug!(tx = %ctx.id(), primary, "Rollback not delivered: {}", e);
                }
            }
        });
        join_all(sends).await;
    }

    fn rolled_back(&self, ctx: &TxContext, reason: AbortReason, key: Option<String>) {
        METRICS.tx_rolled_back.inc();
        self.finish(ctx.id());
        tracing::info!(tx = %ctx.id(), reason = %reason, key = ?key, "Transaction rolled back");
        self.events.publish(GridEvent::TransactionRolledBack {
            tx: ctx.id(),
            reason,
            key,
        });
    }

    /// Roll back every undecided transaction past its deadline
    pub async fn reap_expired(&self) -> usize {
        let expired: Vec<Arc<TxContext>> = self
            .active()
            .values()
            .filter(|ctx| ctx.is_expired() && !ctx.is_decided())
            .cloned()
            .collect();

        let mut reaped = 0;
        for ctx in expired {
            if self.rollback(&ctx, AbortReason::Deadline, None).await {
                reaped += 1;
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TxManager {
        TxManager::new(0, Arc::new(Transport::new(Duration::from_millis(100))), EventBus::new())
    }

    #[test]
    fn test_state_machine() {
        let ctx = TxContext::new("c", TxIsolation::RepeatableRead, Duration::from_secs(5));
        assert_eq!(ctx.state(), TxState::Active);
        assert!(!ctx.transition(TxState::Committed));
        assert!(!ctx.decide());

        assert!(ctx.transition(TxState::Preparing));
        assert!(ctx.decide());
        // Past the commit point a rollback is refused
        assert!(!ctx.transition(TxState::RolledBack(AbortReason::Deadline)));
        assert!(ctx.transition(TxState::Committed));
        assert!(ctx.state().is_terminal());
    }

    #[tokio::test]
    async fn test_rollback_publishes_event() {
        let mgr = manager();
        let mut events = mgr.events.subscribe();
        let cfg = CacheConfig::default();
        let ctx = mgr.begin(&cfg, TxIsolation::RepeatableRead, cfg.tx_timeout());
        assert_eq!(mgr.active_count(), 1);

        assert!(mgr.rollback(&ctx, AbortReason::Explicit, Some("A".into())).await);
        assert!(!mgr.rollback(&ctx, AbortReason::Deadline, None).await);
        assert_eq!(ctx.state(), TxState::RolledBack(AbortReason::Explicit));
        assert_eq!(mgr.active_count(), 0);

        let record = events.recv().await.unwrap();
        assert!(matches!(
            record.event,
            GridEvent::TransactionRolledBack {
                reason: AbortReason::Explicit,
                ..
            }
        ));
        assert_eq!(ctx.aborted_error(None).conflicting_key(), Some("A"));
    }

    #[tokio::test]
    async fn test_reaper_rolls_back_expired() {
        let mgr = manager();
        let cfg = CacheConfig {
            tx_timeout_ms: 10,
            ..Default::default()
        };
        let ctx = mgr.begin(&cfg, TxIsolation::ReadCommitted, cfg.tx_timeout());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(mgr.reap_expired().await, 1);
        assert_eq!(ctx.state(), TxState::RolledBack(AbortReason::Deadline));
    }
}
