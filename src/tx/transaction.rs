//! Transaction handle
//!
//! Every key a transaction touches is locked at its primary before the
//! transaction reads or writes it. Locks are taken in one global order
//! (partition, key hash, key); a key that sorts before locks already held is
//! first tried without waiting, and on contention the later locks are
//! released and re-acquired behind it. That keeps two transactions that
//! touch the same keys in opposite order from deadlocking.

use crate::cache::Cache;
use crate::common::{
    key_hash, retry_with_backoff, timestamp_now_millis, validate_key, AbortReason, Error, Result,
    TxIsolation,
};
use crate::grid::protocol::{PeerRequest, PeerResponse, TxWrite};
use crate::grid::{Node, NodeId, PartitionId, PartitionMap};
use crate::store::Entry;
use crate::tx::{TxContext, TxId, TxState};
use bytes::Bytes;
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

const COMMIT_APPLY_RETRIES: usize = 3;

/// Global lock order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct LockKey {
    partition: PartitionId,
    hash: u64,
    key: String,
}

impl LockKey {
    fn new(map: &PartitionMap, key: &str) -> Self {
        Self {
            partition: map.partition_of(key),
            hash: key_hash(key),
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct HeldLock {
    node: NodeId,
    /// Live entry when the lock was granted
    entry: Option<Entry>,
    /// The transaction observed the value, so a change invalidates it
    read: bool,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    value: Option<Bytes>,
    ttl_ms: Option<u64>,
}

pub struct Transaction {
    cache: Cache,
    ctx: Arc<TxContext>,
    held: BTreeMap<LockKey, HeldLock>,
    index: HashMap<String, LockKey>,
    writes: BTreeMap<String, PendingWrite>,
}

impl Transaction {
    pub(crate) fn begin(cache: Cache, isolation: TxIsolation, timeout: Duration) -> Self {
        let ctx = cache
            .node()
            .tx_manager()
            .begin(cache.config(), isolation, timeout);
        Self {
            cache,
            ctx,
            held: BTreeMap::new(),
            index: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TxId {
        self.ctx.id()
    }

    pub fn state(&self) -> TxState {
        self.ctx.state()
    }

    pub fn isolation(&self) -> TxIsolation {
        self.ctx.isolation()
    }

    fn node(&self) -> Arc<Node> {
        Arc::clone(self.cache.node())
    }

    /// Roll back with `reason` and return the error to hand the caller
    async fn abort(&self, reason: AbortReason, key: Option<&str>) -> Error {
        self.cache
            .node()
            .tx_manager()
            .rollback(&self.ctx, reason, key.map(str::to_string))
            .await;
        self.ctx.aborted_error(key)
    }

    async fn ensure_active(&self) -> Result<()> {
        if self.ctx.state() == TxState::Active && self.ctx.is_expired() {
            return Err(self.abort(AbortReason::Deadline, None).await);
        }
        match self.ctx.state() {
            TxState::Active => Ok(()),
            TxState::RolledBack(_) => Err(self.ctx.aborted_error(None)),
            state => Err(Error::InvalidState(format!(
                "transaction {} is {}",
                self.ctx.id(),
                state
            ))),
        }
    }

    /// Value as this transaction sees it
    fn visible(&self, key: &str) -> Option<Bytes> {
        if let Some(write) = self.writes.get(key) {
            return write.value.clone();
        }
        let now = timestamp_now_millis();
        self.index
            .get(key)
            .and_then(|lock_key| self.held.get(lock_key))
            .and_then(|held| held.entry.as_ref())
            .and_then(|entry| entry.live_value(now).cloned())
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        validate_key(key)?;
        self.ensure_active().await?;
        if self.writes.contains_key(key) || self.index.contains_key(key) {
            return Ok(self.visible(key));
        }
        match self.ctx.isolation() {
            TxIsolation::ReadCommitted => self.cache.read_committed(key).await,
            TxIsolation::RepeatableRead => {
                self.enlist(key, true).await?;
                Ok(self.visible(key))
            }
        }
    }

    /// Lock the key and read it, whatever the isolation level
    pub async fn get_for_update(&mut self, key: &str) -> Result<Option<Bytes>> {
        validate_key(key)?;
        self.ensure_active().await?;
        self.enlist(key, true).await?;
        Ok(self.visible(key))
    }

    pub async fn put(&mut self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.write(key, Some(value.into()), None).await
    }

    pub async fn put_with_ttl(&mut self, key: &str, value: impl Into<Bytes>, ttl: Duration) -> Result<()> {
        self.write(key, Some(value.into()), Some(ttl.as_millis() as u64))
            .await
    }

    /// Remove a key; returns whether it was present
    pub async fn remove(&mut self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.ensure_active().await?;
        self.enlist(key, true).await?;
        let existed = self.visible(key).is_some();
        self.writes.insert(
            key.to_string(),
            PendingWrite {
                value: None,
                ttl_ms: None,
            },
        );
        Ok(existed)
    }

    async fn write(&mut self, key: &str, value: Option<Bytes>, ttl_ms: Option<u64>) -> Result<()> {
        validate_key(key)?;
        self.ensure_active().await?;
        self.enlist(key, false).await?;
        self.writes
            .insert(key.to_string(), PendingWrite { value, ttl_ms });
        Ok(())
    }

    async fn enlist(&mut self, key: &str, read: bool) -> Result<()> {
        if let Some(lock_key) = self.index.get(key) {
            if read {
                if let Some(held) = self.held.get_mut(lock_key) {
                    held.read = true;
                }
            }
            return Ok(());
        }

        let map = match self.cache.partition_map() {
            Ok(map) => map,
            Err(_) => return Err(self.abort(AbortReason::NodeUnreachable, Some(key)).await),
        };
        let lock_key = LockKey::new(&map, key);

        let in_order = self
            .held
            .keys()
            .next_back()
            .map(|last| lock_key > *last)
            .unwrap_or(true);
        if in_order {
            self.lock(&map, lock_key, read, true).await?;
            return Ok(());
        }
        if self.lock(&map, lock_key.clone(), read, false).await? {
            return Ok(());
        }

        // Contended and out of order: step back behind the new key
        let later: Vec<(LockKey, HeldLock)> = self.held.split_off(&lock_key).into_iter().collect();
        tracing::debug!(tx = %self.ctx.id(), key, released = later.len(), "Re-ordering locks");
        self.unlock(&later).await;

        self.lock(&map, lock_key, read, true).await?;
        for (lock_key, previous) in later {
            self.lock(&map, lock_key.clone(), previous.read, true).await?;
            if previous.read {
                let now = self
                    .held
                    .get(&lock_key)
                    .and_then(|h| h.entry.as_ref())
                    .map(|e| e.version);
                if now != previous.entry.as_ref().map(|e| e.version) {
                    return Err(self
                        .abort(AbortReason::VersionChanged, Some(&lock_key.key))
                        .await);
                }
            }
        }
        Ok(())
    }

    /// Lock one key at its primary. Without `wait`, a held lock yields
    /// `Ok(false)`; every other failure rolls the transaction back.
    async fn lock(&mut self, map: &PartitionMap, lock_key: LockKey, read: bool, wait: bool) -> Result<bool> {
        let owners = match map.owners_of(lock_key.partition) {
            Ok(owners) => owners,
            Err(_) => {
                return Err(self
                    .abort(AbortReason::NodeUnreachable, Some(&lock_key.key))
                    .await)
            }
        };
        self.ctx.add_participant(owners.primary);

        let node = self.node();
        let wait_ms = if wait {
            self.ctx.remaining().as_millis() as u64
        } else {
            0
        };
        let req = PeerRequest::Lock {
            cache: self.cache.name().to_string(),
            tx: self.ctx.id(),
            key: lock_key.key.clone(),
            deadline_ms: self.ctx.deadline_ms(),
            wait_ms,
        };
        let timeout = Duration::from_millis(wait_ms) + node.ctx().transport.request_timeout();

        let mut state = self.ctx.subscribe();
        let result = tokio::select! {
            result = node.request_with_timeout(owners.primary, &req, timeout) => result,
            _ = async { let _ = state.wait_for(|s| s.is_terminal()).await; } => {
                return Err(self.ctx.aborted_error(Some(&lock_key.key)));
            }
        };

        match result {
            Ok(PeerResponse::Locked { entry }) => {
                self.index.insert(lock_key.key.clone(), lock_key.clone());
                self.held.insert(
                    lock_key,
                    HeldLock {
                        node: owners.primary,
                        entry,
                        read,
                    },
                );
                Ok(true)
            }
            Err(e) if !wait && e.abort_reason() == Some(AbortReason::LockConflict) => Ok(false),
            Ok(other) => {
                tracing::error!(tx = %self.ctx.id(), "Unexpected lock response: {:?}", other);
                Err(self
                    .abort(AbortReason::NodeUnreachable, Some(&lock_key.key))
                    .await)
            }
            Err(e) => {
                let reason = e.abort_reason().unwrap_or(AbortReason::NodeUnreachable);
                tracing::debug!(tx = %self.ctx.id(), key = %lock_key.key, "Lock failed: {}", e);
                Err(self.abort(reason, Some(&lock_key.key)).await)
            }
        }
    }

    async fn unlock(&mut self, locks: &[(LockKey, HeldLock)]) {
        let mut by_node: BTreeMap<NodeId, Vec<String>> = BTreeMap::new();
        for (lock_key, held) in locks {
            self.index.remove(&lock_key.key);
            by_node
                .entry(held.node)
                .or_default()
                .push(lock_key.key.clone());
        }

        let node = self.node();
        for (primary, keys) in by_node {
            let req = PeerRequest::Unlock {
                cache: self.cache.name().to_string(),
                tx: self.ctx.id(),
                keys,
            };
            if let Err(e) = node.request(primary, &req).await {
                tracing::debug!(tx = %self.ctx.id(), primary, "Unlock not delivered: {}", e);
            }
        }
    }

    /// Two-phase commit: prepare at every primary holding writes, then
    /// apply everywhere. A prepare failure rolls back with its reason.
    pub async fn commit(mut self) -> Result<()> {
        self.ensure_active().await?;
        if !self.ctx.transition(TxState::Preparing) {
            return Err(self.ctx.aborted_error(None));
        }

        let mut by_node: BTreeMap<NodeId, Vec<TxWrite>> = BTreeMap::new();
        for (key, write) in std::mem::take(&mut self.writes) {
            let Some(held) = self.index.get(&key).and_then(|lk| self.held.get(lk)) else {
                return Err(self.abort(AbortReason::PrepareFailed, Some(&key)).await);
            };
            by_node.entry(held.node).or_default().push(TxWrite {
                expected: held.entry.as_ref().map(|e| e.version),
                key,
                value: write.value,
                ttl_ms: write.ttl_ms,
            });
        }

        let node = self.node();
        let cache = self.cache.name().to_string();
        let tx = self.ctx.id();

        let prepares = by_node.into_iter().map(|(primary, writes)| {
            let first_key = writes.first().map(|w| w.key.clone());
            let req = PeerRequest::Prepare {
                cache: cache.clone(),
                tx,
                writes,
            };
            let node = &node;
            async move { (primary, first_key, node.request(primary, &req).await) }
        });

        for (primary, first_key, result) in join_all(prepares).await {
            match result {
                Ok(PeerResponse::Prepared) => {}
                Ok(other) => {
                    tracing::error!(tx = %tx, primary, "Unexpected prepare response: {:?}", other);
                    return Err(self
                        .abort(AbortReason::PrepareFailed, first_key.as_deref())
                        .await);
                }
                Err(e) => {
                    let reason = e.abort_reason().unwrap_or(AbortReason::NodeUnreachable);
                    let key = e.conflicting_key().map(str::to_string).or(first_key);
                    tracing::info!(tx = %tx, primary, "Prepare failed: {}", e);
                    return Err(self.abort(reason, key.as_deref()).await);
                }
            }
        }

        // Commit point; loses to a rollback that got there first
        if !self.ctx.decide() {
            return Err(self.ctx.aborted_error(None));
        }

        let applies = self.ctx.participants().into_iter().map(|primary| {
            let req = PeerRequest::CommitApply {
                cache: cache.clone(),
                tx,
            };
            let node = &node;
            async move {
                let result = retry_with_backoff(
                    || node.request(primary, &req),
                    COMMIT_APPLY_RETRIES,
                    Duration::from_millis(10),
                )
                .await;
                (primary, result)
            }
        });

        let mut failure: Option<(AbortReason, Option<String>)> = None;
        for (primary, result) in join_all(applies).await {
            if let Err(e) = result {
                tracing::error!(tx = %tx, primary, "Commit apply failed: {}", e);
                failure.get_or_insert((
                    e.abort_reason().unwrap_or(AbortReason::NodeUnreachable),
                    e.conflicting_key().map(str::to_string),
                ));
            }
        }

        if let Some((reason, key)) = failure {
            node.tx_manager().fail_decided(&self.ctx, reason, key).await;
            return Err(self.ctx.aborted_error(None));
        }

        self.ctx.transition(TxState::Committed);
        node.tx_manager().committed(&self.ctx);
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        match self.ctx.state() {
            TxState::Committed => Err(Error::InvalidState(format!(
                "transaction {} already committed",
                self.ctx.id()
            ))),
            TxState::RolledBack(_) => Ok(()),
            _ => {
                self.abort(AbortReason::Explicit, None).await;
                Ok(())
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.ctx.state().is_terminal() || self.ctx.is_decided() {
            return;
        }
        let node = self.node();
        let ctx = Arc::clone(&self.ctx);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                node.tx_manager()
                    .rollback(&ctx, AbortReason::Explicit, None)
                    .await;
            });
        }
    }
}
