//! Grid node
//!
//! A node serves the partitions it owns, coordinates the transactions its
//! callers start and, when it is not a partition's primary, keeps a near
//! cache of what it read. Requests arrive through the node's mailbox and are
//! handled concurrently on the tokio worker pool; writers to one partition
//! are serialized by that partition's store guard.

use crate::common::{
    timestamp_now_millis, AbortReason, CacheConfig, Error, Result, METRICS,
};
use crate::grid::protocol::{decode_frame, encode_frame, PeerRequest, PeerResponse, ReaderTag, TxWrite};
use crate::grid::transport::Envelope;
use crate::grid::{GridContext, NodeId, NodeRole, PartitionId, PartitionMap, PartitionRole};
use crate::near::{publish_invalidations, Invalidation, NearCache, ReaderRegistry, Unsubscribe};
use crate::replication::Replicator;
use crate::store::{PartitionStore, Precondition, WriteOutcome};
use crate::tx::{LockTable, TxId, TxManager};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Expired entries are purged every this many maintenance ticks
const PURGE_EVERY_TICKS: u64 = 40;

/// Per-cache state of one node
pub struct NodeCache {
    config: CacheConfig,
    stores: RwLock<HashMap<PartitionId, Arc<PartitionStore>>>,
    locks: LockTable,
    staged: Mutex<HashMap<TxId, Vec<TxWrite>>>,
    readers: ReaderRegistry,
    near: Option<NearCache>,
}

impl NodeCache {
    fn new(config: CacheConfig) -> Self {
        let near = config
            .near_enabled
            .then(|| NearCache::new(config.near_ttl(), config.near_max_entries));
        Self {
            config,
            stores: RwLock::new(HashMap::new()),
            locks: LockTable::new(),
            staged: Mutex::new(HashMap::new()),
            readers: ReaderRegistry::new(),
            near,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn near(&self) -> Option<&NearCache> {
        self.near.as_ref()
    }

    pub fn readers(&self) -> &ReaderRegistry {
        &self.readers
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn store(&self, partition: PartitionId, node: NodeId) -> Arc<PartitionStore> {
        if let Some(store) = self
            .stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&partition)
        {
            return Arc::clone(store);
        }
        let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            stores
                .entry(partition)
                .or_insert_with(|| Arc::new(PartitionStore::new(partition, node))),
        )
    }

    fn existing_store(&self, partition: PartitionId) -> Option<Arc<PartitionStore>> {
        self.stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&partition)
            .cloned()
    }

    fn existing_stores(&self) -> Vec<Arc<PartitionStore>> {
        self.stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn stage(&self, tx: TxId, writes: Vec<TxWrite>) {
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tx, writes);
    }

    fn take_staged(&self, tx: TxId) -> Vec<TxWrite> {
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tx)
            .unwrap_or_default()
    }
}

pub struct Node {
    id: NodeId,
    role: NodeRole,
    ctx: Arc<GridContext>,
    caches: RwLock<HashMap<String, Arc<NodeCache>>>,
    tx: TxManager,
    replicator: Replicator,
    alive: AtomicBool,
}

impl Node {
    pub(crate) fn new(id: NodeId, role: NodeRole, ctx: Arc<GridContext>) -> Arc<Self> {
        let tx = TxManager::new(id, Arc::clone(&ctx.transport), ctx.events.clone());
        let replicator = Replicator::new(Arc::clone(&ctx.transport), ctx.events.clone(), id);
        Arc::new(Self {
            id,
            role,
            ctx,
            caches: RwLock::new(HashMap::new()),
            tx,
            replicator,
            alive: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn ctx(&self) -> &GridContext {
        &self.ctx
    }

    pub fn tx_manager(&self) -> &TxManager {
        &self.tx
    }

    pub(crate) fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        for state in self.cache_states() {
            if let Some(near) = state.near() {
                near.clear();
            }
        }
    }

    pub(crate) fn open_cache(&self, config: CacheConfig) {
        let name = config.name.clone();
        self.caches
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, Arc::new(NodeCache::new(config)));
    }

    pub(crate) fn close_cache(&self, name: &str) {
        self.caches
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn cache_state(&self, name: &str) -> Result<Arc<NodeCache>> {
        self.caches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))
    }

    fn cache_states(&self) -> Vec<Arc<NodeCache>> {
        self.caches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub async fn request(&self, to: NodeId, req: &PeerRequest) -> Result<PeerResponse> {
        self.request_with_timeout(to, req, self.ctx.transport.request_timeout())
            .await
    }

    pub async fn request_with_timeout(
        &self,
        to: NodeId,
        req: &PeerRequest,
        timeout: Duration,
    ) -> Result<PeerResponse> {
        if !self.is_alive() {
            return Err(Error::ConnectionFailed(format!("node {} is stopped", self.id)));
        }
        self.ctx
            .transport
            .request_with_timeout(self.id, to, req, timeout)
            .await
    }

    /// Locks outlive the transaction deadline by this much before a primary
    /// reclaims them on its own.
    fn lease_grace_ms(&self) -> u64 {
        2 * self.ctx.config.request_timeout_ms
    }

    fn not_primary(&self, partition: PartitionId) -> Error {
        Error::NotPrimary {
            partition,
            node: self.id,
        }
    }

    /// Serve the mailbox until the node stops
    pub(crate) fn spawn_dispatcher(self: &Arc<Self>, mut mailbox: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = mailbox.recv().await {
                if !node.is_alive() {
                    break;
                }
                let worker = Arc::clone(&node);
                tokio::spawn(async move { worker.serve(envelope).await });
            }
            tracing::debug!(node = node.id, "Dispatcher stopped");
        })
    }

    async fn serve(&self, envelope: Envelope) {
        let response = match decode_frame::<PeerRequest>(&envelope.frame) {
            Ok(req) => {
                let kind = req.kind();
                match self.handle(envelope.from, req).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::debug!(node = self.id, from = envelope.from, kind, "Request failed: {}", e);
                        PeerResponse::Error(e)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(node = self.id, from = envelope.from, "Undecodable frame: {}", e);
                PeerResponse::Error(e)
            }
        };

        // A stopped node never answers
        if !self.is_alive() {
            return;
        }
        match encode_frame(&response) {
            Ok(frame) => {
                let _ = envelope.reply.send(frame);
            }
            Err(e) => tracing::error!(node = self.id, "Failed to encode response: {}", e),
        }
    }

    pub(crate) async fn handle(&self, from: NodeId, req: PeerRequest) -> Result<PeerResponse> {
        tracing::trace!(node = self.id, from, kind = req.kind(), "Handling request");
        match req {
            PeerRequest::Get {
                cache,
                key,
                reader,
                allow_backup,
            } => self.handle_get(&cache, &key, reader, allow_backup).await,
            PeerRequest::Put {
                cache,
                key,
                value,
                ttl_ms,
                precondition,
            } => self.handle_put(&cache, &key, value, ttl_ms, precondition).await,
            PeerRequest::ReplicateApply {
                cache,
                partition,
                key,
                entry,
            } => {
                let state = self.cache_state(&cache)?;
                let map = self.ctx.map(&cache)?;
                let role = map.role_of(partition, self.id);
                if role != Some(PartitionRole::Backup) {
                    tracing::debug!(node = self.id, partition, "Ignoring replica update: not a backup");
                    METRICS.replication_dropped.inc();
                    return Ok(PeerResponse::Replicated { applied: false });
                }
                let store = state.store(partition, self.id);
                let applied = match store.lock_for_replica(role).await {
                    Some(mut data) => data.apply_replica(&key, entry),
                    None => false,
                };
                if !applied {
                    METRICS.replication_dropped.inc();
                }
                Ok(PeerResponse::Replicated { applied })
            }
            PeerRequest::InvalidateNotify {
                cache,
                key,
                version,
            } => {
                let state = self.cache_state(&cache)?;
                if let Some(near) = state.near() {
                    near.invalidate(&key, version);
                }
                Ok(PeerResponse::Ack)
            }
            PeerRequest::Unsubscribe {
                cache,
                partition,
                reader,
                generation,
            } => {
                self.cache_state(&cache)?
                    .readers
                    .remove_reader(partition, reader, generation);
                Ok(PeerResponse::Ack)
            }
            PeerRequest::Lock {
                cache,
                tx,
                key,
                deadline_ms,
                wait_ms,
            } => self.handle_lock(&cache, tx, &key, deadline_ms, wait_ms).await,
            PeerRequest::Unlock { cache, tx, keys } => {
                self.cache_state(&cache)?.locks.release(tx, &keys);
                Ok(PeerResponse::Ack)
            }
            PeerRequest::Prepare { cache, tx, writes } => self.handle_prepare(&cache, tx, writes).await,
            PeerRequest::CommitApply { cache, tx } => self.handle_commit(&cache, tx).await,
            PeerRequest::Rollback { cache, tx } => {
                let state = self.cache_state(&cache)?;
                state.take_staged(tx);
                state
                    .locks
                    .abort(tx, AbortReason::Explicit, timestamp_now_millis());
                Ok(PeerResponse::Ack)
            }
            PeerRequest::StreamLoad {
                cache,
                entries,
                allow_overwrite,
            } => self.handle_stream_load(&cache, entries, allow_overwrite).await,
            PeerRequest::Snapshot { cache, partition } => {
                let state = self.cache_state(&cache)?;
                let entries = match state.existing_store(partition) {
                    Some(store) => store.data().await.snapshot(),
                    None => Vec::new(),
                };
                Ok(PeerResponse::Snapshot(entries))
            }
            PeerRequest::LocalSize { cache } => {
                let state = self.cache_state(&cache)?;
                let map = self.ctx.map(&cache)?;
                Ok(PeerResponse::Size(self.primary_size(&state, &map).await))
            }
        }
    }

    async fn handle_get(
        &self,
        cache: &str,
        key: &str,
        reader: Option<ReaderTag>,
        allow_backup: bool,
    ) -> Result<PeerResponse> {
        let state = self.cache_state(cache)?;
        let map = self.ctx.map(cache)?;
        let partition = map.partition_of(key);
        let role = map.role_of(partition, self.id);
        let now = timestamp_now_millis();

        let entry = match (role, reader) {
            (Some(PartitionRole::Primary), Some(reader)) => {
                // Register under the partition guard so no write can slip
                // between this read and the registration.
                let store = state.store(partition, self.id);
                let data = store.data().await;
                let entry = data.read(key, now).cloned();
                if entry.is_some() && reader.node != self.id {
                    state
                        .readers
                        .register(partition, key, reader.node, reader.generation);
                }
                entry
            }
            _ => {
                let allow = allow_backup && state.config.read_from_backup;
                state
                    .store(partition, self.id)
                    .get(key, role, allow, now)
                    .await?
            }
        };
        Ok(PeerResponse::Value(entry))
    }

    async fn handle_put(
        &self,
        cache: &str,
        key: &str,
        value: Option<Bytes>,
        ttl_ms: Option<u64>,
        precondition: Precondition,
    ) -> Result<PeerResponse> {
        let state = self.cache_state(cache)?;
        let map = self.ctx.map(cache)?;
        let resp = match self
            .write_primary(&state, &map, key, value, ttl_ms, precondition)
            .await?
        {
            WriteOutcome::Applied {
                entry, previous, ..
            } => PeerResponse::Written {
                applied: true,
                version: Some(entry.version),
                previous,
            },
            WriteOutcome::Rejected { current } => PeerResponse::Written {
                applied: false,
                version: current.as_ref().map(|e| e.version),
                previous: current,
            },
        };
        Ok(resp)
    }

    /// Apply a non-transactional write at the primary: wait out any
    /// transaction lock on the key, apply, replicate, then invalidate
    /// near-cache holders.
    async fn write_primary(
        &self,
        state: &NodeCache,
        map: &PartitionMap,
        key: &str,
        value: Option<Bytes>,
        ttl_ms: Option<u64>,
        precondition: Precondition,
    ) -> Result<WriteOutcome> {
        let partition = map.partition_of(key);
        let owners = map.owners_of(partition)?;
        let role = map.role_of(partition, self.id);
        if role != Some(PartitionRole::Primary) {
            return Err(self.not_primary(partition));
        }
        let store = state.store(partition, self.id);
        let wait = self.ctx.transport.request_timeout();

        loop {
            let mut data = store.lock_for_write(role).await?;
            if state.locks.holder(key).is_some() {
                drop(data);
                state.locks.wait_unlocked(key, wait).await?;
                continue;
            }

            let now = timestamp_now_millis();
            let expires_at = ttl_ms
                .or(state.config.default_ttl_ms)
                .map(|ttl| now + ttl);
            let outcome = data.apply_primary(
                key,
                value.clone(),
                expires_at,
                map.topology_version(),
                precondition,
                now,
            );
            let entry = match &outcome {
                WriteOutcome::Applied { entry, .. } => entry.clone(),
                WriteOutcome::Rejected { .. } => return Ok(outcome),
            };

            let readers = state.readers.take(partition, key);
            let replicated = self
                .replicator
                .replicate(&state.config, partition, &owners.backups, key, &entry)
                .await;
            drop(data);

            self.invalidate(&state.config.name, Invalidation::for_readers(readers, key, entry.version))
                .await;
            replicated?;
            return Ok(outcome);
        }
    }

    async fn invalidate(&self, cache: &str, notices: Vec<Invalidation>) {
        publish_invalidations(&self.ctx.transport, self.id, cache, notices).await;
    }

    async fn handle_lock(
        &self,
        cache: &str,
        tx: TxId,
        key: &str,
        deadline_ms: u64,
        wait_ms: u64,
    ) -> Result<PeerResponse> {
        let state = self.cache_state(cache)?;
        let map = self.ctx.map(cache)?;
        let partition = map.partition_of(key);
        if map.role_of(partition, self.id) != Some(PartitionRole::Primary) {
            return Err(self.not_primary(partition));
        }

        let lease_until = deadline_ms.saturating_add(self.lease_grace_ms());
        state
            .locks
            .acquire(tx, key, lease_until, Duration::from_millis(wait_ms))
            .await?;

        let entry = state
            .store(partition, self.id)
            .data()
            .await
            .read(key, timestamp_now_millis())
            .cloned();
        Ok(PeerResponse::Locked { entry })
    }

    async fn handle_prepare(&self, cache: &str, tx: TxId, writes: Vec<TxWrite>) -> Result<PeerResponse> {
        let state = self.cache_state(cache)?;
        let map = self.ctx.map(cache)?;
        if let Some(reason) = state.locks.aborted_reason(tx) {
            return Err(Error::TransactionAborted {
                tx,
                key: None,
                reason,
            });
        }

        let now = timestamp_now_millis();
        for write in &writes {
            let aborted = |reason| Error::TransactionAborted {
                tx,
                key: Some(write.key.clone()),
                reason,
            };
            let partition = map.partition_of(&write.key);
            if map.role_of(partition, self.id) != Some(PartitionRole::Primary) {
                return Err(aborted(AbortReason::PrepareFailed));
            }
            if state.locks.holder(&write.key) != Some(tx) {
                return Err(aborted(AbortReason::LockConflict));
            }
            let unchanged = state
                .store(partition, self.id)
                .data()
                .await
                .unchanged_since(&write.key, write.expected, now);
            if !unchanged {
                return Err(aborted(AbortReason::VersionChanged));
            }
        }

        tracing::debug!(node = self.id, tx = %tx, writes = writes.len(), "Prepared");
        state.stage(tx, writes);
        Ok(PeerResponse::Prepared)
    }

    /// Apply the staged writes of `tx`, replicate them, invalidate holders
    /// and only then release the transaction's locks.
    ///
    /// A transaction this primary already aborted (lease expiry, rollback)
    /// is refused with its abort reason; its staged writes are gone.
    async fn handle_commit(&self, cache: &str, tx: TxId) -> Result<PeerResponse> {
        let state = self.cache_state(cache)?;
        let map = self.ctx.map(cache)?;
        if state.locks.is_committed(tx) {
            return Ok(PeerResponse::Committed { changes: 0 });
        }

        let writes = state.take_staged(tx);
        if let Some(reason) = state.locks.aborted_reason(tx) {
            tracing::warn!(node = self.id, tx = %tx, reason = %reason, dropped = writes.len(), "Commit refused: transaction aborted here");
            return Err(Error::TransactionAborted {
                tx,
                key: None,
                reason,
            });
        }
        if let Some(lost) = writes.iter().find(|w| state.locks.holder(&w.key) != Some(tx)) {
            let key = lost.key.clone();
            state
                .locks
                .abort(tx, AbortReason::LockConflict, timestamp_now_millis());
            tracing::warn!(node = self.id, tx = %tx, key = %key, "Commit refused: lock no longer held");
            return Err(Error::TransactionAborted {
                tx,
                key: Some(key),
                reason: AbortReason::LockConflict,
            });
        }

        let mut notices = Vec::new();
        let mut changes = 0;
        let mut failure: Option<Error> = None;

        for write in writes {
            let partition = map.partition_of(&write.key);
            let owners = match map.owners_of(partition) {
                Ok(owners) => owners,
                Err(e) => {
                    failure.get_or_insert(e);
                    continue;
                }
            };
            let store = state.store(partition, self.id);
            let mut data = match store.lock_for_write(map.role_of(partition, self.id)).await {
                Ok(data) => data,
                Err(e) => {
                    failure.get_or_insert(e);
                    continue;
                }
            };

            let now = timestamp_now_millis();
            let expires_at = write
                .ttl_ms
                .or(state.config.default_ttl_ms)
                .map(|ttl| now + ttl);
            let outcome = data.apply_primary(
                &write.key,
                write.value,
                expires_at,
                map.topology_version(),
                Precondition::None,
                now,
            );
            if let WriteOutcome::Applied { entry, .. } = outcome {
                changes += 1;
                notices.extend(Invalidation::for_readers(
                    state.readers.take(partition, &write.key),
                    &write.key,
                    entry.version,
                ));
                if let Err(e) = self
                    .replicator
                    .replicate(&state.config, partition, &owners.backups, &write.key, &entry)
                    .await
                {
                    tracing::warn!(node = self.id, tx = %tx, key = %write.key, "Committed without backup: {}", e);
                }
            }
        }

        self.invalidate(cache, notices).await;

        let now = timestamp_now_millis();
        if let Some(e) = failure {
            tracing::error!(node = self.id, tx = %tx, "Commit applied partially: {}", e);
            state.locks.abort(tx, AbortReason::NodeUnreachable, now);
            return Err(e);
        }
        state.locks.commit(tx, now);
        Ok(PeerResponse::Committed { changes })
    }

    async fn handle_stream_load(
        &self,
        cache: &str,
        entries: Vec<(String, Bytes)>,
        allow_overwrite: bool,
    ) -> Result<PeerResponse> {
        let state = self.cache_state(cache)?;
        let map = self.ctx.map(cache)?;
        let precondition = if allow_overwrite {
            Precondition::None
        } else {
            Precondition::IfAbsent
        };

        let (mut applied, mut skipped) = (0, 0);
        let mut rerouted = Vec::new();
        for (key, value) in entries {
            match self
                .write_primary(&state, &map, &key, Some(value.clone()), None, precondition)
                .await
            {
                Ok(outcome) if outcome.is_applied() => applied += 1,
                Ok(_) => skipped += 1,
                Err(e @ Error::ReplicationFailed { .. }) => {
                    tracing::warn!(node = self.id, key = %key, "Loaded without backup: {}", e);
                    applied += 1;
                }
                Err(Error::NotPrimary { .. }) => rerouted.push((key, value)),
                Err(e) if e.is_retryable() => rerouted.push((key, value)),
                Err(e) => return Err(e),
            }
        }

        Ok(PeerResponse::Loaded {
            applied,
            skipped,
            rerouted,
        })
    }

    /// Live entries in the partitions this node is primary for
    async fn primary_size(&self, state: &NodeCache, map: &PartitionMap) -> usize {
        let now = timestamp_now_millis();
        let mut total = 0;
        for store in state.existing_stores() {
            if map.role_of(store.partition(), self.id) == Some(PartitionRole::Primary) {
                total += store.data().await.live_len(now);
            }
        }
        total
    }

    pub async fn local_size(&self, cache: &str) -> Result<usize> {
        let state = self.cache_state(cache)?;
        let map = self.ctx.map(cache)?;
        Ok(self.primary_size(&state, &map).await)
    }

    /// React to a new partition map for `cache`
    pub(crate) fn on_topology_change(&self, cache: &str, map: &PartitionMap, departed: &[NodeId]) {
        let Ok(state) = self.cache_state(cache) else {
            return;
        };

        state
            .readers
            .retain_partitions(|p| map.role_of(p, self.id) == Some(PartitionRole::Primary));
        for node in departed {
            state.readers.remove_node(*node);
        }

        if let Some(near) = state.near() {
            near.reset_partitions(|partition, primary| {
                map.primary_of(partition) != Some(primary)
            });
        }
    }

    pub(crate) fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.ctx.config.maintenance_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick: u64 = 0;
            loop {
                ticker.tick().await;
                if !node.is_alive() {
                    break;
                }
                tick += 1;
                node.maintain(tick % PURGE_EVERY_TICKS == 0).await;
            }
        })
    }

    async fn maintain(&self, purge: bool) {
        let now = timestamp_now_millis();
        for state in self.cache_states() {
            for tx in state.locks.expire_leases(now) {
                state.take_staged(tx);
                tracing::warn!(node = self.id, tx = %tx, cache = %state.config.name, "Lock lease expired");
            }
            state.locks.forget_outcomes(now);

            if let Some(near) = state.near() {
                self.flush_unsubscribes(&state.config.name, near).await;
            }

            if purge {
                for store in state.existing_stores() {
                    let purged = store.data().await.purge_expired(now);
                    if purged > 0 {
                        tracing::debug!(node = self.id, partition = store.partition(), purged, "Purged expired entries");
                    }
                }
            }
        }

        let reaped = self.tx.reap_expired().await;
        if reaped > 0 {
            tracing::info!(node = self.id, reaped, "Rolled back expired transactions");
        }
    }

    /// Tell primaries about partitions this node no longer reads
    pub(crate) async fn flush_unsubscribes(&self, cache: &str, near: &NearCache) {
        for Unsubscribe {
            partition,
            primary,
            generation,
        } in near.take_unsubscribes()
        {
            let req = PeerRequest::Unsubscribe {
                cache: cache.to_string(),
                partition,
                reader: self.id,
                generation,
            };
            if let Err(e) = self.request(primary, &req).await {
                tracing::debug!(node = self.id, primary, partition, "Unsubscribe not delivered: {}", e);
            }
        }
    }
}
