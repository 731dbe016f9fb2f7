//! Cache facade
//!
//! The API callers use, bound to one node. Reads go through the node's near
//! cache when the node is not the key's primary; mutations go straight to the
//! primary, wrapped in an implicit transaction when the cache is
//! transactional. Routing failures (primary moved, node unreachable) are
//! retried against the current partition map.

use crate::common::{
    retry_with_backoff, validate_key, AbortReason, CacheConfig, Error, GridEvent, Result,
    TxIsolation, METRICS,
};
use crate::grid::protocol::{PeerRequest, PeerResponse, ReaderTag};
use crate::grid::{Node, NodeId, Owners, PartitionId, PartitionMap};
use crate::near::NearCache;
use crate::store::{Entry, Precondition};
use crate::streamer::DataStreamer;
use crate::tx::Transaction;
use bytes::Bytes;
use futures_util::future::{try_join_all, BoxFuture};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

const ROUTING_RETRIES: usize = 4;
const ROUTING_BACKOFF: Duration = Duration::from_millis(20);
const MAX_CAS_ATTEMPTS: usize = 32;

/// What an entry processor wants done with the entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryAction {
    Keep,
    Put(Bytes),
    Remove,
}

/// Where a near-cache candidate came from
#[derive(Debug, Clone, Copy)]
struct Fetched {
    partition: PartitionId,
    primary: NodeId,
    generation: u64,
}

/// Primary's answer to a direct write
#[derive(Debug, Clone)]
struct WriteResult {
    applied: bool,
    previous: Option<Entry>,
}

#[derive(Clone)]
pub struct Cache {
    node: Arc<Node>,
    config: CacheConfig,
}

impl Cache {
    pub(crate) fn new(node: Arc<Node>, config: CacheConfig) -> Self {
        Self { node, config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn partition_map(&self) -> Result<Arc<PartitionMap>> {
        self.node.ctx().map(&self.config.name)
    }

    async fn timed<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let start = Instant::now();
        let result = fut
            .instrument(tracing::debug_span!("cache", op, cache = %self.config.name, node = self.node.id()))
            .await;
        METRICS.record_operation(op, start.elapsed(), result.is_ok());
        result
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.timed("get", self.read_committed(key)).await
    }

    pub async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Read several keys; absent keys are left out of the result
    pub async fn get_all(&self, keys: &[&str]) -> Result<HashMap<String, Bytes>> {
        let reads = keys.iter().map(|key| async move {
            let value = self.read_committed(key).await?;
            Ok::<_, Error>(value.map(|v| (key.to_string(), v)))
        });
        let values = self.timed("get_all", try_join_all(reads)).await?;
        Ok(values.into_iter().flatten().collect())
    }

    /// Routed read with the near cache in front
    pub(crate) async fn read_committed(&self, key: &str) -> Result<Option<Bytes>> {
        validate_key(key)?;
        retry_with_backoff(|| self.read_once(key), ROUTING_RETRIES, ROUTING_BACKOFF).await
    }

    async fn read_once(&self, key: &str) -> Result<Option<Bytes>> {
        let map = self.partition_map()?;
        let (partition, owners) = map.owners_of_key(key)?;
        let state = self.node.cache_state(&self.config.name)?;
        let near = state
            .near()
            .filter(|_| owners.primary != self.node.id());

        if let Some(near) = near {
            self.node.flush_unsubscribes(&self.config.name, near).await;
            if let Some((value, _)) = near.get(key) {
                METRICS.near_hits.inc();
                return Ok(Some(value));
            }
            METRICS.near_misses.inc();
        }

        let reader = near.map(|near| ReaderTag {
            node: self.node.id(),
            generation: near.generation(),
        });
        let entry = self.fetch(key, &owners, reader).await?;

        if let (Some(near), Some(reader), Some(entry)) = (near, reader, entry.as_ref()) {
            if let Some(value) = &entry.value {
                let fetched = Fetched {
                    partition,
                    primary: owners.primary,
                    generation: reader.generation,
                };
                self.offer_near(near, key, fetched, value.clone(), entry);
            }
        }
        Ok(entry.and_then(|e| e.value))
    }

    fn offer_near(&self, near: &NearCache, key: &str, fetched: Fetched, value: Bytes, entry: &Entry) {
        let stale = near.offer(
            key,
            fetched.partition,
            fetched.primary,
            value,
            entry.version,
            entry.expires_at,
            fetched.generation,
        );
        if let Some(stale) = stale {
            METRICS.stale_reads.inc();
            tracing::warn!(
                cache = %self.config.name,
                key,
                node = self.node.id(),
                served = %stale.served,
                actual = %stale.actual,
                "Near cache served a stale value"
            );
            self.node.ctx().events.publish(GridEvent::StaleRead {
                cache: self.config.name.clone(),
                key: key.to_string(),
                node: self.node.id(),
                served: stale.served,
                actual: stale.actual,
            });
        }
    }

    /// Read the owner's entry, falling back to backups when permitted
    async fn fetch(&self, key: &str, owners: &Owners, reader: Option<ReaderTag>) -> Result<Option<Entry>> {
        let req = PeerRequest::Get {
            cache: self.config.name.clone(),
            key: key.to_string(),
            reader,
            allow_backup: false,
        };
        let primary_err = match self.node.request(owners.primary, &req).await {
            Ok(resp) => return expect_value(resp),
            Err(e) => e,
        };
        if !self.config.read_from_backup || !primary_err.is_retryable() {
            return Err(primary_err);
        }

        let req = PeerRequest::Get {
            cache: self.config.name.clone(),
            key: key.to_string(),
            reader: None,
            allow_backup: true,
        };
        for backup in &owners.backups {
            match self.node.request(*backup, &req).await {
                Ok(resp) => return expect_value(resp),
                Err(e) => tracing::debug!(backup, key, "Backup read failed: {}", e),
            }
        }
        Err(primary_err)
    }

    /// Fetch the primary's entry without touching the near cache
    async fn fetch_primary(&self, key: &str) -> Result<Option<Entry>> {
        retry_with_backoff(
            || async {
                let map = self.partition_map()?;
                let (_, owners) = map.owners_of_key(key)?;
                let req = PeerRequest::Get {
                    cache: self.config.name.clone(),
                    key: key.to_string(),
                    reader: None,
                    allow_backup: false,
                };
                expect_value(self.node.request(owners.primary, &req).await?)
            },
            ROUTING_RETRIES,
            ROUTING_BACKOFF,
        )
        .await
    }

    async fn write_direct(
        &self,
        key: &str,
        value: Option<Bytes>,
        ttl_ms: Option<u64>,
        precondition: Precondition,
    ) -> Result<WriteResult> {
        validate_key(key)?;
        retry_with_backoff(
            || self.write_once(key, value.clone(), ttl_ms, precondition),
            ROUTING_RETRIES,
            ROUTING_BACKOFF,
        )
        .await
    }

    async fn write_once(
        &self,
        key: &str,
        value: Option<Bytes>,
        ttl_ms: Option<u64>,
        precondition: Precondition,
    ) -> Result<WriteResult> {
        let map = self.partition_map()?;
        let (_, owners) = map.owners_of_key(key)?;
        let req = PeerRequest::Put {
            cache: self.config.name.clone(),
            key: key.to_string(),
            value,
            ttl_ms,
            precondition,
        };
        match self.node.request(owners.primary, &req).await? {
            PeerResponse::Written {
                applied,
                version,
                previous,
            } => {
                // Drop our own copy at once; the primary never lists the
                // writer as a holder of its new version.
                if let (true, Some(version)) = (applied, version) {
                    if let Some(near) = self.node.cache_state(&self.config.name)?.near() {
                        near.invalidate(key, version);
                    }
                }
                Ok(WriteResult { applied, previous })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Run `body` in an implicit transaction, retrying when a primary
    /// became unreachable under it.
    async fn with_implicit_tx<T, F>(&self, mut body: F) -> Result<T>
    where
        F: for<'t> FnMut(&'t mut Transaction) -> BoxFuture<'t, Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.tx_start_with(self.config.tx_isolation);
            let result = match body(&mut tx).await {
                Ok(value) => tx.commit().await.map(|_| value),
                Err(e) => Err(e),
            };
            match result {
                Err(e)
                    if attempt < ROUTING_RETRIES
                        && e.abort_reason() == Some(AbortReason::NodeUnreachable) =>
                {
                    tracing::debug!(cache = %self.config.name, attempt, "Retrying implicit transaction: {}", e);
                    tokio::time::sleep(ROUTING_BACKOFF * attempt as u32).await;
                }
                other => return other,
            }
        }
    }

    pub async fn put(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.put_inner(key, value.into(), None).await
    }

    pub async fn put_with_ttl(&self, key: &str, value: impl Into<Bytes>, ttl: Duration) -> Result<()> {
        self.put_inner(key, value.into(), Some(ttl.as_millis() as u64))
            .await
    }

    async fn put_inner(&self, key: &str, value: Bytes, ttl_ms: Option<u64>) -> Result<()> {
        validate_key(key)?;
        let fut = async {
            if self.config.tx_enabled {
                let key = key.to_string();
                self.with_implicit_tx(move |tx| {
                    let key = key.clone();
                    let value = value.clone();
                    Box::pin(async move {
                        match ttl_ms {
                            Some(ttl) => tx.put_with_ttl(&key, value, Duration::from_millis(ttl)).await,
                            None => tx.put(&key, value).await,
                        }
                    })
                })
                .await
            } else {
                self.write_direct(key, Some(value), ttl_ms, Precondition::None)
                    .await
                    .map(|_| ())
            }
        };
        self.timed("put", fut).await
    }

    /// Put and return the previous value
    pub async fn get_and_put(&self, key: &str, value: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let value = value.into();
        if self.config.tx_enabled {
            return self
                .timed(
                    "get_and_put",
                    self.invoke_inner(key, move |_| EntryAction::Put(value.clone())),
                )
                .await;
        }
        let fut = async {
            let written = self
                .write_direct(key, Some(value), None, Precondition::None)
                .await?;
            Ok(written.previous.and_then(|e| e.value))
        };
        self.timed("get_and_put", fut).await
    }

    /// Put only when no live entry exists; returns whether it was stored
    pub async fn put_if_absent(&self, key: &str, value: impl Into<Bytes>) -> Result<bool> {
        let value = value.into();
        let fut = async {
            if self.config.tx_enabled {
                let previous = self
                    .invoke_inner(key, move |current| match current {
                        None => EntryAction::Put(value.clone()),
                        Some(_) => EntryAction::Keep,
                    })
                    .await?;
                Ok(previous.is_none())
            } else {
                let written = self
                    .write_direct(key, Some(value), None, Precondition::IfAbsent)
                    .await?;
                Ok(written.applied)
            }
        };
        self.timed("put_if_absent", fut).await
    }

    /// Put only when a live entry exists; returns whether it was replaced
    pub async fn replace(&self, key: &str, value: impl Into<Bytes>) -> Result<bool> {
        let value = value.into();
        let fut = async {
            if self.config.tx_enabled {
                let previous = self
                    .invoke_inner(key, move |current| match current {
                        Some(_) => EntryAction::Put(value.clone()),
                        None => EntryAction::Keep,
                    })
                    .await?;
                Ok(previous.is_some())
            } else {
                let written = self
                    .write_direct(key, Some(value), None, Precondition::IfPresent)
                    .await?;
                Ok(written.applied)
            }
        };
        self.timed("replace", fut).await
    }

    /// Remove a key; returns whether it was present
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let fut = async {
            if self.config.tx_enabled {
                let previous = self
                    .invoke_inner(key, |current| match current {
                        Some(_) => EntryAction::Remove,
                        None => EntryAction::Keep,
                    })
                    .await?;
                Ok(previous.is_some())
            } else {
                let written = self
                    .write_direct(key, None, None, Precondition::None)
                    .await?;
                Ok(written.applied)
            }
        };
        self.timed("remove", fut).await
    }

    /// Store several entries; atomically when the cache is transactional
    pub async fn put_all(&self, entries: Vec<(String, Bytes)>) -> Result<()> {
        for (key, _) in &entries {
            validate_key(key)?;
        }
        let fut = async {
            if self.config.tx_enabled {
                let entries = self.in_lock_order(entries)?;
                self.with_implicit_tx(move |tx| {
                    let entries = entries.clone();
                    Box::pin(async move {
                        for (key, value) in entries {
                            tx.put(&key, value).await?;
                        }
                        Ok(())
                    })
                })
                .await
            } else {
                let writes = entries.into_iter().map(|(key, value)| async move {
                    self.write_direct(&key, Some(value), None, Precondition::None)
                        .await
                });
                try_join_all(writes).await.map(|_| ())
            }
        };
        self.timed("put_all", fut).await
    }

    pub async fn remove_all(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            validate_key(key)?;
        }
        let fut = async {
            if self.config.tx_enabled {
                let keyed = keys.iter().map(|k| (k.to_string(), ())).collect();
                let ordered = self.in_lock_order(keyed)?;
                self.with_implicit_tx(move |tx| {
                    let ordered = ordered.clone();
                    Box::pin(async move {
                        for (key, _) in ordered {
                            tx.remove(&key).await?;
                        }
                        Ok(())
                    })
                })
                .await
            } else {
                let removes = keys.iter().map(|key| async move {
                    self.write_direct(key, None, None, Precondition::None).await
                });
                try_join_all(removes).await.map(|_| ())
            }
        };
        self.timed("remove_all", fut).await
    }

    /// Sort by lock order so a batch never has to re-order its locks
    fn in_lock_order<V>(&self, mut entries: Vec<(String, V)>) -> Result<Vec<(String, V)>> {
        let map = self.partition_map()?;
        entries.sort_by_cached_key(|(key, _)| {
            (map.partition_of(key), crate::common::key_hash(key), key.clone())
        });
        Ok(entries)
    }

    /// Apply `processor` to the current value atomically; returns the value
    /// it saw. Runs under a lock when the cache is transactional and as a
    /// compare-and-set loop otherwise.
    pub async fn invoke<F>(&self, key: &str, processor: F) -> Result<Option<Bytes>>
    where
        F: FnMut(Option<&Bytes>) -> EntryAction + Send,
    {
        self.timed("invoke", self.invoke_inner(key, processor)).await
    }

    async fn invoke_inner<F>(&self, key: &str, mut processor: F) -> Result<Option<Bytes>>
    where
        F: FnMut(Option<&Bytes>) -> EntryAction + Send,
    {
        validate_key(key)?;
        if self.config.tx_enabled {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.invoke_locked(key, &mut processor).await {
                    Err(e)
                        if attempt < ROUTING_RETRIES
                            && e.abort_reason() == Some(AbortReason::NodeUnreachable) =>
                    {
                        tokio::time::sleep(ROUTING_BACKOFF * attempt as u32).await;
                    }
                    other => return other,
                }
            }
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let entry = self.fetch_primary(key).await?;
            let current = entry.as_ref().and_then(|e| e.value.clone());
            let precondition = match &entry {
                Some(e) => Precondition::IfVersion(e.version),
                None => Precondition::IfAbsent,
            };
            let written = match processor(current.as_ref()) {
                EntryAction::Keep => return Ok(current),
                EntryAction::Put(value) => {
                    self.write_direct(key, Some(value), None, precondition)
                        .await?
                }
                EntryAction::Remove if current.is_none() => return Ok(None),
                EntryAction::Remove => self.write_direct(key, None, None, precondition).await?,
            };
            if written.applied {
                return Ok(current);
            }
        }
        Err(Error::Timeout(format!(
            "invoke on '{}' lost {} compare-and-set races",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    async fn invoke_locked<F>(&self, key: &str, processor: &mut F) -> Result<Option<Bytes>>
    where
        F: FnMut(Option<&Bytes>) -> EntryAction + Send,
    {
        let mut tx = self.tx_start_with(self.config.tx_isolation);
        let current = tx.get_for_update(key).await?;
        match processor(current.as_ref()) {
            EntryAction::Keep => {}
            EntryAction::Put(value) => tx.put(key, value).await?,
            EntryAction::Remove => {
                tx.remove(key).await?;
            }
        }
        tx.commit().await?;
        Ok(current)
    }

    /// Start an explicit transaction with the cache's default isolation
    pub fn tx_start(&self) -> Transaction {
        self.tx_start_with(self.config.tx_isolation)
    }

    pub fn tx_start_with(&self, isolation: TxIsolation) -> Transaction {
        self.tx_start_with_timeout(isolation, self.config.tx_timeout())
    }

    /// Start a transaction that rolls back once `timeout` elapses
    pub fn tx_start_with_timeout(&self, isolation: TxIsolation, timeout: Duration) -> Transaction {
        Transaction::begin(self.clone(), isolation, timeout)
    }

    /// Live entries across all primaries
    pub async fn size(&self) -> Result<usize> {
        let req = PeerRequest::LocalSize {
            cache: self.config.name.clone(),
        };
        let servers = self.node.ctx().live_servers();
        let sizes = servers.iter().map(|server| {
            let req = &req;
            async move {
                match self.node.request(*server, req).await? {
                    PeerResponse::Size(n) => Ok(n),
                    other => Err(unexpected(other)),
                }
            }
        });
        Ok(try_join_all(sizes).await?.into_iter().sum())
    }

    /// Live entries in the partitions this node is primary for
    pub async fn local_size(&self) -> Result<usize> {
        self.node.local_size(&self.config.name).await
    }

    /// Entries held in this node's near cache
    pub fn near_size(&self) -> usize {
        self.node
            .cache_state(&self.config.name)
            .ok()
            .and_then(|state| state.near().map(|near| near.len()))
            .unwrap_or(0)
    }

    pub fn streamer(&self) -> DataStreamer {
        DataStreamer::new(self.clone())
    }
}

fn expect_value(resp: PeerResponse) -> Result<Option<Entry>> {
    match resp {
        PeerResponse::Value(entry) => Ok(entry),
        other => Err(unexpected(other)),
    }
}

fn unexpected(resp: PeerResponse) -> Error {
    Error::Internal(format!("unexpected response: {:?}", resp))
}
