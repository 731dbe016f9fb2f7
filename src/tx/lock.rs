//! Per-key pessimistic locks held at a partition primary.
//!
//! Locks are leased: each carries the owning transaction's deadline (plus a
//! grace period) and is reclaimed by the node's maintenance loop once the
//! lease runs out. A transaction that is rolled back is remembered for a
//! while so that late lock requests from it fail instead of re-locking; a
//! committed one is remembered so that a redelivered commit is answered
//! without applying anything twice.

use crate::common::{AbortReason, Error, Result, METRICS};
use crate::tx::TxId;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

const OUTCOME_RETENTION_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy)]
struct Lease {
    tx: TxId,
    until_ms: u64,
}

#[derive(Debug, Default)]
struct LockState {
    held: HashMap<String, Lease>,
    aborted: HashMap<TxId, (AbortReason, u64)>,
    committed: HashMap<TxId, u64>,
}

#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    released: Notify,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn aborted_error(tx: TxId, key: &str, reason: AbortReason) -> Error {
        Error::TransactionAborted {
            tx,
            key: Some(key.to_string()),
            reason,
        }
    }

    /// Take the lock if free (or already ours). Fails if `tx` was aborted.
    pub fn try_acquire(&self, tx: TxId, key: &str, until_ms: u64) -> Result<bool> {
        let mut st = self.state();
        if let Some((reason, _)) = st.aborted.get(&tx) {
            return Err(Self::aborted_error(tx, key, *reason));
        }
        match st.held.get_mut(key) {
            Some(lease) if lease.tx == tx => {
                lease.until_ms = lease.until_ms.max(until_ms);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                st.held.insert(key.to_string(), Lease { tx, until_ms });
                Ok(true)
            }
        }
    }

    /// Take the lock, waiting at most `wait` for the current holder.
    pub async fn acquire(&self, tx: TxId, key: &str, until_ms: u64, wait: Duration) -> Result<()> {
        let give_up = tokio::time::Instant::now() + wait;
        let mut counted = false;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_acquire(tx, key, until_ms)? {
                return Ok(());
            }
            if !counted {
                METRICS.lock_waits.inc();
                counted = true;
            }
            if tokio::time::timeout_at(give_up, released).await.is_err() {
                return Err(Self::aborted_error(tx, key, AbortReason::LockConflict));
            }
        }
    }

    /// Wait until nobody holds the key; used by non-transactional writers.
    pub async fn wait_unlocked(&self, key: &str, wait: Duration) -> Result<()> {
        let give_up = tokio::time::Instant::now() + wait;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.holder(key).is_none() {
                return Ok(());
            }
            if tokio::time::timeout_at(give_up, released).await.is_err() {
                return Err(Error::Timeout(format!("key '{}' stayed locked", key)));
            }
        }
    }

    pub fn holder(&self, key: &str) -> Option<TxId> {
        self.state().held.get(key).map(|lease| lease.tx)
    }

    /// Release the given keys if `tx` holds them
    pub fn release(&self, tx: TxId, keys: &[String]) -> usize {
        let released = {
            let mut st = self.state();
            keys.iter()
                .filter(|key| match st.held.get(key.as_str()) {
                    Some(lease) if lease.tx == tx => {
                        st.held.remove(key.as_str());
                        true
                    }
                    _ => false,
                })
                .count()
        };
        if released > 0 {
            self.released.notify_waiters();
        }
        released
    }

    /// Release everything `tx` holds and refuse its future lock requests.
    /// Waiters blocked on behalf of `tx` fail on their next wake-up.
    pub fn abort(&self, tx: TxId, reason: AbortReason, now_ms: u64) -> usize {
        let released = {
            let mut st = self.state();
            st.aborted
                .entry(tx)
                .or_insert((reason, now_ms + OUTCOME_RETENTION_MS));
            let before = st.held.len();
            st.held.retain(|_, lease| lease.tx != tx);
            before - st.held.len()
        };
        self.released.notify_waiters();
        released
    }

    /// Release everything `tx` holds and remember that it committed
    pub fn commit(&self, tx: TxId, now_ms: u64) -> usize {
        let released = {
            let mut st = self.state();
            st.committed.insert(tx, now_ms + OUTCOME_RETENTION_MS);
            let before = st.held.len();
            st.held.retain(|_, lease| lease.tx != tx);
            before - st.held.len()
        };
        self.released.notify_waiters();
        released
    }

    pub fn is_committed(&self, tx: TxId) -> bool {
        self.state().committed.contains_key(&tx)
    }

    pub fn aborted_reason(&self, tx: TxId) -> Option<AbortReason> {
        self.state().aborted.get(&tx).map(|(reason, _)| *reason)
    }

    /// Abort transactions whose lease ran out; returns them.
    pub fn expire_leases(&self, now_ms: u64) -> Vec<TxId> {
        let expired: Vec<TxId> = {
            let st = self.state();
            let set: HashSet<TxId> = st
                .held
                .values()
                .filter(|lease| lease.until_ms <= now_ms)
                .map(|lease| lease.tx)
                .collect();
            set.into_iter().collect()
        };
        for tx in &expired {
            self.abort(*tx, AbortReason::Deadline, now_ms);
        }
        expired
    }

    /// Drop outcome records older than the retention window
    pub fn forget_outcomes(&self, now_ms: u64) {
        let mut st = self.state();
        st.aborted.retain(|_, (_, until)| *until > now_ms);
        st.committed.retain(|_, until| *until > now_ms);
    }

    pub fn locked_count(&self) -> usize {
        self.state().held.len()
    }
}
