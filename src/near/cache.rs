//! Holder side of the near cache
//!
//! A node that is not the primary of a partition may keep copies of entries
//! it read from that partition. A copy is served only while the holder is
//! subscribed to the partition's current primary and the copy is younger
//! than the TTL; the TTL caps staleness when an invalidation is lost.

use crate::common::{timestamp_now_millis, METRICS};
use crate::grid::{NodeId, PartitionId};
use crate::store::Version;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct NearEntry {
    value: Bytes,
    version: Version,
    partition: PartitionId,
    primary: NodeId,
    cached_at: Instant,
    /// Expiry of the owner's entry, Unix milliseconds
    expires_at: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    primary: NodeId,
    keys: usize,
}

/// An unsubscribe owed to a primary: forget this holder's registrations in
/// `partition` made at or before `generation`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsubscribe {
    pub partition: PartitionId,
    pub primary: NodeId,
    pub generation: u64,
}

/// Proof that a previously served copy was older than the owner's version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleRead {
    pub served: Version,
    pub actual: Version,
}

#[derive(Debug, Default)]
struct NearState {
    entries: HashMap<String, NearEntry>,
    subscriptions: HashMap<PartitionId, Subscription>,
    /// Highest version announced by invalidations, per key, with the
    /// stamp of the last update
    invalidated: HashMap<String, (Version, u64)>,
    /// Versions that aged out by TTL without an invalidation
    aged_out: HashMap<String, (Version, u64)>,
    stamp: u64,
    /// Subscription generation; fetches carry it to the owner
    generation: u64,
    /// Generation at which each partition last lost its subscription
    dropped: HashMap<PartitionId, u64>,
    /// Subscriptions that lost their last key; the owner should forget us
    pending_unsubscribe: Vec<Unsubscribe>,
}

impl NearState {
    fn remove_entry(&mut self, key: &str) -> Option<NearEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(sub) = self.subscriptions.get_mut(&entry.partition) {
            if sub.primary == entry.primary {
                sub.keys = sub.keys.saturating_sub(1);
                if sub.keys == 0 {
                    self.subscriptions.remove(&entry.partition);
                    let generation = self.generation;
                    self.generation += 1;
                    self.dropped.insert(entry.partition, generation);
                    self.pending_unsubscribe.push(Unsubscribe {
                        partition: entry.partition,
                        primary: entry.primary,
                        generation,
                    });
                }
            }
        }
        Some(entry)
    }

    fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.cached_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.remove_entry(&key);
        }
    }
}

#[derive(Debug)]
pub struct NearCache {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<NearState>,
}

impl NearCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: Mutex::new(NearState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NearState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Local lookup; never blocks on I/O.
    pub fn get(&self, key: &str) -> Option<(Bytes, Version)> {
        let mut st = self.state();
        let entry = st.entries.get(key)?.clone();

        if entry.cached_at.elapsed() >= self.ttl {
            st.remove_entry(key);
            let stamp = st.next_stamp();
            st.aged_out.insert(key.to_string(), (entry.version, stamp));
            trim_oldest(&mut st.aged_out, self.max_entries);
            return None;
        }

        if entry
            .expires_at
            .map(|exp| timestamp_now_millis() > exp)
            .unwrap_or(false)
        {
            st.remove_entry(key);
            return None;
        }

        let subscribed = st
            .subscriptions
            .get(&entry.partition)
            .map(|s| s.primary == entry.primary)
            .unwrap_or(false);
        if !subscribed {
            st.remove_entry(key);
            return None;
        }

        Some((entry.value, entry.version))
    }

    /// Generation to send with a fetch that may be offered afterwards
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Cache a copy fetched from `primary` by a fetch that carried
    /// `generation`.
    ///
    /// A copy older than an invalidation already received is refused, which
    /// closes the race between an in-flight fetch and a concurrent write.
    /// So is a copy whose partition lost its subscription while the fetch
    /// was in flight: the owner may drop that fetch's registration.
    /// Returns a `StaleRead` when the fetch proves that a copy which aged
    /// out without invalidation had been stale.
    #[allow(clippy::too_many_arguments)]
    pub fn offer(
        &self,
        key: &str,
        partition: PartitionId,
        primary: NodeId,
        value: Bytes,
        version: Version,
        expires_at: Option<u64>,
        generation: u64,
    ) -> Option<StaleRead> {
        let mut st = self.state();

        let stale = st
            .aged_out
            .remove(key)
            .map(|(served, _)| served)
            .filter(|served| version > *served)
            .map(|served| StaleRead {
                served,
                actual: version,
            });

        if let Some((announced, _)) = st.invalidated.get(key) {
            if *announced > version {
                return stale;
            }
        }
        if st.dropped.get(&partition).is_some_and(|d| *d >= generation) {
            return stale;
        }
        st.invalidated.remove(key);

        if let Some(existing) = st.entries.get(key) {
            if existing.version > version {
                return stale;
            }
        }
        st.remove_entry(key);

        // A partition that moved to another primary restarts its subscription
        let moved = st
            .subscriptions
            .get(&partition)
            .map(|s| s.primary != primary)
            .unwrap_or(false);
        if moved {
            st.subscriptions.remove(&partition);
            st.entries.retain(|_, e| e.partition != partition);
        }
        st.subscriptions
            .entry(partition)
            .or_insert(Subscription { primary, keys: 0 })
            .keys += 1;

        st.entries.insert(
            key.to_string(),
            NearEntry {
                value,
                version,
                partition,
                primary,
                cached_at: Instant::now(),
                expires_at,
            },
        );

        while st.entries.len() > self.max_entries {
            st.evict_oldest();
        }

        stale
    }

    /// Apply an invalidation from the owner. Copies older than `version`
    /// are dropped; returns whether a copy was dropped.
    pub fn invalidate(&self, key: &str, version: Version) -> bool {
        let mut st = self.state();
        METRICS.near_invalidations.inc();

        let stamp = st.next_stamp();
        let announced = st
            .invalidated
            .entry(key.to_string())
            .or_insert((version, stamp));
        if announced.0 < version {
            *announced = (version, stamp);
        }
        trim_oldest(&mut st.invalidated, self.max_entries);

        let older = st
            .entries
            .get(key)
            .map(|e| e.version < version)
            .unwrap_or(false);
        if older {
            st.remove_entry(key);
        }
        older
    }

    /// Drop copies whose partition now has a different primary
    pub fn reset_partitions(&self, moved: impl Fn(PartitionId, NodeId) -> bool) {
        let mut st = self.state();
        st.entries.retain(|_, e| !moved(e.partition, e.primary));
        st.subscriptions
            .retain(|partition, sub| !moved(*partition, sub.primary));
    }

    pub fn take_unsubscribes(&self) -> Vec<Unsubscribe> {
        std::mem::take(&mut self.state().pending_unsubscribe)
    }

    pub fn is_subscribed(&self, partition: PartitionId) -> bool {
        self.state().subscriptions.contains_key(&partition)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut st = self.state();
        // Generations stay monotonic across a clear
        let generation = st.generation;
        let dropped = std::mem::take(&mut st.dropped);
        *st = NearState {
            generation,
            dropped,
            ..NearState::default()
        };
    }
}

/// Drop the oldest records once `records` outgrows `max`
fn trim_oldest(records: &mut HashMap<String, (Version, u64)>, max: usize) {
    while records.len() > max {
        let oldest = records
            .iter()
            .min_by_key(|(_, (_, stamp))| *stamp)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => records.remove(&key),
            None => break,
        };
    }
}
