//! Partition store
//!
//! Holds the entries of one partition on one node, in either the primary or
//! the backup role. All mutations of a partition go through its async mutex,
//! which linearizes concurrent writers to the same partition while writers to
//! other partitions proceed in parallel. A primary keeps the guard across
//! FULL_SYNC replication so backups observe writes in version order.

use crate::common::{Error, Result};
use crate::grid::{NodeId, PartitionId, PartitionRole};
use crate::store::entry::{ChangeEvent, Entry, Precondition, Version};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};

/// Result of a primary write attempt
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Applied {
        entry: Entry,
        previous: Option<Entry>,
        change: ChangeEvent,
    },
    /// Precondition failed (or removal of an absent key); nothing changed
    Rejected { current: Option<Entry> },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }
}

/// Entries of one partition
#[derive(Debug, Default)]
pub struct PartitionData {
    entries: HashMap<String, Entry>,
}

impl PartitionData {
    /// Live entry for a key (tombstones and expired entries read as absent)
    pub fn read(&self, key: &str, now_ms: u64) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(now_ms))
    }

    /// Version of the live entry, if any
    pub fn live_version(&self, key: &str, now_ms: u64) -> Option<Version> {
        self.read(key, now_ms).map(|e| e.version)
    }

    /// Version stored for a key, including expired entries and tombstones
    pub fn stored_version(&self, key: &str) -> Option<Version> {
        self.entries.get(key).map(|e| e.version)
    }

    /// Whether the key is where a reader that saw `seen` left it. An entry
    /// that merely expired since then has not changed.
    pub fn unchanged_since(&self, key: &str, seen: Option<Version>, now_ms: u64) -> bool {
        match seen {
            None => self.live_version(key, now_ms).is_none(),
            Some(seen) => self.stored_version(key) == Some(seen),
        }
    }

    /// Apply a client write on the primary.
    ///
    /// The version is bumped before the caller replicates, so a primary that
    /// crashes mid-replication still holds the unambiguous latest version.
    pub fn apply_primary(
        &mut self,
        key: &str,
        value: Option<Bytes>,
        expires_at: Option<u64>,
        epoch: u64,
        precondition: Precondition,
        now_ms: u64,
    ) -> WriteOutcome {
        let current = self.entries.get(key);
        let live = current.filter(|e| e.is_live(now_ms)).cloned();

        if !precondition.holds(current, now_ms) || (value.is_none() && live.is_none()) {
            return WriteOutcome::Rejected { current: live };
        }

        let old_version = current.map(|e| e.version);
        let new_version = old_version.unwrap_or(Version::ZERO).next(epoch);
        let entry = match value {
            Some(v) => Entry::live(v, new_version, expires_at),
            None => Entry::tombstone(new_version),
        };
        self.entries.insert(key.to_string(), entry.clone());

        WriteOutcome::Applied {
            entry,
            previous: live,
            change: ChangeEvent {
                key: key.to_string(),
                old_version,
                new_version,
            },
        }
    }

    /// Apply a replicated entry on a backup.
    ///
    /// Only strictly newer versions are applied, which makes redelivery safe;
    /// returns whether anything changed.
    pub fn apply_replica(&mut self, key: &str, entry: Entry) -> bool {
        match self.entries.get(key) {
            Some(held) if held.version >= entry.version => false,
            _ => {
                self.entries.insert(key.to_string(), entry);
                true
            }
        }
    }

    /// Turn expired entries into tombstones, keeping their versions.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let mut purged = 0;
        for entry in self.entries.values_mut() {
            if entry.value.is_some() && entry.is_expired(now_ms) {
                *entry = Entry::tombstone(entry.version);
                purged += 1;
            }
        }
        purged
    }

    /// All entries including tombstones
    pub fn snapshot(&self) -> Vec<(String, Entry)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    pub fn live_len(&self, now_ms: u64) -> usize {
        self.entries.values().filter(|e| e.is_live(now_ms)).count()
    }
}

/// Partition store of one node
#[derive(Debug)]
pub struct PartitionStore {
    partition: PartitionId,
    node: NodeId,
    data: Mutex<PartitionData>,
}

impl PartitionStore {
    pub fn new(partition: PartitionId, node: NodeId) -> Self {
        Self {
            partition,
            node,
            data: Mutex::new(PartitionData::default()),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    fn not_primary(&self) -> Error {
        Error::NotPrimary {
            partition: self.partition,
            node: self.node,
        }
    }

    /// Client read. Backups refuse with `NotPrimary` unless stale reads are
    /// explicitly permitted.
    pub async fn get(
        &self,
        key: &str,
        role: Option<PartitionRole>,
        allow_backup_read: bool,
        now_ms: u64,
    ) -> Result<Option<Entry>> {
        match role {
            Some(PartitionRole::Primary) => {}
            Some(PartitionRole::Backup) if allow_backup_read => {}
            _ => return Err(self.not_primary()),
        }
        let data = self.data.lock().await;
        Ok(data.read(key, now_ms).cloned())
    }

    /// Guard for a client mutation; only the primary may take it.
    pub async fn lock_for_write(
        &self,
        role: Option<PartitionRole>,
    ) -> Result<MutexGuard<'_, PartitionData>> {
        if role != Some(PartitionRole::Primary) {
            return Err(self.not_primary());
        }
        Ok(self.data.lock().await)
    }

    /// Guard for a replica apply; only a backup may take it.
    pub async fn lock_for_replica(
        &self,
        role: Option<PartitionRole>,
    ) -> Option<MutexGuard<'_, PartitionData>> {
        if role != Some(PartitionRole::Backup) {
            return None;
        }
        Some(self.data.lock().await)
    }

    /// Unchecked access for maintenance and verification
    pub async fn data(&self) -> MutexGuard<'_, PartitionData> {
        self.data.lock().await
    }
}
