//! Owner side of the near cache: which holders read which keys.
//!
//! Registrations are taken (removed) when an invalidation is sent; a holder
//! re-registers on its next fetch. Each registration carries the holder's
//! subscription generation, and an unsubscribe only drops registrations
//! up to the generation it names, so a late unsubscribe never erases a
//! newer registration.

use crate::grid::{NodeId, PartitionId};
use std::collections::HashMap;
use std::sync::Mutex;

type Registrations = HashMap<PartitionId, HashMap<String, HashMap<NodeId, u64>>>;

#[derive(Debug, Default)]
pub struct ReaderRegistry {
    inner: Mutex<Registrations>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Registrations> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, partition: PartitionId, key: &str, reader: NodeId, generation: u64) {
        let mut inner = self.inner();
        let held = inner
            .entry(partition)
            .or_default()
            .entry(key.to_string())
            .or_default()
            .entry(reader)
            .or_insert(generation);
        *held = (*held).max(generation);
    }

    /// Remove and return the readers of a key
    pub fn take(&self, partition: PartitionId, key: &str) -> Vec<NodeId> {
        let mut inner = self.inner();
        let Some(keys) = inner.get_mut(&partition) else {
            return Vec::new();
        };
        let mut readers: Vec<NodeId> = keys
            .remove(key)
            .map(|held| held.into_keys().collect())
            .unwrap_or_default();
        if keys.is_empty() {
            inner.remove(&partition);
        }
        readers.sort_unstable();
        readers
    }

    /// Forget a holder's registrations in one partition made at or before
    /// `generation`
    pub fn remove_reader(&self, partition: PartitionId, reader: NodeId, generation: u64) {
        let mut inner = self.inner();
        if let Some(keys) = inner.get_mut(&partition) {
            keys.retain(|_, held| {
                if held.get(&reader).is_some_and(|g| *g <= generation) {
                    held.remove(&reader);
                }
                !held.is_empty()
            });
            if keys.is_empty() {
                inner.remove(&partition);
            }
        }
    }

    /// Forget a holder everywhere (the holder left the grid)
    pub fn remove_node(&self, reader: NodeId) {
        let mut inner = self.inner();
        inner.retain(|_, keys| {
            keys.retain(|_, held| {
                held.remove(&reader);
                !held.is_empty()
            });
            !keys.is_empty()
        });
    }

    /// Keep only the partitions for which `keep` holds
    pub fn retain_partitions(&self, keep: impl Fn(PartitionId) -> bool) {
        self.inner().retain(|partition, _| keep(*partition));
    }

    pub fn readers_of(&self, partition: PartitionId, key: &str) -> Vec<NodeId> {
        let inner = self.inner();
        let mut readers: Vec<NodeId> = inner
            .get(&partition)
            .and_then(|keys| keys.get(key))
            .map(|held| held.keys().copied().collect())
            .unwrap_or_default();
        readers.sort_unstable();
        readers
    }

    pub fn is_empty(&self) -> bool {
        self.inner().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_clears_registration() {
        let readers = ReaderRegistry::new();
        readers.register(5, "A", 2, 0);
        readers.register(5, "A", 1, 0);
        readers.register(5, "B", 2, 0);

        assert_eq!(readers.take(5, "A"), vec![1, 2]);
        assert!(readers.take(5, "A").is_empty());
        assert_eq!(readers.readers_of(5, "B"), vec![2]);
    }

    #[test]
    fn test_remove_reader_and_node() {
        let readers = ReaderRegistry::new();
        readers.register(5, "A", 2, 0);
        readers.register(6, "B", 2, 0);
        readers.register(6, "B", 3, 0);

        readers.remove_reader(5, 2, 0);
        assert!(readers.readers_of(5, "A").is_empty());

        readers.remove_node(2);
        assert_eq!(readers.readers_of(6, "B"), vec![3]);

        readers.retain_partitions(|p| p != 6);
        assert!(readers.is_empty());
    }

    #[test]
    fn test_late_unsubscribe_keeps_newer_registration() {
        let readers = ReaderRegistry::new();
        readers.register(5, "A", 2, 4);
        readers.register(5, "B", 2, 3);

        // Unsubscribe for generation 3 arrives after the re-registration
        readers.remove_reader(5, 2, 3);
        assert_eq!(readers.readers_of(5, "A"), vec![2]);
        assert!(readers.readers_of(5, "B").is_empty());
    }
}
