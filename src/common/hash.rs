//! Hashing utilities for partcache
//!
//! - BLAKE3 for key hashing
//! - HRW (Highest Random Weight) for partition owner ranking

use crate::grid::{NodeId, PartitionId};

/// 64-bit BLAKE3 digest of a key
pub fn key_hash(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix)
}

/// Partition for a key. Pure function of the key and the partition count.
pub fn partition_of(key: &str, partitions: u32) -> PartitionId {
    (key_hash(key) % partitions.max(1) as u64) as PartitionId
}

/// HRW (Highest Random Weight) ranking of the owners of a partition.
///
/// Nodes are sorted by weight, descending; equal weights fall back to the
/// lowest node id so every node computes the same order without coordination.
/// Removing a node keeps the relative order of the others, so the first
/// backup of a failed primary becomes the new primary.
pub fn hrw_rank(cache: &str, partition: PartitionId, nodes: &[NodeId]) -> Vec<NodeId> {
    let mut weights: Vec<(NodeId, u64)> = nodes
        .iter()
        .map(|&node| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(cache.as_bytes());
            hasher.update(&partition.to_le_bytes());
            hasher.update(&node.to_le_bytes());
            let hash = hasher.finalize();
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&hash.as_bytes()[0..8]);
            (node, u64::from_le_bytes(prefix))
        })
        .collect();

    weights.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Select up to `n` owners using HRW ranking
pub fn select_owners(
    cache: &str,
    partition: PartitionId,
    nodes: &[NodeId],
    n: usize,
) -> Vec<NodeId> {
    let mut ranked = hrw_rank(cache, partition, nodes);
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_of_deterministic() {
        let p1 = partition_of("test-key", 1024);
        let p2 = partition_of("test-key", 1024);
        assert_eq!(p1, p2);
        assert!(p1 < 1024);
    }

    #[test]
    fn test_partition_of_spreads_keys() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(partition_of(&format!("key-{}", i), 16));
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_hrw_rank_consistent() {
        let nodes = vec![0, 1, 2];
        let r1 = hrw_rank("cache", 7, &nodes);
        let r2 = hrw_rank("cache", 7, &nodes);
        assert_eq!(r1, r2);
        assert_eq!(r1.len(), 3);
    }

    #[test]
    fn test_hrw_rank_stable_under_removal() {
        let nodes = vec![0, 1, 2, 3];
        for partition in 0..64 {
            let full = hrw_rank("cache", partition, &nodes);
            let removed = full[0];
            let rest: Vec<NodeId> = nodes.iter().copied().filter(|n| *n != removed).collect();
            let after = hrw_rank("cache", partition, &rest);
            assert_eq!(after, full[1..].to_vec());
        }
    }

    #[test]
    fn test_select_owners() {
        let owners = select_owners("cache", 3, &[0, 1, 2, 3], 2);
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0], owners[1]);
        assert_eq!(select_owners("cache", 3, &[0], 2).len(), 1);
    }
}
