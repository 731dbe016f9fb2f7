//! Partition map
//!
//! Keys map to partitions by hash; partitions map to an ordered owner list
//! (primary first, then backups) computed with HRW ranking over the live
//! servers. A map is immutable once built: membership changes produce a new
//! map that replaces the old one.

use crate::common::{partition_of, select_owners, Error, Result};
use crate::grid::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionRole {
    Primary,
    Backup,
}

/// Owners of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owners {
    pub primary: NodeId,
    pub backups: Vec<NodeId>,
}

impl Owners {
    pub fn contains(&self, node: NodeId) -> bool {
        self.primary == node || self.backups.contains(&node)
    }
}

#[derive(Debug, Clone)]
pub struct PartitionMap {
    cache: String,
    partitions: u32,
    backups: usize,
    topology_version: u64,
    assignment: Vec<Vec<NodeId>>,
}

impl PartitionMap {
    /// Compute the assignment for the given live servers
    pub fn compute(
        cache: &str,
        partitions: u32,
        backups: usize,
        live_servers: &[NodeId],
        topology_version: u64,
    ) -> Self {
        let assignment = (0..partitions)
            .map(|p| select_owners(cache, p, live_servers, backups + 1))
            .collect();
        Self {
            cache: cache.to_string(),
            partitions,
            backups,
            topology_version,
            assignment,
        }
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn backups(&self) -> usize {
        self.backups
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    pub fn partition_of(&self, key: &str) -> PartitionId {
        partition_of(key, self.partitions)
    }

    /// Owners of a partition; fails when no live node owns it
    pub fn owners_of(&self, partition: PartitionId) -> Result<Owners> {
        let unavailable = || Error::PartitionUnavailable {
            cache: self.cache.clone(),
            partition,
        };
        let owners = self
            .assignment
            .get(partition as usize)
            .ok_or_else(unavailable)?;
        let (primary, backups) = owners.split_first().ok_or_else(unavailable)?;
        Ok(Owners {
            primary: *primary,
            backups: backups.to_vec(),
        })
    }

    pub fn owners_of_key(&self, key: &str) -> Result<(PartitionId, Owners)> {
        let partition = self.partition_of(key);
        Ok((partition, self.owners_of(partition)?))
    }

    pub fn role_of(&self, partition: PartitionId, node: NodeId) -> Option<PartitionRole> {
        let owners = self.assignment.get(partition as usize)?;
        match owners.iter().position(|n| *n == node)? {
            0 => Some(PartitionRole::Primary),
            _ => Some(PartitionRole::Backup),
        }
    }

    pub fn primary_of(&self, partition: PartitionId) -> Option<NodeId> {
        self.assignment
            .get(partition as usize)
            .and_then(|owners| owners.first().copied())
    }

    /// Partitions a node owns, with its role in each
    pub fn partitions_of(&self, node: NodeId) -> Vec<(PartitionId, PartitionRole)> {
        (0..self.partitions)
            .filter_map(|p| self.role_of(p, node).map(|role| (p, role)))
            .collect()
    }

    /// Partitions with fewer than `backups + 1` owners
    pub fn under_replicated(&self) -> usize {
        self.assignment
            .iter()
            .filter(|owners| owners.len() < self.backups + 1)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owners_distinct_and_sized() {
        let map = PartitionMap::compute("cache", 64, 1, &[0, 1, 2], 3);
        for p in 0..64 {
            let owners = map.owners_of(p).unwrap();
            assert_eq!(owners.backups.len(), 1);
            assert_ne!(owners.primary, owners.backups[0]);
        }
        assert_eq!(map.under_replicated(), 0);
        assert_eq!(map.topology_version(), 3);
    }

    #[test]
    fn test_primaries_spread_over_nodes() {
        let map = PartitionMap::compute("cache", 256, 1, &[0, 1, 2], 1);
        for node in 0..3 {
            let primaries = map
                .partitions_of(node)
                .into_iter()
                .filter(|(_, role)| *role == PartitionRole::Primary)
                .count();
            assert!(primaries > 40, "node {} owns {} primaries", node, primaries);
        }
    }

    #[test]
    fn test_under_replication_tolerated() {
        let map = PartitionMap::compute("cache", 8, 2, &[0, 1], 1);
        let owners = map.owners_of(0).unwrap();
        assert_eq!(owners.backups.len(), 1);
        assert_eq!(map.under_replicated(), 8);
    }

    #[test]
    fn test_no_owner_is_unavailable() {
        let map = PartitionMap::compute("cache", 8, 1, &[], 1);
        assert!(matches!(
            map.owners_of(3),
            Err(Error::PartitionUnavailable { partition: 3, .. })
        ));
    }

    #[test]
    fn test_backup_promoted_on_primary_loss() {
        let before = PartitionMap::compute("cache", 32, 1, &[0, 1, 2], 1);
        for p in 0..32 {
            let owners = before.owners_of(p).unwrap();
            let rest: Vec<NodeId> = [0, 1, 2]
                .into_iter()
                .filter(|n| *n != owners.primary)
                .collect();
            let after = PartitionMap::compute("cache", 32, 1, &rest, 2);
            assert_eq!(after.primary_of(p), Some(owners.backups[0]));
        }
    }

    #[test]
    fn test_role_of() {
        let map = PartitionMap::compute("cache", 4, 1, &[0, 1, 2], 1);
        let owners = map.owners_of(1).unwrap();
        assert_eq!(map.role_of(1, owners.primary), Some(PartitionRole::Primary));
        assert_eq!(map.role_of(1, owners.backups[0]), Some(PartitionRole::Backup));
        let outsider = (0..3).find(|n| !owners.contains(*n)).unwrap();
        assert_eq!(map.role_of(1, outsider), None);
    }
}
