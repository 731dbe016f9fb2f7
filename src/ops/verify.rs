//! Verify replica consistency of a cache
//!
//! Walks every partition, snapshots the primary and each backup, and counts
//! keys whose backup copy is missing or carries a different version.
//! The check is point-in-time: writes still replicating under
//! `primary_sync` can show up as divergent.

use crate::common::{Error, Result};
use crate::grid::protocol::{PeerRequest, PeerResponse};
use crate::grid::{Grid, NodeId, PartitionId};
use crate::store::Entry;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub cache: String,
    pub partitions: usize,
    /// Partitions with fewer owners than `backups + 1`
    pub under_replicated: usize,
    /// Live keys on primaries
    pub total_keys: usize,
    /// Keys whose backup copy is missing or has another version
    pub divergent_keys: usize,
    /// Owners that did not answer a snapshot request
    pub unreachable_owners: usize,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.under_replicated == 0 && self.divergent_keys == 0 && self.unreachable_owners == 0
    }
}

async fn snapshot(
    grid: &Grid,
    from: NodeId,
    owner: NodeId,
    cache: &str,
    partition: PartitionId,
) -> Result<HashMap<String, Entry>> {
    let node = grid.node(from).ok_or(Error::NodeNotFound(from))?;
    let req = PeerRequest::Snapshot {
        cache: cache.to_string(),
        partition,
    };
    match node.request(owner, &req).await? {
        PeerResponse::Snapshot(entries) => Ok(entries.into_iter().collect()),
        other => Err(Error::Internal(format!("unexpected response: {:?}", other))),
    }
}

pub async fn verify_cache(grid: &Grid, cache: &str) -> Result<VerifyReport> {
    let map = grid.partition_map(cache)?;
    let from = grid
        .node_ids()
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidState("grid has no live node".into()))?;

    tracing::info!(cache, partitions = map.partitions(), "Starting cache verification");

    let mut report = VerifyReport {
        cache: cache.to_string(),
        partitions: map.partitions() as usize,
        under_replicated: map.under_replicated(),
        ..Default::default()
    };
    let now = crate::common::timestamp_now_millis();

    for partition in 0..map.partitions() {
        let Ok(owners) = map.owners_of(partition) else {
            continue;
        };

        let primary = match snapshot(grid, from, owners.primary, cache, partition).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(partition, primary = owners.primary, "Snapshot failed: {}", e);
                report.unreachable_owners += 1;
                continue;
            }
        };
        report.total_keys += primary.values().filter(|e| e.is_live(now)).count();

        for backup in &owners.backups {
            let replica = match snapshot(grid, from, *backup, cache, partition).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(partition, backup, "Snapshot failed: {}", e);
                    report.unreachable_owners += 1;
                    continue;
                }
            };
            let divergent = primary
                .iter()
                .filter(|(key, entry)| {
                    replica.get(*key).map(|r| r.version) != Some(entry.version)
                })
                .count();
            if divergent > 0 {
                tracing::debug!(partition, backup, divergent, "Backup diverges from primary");
            }
            report.divergent_keys += divergent;
        }
    }

    tracing::info!(
        cache,
        total_keys = report.total_keys,
        divergent = report.divergent_keys,
        under_replicated = report.under_replicated,
        "Verification finished"
    );
    Ok(report)
}
