//! Primary-to-backup replication
//!
//! A primary pushes every applied entry to the partition's backups.
//! Under `full_sync` the write waits for every backup attempt (with retries)
//! before it is acknowledged; under `primary_sync` the push runs in the
//! background. A backup that stays unreachable is reported, never silently
//! skipped.

use crate::common::{
    retry_with_backoff, CacheConfig, Error, EventBus, GridEvent, Result, WriteSync, METRICS,
};
use crate::grid::protocol::PeerRequest;
use crate::grid::transport::Transport;
use crate::grid::{NodeId, PartitionId};
use crate::store::Entry;
use futures_util::future::join_all;
use std::sync::Arc;

/// Outcome of one replication round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    pub acked: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    /// True when the push was handed to a background task
    pub detached: bool,
}

#[derive(Clone)]
pub struct Replicator {
    transport: Arc<Transport>,
    events: EventBus,
    node: NodeId,
}

impl Replicator {
    pub fn new(transport: Arc<Transport>, events: EventBus, node: NodeId) -> Self {
        Self {
            transport,
            events,
            node,
        }
    }

    /// Replicate `entry` to `backups` according to the cache's write mode.
    ///
    /// Returns `ReplicationFailed` only when the cache demands a backup ack
    /// and none arrived; the primary keeps the write either way.
    pub async fn replicate(
        &self,
        config: &CacheConfig,
        partition: PartitionId,
        backups: &[NodeId],
        key: &str,
        entry: &Entry,
    ) -> Result<ReplicationReport> {
        let demands_ack = config.require_backup_ack
            && config.backups > 0
            && config.write_sync == WriteSync::FullSync;

        if backups.is_empty() {
            if demands_ack {
                return Err(Error::ReplicationFailed {
                    partition,
                    reason: "no live backup owner".into(),
                });
            }
            return Ok(ReplicationReport::default());
        }

        match config.write_sync {
            WriteSync::PrimarySync => {
                let this = self.clone();
                let config = config.clone();
                let backups = backups.to_vec();
                let key = key.to_string();
                let entry = entry.clone();
                tokio::spawn(async move {
                    this.push(&config, partition, &backups, &key, &entry).await;
                });
                Ok(ReplicationReport {
                    detached: true,
                    ..Default::default()
                })
            }
            WriteSync::FullSync => {
                let report = self.push(config, partition, backups, key, entry).await;
                if demands_ack && report.acked.is_empty() {
                    return Err(Error::ReplicationFailed {
                        partition,
                        reason: format!("no backup acknowledged (failed: {:?})", report.failed),
                    });
                }
                Ok(report)
            }
        }
    }

    async fn push(
        &self,
        config: &CacheConfig,
        partition: PartitionId,
        backups: &[NodeId],
        key: &str,
        entry: &Entry,
    ) -> ReplicationReport {
        let req = PeerRequest::ReplicateApply {
            cache: config.name.clone(),
            partition,
            key: key.to_string(),
            entry: entry.clone(),
        };

        let attempts = backups.iter().map(|&backup| {
            let req = &req;
            async move {
                let result = retry_with_backoff(
                    || self.transport.request(self.node, backup, req),
                    config.replication_retries,
                    config.replication_backoff(),
                )
                .await;
                (backup, result)
            }
        });

        let mut report = ReplicationReport::default();
        for (backup, result) in join_all(attempts).await {
            match result {
                Ok(_) => {
                    METRICS.replication_applied.inc();
                    report.acked.push(backup);
                }
                Err(e) => {
                    METRICS.replication_failures.inc();
                    tracing::warn!(
                        cache = %config.name,
                        partition,
                        backup,
                        key,
                        "Replication to backup failed: {}",
                        e
                    );
                    self.events.publish(GridEvent::ReplicationDegraded {
                        cache: config.name.clone(),
                        partition,
                        backup,
                        reason: e.to_string(),
                    });
                    report.failed.push(backup);
                }
            }
        }
        report
    }
}
