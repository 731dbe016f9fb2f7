//! Grid observability events
//!
//! Non-fatal conditions worth surfacing (stale near-cache reads, degraded
//! replication, rollbacks, topology changes) are broadcast to any subscriber.
//! Publishing never blocks and never fails when nobody listens.

use crate::common::error::AbortReason;
use crate::grid::{NodeId, PartitionId};
use crate::store::Version;
use crate::tx::TxId;
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GridEvent {
    /// A near cache served a version later proven older than the owner's
    StaleRead {
        cache: String,
        key: String,
        node: NodeId,
        served: Version,
        actual: Version,
    },
    /// A backup did not acknowledge a replica update
    ReplicationDegraded {
        cache: String,
        partition: PartitionId,
        backup: NodeId,
        reason: String,
    },
    /// Fewer live servers than `backups + 1`
    UnderReplicated {
        cache: String,
        live_servers: usize,
        required: usize,
    },
    TransactionRolledBack {
        tx: TxId,
        reason: AbortReason,
        key: Option<String>,
    },
    TopologyChanged {
        version: u64,
        live_servers: Vec<NodeId>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: GridEvent,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: GridEvent) {
        let record = EventRecord {
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        };
        // No receivers is fine
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
