//! Bulk loader
//!
//! Buffers entries per primary and ships them in batches. Loaded entries go
//! through the same primary write path as single puts, so they get versions,
//! backups and near-cache invalidations like any other write. Entries whose
//! primary moved while in flight are re-routed on the next flush.

use crate::cache::Cache;
use crate::common::{validate_key, Error, Result};
use crate::grid::protocol::{PeerRequest, PeerResponse};
use crate::grid::NodeId;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 512;
const MAX_FLUSH_ROUNDS: usize = 8;
const REROUTE_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamerReport {
    pub applied: usize,
    /// Existing keys left alone because overwrite was off
    pub skipped: usize,
}

pub struct DataStreamer {
    cache: Cache,
    allow_overwrite: bool,
    buffer_size: usize,
    buffers: HashMap<NodeId, Vec<(String, Bytes)>>,
    report: StreamerReport,
}

impl DataStreamer {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            allow_overwrite: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffers: HashMap::new(),
            report: StreamerReport::default(),
        }
    }

    /// Overwrite existing keys (off by default)
    pub fn allow_overwrite(mut self, allow: bool) -> Self {
        self.allow_overwrite = allow;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn report(&self) -> StreamerReport {
        self.report
    }

    fn buffer(&mut self, key: String, value: Bytes) -> Result<NodeId> {
        let map = self.cache.partition_map()?;
        let primary = map.owners_of_key(&key)?.1.primary;
        self.buffers.entry(primary).or_default().push((key, value));
        Ok(primary)
    }

    pub async fn add_data(&mut self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        validate_key(key)?;
        let primary = self.buffer(key.to_string(), value.into())?;
        let full = self
            .buffers
            .get(&primary)
            .map(|b| b.len() >= self.buffer_size)
            .unwrap_or(false);
        if full {
            self.flush().await?;
        }
        Ok(())
    }

    /// Ship every buffered entry, re-routing what a moved primary refused
    pub async fn flush(&mut self) -> Result<StreamerReport> {
        for round in 0..MAX_FLUSH_ROUNDS {
            if self.buffers.is_empty() {
                return Ok(self.report);
            }
            if round > 0 {
                tokio::time::sleep(REROUTE_BACKOFF * round as u32).await;
            }

            let batches: Vec<(NodeId, Vec<(String, Bytes)>)> = self.buffers.drain().collect();
            for (primary, batch) in batches {
                let (leftover, last_error) = self.send_batch(primary, batch).await;
                if let Some(e) = last_error {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    tracing::debug!(primary, leftover = leftover.len(), "Stream batch failed: {}", e);
                }
                for (key, value) in leftover {
                    self.buffer(key, value)?;
                }
            }
        }

        if self.buffers.is_empty() {
            Ok(self.report)
        } else {
            let pending: usize = self.buffers.values().map(Vec::len).sum();
            Err(Error::Timeout(format!(
                "{} streamed entries could not be delivered",
                pending
            )))
        }
    }

    /// Returns the entries to retry and the error that caused it, if any
    async fn send_batch(
        &mut self,
        primary: NodeId,
        batch: Vec<(String, Bytes)>,
    ) -> (Vec<(String, Bytes)>, Option<Error>) {
        let req = PeerRequest::StreamLoad {
            cache: self.cache.name().to_string(),
            entries: batch.clone(),
            allow_overwrite: self.allow_overwrite,
        };
        match self.cache.node().request(primary, &req).await {
            Ok(PeerResponse::Loaded {
                applied,
                skipped,
                rerouted,
            }) => {
                self.report.applied += applied;
                self.report.skipped += skipped;
                (rerouted, None)
            }
            Ok(other) => (
                batch,
                Some(Error::Internal(format!("unexpected response: {:?}", other))),
            ),
            Err(e) => (batch, Some(e)),
        }
    }

    /// Flush and finish
    pub async fn close(mut self) -> Result<StreamerReport> {
        let report = self.flush().await?;
        tracing::info!(
            cache = %self.cache.name(),
            applied = report.applied,
            skipped = report.skipped,
            "Streamer closed"
        );
        Ok(report)
    }
}
