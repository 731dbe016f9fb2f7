//! Error types for partcache
//!
//! Errors are serializable so a peer can return them verbatim over the
//! node-to-node protocol.

use crate::grid::{NodeId, PartitionId};
use crate::tx::TxId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a transaction ended in ROLLED_BACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Lock held by another transaction past the wait budget
    LockConflict,
    /// Entry version moved between enlist and prepare
    VersionChanged,
    /// A participating primary could not be reached
    NodeUnreachable,
    /// Transaction outlived its deadline
    Deadline,
    /// Caller asked for rollback
    Explicit,
    /// Primary refused to stage the writes
    PrepareFailed,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::LockConflict => write!(f, "lock conflict"),
            AbortReason::VersionChanged => write!(f, "version changed"),
            AbortReason::NodeUnreachable => write!(f, "node unreachable"),
            AbortReason::Deadline => write!(f, "deadline exceeded"),
            AbortReason::Explicit => write!(f, "explicit rollback"),
            AbortReason::PrepareFailed => write!(f, "prepare failed"),
        }
    }
}

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum Error {
    // === Routing Errors ===
    #[error("Partition {partition} of cache '{cache}' has no live owner")]
    PartitionUnavailable { cache: String, partition: PartitionId },

    #[error("Node {node} is not primary for partition {partition}")]
    NotPrimary { partition: PartitionId, node: NodeId },

    // === Replication Errors ===
    #[error("Replication failed for partition {partition}: {reason}")]
    ReplicationFailed { partition: PartitionId, reason: String },

    // === Transaction Errors ===
    #[error("Transaction {tx} aborted ({reason}){}", key_suffix(.key))]
    TransactionAborted {
        tx: TxId,
        key: Option<String>,
        reason: AbortReason,
    },

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    // === Grid Errors ===
    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    #[error("Cache already exists: {0}")]
    CacheExists(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Corrupted frame: {0}")]
    Corrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_ref()
        .map(|k| format!(" on key '{}'", k))
        .unwrap_or_default()
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Routing errors are transient: the partition map is refreshed on every
    /// membership change, so a retry lands on the current owner.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NotPrimary { .. }
                | Error::PartitionUnavailable { .. }
        )
    }

    /// Conflicting key of an aborted transaction, if known
    pub fn conflicting_key(&self) -> Option<&str> {
        match self {
            Error::TransactionAborted { key, .. } => key.as_deref(),
            _ => None,
        }
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Error::TransactionAborted { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NotPrimary {
            partition: 3,
            node: 1
        }
        .is_retryable());
        assert!(Error::ConnectionFailed("node 2".into()).is_retryable());
        assert!(!Error::ReplicationFailed {
            partition: 3,
            reason: "no backups".into()
        }
        .is_retryable());
        assert!(!Error::TransactionAborted {
            tx: uuid::Uuid::nil(),
            key: None,
            reason: AbortReason::Deadline
        }
        .is_retryable());
    }

    #[test]
    fn test_abort_message_includes_key() {
        let err = Error::TransactionAborted {
            tx: uuid::Uuid::nil(),
            key: Some("A".into()),
            reason: AbortReason::LockConflict,
        };
        let msg = err.to_string();
        assert!(msg.contains("lock conflict"));
        assert!(msg.contains("'A'"));
        assert_eq!(err.conflicting_key(), Some("A"));
    }
}
