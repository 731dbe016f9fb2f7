//! Per-node partition storage
//!
//! Entries live in the partition store of their primary; backups hold
//! copies with identical versions, written only through replication.

pub mod entry;
pub mod partition;

pub use entry::{ChangeEvent, Entry, Precondition, Version};
pub use partition::{PartitionData, PartitionStore, WriteOutcome};
