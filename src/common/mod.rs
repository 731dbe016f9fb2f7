//! Common utilities and types shared across partcache

pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use config::{CacheConfig, Config, GridConfig, TxIsolation, WriteSync};
pub use error::{AbortReason, Error, Result};
pub use events::{EventBus, EventRecord, GridEvent};
pub use hash::{hrw_rank, key_hash, partition_of, select_owners};
pub use metrics::METRICS;
pub use utils::{crc32, retry_with_backoff, timestamp_now_millis, validate_key, NodeState};
