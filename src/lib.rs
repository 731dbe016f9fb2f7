//! # partcache
//!
//! A partitioned, replicated, transactional in-memory key-value cache with
//! a near-cache layer:
//! - Keys hash into a fixed set of partitions, each owned by a primary and
//!   zero or more backups chosen by rendezvous hashing
//! - Primaries replicate every write to their backups (full or primary sync)
//! - Pessimistic two-phase-commit transactions with ordered key locks
//! - Near caches on non-owner nodes, kept coherent by owner invalidations
//!   and bounded in staleness by a TTL
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!        Cache facade (any node)
//!   ┌──────────────┴──────────────┐
//!   │ near cache hit?  ──yes──▶ value
//!   │      no
//!   ▼
//! ┌────────────┐  replicate   ┌────────────┐
//! │  primary   │ ───────────▶ │  backup    │
//! │ partition  │              │ partition  │
//! │  + locks   │ ──invalidate──▶ near-cache holders
//! └────────────┘              └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() -> partcache::Result<()> {
//! use partcache::{Config, Grid};
//!
//! let config = Config::default();
//! let grid = Grid::start_with_cache(&config).await?;
//! let cache = grid.cache(0, &config.cache.name)?;
//!
//! cache.put("A", "0").await?;
//! let mut tx = cache.tx_start();
//! tx.put("A", "1").await?;
//! tx.put("B", "1").await?;
//! tx.commit().await?;
//! assert_eq!(cache.get("A").await?.as_deref(), Some(&b"1"[..]));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod common;
pub mod grid;
pub mod near;
pub mod ops;
pub mod replication;
pub mod store;
pub mod streamer;
pub mod tx;

// Re-export commonly used types
pub use cache::{Cache, EntryAction};
pub use common::{
    AbortReason, CacheConfig, Config, Error, GridConfig, GridEvent, Result, TxIsolation, WriteSync,
};
pub use grid::{Grid, NodeId, NodeRole, PartitionId};
pub use store::Version;
pub use streamer::{DataStreamer, StreamerReport};
pub use tx::{Transaction, TxId, TxState};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
