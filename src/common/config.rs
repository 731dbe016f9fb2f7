//! Configuration for partcache grids and caches
//!
//! The test-harness parameter set maps onto these structs one to one:
//! `GridCount` is [`GridConfig::grid_count`], `CacheName` is [`CacheConfig::name`],
//! `NearEnabled`, `TxEnabled` and `Backups` live on [`CacheConfig`].

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Grid topology and transport settings
    #[serde(default)]
    pub grid: GridConfig,

    /// Cache created when the grid starts
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Backup acknowledgment policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteSync {
    /// Client completes once the primary write lands
    PrimarySync,
    /// Client completes once every backup acknowledged
    FullSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxIsolation {
    ReadCommitted,
    RepeatableRead,
}

/// Grid configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Number of server nodes (own partitions)
    #[serde(default = "default_grid_count")]
    pub grid_count: usize,

    /// Number of client nodes (own nothing, access caches remotely)
    #[serde(default)]
    pub client_count: usize,

    /// Number of partitions per cache
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Peer request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Pending envelopes per node mailbox
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Interval of the per-node maintenance loop (TTL sweep, lock leases)
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,
}

fn default_grid_count() -> usize {
    3
}
fn default_partitions() -> u32 {
    1024
}
fn default_request_timeout() -> u64 {
    5_000
}
fn default_mailbox_capacity() -> usize {
    1024
}
fn default_maintenance_interval() -> u64 {
    25
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_count: default_grid_count(),
            client_count: 0,
            partitions: default_partitions(),
            request_timeout_ms: default_request_timeout(),
            mailbox_capacity: default_mailbox_capacity(),
            maintenance_interval_ms: default_maintenance_interval(),
        }
    }
}

impl GridConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid_count == 0 {
            return Err(Error::InvalidConfig("grid_count must be at least 1".into()));
        }
        if self.partitions == 0 {
            return Err(Error::InvalidConfig("partitions must be at least 1".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::InvalidConfig(
                "mailbox_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Per-cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Logical cache name; partitions are scoped per name
    #[serde(default = "default_cache_name")]
    pub name: String,

    /// Backup owners per partition (0 = no replication)
    #[serde(default = "default_backups")]
    pub backups: usize,

    /// Near-cache layer with invalidation subscriptions
    #[serde(default = "default_true")]
    pub near_enabled: bool,

    /// Wrap mutations in transactions, even single-key ones
    #[serde(default = "default_true")]
    pub tx_enabled: bool,

    #[serde(default = "default_write_sync")]
    pub write_sync: WriteSync,

    /// Fail FULL_SYNC writes when no backup acknowledged
    #[serde(default)]
    pub require_backup_ack: bool,

    /// Allow reads to be served by a backup copy
    #[serde(default)]
    pub read_from_backup: bool,

    /// Upper bound on near-cache staleness when invalidations are lost
    #[serde(default = "default_near_ttl")]
    pub near_ttl_ms: u64,

    #[serde(default = "default_near_max_entries")]
    pub near_max_entries: usize,

    /// Deadline after which an unfinished transaction is rolled back
    #[serde(default = "default_tx_timeout")]
    pub tx_timeout_ms: u64,

    #[serde(default = "default_isolation")]
    pub tx_isolation: TxIsolation,

    #[serde(default = "default_replication_retries")]
    pub replication_retries: usize,

    #[serde(default = "default_replication_backoff")]
    pub replication_backoff_ms: u64,

    /// Expiry applied to writes without an explicit TTL
    #[serde(default)]
    pub default_ttl_ms: Option<u64>,
}

fn default_cache_name() -> String {
    "partitioned_near".to_string()
}
fn default_backups() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_write_sync() -> WriteSync {
    WriteSync::FullSync
}
fn default_near_ttl() -> u64 {
    30_000
}
fn default_near_max_entries() -> usize {
    10_000
}
fn default_tx_timeout() -> u64 {
    10_000
}
fn default_isolation() -> TxIsolation {
    TxIsolation::RepeatableRead
}
fn default_replication_retries() -> usize {
    3
}
fn default_replication_backoff() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: default_cache_name(),
            backups: default_backups(),
            near_enabled: true,
            tx_enabled: true,
            write_sync: default_write_sync(),
            require_backup_ack: false,
            read_from_backup: false,
            near_ttl_ms: default_near_ttl(),
            near_max_entries: default_near_max_entries(),
            tx_timeout_ms: default_tx_timeout(),
            tx_isolation: default_isolation(),
            replication_retries: default_replication_retries(),
            replication_backoff_ms: default_replication_backoff(),
            default_ttl_ms: None,
        }
    }
}

impl CacheConfig {
    /// Cache config with the given name and defaults for everything else
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn near_ttl(&self) -> Duration {
        Duration::from_millis(self.near_ttl_ms)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }

    pub fn replication_backoff(&self) -> Duration {
        Duration::from_millis(self.replication_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("cache name cannot be empty".into()));
        }
        if self.near_enabled && self.near_ttl_ms == 0 {
            return Err(Error::InvalidConfig(
                "near_ttl_ms must be positive when the near cache is enabled".into(),
            ));
        }
        if self.tx_timeout_ms == 0 {
            return Err(Error::InvalidConfig("tx_timeout_ms must be positive".into()));
        }
        if self.replication_retries == 0 {
            return Err(Error::InvalidConfig(
                "replication_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load `partcache.toml` from the working directory (if present), then
    /// apply `PARTCACHE__SECTION__FIELD` environment overrides.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("partcache").required(false))
            .add_source(Self::env_source())
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file; environment overrides still apply.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(Self::env_source())
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn env_source() -> config::Environment {
        config::Environment::with_prefix("PARTCACHE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    pub fn validate(&self) -> Result<()> {
        self.grid.validate()?;
        self.cache.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_partitioned_near() {
        let cfg = Config::default();
        assert_eq!(cfg.grid.grid_count, 3);
        assert_eq!(cfg.cache.name, "partitioned_near");
        assert_eq!(cfg.cache.backups, 1);
        assert!(cfg.cache.near_enabled);
        assert!(cfg.cache.tx_enabled);
        assert_eq!(cfg.cache.write_sync, WriteSync::FullSync);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[grid]
grid_count = 4
partitions = 64

[cache]
name = "accounts"
backups = 2
near_enabled = false
write_sync = "primary_sync"
"#
        )
        .unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.grid.grid_count, 4);
        assert_eq!(cfg.grid.partitions, 64);
        assert_eq!(cfg.cache.name, "accounts");
        assert_eq!(cfg.cache.backups, 2);
        assert!(!cfg.cache.near_enabled);
        assert!(cfg.cache.tx_enabled);
        assert_eq!(cfg.cache.write_sync, WriteSync::PrimarySync);
    }

    #[test]
    fn test_validate_rejects_empty_grid() {
        let mut cfg = Config::default();
        cfg.grid.grid_count = 0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let mut cfg = Config::default();
        cfg.cache.name = " ".into();
        assert!(cfg.validate().is_err());
    }
}
