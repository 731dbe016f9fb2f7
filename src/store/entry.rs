//! Cache entries and their versions

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Entry version.
///
/// Ordered by topology epoch first, then by the per-key counter, so a write
/// accepted under a newer partition assignment always wins over one from an
/// older assignment.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    pub epoch: u64,
    pub counter: u64,
}

impl Version {
    pub const ZERO: Version = Version {
        epoch: 0,
        counter: 0,
    };

    pub fn new(epoch: u64, counter: u64) -> Self {
        Self { epoch, counter }
    }

    /// Successor of this version written under `epoch`
    pub fn next(self, epoch: u64) -> Version {
        Version {
            epoch: epoch.max(self.epoch),
            counter: self.counter + 1,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.epoch, self.counter)
    }
}

/// A stored entry. `value == None` is a tombstone: it keeps the version of a
/// removal so late replica deliveries of older writes cannot resurrect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub value: Option<Bytes>,
    pub version: Version,
    /// Expiration timestamp in milliseconds since Unix epoch
    pub expires_at: Option<u64>,
}

impl Entry {
    pub fn live(value: Bytes, version: Version, expires_at: Option<u64>) -> Self {
        Self {
            value: Some(value),
            version,
            expires_at,
        }
    }

    pub fn tombstone(version: Version) -> Self {
        Self {
            value: None,
            version,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.map(|exp| now_ms > exp).unwrap_or(false)
    }

    /// Present, not a tombstone, not expired
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.value.is_some() && !self.is_expired(now_ms)
    }

    pub fn live_value(&self, now_ms: u64) -> Option<&Bytes> {
        if self.is_expired(now_ms) {
            return None;
        }
        self.value.as_ref()
    }
}

/// Condition a primary checks before applying a direct write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    /// Only when no live entry exists
    IfAbsent,
    /// Only when a live entry exists
    IfPresent,
    /// Only when the live entry carries exactly this version
    IfVersion(Version),
}

impl Precondition {
    pub fn holds(&self, current: Option<&Entry>, now_ms: u64) -> bool {
        let live = current.filter(|e| e.is_live(now_ms));
        match self {
            Precondition::None => true,
            Precondition::IfAbsent => live.is_none(),
            Precondition::IfPresent => live.is_some(),
            Precondition::IfVersion(v) => live.map(|e| e.version == *v).unwrap_or(false),
        }
    }
}

/// Emitted by a primary for every successful mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    pub old_version: Option<Version>,
    pub new_version: Version,
}
