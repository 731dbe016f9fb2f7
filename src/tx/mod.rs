//! Transactions
//!
//! Pessimistic two-phase commit coordinated by the node that started the
//! transaction. Keys are locked at their primaries as they are enlisted,
//! writes are staged at the primaries on prepare, and applied (then
//! replicated and invalidated) on commit.
//!
//! ```text
//!   ACTIVE ──commit──▶ PREPARING ──all prepared──▶ COMMITTED
//!     │                    │
//!     └──────────┬─────────┘
//!                ▼
//!        ROLLED_BACK(reason)
//! ```

pub mod lock;
pub mod manager;
pub mod transaction;

pub use lock::LockTable;
pub use manager::{TxContext, TxManager};
pub use transaction::Transaction;

use crate::common::AbortReason;
use serde::{Deserialize, Serialize};

pub type TxId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Active,
    Preparing,
    Committed,
    RolledBack(AbortReason),
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack(_))
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxState::Active => write!(f, "active"),
            TxState::Preparing => write!(f, "preparing"),
            TxState::Committed => write!(f, "committed"),
            TxState::RolledBack(reason) => write!(f, "rolled_back({})", reason),
        }
    }
}
