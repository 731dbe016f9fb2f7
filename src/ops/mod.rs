//! Ops commands for grid management

pub mod verify;

pub use verify::{verify_cache, VerifyReport};
