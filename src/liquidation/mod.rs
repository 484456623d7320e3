//! Liquidation module.
//!
//! - Liquidation engine: offset against the Stability Pool, then redistribution
//! - Stability pool with O(1) gain accounting
//! - Recovery mode rules for the system-wide crisis state

pub mod engine;
pub mod recovery;
pub mod stability_pool;

pub use engine::*;
pub use recovery::*;
pub use stability_pool::*;
