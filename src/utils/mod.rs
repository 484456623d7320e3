//! Utility modules for the trove protocol.
//!
//! - Constants
//! - Fixed-point arithmetic
//! - Addresses and hashes
//! - Undo journals for rollback
//! - Tracing setup

pub mod constants;
pub mod crypto;
pub mod journal;
pub mod logging;
pub mod math;

pub use constants::*;
pub use crypto::*;
pub use math::*;
