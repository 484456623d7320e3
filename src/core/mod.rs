//! Core building blocks of the trove protocol.
//!
//! - Configuration and protocol parameters
//! - Component allow-lists
//! - Pool ledgers and native collateral accounts
//! - Sorted troves index
//! - Debt token
//! - Trove records

pub mod access;
pub mod config;
pub mod pools;
pub mod sorted_troves;
pub mod token;
pub mod trove;

pub use access::*;
pub use config::*;
pub use pools::*;
pub use sorted_troves::*;
pub use token::*;
pub use trove::*;
