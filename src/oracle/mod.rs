//! External capabilities: price feed and reward issuance.

pub mod issuance;
pub mod price_feed;

pub use issuance::*;
pub use price_feed::*;
