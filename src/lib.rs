//! # Trove Protocol
//!
//! A collateralized-debt-position stablecoin core: borrowers lock native
//! collateral in troves and mint a debt token against it, and undercollateralized
//! troves are liquidated against a Stability Pool or redistributed to the
//! remaining troves.
//!
//! ## Architecture
//!
//! - **Core**: parameters, pool ledgers, sorted troves index, debt token
//! - **Liquidation**: liquidation engine, Stability Pool, recovery mode rules
//! - **Protocol**: Trove Manager, Borrower Operations, redemptions, events and
//!   the atomic [`System`](protocol::system::System)
//! - **Oracle**: price feed and reward issuance capabilities
//!
//! ## Example
//!
//! ```rust,ignore
//! use trove_protocol::prelude::*;
//!
//! let mut system = System::with_price(ProtocolParams::default(), 2_000 * DECIMAL_PRECISION)?;
//! let alice = Address::derive("alice");
//! system.fund(alice, 10 * DECIMAL_PRECISION)?;
//! system.open_trove(alice, DECIMAL_PRECISION / 20, 5_000 * DECIMAL_PRECISION, PositionHint::NONE, 10 * DECIMAL_PRECISION)?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications
)]

pub mod core;
pub mod error;
pub mod liquidation;
pub mod oracle;
pub mod protocol;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        config::{ProtocolParams, RecoveryCeiling},
        sorted_troves::PositionHint,
        trove::{Trove, TroveStatus},
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::liquidation::{engine::LiquidationOutcome, stability_pool::DepositOutcome};
    pub use crate::oracle::{
        issuance::{LinearIssuance, NoIssuance, RewardIssuance},
        price_feed::{ManualPriceFeed, PriceFeed},
    };
    pub use crate::protocol::{
        borrower_operations::Adjustment,
        events::ProtocolEvent,
        redemption::{RedemptionHints, RedemptionOutcome},
        system::{System, SystemAddresses},
    };
    pub use crate::utils::{
        constants::DECIMAL_PRECISION,
        crypto::{Address, StateHash},
    };
}

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol name
pub const PROTOCOL_NAME: &str = "Trove Protocol";
