//! Protocol module - trove lifecycle and system assembly.
//!
//! [`system::System`] runs every external action atomically against the
//! Trove Manager, Borrower Operations and the ledgers they share.

pub mod borrower_operations;
pub mod events;
pub mod redemption;
pub mod system;
pub mod trove_manager;

pub use borrower_operations::*;
pub use events::*;
pub use redemption::*;
pub use system::*;
pub use trove_manager::*;
