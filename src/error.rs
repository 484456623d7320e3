//! Error types for the trove protocol.
//!
//! Every failure rejects the whole triggering action; nothing here is retried
//! internally. [`ErrorKind`] groups the variants into the categories callers
//! act on (fix authorization, fix inputs, refresh a hint, report a defect).

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller is not in the allow-list of the component
    Authorization,
    /// The action is not applicable to the current state
    Precondition,
    /// A balance would go negative
    InsufficientBalance,
    /// A positional hint needs too much traversal to correct
    StaleHint,
    /// Internal accounting reached an impossible state
    InvariantViolation,
    /// Malformed input or configuration
    Validation,
    /// Snapshot encoding or config file IO failed
    Serialization,
}

/// Main error type for the trove protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ═══════════════════════════════════════════════════════════════════
    // Authorization Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Caller not allowed to perform the operation
    #[error("Not authorized: {caller} may not call {operation}")]
    Unauthorized {
        /// Hex address of the caller
        caller: String,
        /// Operation that was attempted
        operation: String,
    },

    /// Component addresses were already wired
    #[error("Addresses already set for {0}")]
    AddressesAlreadySet(String),

    // ═══════════════════════════════════════════════════════════════════
    // Trove Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Trove does not exist or is closed
    #[error("Trove does not exist or is closed: {0}")]
    TroveNotActive(String),

    /// Trove is already active
    #[error("Trove is already active: {0}")]
    TroveAlreadyActive(String),

    /// Individual collateral ratio below the required minimum
    #[error("ICR {icr} below required {required}")]
    IcrBelowMinimum {
        /// ICR after the operation (1e18 = 100%)
        icr: u128,
        /// Required ratio (1e18 = 100%)
        required: u128,
    },

    /// Operation would push TCR below CCR
    #[error("Operation would leave TCR {tcr} below CCR {ccr}")]
    TcrBelowCcr {
        /// TCR after the operation
        tcr: u128,
        /// Critical ratio
        ccr: u128,
    },

    /// Net debt under the protocol minimum
    #[error("Net debt {amount} below minimum {minimum}")]
    NetDebtBelowMinimum {
        /// Net debt requested
        amount: u128,
        /// Protocol minimum
        minimum: u128,
    },

    /// Fee exceeded the caller's accepted maximum
    #[error("Fee percentage {fee} exceeds accepted maximum {max}")]
    FeeExceedsMaximum {
        /// Fee percentage charged
        fee: u128,
        /// Caller's accepted maximum
        max: u128,
    },

    /// Only one trove left in the system
    #[error("Only one trove in the system")]
    OnlyOneTroveLeft,

    /// Operation not permitted while the system is in recovery mode
    #[error("Operation not permitted during recovery mode: {0}")]
    RecoveryMode(String),

    // ═══════════════════════════════════════════════════════════════════
    // Liquidation / Redemption Errors
    // ═══════════════════════════════════════════════════════════════════

    /// No trove qualified for liquidation
    #[error("Nothing to liquidate")]
    NothingToLiquidate,

    /// No trove could be redeemed against
    #[error("Unable to redeem any amount")]
    NothingToRedeem,

    /// Withdrawals blocked while undercollateralized troves exist
    #[error("Cannot withdraw while there are troves with ICR < MCR")]
    UndercollateralizedTroves,

    // ═══════════════════════════════════════════════════════════════════
    // Stability Pool Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Depositor has no deposit
    #[error("No stability pool deposit for {0}")]
    NoDeposit(String),

    /// Frontend registration problem
    #[error("Frontend error for {address}: {reason}")]
    Frontend {
        /// Frontend address
        address: String,
        /// Reason for failure
        reason: String,
    },

    /// Kickback rate outside [0, 1]
    #[error("Kickback rate {0} outside [0, 1e18]")]
    InvalidKickbackRate(u128),

    // ═══════════════════════════════════════════════════════════════════
    // Sorted Troves Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Hint needed more steps than allowed to correct
    #[error("Hint too stale: position not found within {max_steps} steps")]
    StaleHint {
        /// Traversal bound that was exceeded
        max_steps: u32,
    },

    /// List reached its configured maximum size
    #[error("Sorted troves list is full ({0} entries)")]
    ListFull(usize),

    /// Node already present in the list
    #[error("Sorted troves already contains {0}")]
    NodeExists(String),

    /// Node not present in the list
    #[error("Sorted troves does not contain {0}")]
    NodeNotFound(String),

    // ═══════════════════════════════════════════════════════════════════
    // Balance Errors
    // ═══════════════════════════════════════════════════════════════════

    /// A balance would go negative
    #[error("Insufficient balance in {account}: required {required}, available {available}")]
    InsufficientBalance {
        /// Account or pool name
        account: String,
        /// Amount required
        required: u128,
        /// Amount available
        available: u128,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Oracle Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Price is zero or unavailable
    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),

    // ═══════════════════════════════════════════════════════════════════
    // Validation Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Invalid input parameter
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Amount is zero
    #[error("Amount cannot be zero")]
    ZeroAmount,

    /// Overflow in calculation
    #[error("Arithmetic overflow in {operation}")]
    Overflow {
        /// Operation that overflowed
        operation: String,
    },

    /// Underflow in calculation
    #[error("Arithmetic underflow in {operation}")]
    Underflow {
        /// Operation that underflowed
        operation: String,
    },

    /// Invariant violation detected
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // ═══════════════════════════════════════════════════════════════════
    // Serialization Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration file could not be read or written
    #[error("Config IO error: {0}")]
    ConfigIo(String),
}

impl Error {
    /// Shorthand for an authorization failure
    pub fn unauthorized(caller: impl ToString, operation: &str) -> Self {
        Error::Unauthorized {
            caller: caller.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Shorthand for an insufficient balance failure
    pub fn insufficient(account: &str, required: u128, available: u128) -> Self {
        Error::InsufficientBalance {
            account: account.to_string(),
            required,
            available,
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthorized { .. } | Error::AddressesAlreadySet(_) => ErrorKind::Authorization,

            Error::TroveNotActive(_)
            | Error::TroveAlreadyActive(_)
            | Error::IcrBelowMinimum { .. }
            | Error::TcrBelowCcr { .. }
            | Error::NetDebtBelowMinimum { .. }
            | Error::FeeExceedsMaximum { .. }
            | Error::OnlyOneTroveLeft
            | Error::RecoveryMode(_)
            | Error::NothingToLiquidate
            | Error::NothingToRedeem
            | Error::UndercollateralizedTroves
            | Error::NoDeposit(_)
            | Error::Frontend { .. }
            | Error::ListFull(_)
            | Error::NodeExists(_)
            | Error::NodeNotFound(_)
            | Error::PriceUnavailable(_) => ErrorKind::Precondition,

            Error::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,

            Error::StaleHint { .. } => ErrorKind::StaleHint,

            Error::Overflow { .. } | Error::Underflow { .. } | Error::InvariantViolation(_) => {
                ErrorKind::InvariantViolation
            }

            Error::InvalidParameter { .. } | Error::ZeroAmount | Error::InvalidKickbackRate(_) => {
                ErrorKind::Validation
            }

            Error::Serialization(_) | Error::Deserialization(_) | Error::ConfigIo(_) => {
                ErrorKind::Serialization
            }
        }
    }

    /// Returns true if resubmitting with fresh input can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::StaleHint { .. }
                | Error::FeeExceedsMaximum { .. }
                | Error::PriceUnavailable(_)
                | Error::InsufficientBalance { .. }
        )
    }

    /// Returns true if this is a defect rather than a user error
    pub fn is_critical(&self) -> bool {
        self.kind() == ErrorKind::InvariantViolation
    }

    /// Returns the error code for external systems
    pub fn code(&self) -> u32 {
        match self {
            // Authorization errors: 1xxx
            Error::Unauthorized { .. } => 1001,
            Error::AddressesAlreadySet(_) => 1002,

            // Trove errors: 2xxx
            Error::TroveNotActive(_) => 2001,
            Error::TroveAlreadyActive(_) => 2002,
            Error::IcrBelowMinimum { .. } => 2003,
            Error::TcrBelowCcr { .. } => 2004,
            Error::NetDebtBelowMinimum { .. } => 2005,
            Error::FeeExceedsMaximum { .. } => 2006,
            Error::OnlyOneTroveLeft => 2007,
            Error::RecoveryMode(_) => 2008,

            // Liquidation / redemption errors: 3xxx
            Error::NothingToLiquidate => 3001,
            Error::NothingToRedeem => 3002,
            Error::UndercollateralizedTroves => 3003,

            // Stability pool errors: 4xxx
            Error::NoDeposit(_) => 4001,
            Error::Frontend { .. } => 4002,
            Error::InvalidKickbackRate(_) => 4003,

            // Sorted troves errors: 5xxx
            Error::StaleHint { .. } => 5001,
            Error::ListFull(_) => 5002,
            Error::NodeExists(_) => 5003,
            Error::NodeNotFound(_) => 5004,

            // Balance errors: 6xxx
            Error::InsufficientBalance { .. } => 6001,

            // Oracle errors: 7xxx
            Error::PriceUnavailable(_) => 7001,

            // Validation errors: 8xxx
            Error::InvalidParameter { .. } => 8001,
            Error::ZeroAmount => 8002,
            Error::Overflow { .. } => 8003,
            Error::Underflow { .. } => 8004,
            Error::InvariantViolation(_) => 8005,

            // Serialization errors: 9xxx
            Error::Serialization(_) => 9001,
            Error::Deserialization(_) => 9002,
            Error::ConfigIo(_) => 9003,
        }
    }
}
