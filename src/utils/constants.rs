//! Protocol constants.
//!
//! All protocol-wide constants are defined here for easy auditing. Amounts,
//! prices and ratios are 18-decimal fixed point values stored in `u128`.

// ═══════════════════════════════════════════════════════════════════════════════
// PRECISION
// ═══════════════════════════════════════════════════════════════════════════════

/// 1.0 in 18-decimal fixed point
pub const DECIMAL_PRECISION: u128 = 1_000_000_000_000_000_000;

/// 100% expressed as a ratio
pub const ONE_HUNDRED_PERCENT: u128 = DECIMAL_PRECISION;

/// Precision of the nominal collateral ratio (coll * 1e20 / debt)
pub const NICR_PRECISION: u128 = 100_000_000_000_000_000_000;

/// Stability pool scale step; P is multiplied by this when it drops below it
pub const SCALE_FACTOR: u128 = 1_000_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERALIZATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum Collateral Ratio (MCR) - 110%
pub const MIN_COLLATERAL_RATIO: u128 = 1_100_000_000_000_000_000;

/// Critical Collateral Ratio (CCR) - 150%
/// When TCR falls below this, recovery mode applies
pub const CRITICAL_COLLATERAL_RATIO: u128 = 1_500_000_000_000_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// DEBT
// ═══════════════════════════════════════════════════════════════════════════════

/// Debt reserved in the gas pool for every trove (200 units)
pub const GAS_COMPENSATION: u128 = 200 * DECIMAL_PRECISION;

/// Minimum net debt of a trove (1800 units)
pub const MIN_NET_DEBT: u128 = 1_800 * DECIMAL_PRECISION;

/// Divisor for the collateral share paid to liquidators (1 / 200 = 0.5%)
pub const PERCENT_DIVISOR: u128 = 200;

// ═══════════════════════════════════════════════════════════════════════════════
// FEES
// ═══════════════════════════════════════════════════════════════════════════════

/// Borrowing fee floor - 0.5%
pub const BORROWING_FEE_FLOOR: u128 = DECIMAL_PRECISION / 1000 * 5;

/// Maximum borrowing fee - 5%
pub const MAX_BORROWING_FEE: u128 = DECIMAL_PRECISION / 100 * 5;

/// Redemption fee floor - 0.5%
pub const REDEMPTION_FEE_FLOOR: u128 = DECIMAL_PRECISION / 1000 * 5;

/// Divisor applied to the redeemed fraction when bumping the base rate
pub const BETA: u128 = 2;

/// Per-minute decay factor of the base rate (12h half-life)
pub const MINUTE_DECAY_FACTOR: u128 = 999_037_758_833_783_000;

/// Seconds per minute
pub const SECONDS_IN_ONE_MINUTE: u64 = 60;

/// Cap on the exponent of the decay (1000 years in minutes)
pub const MAX_DECAY_MINUTES: u64 = 525_600_000;

// ═══════════════════════════════════════════════════════════════════════════════
// SORTED TROVES
// ═══════════════════════════════════════════════════════════════════════════════

/// Default maximum number of troves in the sorted list
pub const DEFAULT_MAX_SORTED_SIZE: usize = 1000;

/// Default maximum number of steps taken to correct a positional hint
pub const DEFAULT_MAX_HINT_TRAVERSAL: u32 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// ADDRESSES
// ═══════════════════════════════════════════════════════════════════════════════

/// Length of an address in bytes
pub const ADDRESS_LENGTH: usize = 20;

/// Length of a hash in bytes (SHA256)
pub const HASH_LENGTH: usize = 32;
