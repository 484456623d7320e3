//! Trove records.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::math::{compute_cr, compute_nominal_cr};

/// Lifecycle state of a trove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TroveStatus {
    /// Never opened (or record reset)
    #[default]
    NonExistent,
    /// Open with collateral and debt
    Active,
    /// Closed by its owner
    ClosedByOwner,
    /// Closed by liquidation
    ClosedByLiquidation,
    /// Closed by a redemption that cleared its debt
    ClosedByRedemption,
}

impl TroveStatus {
    /// Whether the trove is open
    pub fn is_active(&self) -> bool {
        matches!(self, TroveStatus::Active)
    }

    /// Whether the trove reached a terminal closed state
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TroveStatus::ClosedByOwner
                | TroveStatus::ClosedByLiquidation
                | TroveStatus::ClosedByRedemption
        )
    }
}

impl fmt::Display for TroveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TroveStatus::NonExistent => write!(f, "NonExistent"),
            TroveStatus::Active => write!(f, "Active"),
            TroveStatus::ClosedByOwner => write!(f, "ClosedByOwner"),
            TroveStatus::ClosedByLiquidation => write!(f, "ClosedByLiquidation"),
            TroveStatus::ClosedByRedemption => write!(f, "ClosedByRedemption"),
        }
    }
}

/// Values of `L_coll` / `L_debt` when the trove was last touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RewardSnapshot {
    /// Collateral reward per unit staked
    pub coll: u128,
    /// Debt reward per unit staked
    pub debt: u128,
}

/// A borrower's position
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Trove {
    /// Lifecycle state
    pub status: TroveStatus,
    /// Recorded collateral, excluding pending rewards
    pub coll: u128,
    /// Recorded debt, excluding pending rewards
    pub debt: u128,
    /// Redistribution stake
    pub stake: u128,
    /// Scalars at last touch
    pub snapshot: RewardSnapshot,
    /// Position in the trove owners array
    pub array_index: usize,
}

impl Trove {
    /// Nominal ratio of the recorded amounts
    pub fn nominal_icr(&self) -> u128 {
        compute_nominal_cr(self.coll, self.debt)
    }

    /// Ratio of the recorded amounts at `price`
    pub fn icr(&self, price: u128) -> u128 {
        compute_cr(self.coll, self.debt, price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::constants::DECIMAL_PRECISION;

    #[test]
    fn test_status_predicates() {
        assert!(TroveStatus::Active.is_active());
        assert!(!TroveStatus::NonExistent.is_closed());
        assert!(TroveStatus::ClosedByRedemption.is_closed());
        assert_eq!(TroveStatus::default(), TroveStatus::NonExistent);
    }

    #[test]
    fn test_ratios() {
        let trove = Trove {
            status: TroveStatus::Active,
            coll: 10 * DECIMAL_PRECISION,
            debt: 5_000 * DECIMAL_PRECISION,
            ..Default::default()
        };
        // 10 * 3000 / 5000 = 600%
        assert_eq!(trove.icr(3_000 * DECIMAL_PRECISION), 6 * DECIMAL_PRECISION);
        // 10e18 * 1e20 / 5000e18 = 2e17
        assert_eq!(trove.nominal_icr(), 200_000_000_000_000_000);
    }
}
