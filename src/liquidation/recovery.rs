//! Recovery mode rules.
//!
//! Recovery mode is active while the Total Collateral Ratio (TCR) is below
//! the Critical Collateral Ratio (CCR). In this mode:
//!
//! 1. **Liquidation threshold raised**: troves between MCR and the configured
//!    ceiling can be liquidated when the stability pool absorbs their whole
//!    debt, with the collateral taken capped at MCR
//! 2. **Borrowing restricted**: new or increased debt needs ICR >= CCR
//! 3. **Withdrawal blocked**: collateral cannot be withdrawn and troves cannot
//!    be closed
//!
//! Everything here is a pure function of the inputs; callers gather the
//! totals from the pools.

use serde::{Deserialize, Serialize};

use crate::core::config::{ProtocolParams, RecoveryCeiling};
use crate::error::{Error, Result};
use crate::utils::constants::ONE_HUNDRED_PERCENT;
use crate::utils::math::{compute_cr, safe_add, safe_sub};

// ═══════════════════════════════════════════════════════════════════════════════
// RECOVERY MODE STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of the system collateralization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryModeStatus {
    /// Whether recovery mode is active
    pub is_active: bool,
    /// Total Collateral Ratio
    pub tcr: u128,
    /// Critical ratio the TCR is compared against
    pub ccr: u128,
    /// Active plus default pool collateral
    pub total_coll: u128,
    /// Active plus default pool debt
    pub total_debt: u128,
    /// Price used
    pub price: u128,
}

impl RecoveryModeStatus {
    /// Evaluate the status for the given totals
    pub fn evaluate(total_coll: u128, total_debt: u128, price: u128, ccr: u128) -> Self {
        let tcr = RecoveryMode::calculate_tcr(total_coll, total_debt, price);
        Self {
            is_active: RecoveryMode::is_recovery_mode(tcr, ccr),
            tcr,
            ccr,
            total_coll,
            total_debt,
            price,
        }
    }

    /// Signed distance between TCR and CCR; negative while in recovery mode
    pub fn distance_to_exit(&self) -> i128 {
        let tcr = self.tcr.min(i128::MAX as u128) as i128;
        tcr - self.ccr as i128
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TROVE CHANGES
// ═══════════════════════════════════════════════════════════════════════════════

/// A change to a trove's collateral and debt, as magnitudes plus direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroveChange {
    /// Collateral moved
    pub coll_change: u128,
    /// Whether collateral is added
    pub is_coll_increase: bool,
    /// Debt moved, fees included
    pub debt_change: u128,
    /// Whether debt is added
    pub is_debt_increase: bool,
}

impl TroveChange {
    /// Apply to a `(coll, debt)` pair
    pub fn apply(&self, coll: u128, debt: u128) -> Result<(u128, u128)> {
        let coll = if self.is_coll_increase {
            safe_add(coll, self.coll_change)?
        } else {
            safe_sub(coll, self.coll_change)?
        };
        let debt = if self.is_debt_increase {
            safe_add(debt, self.debt_change)?
        } else {
            safe_sub(debt, self.debt_change)?
        };
        Ok((coll, debt))
    }

    /// Whether collateral leaves the trove
    pub fn is_coll_withdrawal(&self) -> bool {
        !self.is_coll_increase && self.coll_change > 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATION VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of validating a borrower operation against the current mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryModeValidation {
    /// Operation is allowed
    Allowed,
    /// Operation is blocked
    Blocked(Error),
}

impl RecoveryModeValidation {
    /// Check if operation is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Convert into a result
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Blocked(error) => Err(error),
        }
    }
}

/// What a recovery-mode liquidation does with a trove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationAction {
    /// Leave the trove alone
    Skip,
    /// ICR <= 100%: redistribute everything left after gas compensation
    Redistribute,
    /// Offset what the pool can and redistribute the rest
    OffsetAndRedistribute,
    /// Offset the whole debt, taking collateral only up to MCR
    CappedOffset,
}

/// Recovery mode rule set
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryMode;

impl RecoveryMode {
    // ═══════════════════════════════════════════════════════════════════════════
    // TCR CALCULATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Calculate Total Collateral Ratio
    pub fn calculate_tcr(total_coll: u128, total_debt: u128, price: u128) -> u128 {
        compute_cr(total_coll, total_debt, price)
    }

    /// Check if TCR indicates recovery mode
    pub fn is_recovery_mode(tcr: u128, ccr: u128) -> bool {
        tcr < ccr
    }

    /// TCR after applying `change` to the system totals
    pub fn calculate_tcr_after_change(
        total_coll: u128,
        total_debt: u128,
        change: &TroveChange,
        price: u128,
    ) -> Result<u128> {
        let (coll, debt) = change.apply(total_coll, total_debt)?;
        Ok(Self::calculate_tcr(coll, debt, price))
    }

    /// Ratio a trove must stay under to be liquidated in recovery mode
    pub fn liquidation_ceiling(params: &ProtocolParams, tcr: u128) -> u128 {
        match params.recovery_ceiling {
            RecoveryCeiling::Tcr => tcr,
            RecoveryCeiling::Ccr => params.critical_collateral_ratio,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPERATION VALIDATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Validate opening a trove with ratio `icr`
    pub fn validate_open_trove(
        params: &ProtocolParams,
        is_recovery_mode: bool,
        icr: u128,
        new_tcr: u128,
    ) -> RecoveryModeValidation {
        if is_recovery_mode {
            if icr < params.critical_collateral_ratio {
                return RecoveryModeValidation::Blocked(Error::IcrBelowMinimum {
                    icr,
                    required: params.critical_collateral_ratio,
                });
            }
            return RecoveryModeValidation::Allowed;
        }

        if icr < params.min_collateral_ratio {
            return RecoveryModeValidation::Blocked(Error::IcrBelowMinimum {
                icr,
                required: params.min_collateral_ratio,
            });
        }
        if new_tcr < params.critical_collateral_ratio {
            return RecoveryModeValidation::Blocked(Error::TcrBelowCcr {
                tcr: new_tcr,
                ccr: params.critical_collateral_ratio,
            });
        }
        RecoveryModeValidation::Allowed
    }

    /// Validate adjusting a trove from `old_icr` to `new_icr`
    pub fn validate_adjustment(
        params: &ProtocolParams,
        is_recovery_mode: bool,
        change: &TroveChange,
        old_icr: u128,
        new_icr: u128,
        new_tcr: u128,
    ) -> RecoveryModeValidation {
        if is_recovery_mode {
            if change.is_coll_withdrawal() {
                return RecoveryModeValidation::Blocked(Error::RecoveryMode(
                    "collateral withdrawal not permitted".into(),
                ));
            }
            if change.is_debt_increase && change.debt_change > 0 {
                if new_icr < params.critical_collateral_ratio {
                    return RecoveryModeValidation::Blocked(Error::IcrBelowMinimum {
                        icr: new_icr,
                        required: params.critical_collateral_ratio,
                    });
                }
                if new_icr < old_icr {
                    return RecoveryModeValidation::Blocked(Error::RecoveryMode(
                        "cannot decrease your trove's ICR".into(),
                    ));
                }
            }
            return RecoveryModeValidation::Allowed;
        }

        if new_icr < params.min_collateral_ratio {
            return RecoveryModeValidation::Blocked(Error::IcrBelowMinimum {
                icr: new_icr,
                required: params.min_collateral_ratio,
            });
        }
        if new_tcr < params.critical_collateral_ratio {
            return RecoveryModeValidation::Blocked(Error::TcrBelowCcr {
                tcr: new_tcr,
                ccr: params.critical_collateral_ratio,
            });
        }
        RecoveryModeValidation::Allowed
    }

    /// Validate closing a trove
    pub fn validate_close(
        params: &ProtocolParams,
        is_recovery_mode: bool,
        new_tcr: u128,
    ) -> RecoveryModeValidation {
        if is_recovery_mode {
            return RecoveryModeValidation::Blocked(Error::RecoveryMode("close_trove".into()));
        }
        if new_tcr < params.critical_collateral_ratio {
            return RecoveryModeValidation::Blocked(Error::TcrBelowCcr {
                tcr: new_tcr,
                ccr: params.critical_collateral_ratio,
            });
        }
        RecoveryModeValidation::Allowed
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION IN RECOVERY MODE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Classify a trove for liquidation while the system is in recovery mode
    pub fn liquidation_action(
        params: &ProtocolParams,
        icr: u128,
        tcr: u128,
        trove_debt: u128,
        pool_deposits: u128,
    ) -> LiquidationAction {
        if icr <= ONE_HUNDRED_PERCENT {
            LiquidationAction::Redistribute
        } else if icr < params.min_collateral_ratio {
            LiquidationAction::OffsetAndRedistribute
        } else if icr < Self::liquidation_ceiling(params, tcr) && trove_debt <= pool_deposits {
            LiquidationAction::CappedOffset
        } else {
            LiquidationAction::Skip
        }
    }

    /// Classify a trove for liquidation under normal-mode rules
    pub fn normal_action(params: &ProtocolParams, icr: u128) -> LiquidationAction {
        if icr < params.min_collateral_ratio {
            LiquidationAction::OffsetAndRedistribute
        } else {
            LiquidationAction::Skip
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::constants::DECIMAL_PRECISION;

    const E18: u128 = DECIMAL_PRECISION;

    fn params() -> ProtocolParams {
        ProtocolParams::default()
    }

    #[test]
    fn test_calculate_tcr() {
        // 10 coll at 2000 against 10000 debt = 200%
        let tcr = RecoveryMode::calculate_tcr(10 * E18, 10_000 * E18, 2_000 * E18);
        assert_eq!(tcr, 2 * E18);
        assert_eq!(RecoveryMode::calculate_tcr(10 * E18, 0, 2_000 * E18), u128::MAX);
    }

    #[test]
    fn test_status_evaluate() {
        let status = RecoveryModeStatus::evaluate(10 * E18, 15_000 * E18, 2_000 * E18, params().critical_collateral_ratio);
        assert!(status.is_active);
        assert!(status.distance_to_exit() < 0);

        let status = RecoveryModeStatus::evaluate(10 * E18, 10_000 * E18, 2_000 * E18, params().critical_collateral_ratio);
        assert!(!status.is_active);
        assert_eq!(status.distance_to_exit(), (E18 / 2) as i128);
    }

    #[test]
    fn test_tcr_after_change() {
        let change = TroveChange {
            coll_change: 10 * E18,
            is_coll_increase: false,
            debt_change: 0,
            is_debt_increase: false,
        };
        let tcr =
            RecoveryMode::calculate_tcr_after_change(20 * E18, 10_000 * E18, &change, 2_000 * E18)
                .unwrap();
        assert_eq!(tcr, 2 * E18);

        let too_much = TroveChange {
            coll_change: 30 * E18,
            ..change
        };
        assert!(RecoveryMode::calculate_tcr_after_change(20 * E18, 1, &too_much, E18).is_err());
    }

    #[test]
    fn test_validate_open_trove() {
        let p = params();
        assert!(RecoveryMode::validate_open_trove(&p, false, p.min_collateral_ratio, 2 * E18).is_allowed());
        assert!(matches!(
            RecoveryMode::validate_open_trove(&p, false, p.min_collateral_ratio - 1, 2 * E18),
            RecoveryModeValidation::Blocked(Error::IcrBelowMinimum { .. })
        ));
        assert!(matches!(
            RecoveryMode::validate_open_trove(&p, false, 2 * E18, p.critical_collateral_ratio - 1),
            RecoveryModeValidation::Blocked(Error::TcrBelowCcr { .. })
        ));
        // Recovery mode needs CCR but ignores the resulting TCR
        assert!(!RecoveryMode::validate_open_trove(&p, true, 14 * E18 / 10, 0).is_allowed());
        assert!(RecoveryMode::validate_open_trove(&p, true, p.critical_collateral_ratio, 0).is_allowed());
    }

    #[test]
    fn test_validate_adjustment_in_recovery_mode() {
        let p = params();
        let withdrawal = TroveChange {
            coll_change: 1,
            ..Default::default()
        };
        let result = RecoveryMode::validate_adjustment(&p, true, &withdrawal, 3 * E18, 3 * E18, E18);
        assert!(matches!(result, RecoveryModeValidation::Blocked(Error::RecoveryMode(_))));

        let borrow = TroveChange {
            debt_change: 100 * E18,
            is_debt_increase: true,
            ..Default::default()
        };
        // Borrowing that lowers ICR is refused even above CCR
        assert!(!RecoveryMode::validate_adjustment(&p, true, &borrow, 3 * E18, 2 * E18, E18).is_allowed());
        let top_up = TroveChange {
            coll_change: 5 * E18,
            is_coll_increase: true,
            ..borrow
        };
        assert!(RecoveryMode::validate_adjustment(&p, true, &top_up, 2 * E18, 3 * E18, E18).is_allowed());

        let repay = TroveChange {
            debt_change: 100 * E18,
            ..Default::default()
        };
        assert!(RecoveryMode::validate_adjustment(&p, true, &repay, E18, E18, E18).is_allowed());
    }

    #[test]
    fn test_validate_adjustment_in_normal_mode() {
        let p = params();
        let change = TroveChange::default();
        assert!(RecoveryMode::validate_adjustment(&p, false, &change, 2 * E18, 2 * E18, 2 * E18).is_allowed());
        assert!(!RecoveryMode::validate_adjustment(&p, false, &change, 2 * E18, E18, 2 * E18).is_allowed());
        assert!(!RecoveryMode::validate_adjustment(&p, false, &change, 2 * E18, 2 * E18, E18).is_allowed());
    }

    #[test]
    fn test_validate_close() {
        let p = params();
        assert!(RecoveryMode::validate_close(&p, false, 2 * E18).is_allowed());
        assert!(!RecoveryMode::validate_close(&p, true, 2 * E18).is_allowed());
        assert!(!RecoveryMode::validate_close(&p, false, E18).is_allowed());
    }

    #[test]
    fn test_liquidation_action() {
        let p = params();
        let tcr = 13 * E18 / 10;
        let deposits = 1_000 * E18;

        assert_eq!(RecoveryMode::liquidation_action(&p, E18, tcr, 500 * E18, deposits), LiquidationAction::Redistribute);
        assert_eq!(
            RecoveryMode::liquidation_action(&p, 105 * E18 / 100, tcr, 500 * E18, deposits),
            LiquidationAction::OffsetAndRedistribute
        );
        assert_eq!(
            RecoveryMode::liquidation_action(&p, 12 * E18 / 10, tcr, 500 * E18, deposits),
            LiquidationAction::CappedOffset
        );
        // Pool cannot absorb the whole debt
        assert_eq!(
            RecoveryMode::liquidation_action(&p, 12 * E18 / 10, tcr, 5_000 * E18, deposits),
            LiquidationAction::Skip
        );
        // At or above TCR
        assert_eq!(RecoveryMode::liquidation_action(&p, tcr, tcr, 500 * E18, deposits), LiquidationAction::Skip);
    }

    #[test]
    fn test_ccr_ceiling() {
        let p = params().with_recovery_ceiling(RecoveryCeiling::Ccr);
        let tcr = 12 * E18 / 10;
        // Above TCR but under CCR qualifies with the CCR ceiling
        assert_eq!(
            RecoveryMode::liquidation_action(&p, 14 * E18 / 10, tcr, 100 * E18, 1_000 * E18),
            LiquidationAction::CappedOffset
        );
        assert_eq!(RecoveryMode::liquidation_ceiling(&p, tcr), p.critical_collateral_ratio);
        assert_eq!(RecoveryMode::liquidation_ceiling(&params(), tcr), tcr);
    }

    #[test]
    fn test_normal_action() {
        let p = params();
        assert_eq!(RecoveryMode::normal_action(&p, p.min_collateral_ratio - 1), LiquidationAction::OffsetAndRedistribute);
        assert_eq!(RecoveryMode::normal_action(&p, p.min_collateral_ratio), LiquidationAction::Skip);
    }
}
