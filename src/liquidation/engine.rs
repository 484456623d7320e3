//! Liquidation engine.
//!
//! Troves are liquidated one at a time, each in the same fixed order:
//!
//! 1. pending redistribution rewards are moved into the trove
//! 2. the stake is removed and the trove is closed (owners array, sorted list)
//! 3. `min(debt, deposits)` is offset against the Stability Pool together with
//!    a proportional share of the collateral
//! 4. the rest is redistributed to all remaining stakes
//! 5. collateral above `debt * MCR / price` (recovery mode only) is parked in
//!    the Collateral Surplus Pool for the owner
//!
//! Gas compensation for the whole call is paid to the liquidator at the end:
//! 0.5% of each trove's collateral plus the fixed debt-token reserve.

use serde::{Deserialize, Serialize};

use crate::core::config::ProtocolParams;
use crate::core::trove::TroveStatus;
use crate::error::{Error, Result};
use crate::liquidation::recovery::{LiquidationAction, RecoveryMode};
use crate::protocol::events::{
    LiquidationEvent, LiquidationMode, ProtocolEvent, TroveLiquidatedEvent, TroveOperation,
    TroveUpdatedEvent,
};
use crate::protocol::system::{Components, ExecutionContext};
use crate::protocol::trove_manager::{EntireDebtAndColl, TroveManager};
use crate::utils::constants::PERCENT_DIVISOR;
use crate::utils::crypto::Address;
use crate::utils::math::{compute_cr, mul_div, safe_add, safe_sub};

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION VALUES
// ═══════════════════════════════════════════════════════════════════════════════

/// How one trove's debt and collateral are split by a liquidation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationValues {
    /// Debt including pending rewards
    pub entire_debt: u128,
    /// Collateral including pending rewards
    pub entire_coll: u128,
    /// Collateral paid to the liquidator
    pub coll_gas_compensation: u128,
    /// Debt tokens paid to the liquidator from the gas pool
    pub token_gas_compensation: u128,
    /// Debt cancelled against the Stability Pool
    pub debt_to_offset: u128,
    /// Collateral sent to the Stability Pool
    pub coll_to_send_to_sp: u128,
    /// Debt spread over remaining troves
    pub debt_to_redistribute: u128,
    /// Collateral spread over remaining troves
    pub coll_to_redistribute: u128,
    /// Collateral left for the owner to claim
    pub coll_surplus: u128,
}

/// Split a trove for `action` at `price` with `deposits` in the pool
pub fn compute_liquidation_values(
    params: &ProtocolParams,
    entire: &EntireDebtAndColl,
    action: LiquidationAction,
    price: u128,
    deposits: u128,
) -> Result<LiquidationValues> {
    let debt = entire.debt;
    let coll = entire.coll;
    let mut values = LiquidationValues {
        entire_debt: debt,
        entire_coll: coll,
        token_gas_compensation: params.gas_compensation,
        ..Default::default()
    };

    match action {
        LiquidationAction::Skip => {
            return Err(Error::InvariantViolation(
                "liquidation values requested for a skipped trove".into(),
            ));
        }
        LiquidationAction::Redistribute => {
            values.coll_gas_compensation = coll / PERCENT_DIVISOR;
            values.debt_to_redistribute = debt;
            values.coll_to_redistribute = coll - values.coll_gas_compensation;
        }
        LiquidationAction::OffsetAndRedistribute => {
            values.coll_gas_compensation = coll / PERCENT_DIVISOR;
            let coll_to_liquidate = coll - values.coll_gas_compensation;
            if deposits > 0 && debt > 0 {
                values.debt_to_offset = debt.min(deposits);
                values.coll_to_send_to_sp =
                    mul_div(coll_to_liquidate, values.debt_to_offset, debt)?;
            }
            values.debt_to_redistribute = debt - values.debt_to_offset;
            values.coll_to_redistribute = coll_to_liquidate - values.coll_to_send_to_sp;
        }
        LiquidationAction::CappedOffset => {
            let capped_coll = mul_div(debt, params.min_collateral_ratio, price)?;
            if capped_coll > coll {
                return Err(Error::InvariantViolation(
                    "capped collateral exceeds trove collateral".into(),
                ));
            }
            values.coll_gas_compensation = capped_coll / PERCENT_DIVISOR;
            values.debt_to_offset = debt;
            values.coll_to_send_to_sp = capped_coll - values.coll_gas_compensation;
            values.coll_surplus = coll - capped_coll;
        }
    }
    Ok(values)
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION TOTALS
// ═══════════════════════════════════════════════════════════════════════════════

/// Sums over the troves liquidated by one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationTotals {
    /// Troves liquidated
    pub troves: u32,
    /// Collateral of the liquidated troves
    pub coll_in_sequence: u128,
    /// Debt of the liquidated troves
    pub debt_in_sequence: u128,
    /// Collateral paid to the liquidator
    pub coll_gas_compensation: u128,
    /// Debt tokens paid to the liquidator
    pub token_gas_compensation: u128,
    /// Debt cancelled against the Stability Pool
    pub debt_to_offset: u128,
    /// Collateral sent to the Stability Pool
    pub coll_to_send_to_sp: u128,
    /// Debt redistributed
    pub debt_to_redistribute: u128,
    /// Collateral redistributed
    pub coll_to_redistribute: u128,
    /// Collateral left for owners to claim
    pub coll_surplus: u128,
}

impl LiquidationTotals {
    /// Add one trove's values
    pub fn add(&mut self, values: &LiquidationValues) -> Result<()> {
        self.troves += 1;
        self.coll_in_sequence = safe_add(self.coll_in_sequence, values.entire_coll)?;
        self.debt_in_sequence = safe_add(self.debt_in_sequence, values.entire_debt)?;
        self.coll_gas_compensation =
            safe_add(self.coll_gas_compensation, values.coll_gas_compensation)?;
        self.token_gas_compensation =
            safe_add(self.token_gas_compensation, values.token_gas_compensation)?;
        self.debt_to_offset = safe_add(self.debt_to_offset, values.debt_to_offset)?;
        self.coll_to_send_to_sp = safe_add(self.coll_to_send_to_sp, values.coll_to_send_to_sp)?;
        self.debt_to_redistribute =
            safe_add(self.debt_to_redistribute, values.debt_to_redistribute)?;
        self.coll_to_redistribute =
            safe_add(self.coll_to_redistribute, values.coll_to_redistribute)?;
        self.coll_surplus = safe_add(self.coll_surplus, values.coll_surplus)?;
        Ok(())
    }

    /// Collateral that left the system through offset or redistribution
    pub fn liquidated_coll(&self) -> u128 {
        self.coll_in_sequence
            .saturating_sub(self.coll_gas_compensation)
            .saturating_sub(self.coll_surplus)
    }
}

/// Result of a liquidation call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationOutcome {
    /// Liquidated troves, in liquidation order
    pub liquidated: Vec<Address>,
    /// Sums over the liquidated troves
    pub totals: LiquidationTotals,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

impl TroveManager {
    /// Liquidate a single trove
    pub fn liquidate(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        liquidator: Address,
        borrower: Address,
    ) -> Result<LiquidationOutcome> {
        if !self.get_trove_status(borrower).is_active() {
            return Err(Error::TroveNotActive(borrower.to_hex()));
        }
        if self.trove_owners.len() <= 1 {
            return Err(Error::OnlyOneTroveLeft);
        }
        self.batch_liquidate_troves(c, ctx, liquidator, &[borrower])
    }

    /// Liquidate up to `n` troves starting from the lowest ratio
    pub fn liquidate_troves(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        liquidator: Address,
        n: usize,
    ) -> Result<LiquidationOutcome> {
        let price = ctx.price;
        let mcr = self.params.min_collateral_ratio;
        let mut outcome = LiquidationOutcome::default();
        let mut recovery = self.check_recovery_mode(c, price)?;
        let mut current = c.sorted_troves.get_last();

        for _ in 0..n {
            let Some(borrower) = current else { break };
            if self.trove_owners.len() <= 1 {
                break;
            }
            // Cached before the trove leaves the list
            let prev = c.sorted_troves.get_prev(borrower);
            let icr = self.get_current_icr(borrower, price)?;

            if recovery {
                let deposits = c.stability_pool.get_total_debt_deposits();
                if icr >= mcr && deposits == 0 {
                    break;
                }
                let tcr = self.tcr_during_liquidation(c, price, &outcome.totals)?;
                let debt = self.get_entire_debt_and_coll(borrower)?.debt;
                match RecoveryMode::liquidation_action(&self.params, icr, tcr, debt, deposits) {
                    LiquidationAction::Skip => {
                        // Troves further up only have higher ratios
                        if icr >= RecoveryMode::liquidation_ceiling(&self.params, tcr) {
                            break;
                        }
                        tracing::warn!(trove = %borrower.short(), debt, deposits, "trove skipped: pool cannot absorb its debt");
                    }
                    action => {
                        self.liquidate_into(c, ctx, &mut outcome, borrower, action, LiquidationMode::Recovery)?;
                        recovery = self.still_in_recovery(c, price, &outcome.totals)?;
                    }
                }
            } else if icr < mcr {
                self.liquidate_into(
                    c,
                    ctx,
                    &mut outcome,
                    borrower,
                    LiquidationAction::OffsetAndRedistribute,
                    LiquidationMode::Normal,
                )?;
            } else {
                break;
            }
            current = prev;
        }

        self.finish_liquidation(c, ctx, liquidator, outcome)
    }

    /// Liquidate the eligible troves among `borrowers`, in the given order
    pub fn batch_liquidate_troves(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        liquidator: Address,
        borrowers: &[Address],
    ) -> Result<LiquidationOutcome> {
        if borrowers.is_empty() {
            return Err(Error::InvalidParameter {
                name: "borrowers".into(),
                reason: "calldata address array must not be empty".into(),
            });
        }

        let price = ctx.price;
        let mcr = self.params.min_collateral_ratio;
        let mut outcome = LiquidationOutcome::default();
        let mut recovery = self.check_recovery_mode(c, price)?;

        for &borrower in borrowers {
            if !self.get_trove_status(borrower).is_active() {
                continue;
            }
            if self.trove_owners.len() <= 1 {
                break;
            }
            let icr = self.get_current_icr(borrower, price)?;

            if recovery {
                let deposits = c.stability_pool.get_total_debt_deposits();
                if icr >= mcr && deposits == 0 {
                    continue;
                }
                let tcr = self.tcr_during_liquidation(c, price, &outcome.totals)?;
                let debt = self.get_entire_debt_and_coll(borrower)?.debt;
                let action = RecoveryMode::liquidation_action(&self.params, icr, tcr, debt, deposits);
                if action == LiquidationAction::Skip {
                    continue;
                }
                self.liquidate_into(c, ctx, &mut outcome, borrower, action, LiquidationMode::Recovery)?;
                recovery = self.still_in_recovery(c, price, &outcome.totals)?;
            } else if icr < mcr {
                self.liquidate_into(
                    c,
                    ctx,
                    &mut outcome,
                    borrower,
                    LiquidationAction::OffsetAndRedistribute,
                    LiquidationMode::Normal,
                )?;
            }
        }

        self.finish_liquidation(c, ctx, liquidator, outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SINGLE TROVE
    // ═══════════════════════════════════════════════════════════════════════════

    fn liquidate_into(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        outcome: &mut LiquidationOutcome,
        borrower: Address,
        action: LiquidationAction,
        mode: LiquidationMode,
    ) -> Result<()> {
        let values = self.liquidate_trove(c, ctx, borrower, action, mode)?;
        outcome.totals.add(&values)?;
        outcome.liquidated.push(borrower);
        Ok(())
    }

    fn liquidate_trove(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
        action: LiquidationAction,
        mode: LiquidationMode,
    ) -> Result<LiquidationValues> {
        let entire = self.get_entire_debt_and_coll(borrower)?;
        let deposits = c.stability_pool.get_total_debt_deposits();
        let values = compute_liquidation_values(&self.params, &entire, action, ctx.price, deposits)?;

        self.move_pending_rewards_to_active(c, ctx, borrower)?;
        self.remove_stake(borrower)?;
        self.close_trove_record(c, borrower, TroveStatus::ClosedByLiquidation)?;

        c.stability_pool.offset(
            self.address,
            &mut c.token,
            &mut c.active_pool,
            ctx.cumulative_issuance,
            values.debt_to_offset,
            values.coll_to_send_to_sp,
        )?;
        self.redistribute_debt_and_coll(
            c,
            ctx,
            values.debt_to_redistribute,
            values.coll_to_redistribute,
        )?;
        if values.coll_surplus > 0 {
            c.coll_surplus_pool
                .account_surplus(self.address, borrower, values.coll_surplus)?;
            c.active_pool
                .send_collateral(self.address, &mut c.coll_surplus_pool, values.coll_surplus)?;
        }

        tracing::info!(
            trove = %borrower.short(),
            debt = values.entire_debt,
            coll = values.entire_coll,
            offset = values.debt_to_offset,
            redistributed = values.debt_to_redistribute,
            ?mode,
            "trove liquidated"
        );
        let operation = match mode {
            LiquidationMode::Normal => TroveOperation::LiquidateInNormalMode,
            LiquidationMode::Recovery => TroveOperation::LiquidateInRecoveryMode,
        };
        c.events.push(ProtocolEvent::TroveLiquidated(TroveLiquidatedEvent {
            borrower,
            debt: values.entire_debt,
            coll: values.entire_coll,
            debt_offset: values.debt_to_offset,
            debt_redistributed: values.debt_to_redistribute,
            coll_surplus: values.coll_surplus,
            mode,
            timestamp: ctx.timestamp,
        }));
        c.events.push(ProtocolEvent::TroveUpdated(TroveUpdatedEvent {
            borrower,
            coll: 0,
            debt: 0,
            stake: 0,
            operation,
            timestamp: ctx.timestamp,
        }));
        Ok(values)
    }

    /// TCR with this call's collateral gas compensation already paid out
    fn tcr_during_liquidation(
        &self,
        c: &Components,
        price: u128,
        totals: &LiquidationTotals,
    ) -> Result<u128> {
        let coll = safe_sub(self.get_entire_system_coll(c)?, totals.coll_gas_compensation)?;
        Ok(compute_cr(coll, self.get_entire_system_debt(c)?, price))
    }

    fn still_in_recovery(&self, c: &Components, price: u128, totals: &LiquidationTotals) -> Result<bool> {
        let tcr = self.tcr_during_liquidation(c, price, totals)?;
        let recovery = RecoveryMode::is_recovery_mode(tcr, self.params.critical_collateral_ratio);
        if !recovery {
            tracing::info!(tcr, "back to normal mode during liquidation");
        }
        Ok(recovery)
    }

    fn finish_liquidation(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        liquidator: Address,
        outcome: LiquidationOutcome,
    ) -> Result<LiquidationOutcome> {
        let totals = outcome.totals;
        if totals.troves == 0 {
            return Err(Error::NothingToLiquidate);
        }

        self.update_system_snapshots_exclude_coll_remainder(c, ctx, totals.coll_gas_compensation)?;

        let gas_pool = self.gas_pool()?;
        c.token.return_from_pool(
            self.address,
            gas_pool,
            liquidator,
            totals.token_gas_compensation,
        )?;
        c.active_pool.send_collateral(
            self.address,
            &mut c.accounts.wallet(liquidator),
            totals.coll_gas_compensation,
        )?;

        c.events.push(ProtocolEvent::Liquidation(LiquidationEvent {
            liquidator,
            troves: totals.troves,
            liquidated_debt: totals.debt_in_sequence,
            liquidated_coll: totals.liquidated_coll(),
            coll_gas_compensation: totals.coll_gas_compensation,
            token_gas_compensation: totals.token_gas_compensation,
            timestamp: ctx.timestamp,
        }));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::constants::DECIMAL_PRECISION;

    const E18: u128 = DECIMAL_PRECISION;

    fn entire(coll: u128, debt: u128) -> EntireDebtAndColl {
        EntireDebtAndColl {
            coll,
            debt,
            ..Default::default()
        }
    }

    #[test]
    fn test_offset_and_redistribute_split() {
        let params = ProtocolParams::default();
        // 10 coll, 10000 debt, pool holds 4000
        let v = compute_liquidation_values(
            &params,
            &entire(10 * E18, 10_000 * E18),
            LiquidationAction::OffsetAndRedistribute,
            1_000 * E18,
            4_000 * E18,
        )
        .unwrap();

        assert_eq!(v.coll_gas_compensation, E18 / 20);
        assert_eq!(v.token_gas_compensation, params.gas_compensation);
        assert_eq!(v.debt_to_offset, 4_000 * E18);
        assert_eq!(v.debt_to_redistribute, 6_000 * E18);
        // 40% of the 9.95 left after gas compensation
        assert_eq!(v.coll_to_send_to_sp, 398 * E18 / 100);
        assert_eq!(v.coll_to_redistribute, 597 * E18 / 100);
        assert_eq!(v.coll_surplus, 0);
        assert_eq!(
            v.coll_gas_compensation + v.coll_to_send_to_sp + v.coll_to_redistribute,
            10 * E18
        );
    }

    #[test]
    fn test_empty_pool_redistributes_everything() {
        let params = ProtocolParams::default();
        let v = compute_liquidation_values(
            &params,
            &entire(10 * E18, 10_000 * E18),
            LiquidationAction::OffsetAndRedistribute,
            1_000 * E18,
            0,
        )
        .unwrap();
        assert_eq!(v.debt_to_offset, 0);
        assert_eq!(v.coll_to_send_to_sp, 0);
        assert_eq!(v.debt_to_redistribute, 10_000 * E18);
        assert_eq!(v.coll_to_redistribute, 995 * E18 / 100);
    }

    #[test]
    fn test_full_redistribution_ignores_pool() {
        let params = ProtocolParams::default();
        let v = compute_liquidation_values(
            &params,
            &entire(10 * E18, 12_000 * E18),
            LiquidationAction::Redistribute,
            1_000 * E18,
            50_000 * E18,
        )
        .unwrap();
        assert_eq!(v.debt_to_offset, 0);
        assert_eq!(v.debt_to_redistribute, 12_000 * E18);
        assert_eq!(v.coll_to_redistribute, 995 * E18 / 100);
    }

    #[test]
    fn test_capped_offset_leaves_surplus() {
        let params = ProtocolParams::default();
        // ICR 120% at price 1000: 12 coll against 10000 debt
        let v = compute_liquidation_values(
            &params,
            &entire(12 * E18, 10_000 * E18),
            LiquidationAction::CappedOffset,
            1_000 * E18,
            20_000 * E18,
        )
        .unwrap();

        // Capped at 110%: 11 coll
        assert_eq!(v.debt_to_offset, 10_000 * E18);
        assert_eq!(v.coll_gas_compensation, 11 * E18 / 200);
        assert_eq!(v.coll_to_send_to_sp, 11 * E18 - 11 * E18 / 200);
        assert_eq!(v.coll_surplus, E18);
        assert_eq!(v.debt_to_redistribute, 0);
    }

    #[test]
    fn test_skip_has_no_values() {
        let err = compute_liquidation_values(
            &ProtocolParams::default(),
            &entire(E18, E18),
            LiquidationAction::Skip,
            E18,
            0,
        )
        .unwrap_err();
        assert!(err.is_critical());
    }

    #[test]
    fn test_totals_accumulate() {
        let mut totals = LiquidationTotals::default();
        let v = LiquidationValues {
            entire_debt: 100,
            entire_coll: 10,
            coll_gas_compensation: 1,
            coll_surplus: 2,
            ..Default::default()
        };
        totals.add(&v).unwrap();
        totals.add(&v).unwrap();
        assert_eq!(totals.troves, 2);
        assert_eq!(totals.debt_in_sequence, 200);
        assert_eq!(totals.liquidated_coll(), 14);
    }
}
