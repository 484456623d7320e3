//! Redemptions.
//!
//! Debt tokens are exchanged for collateral at face value against the troves
//! with the lowest ratio at or above MCR. A trove redeemed down to its gas
//! reserve is closed and its remaining collateral becomes claimable in the
//! Collateral Surplus Pool. The protocol keeps a collateral fee driven by the
//! base rate, which grows with every redemption.

use serde::{Deserialize, Serialize};

use crate::core::sorted_troves::PositionHint;
use crate::core::trove::TroveStatus;
use crate::error::{Error, Result};
use crate::protocol::events::{ProtocolEvent, RedemptionEvent, TroveOperation, TroveUpdatedEvent};
use crate::protocol::system::{Components, ExecutionContext};
use crate::protocol::trove_manager::TroveManager;
use crate::utils::constants::DECIMAL_PRECISION;
use crate::utils::crypto::Address;
use crate::utils::math::{compute_nominal_cr, mul_div, safe_add, safe_sub};

/// Caller-computed hints for a redemption
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionHints {
    /// First trove to redeem from; searched from the tail when invalid
    pub first_redemption_hint: Option<Address>,
    /// Position of the partially redeemed trove
    pub partial: PositionHint,
    /// Expected NICR of the partially redeemed trove; a mismatch stops the
    /// redemption before the partial step
    pub partial_nicr: Option<u128>,
}

/// Result of a redemption
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionOutcome {
    /// Debt tokens burned
    pub debt_redeemed: u128,
    /// Collateral taken from troves
    pub coll_drawn: u128,
    /// Collateral kept as fee
    pub coll_fee: u128,
    /// Collateral sent to the redeemer
    pub coll_sent: u128,
    /// Troves touched
    pub troves: u32,
}

/// What redeeming from one trove did
#[derive(Debug, Clone, Copy, Default)]
struct SingleRedemption {
    debt_lot: u128,
    coll_lot: u128,
    cancelled_partial: bool,
}

impl TroveManager {
    /// Redeem `amount` debt tokens of `redeemer` for collateral.
    ///
    /// `max_iterations` of zero means no limit. `max_fee` bounds the fee
    /// percentage the redeemer accepts.
    #[allow(clippy::too_many_arguments)]
    pub fn redeem_collateral(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        redeemer: Address,
        amount: u128,
        hints: RedemptionHints,
        max_iterations: u32,
        max_fee: u128,
    ) -> Result<RedemptionOutcome> {
        let price = ctx.price;
        if max_fee < self.params.redemption_fee_floor || max_fee > DECIMAL_PRECISION {
            return Err(Error::InvalidParameter {
                name: "max_fee".into(),
                reason: "max fee percentage must be between the redemption floor and 100%".into(),
            });
        }
        let tcr = self.get_tcr(c, price)?;
        if tcr < self.params.min_collateral_ratio {
            return Err(Error::RecoveryMode("cannot redeem when TCR < MCR".into()));
        }
        if amount == 0 {
            return Err(Error::ZeroAmount);
        }
        let balance = c.token.balance_of(redeemer);
        if balance < amount {
            return Err(Error::insufficient(&redeemer.to_hex(), amount, balance));
        }
        let total_supply_at_start = c.token.total_supply();

        let mut current = if self.is_valid_first_redemption_hint(c, hints.first_redemption_hint, price)? {
            hints.first_redemption_hint
        } else {
            let mut candidate = c.sorted_troves.get_last();
            while let Some(borrower) = candidate {
                if self.get_current_icr(borrower, price)? >= self.params.min_collateral_ratio {
                    break;
                }
                candidate = c.sorted_troves.get_prev(borrower);
            }
            candidate
        };

        let mut outcome = RedemptionOutcome::default();
        let mut remaining = amount;
        let mut iterations = 0u32;

        while let Some(borrower) = current {
            if remaining == 0 || (max_iterations > 0 && iterations >= max_iterations) {
                break;
            }
            iterations += 1;
            // Cached before the trove may leave the list
            let next = c.sorted_troves.get_prev(borrower);

            self.move_pending_rewards_to_active(c, ctx, borrower)?;
            let single = self.redeem_from_trove(c, ctx, borrower, remaining, &hints)?;
            if single.cancelled_partial {
                break;
            }

            outcome.debt_redeemed = safe_add(outcome.debt_redeemed, single.debt_lot)?;
            outcome.coll_drawn = safe_add(outcome.coll_drawn, single.coll_lot)?;
            outcome.troves += 1;
            remaining = safe_sub(remaining, single.debt_lot)?;
            current = next;
        }

        if outcome.coll_drawn == 0 {
            return Err(Error::NothingToRedeem);
        }

        self.update_base_rate_from_redemption(c, ctx, outcome.coll_drawn, total_supply_at_start)?;
        outcome.coll_fee = self.get_redemption_fee(outcome.coll_drawn)?;
        let fee_percentage = mul_div(outcome.coll_fee, DECIMAL_PRECISION, outcome.coll_drawn)?;
        if fee_percentage > max_fee {
            return Err(Error::FeeExceedsMaximum {
                fee: fee_percentage,
                max: max_fee,
            });
        }

        let fee_recipient = self.fee_recipient;
        c.active_pool.send_collateral(
            self.address,
            &mut c.accounts.wallet(fee_recipient),
            outcome.coll_fee,
        )?;
        outcome.coll_sent = outcome.coll_drawn - outcome.coll_fee;

        c.token.burn(self.address, redeemer, outcome.debt_redeemed)?;
        c.active_pool.decrease_debt(self.address, outcome.debt_redeemed)?;
        c.active_pool.send_collateral(
            self.address,
            &mut c.accounts.wallet(redeemer),
            outcome.coll_sent,
        )?;

        tracing::info!(
            redeemer = %redeemer.short(),
            attempted = amount,
            redeemed = outcome.debt_redeemed,
            coll_sent = outcome.coll_sent,
            base_rate = self.base_rate,
            "redemption"
        );
        c.events.push(ProtocolEvent::Redemption(RedemptionEvent {
            redeemer,
            attempted: amount,
            actual: outcome.debt_redeemed,
            coll_sent: outcome.coll_sent,
            coll_fee: outcome.coll_fee,
            timestamp: ctx.timestamp,
        }));
        Ok(outcome)
    }

    /// Whether `hint` is the riskiest trove still at or above MCR
    fn is_valid_first_redemption_hint(
        &self,
        c: &Components,
        hint: Option<Address>,
        price: u128,
    ) -> Result<bool> {
        let Some(first) = hint else { return Ok(false) };
        if !c.sorted_troves.contains(first)
            || self.get_current_icr(first, price)? < self.params.min_collateral_ratio
        {
            return Ok(false);
        }
        match c.sorted_troves.get_next(first) {
            None => Ok(true),
            Some(next) => Ok(self.get_current_icr(next, price)? < self.params.min_collateral_ratio),
        }
    }

    fn redeem_from_trove(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
        max_debt: u128,
        hints: &RedemptionHints,
    ) -> Result<SingleRedemption> {
        let gas_compensation = self.params.gas_compensation;
        let trove = self
            .get_trove(borrower)
            .filter(|t| t.status.is_active())
            .ok_or_else(|| Error::TroveNotActive(borrower.to_hex()))?;
        let (coll, debt) = (trove.coll, trove.debt);

        let debt_lot = max_debt.min(safe_sub(debt, gas_compensation)?);
        let coll_lot = mul_div(debt_lot, DECIMAL_PRECISION, ctx.price)?;
        let new_debt = debt - debt_lot;
        let new_coll = safe_sub(coll, coll_lot)?;

        if new_debt == gas_compensation {
            self.remove_stake(borrower)?;
            self.close_trove_record(c, borrower, TroveStatus::ClosedByRedemption)?;
            self.redeem_close_trove(c, borrower, new_coll)?;
            c.events.push(ProtocolEvent::TroveUpdated(TroveUpdatedEvent {
                borrower,
                coll: 0,
                debt: 0,
                stake: 0,
                operation: TroveOperation::Redeem,
                timestamp: ctx.timestamp,
            }));
        } else {
            let new_nicr = compute_nominal_cr(new_coll, new_debt);
            let nicr_mismatch = hints.partial_nicr.is_some_and(|hint| hint != new_nicr);
            if nicr_mismatch || new_debt - gas_compensation < self.params.min_net_debt {
                tracing::debug!(trove = %borrower.short(), new_debt, "partial redemption cancelled");
                return Ok(SingleRedemption {
                    cancelled_partial: true,
                    ..Default::default()
                });
            }

            if let Some(trove) = self.troves.get_mut(&borrower) {
                trove.coll = new_coll;
                trove.debt = new_debt;
            }
            let stake = self.update_stake_and_total_stakes(borrower)?;
            c.sorted_troves.reinsert(
                self.address,
                &*self,
                borrower,
                new_nicr,
                hints.partial.prev,
                hints.partial.next,
            )?;
            c.events.push(ProtocolEvent::TroveUpdated(TroveUpdatedEvent {
                borrower,
                coll: new_coll,
                debt: new_debt,
                stake,
                operation: TroveOperation::Redeem,
                timestamp: ctx.timestamp,
            }));
        }

        Ok(SingleRedemption {
            debt_lot,
            coll_lot,
            cancelled_partial: false,
        })
    }

    /// Burn the gas reserve of a fully redeemed trove and park its collateral
    fn redeem_close_trove(&mut self, c: &mut Components, borrower: Address, coll: u128) -> Result<()> {
        let gas_compensation = self.params.gas_compensation;
        let gas_pool = self.gas_pool()?;
        c.token.burn(self.address, gas_pool, gas_compensation)?;
        c.active_pool.decrease_debt(self.address, gas_compensation)?;

        c.coll_surplus_pool.account_surplus(self.address, borrower, coll)?;
        c.active_pool
            .send_collateral(self.address, &mut c.coll_surplus_pool, coll)?;
        Ok(())
    }
}
