//! Borrower Operations.
//!
//! Borrower-facing entry points: open, adjust and close a trove, and claim
//! collateral left over after a liquidation or redemption. Every trove change
//! is checked against the current mode (see [`RecoveryMode`]); borrowing fees
//! are charged only in normal mode.

use serde::{Deserialize, Serialize};

use crate::core::access::{AccessList, Role};
use crate::core::config::ProtocolParams;
use crate::core::pools::CollateralReceiver;
use crate::core::sorted_troves::PositionHint;
use crate::error::{Error, Result};
use crate::liquidation::recovery::{RecoveryMode, TroveChange};
use crate::protocol::events::{
    BorrowingFeePaidEvent, CollateralClaimedEvent, ProtocolEvent, TroveOperation,
    TroveUpdatedEvent,
};
use crate::protocol::system::{Components, ExecutionContext};
use crate::protocol::trove_manager::TroveManager;
use crate::utils::constants::DECIMAL_PRECISION;
use crate::utils::crypto::Address;
use crate::utils::math::{compute_cr, compute_nominal_cr, mul_div, safe_add, safe_sub};

/// A requested trove adjustment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    /// Collateral added from the borrower's account
    pub coll_deposit: u128,
    /// Collateral withdrawn to the borrower's account
    pub coll_withdrawal: u128,
    /// Debt drawn or repaid, fee excluded
    pub debt_change: u128,
    /// Whether `debt_change` is drawn
    pub is_debt_increase: bool,
    /// Highest borrowing fee percentage accepted
    pub max_fee: u128,
}

impl Adjustment {
    /// Add collateral
    pub fn add_coll(amount: u128) -> Self {
        Self {
            coll_deposit: amount,
            ..Default::default()
        }
    }

    /// Withdraw collateral
    pub fn withdraw_coll(amount: u128) -> Self {
        Self {
            coll_withdrawal: amount,
            ..Default::default()
        }
    }

    /// Draw more debt
    pub fn withdraw_debt(amount: u128, max_fee: u128) -> Self {
        Self {
            debt_change: amount,
            is_debt_increase: true,
            max_fee,
            ..Default::default()
        }
    }

    /// Repay debt
    pub fn repay_debt(amount: u128) -> Self {
        Self {
            debt_change: amount,
            ..Default::default()
        }
    }
}

/// Where added collateral comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollSource {
    /// The borrower's account
    Account,
    /// Already in the Active Pool, moved there by the Stability Pool
    StabilityPool,
}

/// Result of opening a trove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTroveOutcome {
    /// Total recorded debt: requested debt, fee and gas reserve
    pub composite_debt: u128,
    /// Borrowing fee charged
    pub fee: u128,
    /// Stake assigned
    pub stake: u128,
    /// Collateral ratio at open
    pub icr: u128,
}

/// Borrower-facing entry points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowerOperations {
    address: Address,
    params: ProtocolParams,
    gas_pool: Address,
    fee_recipient: Address,
    access: AccessList,
}

impl BorrowerOperations {
    /// Create at `address`
    pub fn new(address: Address, params: ProtocolParams) -> Self {
        Self {
            address,
            params,
            gas_pool: Address::ZERO,
            fee_recipient: Address::ZERO,
            access: AccessList::new("borrower_operations"),
        }
    }

    /// Wire trusted callers and payees; only once
    pub fn set_addresses(
        &mut self,
        stability_pool: Address,
        gas_pool: Address,
        fee_recipient: Address,
    ) -> Result<()> {
        if fee_recipient.is_zero() {
            return Err(Error::InvalidParameter {
                name: "fee_recipient".into(),
                reason: "zero address".into(),
            });
        }
        self.access.configure([
            (Role::StabilityPool, stability_pool),
            (Role::GasPool, gas_pool),
        ])?;
        self.gas_pool = gas_pool;
        self.fee_recipient = fee_recipient;
        Ok(())
    }

    /// Address of this component
    pub fn address(&self) -> Address {
        self.address
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPEN
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a trove for `borrower` with `coll` collateral drawing `debt_amount`
    #[allow(clippy::too_many_arguments)]
    pub fn open_trove(
        &self,
        tm: &mut TroveManager,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
        max_fee: u128,
        debt_amount: u128,
        hint: PositionHint,
        coll: u128,
    ) -> Result<OpenTroveOutcome> {
        let price = ctx.price;
        let is_recovery_mode = tm.check_recovery_mode(c, price)?;
        self.require_valid_max_fee(max_fee, is_recovery_mode)?;
        if tm.get_trove_status(borrower).is_active() {
            return Err(Error::TroveAlreadyActive(borrower.to_hex()));
        }

        let mut net_debt = debt_amount;
        let mut fee = 0;
        if !is_recovery_mode {
            fee = self.trigger_borrowing_fee(tm, c, ctx, borrower, debt_amount, max_fee)?;
            net_debt = safe_add(net_debt, fee)?;
        }
        self.require_at_least_min_net_debt(net_debt)?;

        let composite_debt = safe_add(net_debt, self.params.gas_compensation)?;
        let icr = compute_cr(coll, composite_debt, price);
        let nicr = compute_nominal_cr(coll, composite_debt);

        let change = TroveChange {
            coll_change: coll,
            is_coll_increase: true,
            debt_change: composite_debt,
            is_debt_increase: true,
        };
        let new_tcr = self.new_tcr(tm, c, &change, price)?;
        RecoveryMode::validate_open_trove(&self.params, is_recovery_mode, icr, new_tcr)
            .into_result()?;

        // Trove record, then pools and token, then the sorted list
        let stake = tm.open_trove_record(self.address, borrower, coll, composite_debt)?;

        self.pull_collateral(c, borrower, coll)?;
        c.active_pool.increase_debt(self.address, net_debt)?;
        c.token.mint(self.address, borrower, debt_amount)?;
        c.active_pool
            .increase_debt(self.address, self.params.gas_compensation)?;
        c.token
            .mint(self.address, self.gas_pool, self.params.gas_compensation)?;

        c.sorted_troves
            .insert(self.address, &*tm, borrower, nicr, hint.prev, hint.next)?;

        tracing::info!(
            trove = %borrower.short(),
            coll,
            debt = composite_debt,
            fee,
            icr,
            "trove opened"
        );
        c.events.push(ProtocolEvent::TroveUpdated(TroveUpdatedEvent {
            borrower,
            coll,
            debt: composite_debt,
            stake,
            operation: TroveOperation::Open,
            timestamp: ctx.timestamp,
        }));

        Ok(OpenTroveOutcome {
            composite_debt,
            fee,
            stake,
            icr,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ADJUST
    // ═══════════════════════════════════════════════════════════════════════════

    /// Change collateral and/or debt of `borrower`'s trove
    pub fn adjust_trove(
        &self,
        tm: &mut TroveManager,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
        adjustment: Adjustment,
        hint: PositionHint,
    ) -> Result<()> {
        self.adjust(tm, c, ctx, borrower, adjustment, hint, CollSource::Account)
    }

    /// Add collateral that the Stability Pool already moved into the Active
    /// Pool. Stability Pool only.
    #[allow(clippy::too_many_arguments)]
    pub fn move_coll_gain_to_trove(
        &self,
        caller: Address,
        tm: &mut TroveManager,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
        coll: u128,
        hint: PositionHint,
    ) -> Result<()> {
        self.access
            .require(caller, &[Role::StabilityPool], "move_coll_gain_to_trove")?;
        self.adjust(
            tm,
            c,
            ctx,
            borrower,
            Adjustment::add_coll(coll),
            hint,
            CollSource::StabilityPool,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn adjust(
        &self,
        tm: &mut TroveManager,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
        adjustment: Adjustment,
        hint: PositionHint,
        source: CollSource,
    ) -> Result<()> {
        let price = ctx.price;
        let is_recovery_mode = tm.check_recovery_mode(c, price)?;

        if adjustment.is_debt_increase {
            self.require_valid_max_fee(adjustment.max_fee, is_recovery_mode)?;
            if adjustment.debt_change == 0 {
                return Err(Error::ZeroAmount);
            }
        }
        if adjustment.coll_deposit > 0 && adjustment.coll_withdrawal > 0 {
            return Err(Error::InvalidParameter {
                name: "adjustment".into(),
                reason: "cannot withdraw and add collateral at the same time".into(),
            });
        }
        if adjustment.coll_deposit == 0 && adjustment.coll_withdrawal == 0 && adjustment.debt_change == 0 {
            return Err(Error::InvalidParameter {
                name: "adjustment".into(),
                reason: "there must be either a collateral change or a debt change".into(),
            });
        }
        if !tm.get_trove_status(borrower).is_active() {
            return Err(Error::TroveNotActive(borrower.to_hex()));
        }

        tm.apply_pending_rewards(self.address, c, ctx, borrower)?;

        let (coll_change, is_coll_increase) = if adjustment.coll_deposit > 0 {
            (adjustment.coll_deposit, true)
        } else {
            (adjustment.coll_withdrawal, false)
        };

        let mut net_debt_change = adjustment.debt_change;
        if adjustment.is_debt_increase && !is_recovery_mode {
            let fee = self.trigger_borrowing_fee(
                tm,
                c,
                ctx,
                borrower,
                adjustment.debt_change,
                adjustment.max_fee,
            )?;
            net_debt_change = safe_add(net_debt_change, fee)?;
        }

        let entire = tm.get_entire_debt_and_coll(borrower)?;
        let (coll, debt) = (entire.coll, entire.debt);
        if adjustment.coll_withdrawal > coll {
            return Err(Error::insufficient("trove collateral", adjustment.coll_withdrawal, coll));
        }

        let change = TroveChange {
            coll_change,
            is_coll_increase,
            debt_change: net_debt_change,
            is_debt_increase: adjustment.is_debt_increase,
        };
        let (new_coll, new_debt) = change.apply(coll, debt).map_err(|_| Error::InvalidParameter {
            name: "debt_change".into(),
            reason: "repayment exceeds trove debt".into(),
        })?;
        let old_icr = compute_cr(coll, debt, price);
        let new_icr = compute_cr(new_coll, new_debt, price);
        let new_tcr = self.new_tcr(tm, c, &change, price)?;
        RecoveryMode::validate_adjustment(
            &self.params,
            is_recovery_mode,
            &change,
            old_icr,
            new_icr,
            new_tcr,
        )
        .into_result()?;

        if !adjustment.is_debt_increase && adjustment.debt_change > 0 {
            let repayable = safe_sub(debt, self.params.gas_compensation)?;
            if adjustment.debt_change > repayable {
                return Err(Error::InvalidParameter {
                    name: "debt_change".into(),
                    reason: "amount repaid must not be larger than the trove's debt".into(),
                });
            }
            self.require_at_least_min_net_debt(repayable - adjustment.debt_change)?;
            let balance = c.token.balance_of(borrower);
            if balance < adjustment.debt_change {
                return Err(Error::insufficient(&borrower.to_hex(), adjustment.debt_change, balance));
            }
        }

        // Trove record, then pools and token, then the sorted list
        let stake = tm.update_trove_record(self.address, borrower, new_coll, new_debt)?;

        if adjustment.debt_change > 0 {
            if adjustment.is_debt_increase {
                c.active_pool.increase_debt(self.address, net_debt_change)?;
                c.token.mint(self.address, borrower, adjustment.debt_change)?;
            } else {
                c.active_pool.decrease_debt(self.address, adjustment.debt_change)?;
                c.token.burn(self.address, borrower, adjustment.debt_change)?;
            }
        }
        if coll_change > 0 {
            if is_coll_increase {
                if source == CollSource::Account {
                    self.pull_collateral(c, borrower, coll_change)?;
                }
            } else {
                c.active_pool.send_collateral(
                    self.address,
                    &mut c.accounts.wallet(borrower),
                    coll_change,
                )?;
            }
        }

        let new_nicr = compute_nominal_cr(new_coll, new_debt);
        c.sorted_troves
            .reinsert(self.address, &*tm, borrower, new_nicr, hint.prev, hint.next)?;

        tracing::info!(trove = %borrower.short(), coll = new_coll, debt = new_debt, "trove adjusted");
        c.events.push(ProtocolEvent::TroveUpdated(TroveUpdatedEvent {
            borrower,
            coll: new_coll,
            debt: new_debt,
            stake,
            operation: TroveOperation::Adjust,
            timestamp: ctx.timestamp,
        }));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CLOSE AND CLAIM
    // ═══════════════════════════════════════════════════════════════════════════

    /// Repay all debt and withdraw all collateral of `borrower`'s trove
    pub fn close_trove(
        &self,
        tm: &mut TroveManager,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
    ) -> Result<()> {
        let price = ctx.price;
        if !tm.get_trove_status(borrower).is_active() {
            return Err(Error::TroveNotActive(borrower.to_hex()));
        }
        let is_recovery_mode = tm.check_recovery_mode(c, price)?;

        tm.apply_pending_rewards(self.address, c, ctx, borrower)?;
        let entire = tm.get_entire_debt_and_coll(borrower)?;
        let (coll, debt) = (entire.coll, entire.debt);

        let repayment = safe_sub(debt, self.params.gas_compensation)?;
        let balance = c.token.balance_of(borrower);
        if balance < repayment {
            return Err(Error::insufficient(&borrower.to_hex(), repayment, balance));
        }

        let change = TroveChange {
            coll_change: coll,
            is_coll_increase: false,
            debt_change: debt,
            is_debt_increase: false,
        };
        let new_tcr = self.new_tcr(tm, c, &change, price)?;
        RecoveryMode::validate_close(&self.params, is_recovery_mode, new_tcr).into_result()?;

        tm.close_trove(self.address, c, borrower)?;

        c.active_pool.decrease_debt(self.address, repayment)?;
        c.token.burn(self.address, borrower, repayment)?;
        c.active_pool
            .decrease_debt(self.address, self.params.gas_compensation)?;
        c.token
            .burn(self.address, self.gas_pool, self.params.gas_compensation)?;
        c.active_pool
            .send_collateral(self.address, &mut c.accounts.wallet(borrower), coll)?;

        c.events.push(ProtocolEvent::TroveUpdated(TroveUpdatedEvent {
            borrower,
            coll: 0,
            debt: 0,
            stake: 0,
            operation: TroveOperation::Close,
            timestamp: ctx.timestamp,
        }));
        Ok(())
    }

    /// Pay out `borrower`'s surplus collateral
    pub fn claim_collateral(
        &self,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
    ) -> Result<u128> {
        let amount = c.coll_surplus_pool.claim_collateral(
            self.address,
            borrower,
            &mut c.accounts.wallet(borrower),
        )?;
        tracing::info!(account = %borrower.short(), amount, "surplus collateral claimed");
        c.events
            .push(ProtocolEvent::CollateralClaimed(CollateralClaimedEvent {
                account: borrower,
                amount,
                timestamp: ctx.timestamp,
            }));
        Ok(amount)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════════════════

    fn trigger_borrowing_fee(
        &self,
        tm: &mut TroveManager,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
        debt_amount: u128,
        max_fee: u128,
    ) -> Result<u128> {
        tm.decay_base_rate_from_borrowing(self.address, c, ctx)?;
        let fee = tm.get_borrowing_fee(debt_amount)?;
        if debt_amount > 0 {
            let fee_percentage = mul_div(fee, DECIMAL_PRECISION, debt_amount)?;
            if fee_percentage > max_fee {
                return Err(Error::FeeExceedsMaximum {
                    fee: fee_percentage,
                    max: max_fee,
                });
            }
        }
        if fee > 0 {
            c.token.mint(self.address, self.fee_recipient, fee)?;
            c.events.push(ProtocolEvent::BorrowingFeePaid(BorrowingFeePaidEvent {
                borrower,
                fee,
                timestamp: ctx.timestamp,
            }));
        }
        Ok(fee)
    }

    fn require_valid_max_fee(&self, max_fee: u128, is_recovery_mode: bool) -> Result<()> {
        let floor = if is_recovery_mode {
            0
        } else {
            self.params.borrowing_fee_floor
        };
        if max_fee < floor || max_fee > DECIMAL_PRECISION {
            return Err(Error::InvalidParameter {
                name: "max_fee".into(),
                reason: format!("max fee percentage must be between {} and 100%", floor),
            });
        }
        Ok(())
    }

    fn require_at_least_min_net_debt(&self, net_debt: u128) -> Result<()> {
        if net_debt < self.params.min_net_debt {
            return Err(Error::NetDebtBelowMinimum {
                amount: net_debt,
                minimum: self.params.min_net_debt,
            });
        }
        Ok(())
    }

    fn new_tcr(
        &self,
        tm: &TroveManager,
        c: &Components,
        change: &TroveChange,
        price: u128,
    ) -> Result<u128> {
        RecoveryMode::calculate_tcr_after_change(
            tm.get_entire_system_coll(c)?,
            tm.get_entire_system_debt(c)?,
            change,
            price,
        )
    }

    /// Move collateral from the borrower's account into the Active Pool
    fn pull_collateral(&self, c: &mut Components, borrower: Address, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        c.accounts.debit(borrower, amount)?;
        c.active_pool.receive_collateral(self.address, amount)
    }
}
