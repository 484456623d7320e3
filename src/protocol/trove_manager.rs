//! Trove Manager.
//!
//! Owns every trove record, the redistribution scalars and the base rate.
//!
//! Redistributed debt and collateral are never pushed to troves eagerly.
//! `L_coll` / `L_debt` accumulate the reward per unit of stake, and each trove
//! keeps the values it last saw. A trove's current position is
//!
//! ```text
//! coll = stored_coll + stake * (L_coll - snapshot.coll) / 1e18
//! debt = stored_debt + stake * (L_debt - snapshot.debt) / 1e18
//! ```
//!
//! and the pending part is moved from the Default Pool into the Active Pool
//! whenever the trove is touched.
//!
//! Liquidation lives in [`crate::liquidation::engine`] and redemption in
//! [`crate::protocol::redemption`]; both extend this type.

use serde::{Deserialize, Serialize};

use crate::core::access::{AccessList, Role};
use crate::core::config::ProtocolParams;
use crate::core::sorted_troves::NicrSource;
use crate::core::trove::{RewardSnapshot, Trove, TroveStatus};
use crate::error::{Error, Result};
use crate::liquidation::recovery::{RecoveryMode, RecoveryModeStatus};
use crate::protocol::events::{
    BaseRateEvent, ProtocolEvent, RedistributionEvent, SystemSnapshotsEvent, TroveOperation,
    TroveUpdatedEvent,
};
use crate::protocol::system::{Components, ExecutionContext};
use crate::utils::constants::{
    BETA, DECIMAL_PRECISION, MINUTE_DECAY_FACTOR, SECONDS_IN_ONE_MINUTE,
};
use crate::utils::crypto::Address;
use crate::utils::journal::{JournaledMap, JournaledVec, Saved, Transactional};
use crate::utils::math::{
    compute_cr, compute_nominal_cr, dec_pow, div_with_error, mul_div, safe_add, safe_sub,
};

/// A trove's position including pending redistribution rewards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntireDebtAndColl {
    /// Stored plus pending debt
    pub debt: u128,
    /// Stored plus pending collateral
    pub coll: u128,
    /// Pending debt reward
    pub pending_debt: u128,
    /// Pending collateral reward
    pub pending_coll: u128,
}

/// Trove records, stakes, redistribution scalars and base rate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TroveManager {
    pub(crate) address: Address,
    pub(crate) params: ProtocolParams,

    pub(crate) troves: JournaledMap<Address, Trove>,
    /// Owners of active troves; `Trove::array_index` points into it
    pub(crate) trove_owners: JournaledVec<Address>,

    pub(crate) total_stakes: u128,
    /// `total_stakes` right after the last liquidation
    pub(crate) total_stakes_snapshot: u128,
    /// System collateral right after the last liquidation
    pub(crate) total_collateral_snapshot: u128,

    pub(crate) l_coll: u128,
    pub(crate) l_debt: u128,
    pub(crate) last_coll_error_redistribution: u128,
    pub(crate) last_debt_error_redistribution: u128,

    pub(crate) base_rate: u128,
    pub(crate) last_fee_operation_time: u64,

    pub(crate) fee_recipient: Address,
    pub(crate) access: AccessList,
    #[serde(skip)]
    saved: Saved<Scalars>,
}

#[derive(Debug, Clone, Copy)]
struct Scalars {
    total_stakes: u128,
    total_stakes_snapshot: u128,
    total_collateral_snapshot: u128,
    l_coll: u128,
    l_debt: u128,
    last_coll_error_redistribution: u128,
    last_debt_error_redistribution: u128,
    base_rate: u128,
    last_fee_operation_time: u64,
}

impl TroveManager {
    /// Create an empty manager at `address`
    pub fn new(address: Address, params: ProtocolParams) -> Self {
        Self {
            address,
            params,
            troves: JournaledMap::new(),
            trove_owners: JournaledVec::new(),
            total_stakes: 0,
            total_stakes_snapshot: 0,
            total_collateral_snapshot: 0,
            l_coll: 0,
            l_debt: 0,
            last_coll_error_redistribution: 0,
            last_debt_error_redistribution: 0,
            base_rate: 0,
            last_fee_operation_time: 0,
            fee_recipient: Address::ZERO,
            access: AccessList::new("trove_manager"),
            saved: Saved::default(),
        }
    }

    /// Wire trusted callers and payees; only once
    pub fn set_addresses(
        &mut self,
        borrower_operations: Address,
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
            (Role::BorrowerOperations, borrower_operations),
            (Role::GasPool, gas_pool),
        ])?;
        self.fee_recipient = fee_recipient;
        Ok(())
    }

    /// Address of the manager
    pub fn address(&self) -> Address {
        self.address
    }

    /// Parameters in force
    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    pub(crate) fn gas_pool(&self) -> Result<Address> {
        self.access
            .address_of(Role::GasPool)
            .ok_or_else(|| Error::InvariantViolation("gas pool address not set".into()))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TROVE QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Stored record of `borrower`
    pub fn get_trove(&self, borrower: Address) -> Option<&Trove> {
        self.troves.get(&borrower)
    }

    /// Lifecycle state of `borrower`'s trove
    pub fn get_trove_status(&self, borrower: Address) -> TroveStatus {
        self.troves
            .get(&borrower)
            .map(|t| t.status)
            .unwrap_or_default()
    }

    /// Stake of `borrower`'s trove
    pub fn get_trove_stake(&self, borrower: Address) -> u128 {
        self.troves.get(&borrower).map(|t| t.stake).unwrap_or(0)
    }

    /// Number of active troves
    pub fn get_trove_owners_count(&self) -> usize {
        self.trove_owners.len()
    }

    /// Owner at `index` of the owners array
    pub fn get_trove_from_owners_array(&self, index: usize) -> Option<Address> {
        self.trove_owners.get(index).copied()
    }

    /// Owners of all active troves
    pub fn trove_owners(&self) -> &[Address] {
        self.trove_owners.as_slice()
    }

    /// Sum of all stakes
    pub fn total_stakes(&self) -> u128 {
        self.total_stakes
    }

    /// `(total_stakes_snapshot, total_collateral_snapshot)`
    pub fn system_snapshots(&self) -> (u128, u128) {
        (self.total_stakes_snapshot, self.total_collateral_snapshot)
    }

    /// Collateral reward per unit staked
    pub fn l_coll(&self) -> u128 {
        self.l_coll
    }

    /// Debt reward per unit staked
    pub fn l_debt(&self) -> u128 {
        self.l_debt
    }

    fn active_trove(&self, borrower: Address) -> Result<&Trove> {
        self.troves
            .get(&borrower)
            .filter(|t| t.status.is_active())
            .ok_or_else(|| Error::TroveNotActive(borrower.to_hex()))
    }

    fn active_trove_mut(&mut self, borrower: Address) -> Result<&mut Trove> {
        self.troves
            .get_mut(&borrower)
            .filter(|t| t.status.is_active())
            .ok_or_else(|| Error::TroveNotActive(borrower.to_hex()))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PENDING REWARDS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Collateral redistributed to `borrower` since the last touch
    pub fn get_pending_coll_reward(&self, borrower: Address) -> Result<u128> {
        match self.troves.get(&borrower) {
            Some(trove) if trove.status.is_active() => {
                let per_unit = safe_sub(self.l_coll, trove.snapshot.coll)?;
                if per_unit == 0 {
                    return Ok(0);
                }
                mul_div(trove.stake, per_unit, DECIMAL_PRECISION)
            }
            _ => Ok(0),
        }
    }

    /// Debt redistributed to `borrower` since the last touch
    pub fn get_pending_debt_reward(&self, borrower: Address) -> Result<u128> {
        match self.troves.get(&borrower) {
            Some(trove) if trove.status.is_active() => {
                let per_unit = safe_sub(self.l_debt, trove.snapshot.debt)?;
                if per_unit == 0 {
                    return Ok(0);
                }
                mul_div(trove.stake, per_unit, DECIMAL_PRECISION)
            }
            _ => Ok(0),
        }
    }

    /// Whether `borrower` has rewards not yet applied
    pub fn has_pending_rewards(&self, borrower: Address) -> bool {
        self.troves
            .get(&borrower)
            .filter(|t| t.status.is_active())
            .is_some_and(|t| t.snapshot.coll < self.l_coll || t.snapshot.debt < self.l_debt)
    }

    /// Position of `borrower` including pending rewards
    pub fn get_entire_debt_and_coll(&self, borrower: Address) -> Result<EntireDebtAndColl> {
        let trove = self.active_trove(borrower)?;
        let pending_debt = self.get_pending_debt_reward(borrower)?;
        let pending_coll = self.get_pending_coll_reward(borrower)?;
        Ok(EntireDebtAndColl {
            debt: safe_add(trove.debt, pending_debt)?,
            coll: safe_add(trove.coll, pending_coll)?,
            pending_debt,
            pending_coll,
        })
    }

    /// Nominal ratio including pending rewards
    pub fn get_nominal_icr(&self, borrower: Address) -> Result<u128> {
        let entire = self.get_entire_debt_and_coll(borrower)?;
        Ok(compute_nominal_cr(entire.coll, entire.debt))
    }

    /// Collateral ratio at `price` including pending rewards
    pub fn get_current_icr(&self, borrower: Address, price: u128) -> Result<u128> {
        let entire = self.get_entire_debt_and_coll(borrower)?;
        Ok(compute_cr(entire.coll, entire.debt, price))
    }

    /// Move `borrower`'s pending rewards into the trove. Borrower Operations only.
    pub fn apply_pending_rewards(
        &mut self,
        caller: Address,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
    ) -> Result<()> {
        self.access
            .require(caller, &[Role::BorrowerOperations], "apply_pending_rewards")?;
        self.move_pending_rewards_to_active(c, ctx, borrower)
    }

    pub(crate) fn move_pending_rewards_to_active(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        borrower: Address,
    ) -> Result<()> {
        if !self.has_pending_rewards(borrower) {
            return Ok(());
        }

        let pending_coll = self.get_pending_coll_reward(borrower)?;
        let pending_debt = self.get_pending_debt_reward(borrower)?;
        let (l_coll, l_debt) = (self.l_coll, self.l_debt);

        // Trove record first, then the pools
        let trove = self.active_trove_mut(borrower)?;
        trove.coll = safe_add(trove.coll, pending_coll)?;
        trove.debt = safe_add(trove.debt, pending_debt)?;
        trove.snapshot = RewardSnapshot {
            coll: l_coll,
            debt: l_debt,
        };
        let (coll, debt, stake) = (trove.coll, trove.debt, trove.stake);

        c.default_pool.decrease_debt(self.address, pending_debt)?;
        c.active_pool.increase_debt(self.address, pending_debt)?;
        c.default_pool
            .send_collateral_to_active_pool(self.address, &mut c.active_pool, pending_coll)?;

        tracing::debug!(
            trove = %borrower.short(),
            pending_coll,
            pending_debt,
            "applied pending rewards"
        );
        c.events.push(ProtocolEvent::TroveUpdated(TroveUpdatedEvent {
            borrower,
            coll,
            debt,
            stake,
            operation: TroveOperation::ApplyPendingRewards,
            timestamp: ctx.timestamp,
        }));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // RECORD MAINTENANCE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Create a fresh active record for `borrower`. Borrower Operations only.
    ///
    /// Returns the new stake.
    pub fn open_trove_record(
        &mut self,
        caller: Address,
        borrower: Address,
        coll: u128,
        debt: u128,
    ) -> Result<u128> {
        self.access
            .require(caller, &[Role::BorrowerOperations], "open_trove_record")?;
        if self.get_trove_status(borrower).is_active() {
            return Err(Error::TroveAlreadyActive(borrower.to_hex()));
        }

        // Reopening replaces the closed record entirely
        self.troves.insert(
            borrower,
            Trove {
                status: TroveStatus::Active,
                coll,
                debt,
                stake: 0,
                snapshot: RewardSnapshot {
                    coll: self.l_coll,
                    debt: self.l_debt,
                },
                array_index: 0,
            },
        );
        let stake = self.update_stake_and_total_stakes(borrower)?;
        self.add_trove_owner_to_array(borrower)?;
        Ok(stake)
    }

    /// Overwrite the stored amounts of an active trove and refresh its stake.
    /// Borrower Operations only.
    ///
    /// Pending rewards must have been applied first.
    pub fn update_trove_record(
        &mut self,
        caller: Address,
        borrower: Address,
        coll: u128,
        debt: u128,
    ) -> Result<u128> {
        self.access
            .require(caller, &[Role::BorrowerOperations], "update_trove_record")?;
        if self.has_pending_rewards(borrower) {
            return Err(Error::InvariantViolation(format!(
                "pending rewards not applied for {}",
                borrower
            )));
        }
        let trove = self.active_trove_mut(borrower)?;
        trove.coll = coll;
        trove.debt = debt;
        self.update_stake_and_total_stakes(borrower)
    }

    /// Close `borrower`'s trove on the owner's request. Borrower Operations only.
    pub fn close_trove(&mut self, caller: Address, c: &mut Components, borrower: Address) -> Result<()> {
        self.access
            .require(caller, &[Role::BorrowerOperations], "close_trove")?;
        self.remove_stake(borrower)?;
        self.close_trove_record(c, borrower, TroveStatus::ClosedByOwner)
    }

    /// Stake a trove with `coll` would get now
    pub fn compute_new_stake(&self, coll: u128) -> Result<u128> {
        if self.total_collateral_snapshot == 0 {
            return Ok(coll);
        }
        if self.total_stakes_snapshot == 0 {
            return Err(Error::InvariantViolation(
                "stakes snapshot is zero while collateral snapshot is not".into(),
            ));
        }
        mul_div(coll, self.total_stakes_snapshot, self.total_collateral_snapshot)
    }

    pub(crate) fn update_stake_and_total_stakes(&mut self, borrower: Address) -> Result<u128> {
        let coll = self.active_trove(borrower)?.coll;
        let new_stake = self.compute_new_stake(coll)?;
        let trove = self.active_trove_mut(borrower)?;
        let old_stake = trove.stake;
        trove.stake = new_stake;

        self.total_stakes = safe_add(safe_sub(self.total_stakes, old_stake)?, new_stake)?;
        tracing::debug!(trove = %borrower.short(), new_stake, total_stakes = self.total_stakes, "stake updated");
        Ok(new_stake)
    }

    pub(crate) fn remove_stake(&mut self, borrower: Address) -> Result<()> {
        let trove = self.active_trove_mut(borrower)?;
        let stake = trove.stake;
        trove.stake = 0;
        self.total_stakes = safe_sub(self.total_stakes, stake)?;
        Ok(())
    }

    fn add_trove_owner_to_array(&mut self, borrower: Address) -> Result<usize> {
        let index = self.trove_owners.len();
        self.trove_owners.push(borrower);
        self.active_trove_mut(borrower)?.array_index = index;
        Ok(index)
    }

    /// Swap-remove `borrower` from the owners array
    fn remove_trove_owner(&mut self, borrower: Address) -> Result<()> {
        let index = self
            .troves
            .get(&borrower)
            .map(|t| t.array_index)
            .ok_or_else(|| Error::TroveNotActive(borrower.to_hex()))?;
        if self.trove_owners.get(index) != Some(&borrower) {
            return Err(Error::InvariantViolation(format!(
                "owners array out of sync for {}",
                borrower
            )));
        }

        self.trove_owners.swap_remove(index);
        if let Some(moved) = self.trove_owners.get(index).copied() {
            if let Some(trove) = self.troves.get_mut(&moved) {
                trove.array_index = index;
            }
        }
        Ok(())
    }

    /// Mark a trove closed and drop it from the owners array and the list
    pub(crate) fn close_trove_record(
        &mut self,
        c: &mut Components,
        borrower: Address,
        status: TroveStatus,
    ) -> Result<()> {
        if !status.is_closed() {
            return Err(Error::InvariantViolation(format!(
                "cannot close a trove with status {}",
                status
            )));
        }
        if self.trove_owners.len() <= 1 {
            return Err(Error::OnlyOneTroveLeft);
        }
        self.active_trove(borrower)?;

        self.remove_trove_owner(borrower)?;
        if let Some(trove) = self.troves.get_mut(&borrower) {
            trove.status = status;
            trove.coll = 0;
            trove.debt = 0;
            trove.stake = 0;
            trove.snapshot = RewardSnapshot::default();
        }
        c.sorted_troves.remove(self.address, borrower)?;

        tracing::info!(trove = %borrower.short(), %status, "trove closed");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REDISTRIBUTION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Spread `debt` and `coll` over all stakes and park them in the Default Pool
    pub(crate) fn redistribute_debt_and_coll(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        debt: u128,
        coll: u128,
    ) -> Result<()> {
        if debt == 0 {
            return Ok(());
        }
        if self.total_stakes == 0 {
            return Err(Error::InvariantViolation(
                "redistribution with no remaining stakes".into(),
            ));
        }

        let (coll_per_unit, coll_error) =
            div_with_error(coll, self.last_coll_error_redistribution, self.total_stakes)?;
        let (debt_per_unit, debt_error) =
            div_with_error(debt, self.last_debt_error_redistribution, self.total_stakes)?;
        self.last_coll_error_redistribution = coll_error;
        self.last_debt_error_redistribution = debt_error;

        self.l_coll = safe_add(self.l_coll, coll_per_unit)?;
        self.l_debt = safe_add(self.l_debt, debt_per_unit)?;

        c.active_pool.decrease_debt(self.address, debt)?;
        c.default_pool.increase_debt(self.address, debt)?;
        c.active_pool
            .send_collateral(self.address, &mut c.default_pool, coll)?;

        tracing::debug!(debt, coll, l_coll = self.l_coll, l_debt = self.l_debt, "redistributed");
        c.events.push(ProtocolEvent::Redistribution(RedistributionEvent {
            l_coll: self.l_coll,
            l_debt: self.l_debt,
            timestamp: ctx.timestamp,
        }));
        Ok(())
    }

    /// Refresh the stake snapshots after a liquidation.
    ///
    /// `coll_remainder` is collateral still in the Active Pool that is about to
    /// leave it (gas compensation).
    pub(crate) fn update_system_snapshots_exclude_coll_remainder(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        coll_remainder: u128,
    ) -> Result<()> {
        self.total_stakes_snapshot = self.total_stakes;
        let active_coll = safe_sub(c.active_pool.get_coll(), coll_remainder)?;
        self.total_collateral_snapshot = safe_add(active_coll, c.default_pool.get_coll())?;

        c.events
            .push(ProtocolEvent::SystemSnapshotsUpdated(SystemSnapshotsEvent {
                total_stakes_snapshot: self.total_stakes_snapshot,
                total_collateral_snapshot: self.total_collateral_snapshot,
                timestamp: ctx.timestamp,
            }));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SYSTEM TOTALS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Active plus default pool collateral
    pub fn get_entire_system_coll(&self, c: &Components) -> Result<u128> {
        safe_add(c.active_pool.get_coll(), c.default_pool.get_coll())
    }

    /// Active plus default pool debt
    pub fn get_entire_system_debt(&self, c: &Components) -> Result<u128> {
        safe_add(c.active_pool.get_debt(), c.default_pool.get_debt())
    }

    /// Total collateral ratio at `price`
    pub fn get_tcr(&self, c: &Components, price: u128) -> Result<u128> {
        Ok(RecoveryMode::calculate_tcr(
            self.get_entire_system_coll(c)?,
            self.get_entire_system_debt(c)?,
            price,
        ))
    }

    /// Whether TCR is below CCR at `price`
    pub fn check_recovery_mode(&self, c: &Components, price: u128) -> Result<bool> {
        Ok(RecoveryMode::is_recovery_mode(
            self.get_tcr(c, price)?,
            self.params.critical_collateral_ratio,
        ))
    }

    /// Full recovery mode status at `price`
    pub fn recovery_status(&self, c: &Components, price: u128) -> Result<RecoveryModeStatus> {
        Ok(RecoveryModeStatus::evaluate(
            self.get_entire_system_coll(c)?,
            self.get_entire_system_debt(c)?,
            price,
            self.params.critical_collateral_ratio,
        ))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BASE RATE AND FEES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current base rate, without decay
    pub fn base_rate(&self) -> u128 {
        self.base_rate
    }

    /// Time of the last fee-bearing operation
    pub fn last_fee_operation_time(&self) -> u64 {
        self.last_fee_operation_time
    }

    /// Base rate decayed to `now`
    pub fn calc_decayed_base_rate(&self, now: u64) -> Result<u128> {
        let minutes = now.saturating_sub(self.last_fee_operation_time) / SECONDS_IN_ONE_MINUTE;
        let decay_factor = dec_pow(MINUTE_DECAY_FACTOR, minutes)?;
        mul_div(self.base_rate, decay_factor, DECIMAL_PRECISION)
    }

    fn borrowing_rate_for(&self, base_rate: u128) -> u128 {
        self.params
            .borrowing_fee_floor
            .saturating_add(base_rate)
            .min(self.params.max_borrowing_fee)
    }

    fn redemption_rate_for(&self, base_rate: u128) -> u128 {
        self.params
            .redemption_fee_floor
            .saturating_add(base_rate)
            .min(DECIMAL_PRECISION)
    }

    /// Borrowing rate at the stored base rate
    pub fn get_borrowing_rate(&self) -> u128 {
        self.borrowing_rate_for(self.base_rate)
    }

    /// Borrowing rate with the base rate decayed to `now`
    pub fn get_borrowing_rate_with_decay(&self, now: u64) -> Result<u128> {
        Ok(self.borrowing_rate_for(self.calc_decayed_base_rate(now)?))
    }

    /// Fee on borrowing `debt`
    pub fn get_borrowing_fee(&self, debt: u128) -> Result<u128> {
        mul_div(self.get_borrowing_rate(), debt, DECIMAL_PRECISION)
    }

    /// Fee on borrowing `debt` after decay to `now`
    pub fn get_borrowing_fee_with_decay(&self, debt: u128, now: u64) -> Result<u128> {
        mul_div(self.get_borrowing_rate_with_decay(now)?, debt, DECIMAL_PRECISION)
    }

    /// Redemption rate at the stored base rate
    pub fn get_redemption_rate(&self) -> u128 {
        self.redemption_rate_for(self.base_rate)
    }

    /// Redemption rate with the base rate decayed to `now`
    pub fn get_redemption_rate_with_decay(&self, now: u64) -> Result<u128> {
        Ok(self.redemption_rate_for(self.calc_decayed_base_rate(now)?))
    }

    /// Collateral fee on drawing `coll_drawn`
    pub fn get_redemption_fee(&self, coll_drawn: u128) -> Result<u128> {
        let fee = mul_div(self.get_redemption_rate(), coll_drawn, DECIMAL_PRECISION)?;
        if fee >= coll_drawn {
            return Err(Error::InvalidParameter {
                name: "redemption".into(),
                reason: "fee would eat up all returned collateral".into(),
            });
        }
        Ok(fee)
    }

    /// Decay the base rate before charging a borrowing fee. Borrower Operations only.
    pub fn decay_base_rate_from_borrowing(
        &mut self,
        caller: Address,
        c: &mut Components,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        self.access
            .require(caller, &[Role::BorrowerOperations], "decay_base_rate_from_borrowing")?;
        let decayed = self.calc_decayed_base_rate(ctx.timestamp)?;
        if decayed > DECIMAL_PRECISION {
            return Err(Error::InvariantViolation("base rate above 100%".into()));
        }
        self.set_base_rate(c, ctx, decayed);
        Ok(())
    }

    /// Grow the base rate by the redeemed fraction of the supply
    pub(crate) fn update_base_rate_from_redemption(
        &mut self,
        c: &mut Components,
        ctx: &ExecutionContext,
        coll_drawn: u128,
        total_supply: u128,
    ) -> Result<u128> {
        let decayed = self.calc_decayed_base_rate(ctx.timestamp)?;
        let redeemed_value = mul_div(coll_drawn, ctx.price, DECIMAL_PRECISION)?;
        let redeemed_fraction = mul_div(redeemed_value, DECIMAL_PRECISION, total_supply)?;
        let new_base_rate = safe_add(decayed, redeemed_fraction / BETA)?.min(DECIMAL_PRECISION);
        if new_base_rate == 0 {
            return Err(Error::InvariantViolation("base rate is zero after redemption".into()));
        }
        self.set_base_rate(c, ctx, new_base_rate);
        Ok(new_base_rate)
    }

    fn set_base_rate(&mut self, c: &mut Components, ctx: &ExecutionContext, base_rate: u128) {
        self.base_rate = base_rate;
        c.events.push(ProtocolEvent::BaseRateUpdated(BaseRateEvent {
            base_rate,
            timestamp: ctx.timestamp,
        }));
        self.update_last_fee_op_time(ctx.timestamp);
    }

    /// Advance the fee clock only in whole minutes so decay is not lost
    fn update_last_fee_op_time(&mut self, now: u64) {
        if now.saturating_sub(self.last_fee_operation_time) >= SECONDS_IN_ONE_MINUTE {
            self.last_fee_operation_time = now;
        }
    }
}

impl Transactional for TroveManager {
    fn begin(&mut self) {
        self.saved.save(Scalars {
            total_stakes: self.total_stakes,
            total_stakes_snapshot: self.total_stakes_snapshot,
            total_collateral_snapshot: self.total_collateral_snapshot,
            l_coll: self.l_coll,
            l_debt: self.l_debt,
            last_coll_error_redistribution: self.last_coll_error_redistribution,
            last_debt_error_redistribution: self.last_debt_error_redistribution,
            base_rate: self.base_rate,
            last_fee_operation_time: self.last_fee_operation_time,
        });
        self.troves.begin();
        self.trove_owners.begin();
    }

    fn commit(&mut self) {
        self.saved.clear();
        self.troves.commit();
        self.trove_owners.commit();
    }

    fn rollback(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.total_stakes = saved.total_stakes;
            self.total_stakes_snapshot = saved.total_stakes_snapshot;
            self.total_collateral_snapshot = saved.total_collateral_snapshot;
            self.l_coll = saved.l_coll;
            self.l_debt = saved.l_debt;
            self.last_coll_error_redistribution = saved.last_coll_error_redistribution;
            self.last_debt_error_redistribution = saved.last_debt_error_redistribution;
            self.base_rate = saved.base_rate;
            self.last_fee_operation_time = saved.last_fee_operation_time;
        }
        self.troves.rollback();
        self.trove_owners.rollback();
    }
}

impl NicrSource for TroveManager {
    fn get_nominal_icr(&self, id: Address) -> u128 {
        TroveManager::get_nominal_icr(self, id).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::system::SystemAddresses;

    const E18: u128 = DECIMAL_PRECISION;

    fn manager() -> (TroveManager, SystemAddresses) {
        let addresses = SystemAddresses::derive();
        let mut tm = TroveManager::new(addresses.trove_manager, ProtocolParams::default());
        tm.set_addresses(addresses.borrower_operations, addresses.gas_pool, addresses.fee_recipient)
            .unwrap();
        (tm, addresses)
    }

    #[test]
    fn test_open_record_sets_stake_and_owner() {
        let (mut tm, a) = manager();
        let alice = Address::derive("alice");
        let stake = tm
            .open_trove_record(a.borrower_operations, alice, 10 * E18, 2_000 * E18)
            .unwrap();

        assert_eq!(stake, 10 * E18);
        assert_eq!(tm.total_stakes(), 10 * E18);
        assert_eq!(tm.get_trove_owners_count(), 1);
        assert_eq!(tm.get_trove_from_owners_array(0), Some(alice));
        assert_eq!(tm.get_trove_status(alice), TroveStatus::Active);
        assert_eq!(
            tm.open_trove_record(a.borrower_operations, alice, E18, E18),
            Err(Error::TroveAlreadyActive(alice.to_hex()))
        );
    }

    #[test]
    fn test_record_mutators_are_gated() {
        let (mut tm, _) = manager();
        let alice = Address::derive("alice");
        let err = tm.open_trove_record(alice, alice, E18, E18).unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[test]
    fn test_stake_uses_snapshots() {
        let (mut tm, a) = manager();
        tm.total_stakes_snapshot = 10 * E18;
        tm.total_collateral_snapshot = 20 * E18;
        assert_eq!(tm.compute_new_stake(4 * E18).unwrap(), 2 * E18);

        let bob = Address::derive("bob");
        let stake = tm
            .open_trove_record(a.borrower_operations, bob, 4 * E18, 2_000 * E18)
            .unwrap();
        assert_eq!(stake, 2 * E18);
    }

    #[test]
    fn test_pending_rewards_follow_scalars() {
        let (mut tm, a) = manager();
        let alice = Address::derive("alice");
        tm.open_trove_record(a.borrower_operations, alice, 10 * E18, 2_000 * E18)
            .unwrap();
        assert!(!tm.has_pending_rewards(alice));

        // 0.1 coll and 50 debt per unit staked
        tm.l_coll += E18 / 10;
        tm.l_debt += 50 * E18;

        assert!(tm.has_pending_rewards(alice));
        assert_eq!(tm.get_pending_coll_reward(alice).unwrap(), E18);
        assert_eq!(tm.get_pending_debt_reward(alice).unwrap(), 500 * E18);
        let entire = tm.get_entire_debt_and_coll(alice).unwrap();
        assert_eq!(entire.coll, 11 * E18);
        assert_eq!(entire.debt, 2_500 * E18);
        assert_eq!(
            TroveManager::get_nominal_icr(&tm, alice).unwrap(),
            compute_nominal_cr(11 * E18, 2_500 * E18)
        );
    }

    #[test]
    fn test_owner_array_swap_remove() {
        let (mut tm, a) = manager();
        let owners: Vec<Address> = (0..3).map(|i| Address::derive(&format!("owner-{}", i))).collect();
        for owner in &owners {
            tm.open_trove_record(a.borrower_operations, *owner, E18, E18).unwrap();
        }

        tm.remove_trove_owner(owners[0]).unwrap();
        assert_eq!(tm.trove_owners(), &[owners[2], owners[1]]);
        assert_eq!(tm.get_trove(owners[2]).unwrap().array_index, 0);
        assert_eq!(tm.get_trove(owners[1]).unwrap().array_index, 1);
    }

    #[test]
    fn test_base_rate_decay() {
        let (mut tm, _) = manager();
        tm.base_rate = E18 / 10;
        tm.last_fee_operation_time = 1_000;

        assert_eq!(tm.calc_decayed_base_rate(1_000).unwrap(), E18 / 10);
        // Half-life of 12 hours
        let half = tm.calc_decayed_base_rate(1_000 + 12 * 3_600).unwrap();
        let diff = half.abs_diff(E18 / 20);
        assert!(diff < E18 / 10_000, "decayed to {}", half);
        // Partial minutes do not count
        assert_eq!(tm.calc_decayed_base_rate(1_059).unwrap(), E18 / 10);
    }

    #[test]
    fn test_fee_rates_are_capped() {
        let (mut tm, _) = manager();
        assert_eq!(tm.get_borrowing_rate(), tm.params.borrowing_fee_floor);
        assert_eq!(tm.get_borrowing_fee(1_000 * E18).unwrap(), 5 * E18);

        tm.base_rate = E18;
        assert_eq!(tm.get_borrowing_rate(), tm.params.max_borrowing_fee);
        assert_eq!(tm.get_redemption_rate(), E18);
        assert!(tm.get_redemption_fee(E18).is_err());
    }

    #[test]
    fn test_fee_clock_moves_in_minutes() {
        let (mut tm, _) = manager();
        tm.last_fee_operation_time = 100;
        tm.update_last_fee_op_time(130);
        assert_eq!(tm.last_fee_operation_time(), 100);
        tm.update_last_fee_op_time(160);
        assert_eq!(tm.last_fee_operation_time(), 160);
    }

    #[test]
    fn test_rollback_restores_records_and_scalars() {
        let (mut tm, a) = manager();
        let owners: Vec<Address> = (0..3).map(|i| Address::derive(&format!("owner-{}", i))).collect();
        for owner in &owners {
            tm.open_trove_record(a.borrower_operations, *owner, E18, E18).unwrap();
        }

        tm.begin();
        tm.remove_trove_owner(owners[0]).unwrap();
        tm.open_trove_record(a.borrower_operations, Address::derive("late"), 2 * E18, E18)
            .unwrap();
        tm.l_coll += E18;
        tm.base_rate = E18 / 2;
        tm.rollback();

        assert_eq!(tm.trove_owners(), owners.as_slice());
        assert_eq!(tm.get_trove(owners[2]).unwrap().array_index, 2);
        assert!(tm.get_trove(Address::derive("late")).is_none());
        assert_eq!(tm.total_stakes(), 3 * E18);
        assert_eq!(tm.l_coll, 0);
        assert_eq!(tm.base_rate, 0);
    }
}
