//! Stability Pool.
//!
//! Depositors lock debt tokens that cancel liquidated debt; in exchange they
//! receive the liquidated collateral and a share of the reward issuance.
//!
//! Every depositor's compounded deposit and gains are computed in O(1) from a
//! snapshot taken at their last interaction and the pool's running scalars:
//!
//! - `P`: running product; a deposit made when the product was `P_0` is now
//!   worth `initial * P / P_0`
//! - `S[epoch][scale]`: running sum of collateral gain per unit staked, scaled
//!   by `P`
//! - `G[epoch][scale]`: the same for reward issuance
//!
//! When an offset would push `P` under `SCALE_FACTOR` it is multiplied by
//! `SCALE_FACTOR` and the scale is incremented. When an offset empties the
//! pool the epoch is incremented and `P` resets to 1; deposits from an older
//! epoch compound to zero and their gains freeze at the epoch-end sums.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::core::access::{AccessList, Role};
use crate::core::pools::{Accounts, ActivePool, CollateralReceiver};
use crate::core::token::DebtToken;
use crate::error::{Error, Result};
use crate::utils::constants::{DECIMAL_PRECISION, SCALE_FACTOR};
use crate::utils::crypto::{Address, StateHash};
use crate::utils::journal::{JournaledMap, Saved, Transactional};
use crate::utils::math::{safe_add, to_u128};

// ═══════════════════════════════════════════════════════════════════════════════
// DEPOSITS AND FRONTENDS
// ═══════════════════════════════════════════════════════════════════════════════

/// A depositor's position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Deposit value at the last interaction
    pub initial_value: u128,
    /// Frontend that referred the deposit, fixed by the first deposit
    pub frontend_tag: Option<Address>,
}

/// Pool scalars captured at a depositor's or frontend's last interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshots {
    /// Collateral gain sum
    pub s: U256,
    /// Running product
    pub p: u128,
    /// Reward gain sum
    pub g: U256,
    /// Scale
    pub scale: u64,
    /// Epoch
    pub epoch: u64,
}

/// A registered frontend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontEnd {
    /// Share of rewards kept by referred depositors (1e18 = 100%)
    pub kickback_rate: u128,
    /// Registration flag
    pub registered: bool,
    /// Open deposits tagged with this frontend
    #[serde(default)]
    pub referred_deposits: u64,
}

/// Amounts settled by a depositor interaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositOutcome {
    /// Collateral gain paid out (or moved to the trove)
    pub coll_gain: u128,
    /// Deposit value lost to offsets since the last interaction
    pub debt_loss: u128,
    /// Reward paid to the depositor
    pub depositor_reward: u128,
    /// Reward paid to the depositor's frontend
    pub frontend_reward: u128,
    /// Deposit after the interaction
    pub new_deposit: u128,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// The Stability Pool for absorbing liquidations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityPool {
    address: Address,
    /// Collateral held
    coll: u128,
    /// Debt tokens deposited
    total_debt_deposits: u128,

    deposits: JournaledMap<Address, Deposit>,
    deposit_snapshots: JournaledMap<Address, Snapshots>,
    frontends: JournaledMap<Address, FrontEnd>,
    frontend_stakes: JournaledMap<Address, u128>,
    frontend_snapshots: JournaledMap<Address, Snapshots>,

    p: u128,
    current_scale: u64,
    current_epoch: u64,
    epoch_to_scale_to_sum: JournaledMap<(u64, u64), U256>,
    epoch_to_scale_to_g: JournaledMap<(u64, u64), U256>,

    last_reward_error: u128,
    last_coll_error_offset: u128,
    last_debt_loss_error_offset: u128,
    last_cumulative_issuance: u128,

    /// Rewards paid out per account
    reward_balances: JournaledMap<Address, u128>,

    access: AccessList,
    #[serde(skip)]
    saved: Saved<Scalars>,
}

/// Scalar fields restored on rollback
#[derive(Debug, Clone, Copy)]
struct Scalars {
    coll: u128,
    total_debt_deposits: u128,
    p: u128,
    current_scale: u64,
    current_epoch: u64,
    last_reward_error: u128,
    last_coll_error_offset: u128,
    last_debt_loss_error_offset: u128,
    last_cumulative_issuance: u128,
}

impl StabilityPool {
    /// Create an empty pool at `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            coll: 0,
            total_debt_deposits: 0,
            deposits: JournaledMap::new(),
            deposit_snapshots: JournaledMap::new(),
            frontends: JournaledMap::new(),
            frontend_stakes: JournaledMap::new(),
            frontend_snapshots: JournaledMap::new(),
            p: DECIMAL_PRECISION,
            current_scale: 0,
            current_epoch: 0,
            epoch_to_scale_to_sum: JournaledMap::new(),
            epoch_to_scale_to_g: JournaledMap::new(),
            last_reward_error: 0,
            last_coll_error_offset: 0,
            last_debt_loss_error_offset: 0,
            last_cumulative_issuance: 0,
            reward_balances: JournaledMap::new(),
            access: AccessList::new("stability_pool"),
            saved: Saved::default(),
        }
    }

    /// Wire trusted callers; only once
    pub fn set_addresses(&mut self, trove_manager: Address, active_pool: Address) -> Result<()> {
        self.access.configure([
            (Role::TroveManager, trove_manager),
            (Role::ActivePool, active_pool),
        ])
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // DEPOSITOR OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Deposit `amount` debt tokens.
    ///
    /// Pays out accumulated collateral and reward gains first. `frontend` is
    /// recorded only on a first deposit; the zero address means no frontend.
    pub fn provide_to_sp(
        &mut self,
        token: &mut DebtToken,
        accounts: &mut Accounts,
        cumulative_issuance: u128,
        depositor: Address,
        amount: u128,
        frontend: Address,
    ) -> Result<DepositOutcome> {
        let frontend = frontend.non_zero();
        if let Some(tag) = frontend {
            if !self.is_registered_frontend(tag) {
                return Err(Error::Frontend {
                    address: tag.to_hex(),
                    reason: "frontend is not registered".into(),
                });
            }
        }
        if self.is_registered_frontend(depositor) {
            return Err(Error::Frontend {
                address: depositor.to_hex(),
                reason: "a registered frontend cannot deposit".into(),
            });
        }
        if amount == 0 {
            return Err(Error::ZeroAmount);
        }

        let initial_deposit = self.initial_deposit(depositor);

        self.trigger_issuance(cumulative_issuance)?;

        if initial_deposit == 0 {
            self.deposits.insert(
                depositor,
                Deposit {
                    initial_value: 0,
                    frontend_tag: frontend,
                },
            );
            if let Some(fe) = frontend.and_then(|tag| self.frontends.get_mut(&tag)) {
                fe.referred_deposits += 1;
            }
        }

        let coll_gain = self.get_depositor_coll_gain(depositor)?;
        let compounded = self.get_compounded_debt_deposit(depositor)?;
        let debt_loss = initial_deposit.saturating_sub(compounded);
        let tag = self.frontend_tag(depositor);

        let (depositor_reward, frontend_reward) = self.pay_out_reward_gains(depositor, tag)?;

        if let Some(tag) = tag {
            let stake = safe_add(self.get_compounded_frontend_stake(tag)?, amount)?;
            self.update_frontend_stake_and_snapshots(tag, stake);
        }

        token.send_to_pool(self.address, depositor, self.address, amount)?;
        self.total_debt_deposits = safe_add(self.total_debt_deposits, amount)?;

        let new_deposit = safe_add(compounded, amount)?;
        self.update_deposit_and_snapshots(depositor, new_deposit);

        self.send_coll_gain(accounts, depositor, coll_gain)?;

        tracing::info!(
            depositor = %depositor.short(),
            amount,
            new_deposit,
            coll_gain,
            "stability pool deposit"
        );

        Ok(DepositOutcome {
            coll_gain,
            debt_loss,
            depositor_reward,
            frontend_reward,
            new_deposit,
        })
    }

    /// Withdraw up to `amount` debt tokens and all gains.
    ///
    /// Callers must refuse a non-zero withdrawal while any trove is under MCR.
    pub fn withdraw_from_sp(
        &mut self,
        token: &mut DebtToken,
        accounts: &mut Accounts,
        cumulative_issuance: u128,
        depositor: Address,
        amount: u128,
    ) -> Result<DepositOutcome> {
        let initial_deposit = self.initial_deposit(depositor);
        if initial_deposit == 0 {
            return Err(Error::NoDeposit(depositor.to_hex()));
        }

        self.trigger_issuance(cumulative_issuance)?;

        let coll_gain = self.get_depositor_coll_gain(depositor)?;
        let compounded = self.get_compounded_debt_deposit(depositor)?;
        let to_withdraw = amount.min(compounded);
        let debt_loss = initial_deposit.saturating_sub(compounded);
        let tag = self.frontend_tag(depositor);

        let (depositor_reward, frontend_reward) = self.pay_out_reward_gains(depositor, tag)?;

        if let Some(tag) = tag {
            let stake = self
                .get_compounded_frontend_stake(tag)?
                .saturating_sub(to_withdraw);
            self.update_frontend_stake_and_snapshots(tag, stake);
        }

        self.send_debt_to_depositor(token, depositor, to_withdraw)?;

        let new_deposit = compounded - to_withdraw;
        self.update_deposit_and_snapshots(depositor, new_deposit);

        self.send_coll_gain(accounts, depositor, coll_gain)?;

        tracing::info!(
            depositor = %depositor.short(),
            withdrawn = to_withdraw,
            new_deposit,
            coll_gain,
            "stability pool withdrawal"
        );

        Ok(DepositOutcome {
            coll_gain,
            debt_loss,
            depositor_reward,
            frontend_reward,
            new_deposit,
        })
    }

    /// Move the depositor's collateral gain into the active pool.
    ///
    /// The caller credits the returned `coll_gain` to the depositor's trove.
    pub fn withdraw_coll_gain_to_trove(
        &mut self,
        active_pool: &mut ActivePool,
        cumulative_issuance: u128,
        depositor: Address,
    ) -> Result<DepositOutcome> {
        let initial_deposit = self.initial_deposit(depositor);
        if initial_deposit == 0 {
            return Err(Error::NoDeposit(depositor.to_hex()));
        }
        if self.get_depositor_coll_gain(depositor)? == 0 {
            return Err(Error::InvalidParameter {
                name: "depositor".into(),
                reason: "no collateral gain to withdraw".into(),
            });
        }

        self.trigger_issuance(cumulative_issuance)?;

        let coll_gain = self.get_depositor_coll_gain(depositor)?;
        let compounded = self.get_compounded_debt_deposit(depositor)?;
        let debt_loss = initial_deposit.saturating_sub(compounded);
        let tag = self.frontend_tag(depositor);

        let (depositor_reward, frontend_reward) = self.pay_out_reward_gains(depositor, tag)?;

        if let Some(tag) = tag {
            let stake = self.get_compounded_frontend_stake(tag)?;
            self.update_frontend_stake_and_snapshots(tag, stake);
        }

        self.update_deposit_and_snapshots(depositor, compounded);

        let remaining = self
            .coll
            .checked_sub(coll_gain)
            .ok_or_else(|| Error::InvariantViolation("collateral gain exceeds pool balance".into()))?;
        active_pool.receive_collateral(self.address, coll_gain)?;
        self.coll = remaining;

        tracing::info!(
            depositor = %depositor.short(),
            coll_gain,
            "stability pool gain moved to trove"
        );

        Ok(DepositOutcome {
            coll_gain,
            debt_loss,
            depositor_reward,
            frontend_reward,
            new_deposit: compounded,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // FRONTENDS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register `frontend` with a kickback rate in [0, 1e18]
    pub fn register_frontend(&mut self, frontend: Address, kickback_rate: u128) -> Result<()> {
        if frontend.is_zero() {
            return Err(Error::Frontend {
                address: frontend.to_hex(),
                reason: "zero address".into(),
            });
        }
        if self.is_registered_frontend(frontend) {
            return Err(Error::Frontend {
                address: frontend.to_hex(),
                reason: "must not already be a registered frontend".into(),
            });
        }
        if self.initial_deposit(frontend) > 0 {
            return Err(Error::Frontend {
                address: frontend.to_hex(),
                reason: "user must have no deposit".into(),
            });
        }
        validate_kickback_rate(kickback_rate)?;

        self.frontends.insert(
            frontend,
            FrontEnd {
                kickback_rate,
                registered: true,
                referred_deposits: 0,
            },
        );
        tracing::info!(frontend = %frontend.short(), kickback_rate, "frontend registered");
        Ok(())
    }

    /// Change the kickback rate of a registered frontend.
    ///
    /// Only allowed while no deposit tagged with the frontend is open: a
    /// depositor's pending reward is split at payout time, so changing the
    /// rate under an open deposit would split issuance already accrued at
    /// the old rate a second time. The frontend's remaining reward is paid
    /// out at the old rate first.
    pub fn set_kickback_rate(
        &mut self,
        cumulative_issuance: u128,
        frontend: Address,
        kickback_rate: u128,
    ) -> Result<u128> {
        if !self.is_registered_frontend(frontend) {
            return Err(Error::Frontend {
                address: frontend.to_hex(),
                reason: "frontend is not registered".into(),
            });
        }
        validate_kickback_rate(kickback_rate)?;
        let referred = self
            .frontends
            .get(&frontend)
            .map(|fe| fe.referred_deposits)
            .unwrap_or(0);
        if referred > 0 {
            return Err(Error::Frontend {
                address: frontend.to_hex(),
                reason: format!("kickback rate is fixed while {} referred deposits are open", referred),
            });
        }

        self.trigger_issuance(cumulative_issuance)?;
        let paid = self.get_frontend_reward_gain(frontend)?;
        self.credit_reward(frontend, paid)?;
        let stake = self.get_compounded_frontend_stake(frontend)?;
        self.update_frontend_stake_and_snapshots(frontend, stake);

        if let Some(fe) = self.frontends.get_mut(&frontend) {
            fe.kickback_rate = kickback_rate;
        }
        tracing::info!(frontend = %frontend.short(), kickback_rate, "kickback rate updated");
        Ok(paid)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION OFFSET
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cancel `debt_to_offset` against deposits and take `coll_to_add` from
    /// the active pool. Trove Manager only.
    pub fn offset(
        &mut self,
        caller: Address,
        token: &mut DebtToken,
        active_pool: &mut ActivePool,
        cumulative_issuance: u128,
        debt_to_offset: u128,
        coll_to_add: u128,
    ) -> Result<()> {
        self.access.require(caller, &[Role::TroveManager], "offset")?;

        let total = self.total_debt_deposits;
        if total == 0 || debt_to_offset == 0 {
            return Ok(());
        }
        if debt_to_offset > total {
            return Err(Error::insufficient("stability_pool", debt_to_offset, total));
        }

        self.trigger_issuance(cumulative_issuance)?;

        let (coll_gain_per_unit, debt_loss_per_unit) =
            self.compute_rewards_per_unit_staked(coll_to_add, debt_to_offset, total)?;
        self.update_reward_sum_and_product(coll_gain_per_unit, debt_loss_per_unit)?;

        // Move offset collateral and debt
        active_pool.decrease_debt(self.address, debt_to_offset)?;
        self.total_debt_deposits = total - debt_to_offset;
        token.burn(self.address, self.address, debt_to_offset)?;
        active_pool.send_collateral(self.address, &mut *self, coll_to_add)?;

        tracing::debug!(
            debt = debt_to_offset,
            coll = coll_to_add,
            p = self.p,
            epoch = self.current_epoch,
            scale = self.current_scale,
            "stability pool offset"
        );
        Ok(())
    }

    fn compute_rewards_per_unit_staked(
        &mut self,
        coll_to_add: u128,
        debt_to_offset: u128,
        total_deposits: u128,
    ) -> Result<(u128, u128)> {
        let precision = U256::from(DECIMAL_PRECISION);
        let total = U256::from(total_deposits);

        let coll_numerator =
            U256::from(coll_to_add) * precision + U256::from(self.last_coll_error_offset);

        let debt_loss_per_unit = if debt_to_offset == total_deposits {
            self.last_debt_loss_error_offset = 0;
            DECIMAL_PRECISION
        } else {
            let loss_numerator = (U256::from(debt_to_offset) * precision)
                .checked_sub(U256::from(self.last_debt_loss_error_offset))
                .ok_or_else(|| Error::InvariantViolation("debt loss error exceeds numerator".into()))?;
            // Round up so compounded deposits err in favour of the pool
            let per_unit = loss_numerator / total + U256::one();
            self.last_debt_loss_error_offset = (per_unit * total - loss_numerator).low_u128();
            to_u128(per_unit, "debt loss per unit staked")?
        };

        let coll_gain_per_unit = coll_numerator / total;
        self.last_coll_error_offset = (coll_numerator - coll_gain_per_unit * total).low_u128();

        Ok((
            to_u128(coll_gain_per_unit, "collateral gain per unit staked")?,
            debt_loss_per_unit,
        ))
    }

    fn update_reward_sum_and_product(
        &mut self,
        coll_gain_per_unit: u128,
        debt_loss_per_unit: u128,
    ) -> Result<()> {
        if debt_loss_per_unit > DECIMAL_PRECISION {
            return Err(Error::InvariantViolation("debt loss per unit exceeds 1".into()));
        }
        let current_p = self.p;
        let new_product_factor = DECIMAL_PRECISION - debt_loss_per_unit;

        // S uses the product before this offset
        let key = (self.current_epoch, self.current_scale);
        let marginal_gain = U256::from(coll_gain_per_unit) * U256::from(current_p);
        let sum = self.epoch_to_scale_to_sum.get_or_insert_with(key, U256::zero);
        *sum = sum.saturating_add(marginal_gain);

        let scaled = U256::from(current_p) * U256::from(new_product_factor) / U256::from(DECIMAL_PRECISION);
        let new_p = if new_product_factor == 0 {
            self.current_epoch += 1;
            self.current_scale = 0;
            tracing::info!(epoch = self.current_epoch, "stability pool emptied, new epoch");
            DECIMAL_PRECISION
        } else if scaled < U256::from(SCALE_FACTOR) {
            self.current_scale += 1;
            tracing::info!(scale = self.current_scale, "stability pool scale increased");
            to_u128(
                U256::from(current_p) * U256::from(new_product_factor) * U256::from(SCALE_FACTOR)
                    / U256::from(DECIMAL_PRECISION),
                "scaled product",
            )?
        } else {
            to_u128(scaled, "product")?
        };

        if new_p == 0 {
            return Err(Error::InvariantViolation("running product reached zero".into()));
        }
        self.p = new_p;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REWARD ISSUANCE
    // ═══════════════════════════════════════════════════════════════════════════

    fn trigger_issuance(&mut self, cumulative_issuance: u128) -> Result<()> {
        let issuance = cumulative_issuance.saturating_sub(self.last_cumulative_issuance);
        self.last_cumulative_issuance = self.last_cumulative_issuance.max(cumulative_issuance);
        self.update_g(issuance)
    }

    fn update_g(&mut self, issuance: u128) -> Result<()> {
        let total = self.total_debt_deposits;
        if total == 0 || issuance == 0 {
            return Ok(());
        }

        let numerator = U256::from(issuance) * U256::from(DECIMAL_PRECISION)
            + U256::from(self.last_reward_error);
        let per_unit = numerator / U256::from(total);
        self.last_reward_error = (numerator - per_unit * U256::from(total)).low_u128();

        let marginal = per_unit * U256::from(self.p);
        let key = (self.current_epoch, self.current_scale);
        let g = self.epoch_to_scale_to_g.get_or_insert_with(key, U256::zero);
        *g = g.saturating_add(marginal);
        Ok(())
    }

    fn pay_out_reward_gains(
        &mut self,
        depositor: Address,
        frontend: Option<Address>,
    ) -> Result<(u128, u128)> {
        let frontend_reward = match frontend {
            Some(tag) => {
                let gain = self.get_frontend_reward_gain(tag)?;
                self.credit_reward(tag, gain)?;
                gain
            }
            None => 0,
        };
        let depositor_reward = self.get_depositor_reward_gain(depositor)?;
        self.credit_reward(depositor, depositor_reward)?;
        Ok((depositor_reward, frontend_reward))
    }

    fn credit_reward(&mut self, account: Address, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let balance = safe_add(self.reward_balance_of(account), amount)?;
        self.reward_balances.insert(account, balance);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // GAIN QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Collateral gain of `depositor` since the last interaction
    pub fn get_depositor_coll_gain(&self, depositor: Address) -> Result<u128> {
        let initial = self.initial_deposit(depositor);
        match self.deposit_snapshots.get(&depositor) {
            Some(snapshots) if initial > 0 => self.coll_gain_from_snapshots(initial, snapshots),
            _ => Ok(0),
        }
    }

    /// Reward gain due to `depositor`, net of the frontend's share
    pub fn get_depositor_reward_gain(&self, depositor: Address) -> Result<u128> {
        let initial = self.initial_deposit(depositor);
        let snapshots = match self.deposit_snapshots.get(&depositor) {
            Some(s) if initial > 0 => s,
            _ => return Ok(0),
        };
        let kickback_rate = match self.frontend_tag(depositor) {
            Some(tag) => self
                .frontends
                .get(&tag)
                .map(|fe| fe.kickback_rate)
                .unwrap_or(DECIMAL_PRECISION),
            None => DECIMAL_PRECISION,
        };
        let gain = self.reward_gain_from_snapshots(initial, snapshots)?;
        to_u128(
            U256::from(kickback_rate) * U256::from(gain) / U256::from(DECIMAL_PRECISION),
            "depositor reward gain",
        )
    }

    /// Reward gain due to `frontend` from its referred deposits
    pub fn get_frontend_reward_gain(&self, frontend: Address) -> Result<u128> {
        let stake = self.frontend_stakes.get(&frontend).copied().unwrap_or(0);
        let snapshots = match self.frontend_snapshots.get(&frontend) {
            Some(s) if stake > 0 => s,
            _ => return Ok(0),
        };
        let kickback_rate = self
            .frontends
            .get(&frontend)
            .map(|fe| fe.kickback_rate)
            .unwrap_or(DECIMAL_PRECISION);
        let share = DECIMAL_PRECISION - kickback_rate;
        let gain = self.reward_gain_from_snapshots(stake, snapshots)?;
        to_u128(
            U256::from(share) * U256::from(gain) / U256::from(DECIMAL_PRECISION),
            "frontend reward gain",
        )
    }

    fn coll_gain_from_snapshots(&self, initial: u128, snapshots: &Snapshots) -> Result<u128> {
        let first = self
            .sum_at(snapshots.epoch, snapshots.scale)
            .saturating_sub(snapshots.s);
        let second = self.sum_at(snapshots.epoch, snapshots.scale + 1) / U256::from(SCALE_FACTOR);
        to_u128(
            U256::from(initial) * (first + second)
                / U256::from(snapshots.p)
                / U256::from(DECIMAL_PRECISION),
            "collateral gain",
        )
    }

    fn reward_gain_from_snapshots(&self, initial: u128, snapshots: &Snapshots) -> Result<u128> {
        let first = self
            .g_at(snapshots.epoch, snapshots.scale)
            .saturating_sub(snapshots.g);
        let second = self.g_at(snapshots.epoch, snapshots.scale + 1) / U256::from(SCALE_FACTOR);
        to_u128(
            U256::from(initial) * (first + second)
                / U256::from(snapshots.p)
                / U256::from(DECIMAL_PRECISION),
            "reward gain",
        )
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // COMPOUNDED DEPOSITS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current value of `depositor`'s deposit
    pub fn get_compounded_debt_deposit(&self, depositor: Address) -> Result<u128> {
        let initial = self.initial_deposit(depositor);
        match self.deposit_snapshots.get(&depositor) {
            Some(snapshots) if initial > 0 => self.compounded_stake_from_snapshots(initial, snapshots),
            _ => Ok(0),
        }
    }

    /// Current value of the deposits referred by `frontend`
    pub fn get_compounded_frontend_stake(&self, frontend: Address) -> Result<u128> {
        let stake = self.frontend_stakes.get(&frontend).copied().unwrap_or(0);
        match self.frontend_snapshots.get(&frontend) {
            Some(snapshots) if stake > 0 => self.compounded_stake_from_snapshots(stake, snapshots),
            _ => Ok(0),
        }
    }

    fn compounded_stake_from_snapshots(&self, initial: u128, snapshots: &Snapshots) -> Result<u128> {
        // Emptied in a later epoch
        if snapshots.epoch < self.current_epoch {
            return Ok(0);
        }

        let scale_diff = self.current_scale.saturating_sub(snapshots.scale);
        let product = U256::from(initial) * U256::from(self.p) / U256::from(snapshots.p);
        let compounded = match scale_diff {
            0 => to_u128(product, "compounded stake")?,
            1 => to_u128(product / U256::from(SCALE_FACTOR), "compounded stake")?,
            _ => 0,
        };

        // Treat dust left after a near-total offset as empty
        if compounded < initial / 1_000_000_000 {
            return Ok(0);
        }
        Ok(compounded)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SNAPSHOT UPDATES
    // ═══════════════════════════════════════════════════════════════════════════

    fn current_snapshots(&self, with_sum: bool) -> Snapshots {
        Snapshots {
            s: if with_sum {
                self.sum_at(self.current_epoch, self.current_scale)
            } else {
                U256::zero()
            },
            p: self.p,
            g: self.g_at(self.current_epoch, self.current_scale),
            scale: self.current_scale,
            epoch: self.current_epoch,
        }
    }

    fn update_deposit_and_snapshots(&mut self, depositor: Address, new_value: u128) {
        if new_value == 0 {
            let closed = self.deposits.remove(&depositor);
            self.deposit_snapshots.remove(&depositor);
            if let Some(fe) = closed
                .and_then(|d| d.frontend_tag)
                .and_then(|tag| self.frontends.get_mut(&tag))
            {
                fe.referred_deposits = fe.referred_deposits.saturating_sub(1);
            }
            return;
        }
        let tag = self.frontend_tag(depositor);
        self.deposits.insert(
            depositor,
            Deposit {
                initial_value: new_value,
                frontend_tag: tag,
            },
        );
        let snapshots = self.current_snapshots(true);
        self.deposit_snapshots.insert(depositor, snapshots);
    }

    fn update_frontend_stake_and_snapshots(&mut self, frontend: Address, new_value: u128) {
        if new_value == 0 {
            self.frontend_stakes.remove(&frontend);
            self.frontend_snapshots.remove(&frontend);
            return;
        }
        self.frontend_stakes.insert(frontend, new_value);
        let snapshots = self.current_snapshots(false);
        self.frontend_snapshots.insert(frontend, snapshots);
    }

    fn send_debt_to_depositor(&mut self, token: &mut DebtToken, depositor: Address, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        token.return_from_pool(self.address, self.address, depositor, amount)?;
        self.total_debt_deposits = self
            .total_debt_deposits
            .checked_sub(amount)
            .ok_or_else(|| Error::insufficient("stability_pool", amount, self.total_debt_deposits))?;
        Ok(())
    }

    fn send_coll_gain(&mut self, accounts: &mut Accounts, depositor: Address, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let remaining = self
            .coll
            .checked_sub(amount)
            .ok_or_else(|| Error::InvariantViolation("collateral gain exceeds pool balance".into()))?;
        accounts.wallet(depositor).receive_collateral(self.address, amount)?;
        self.coll = remaining;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Pool address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Collateral held
    pub fn get_coll(&self) -> u128 {
        self.coll
    }

    /// Total debt tokens deposited
    pub fn get_total_debt_deposits(&self) -> u128 {
        self.total_debt_deposits
    }

    /// Deposit record of `depositor`
    pub fn get_deposit(&self, depositor: Address) -> Option<&Deposit> {
        self.deposits.get(&depositor)
    }

    /// Frontend record of `frontend`
    pub fn get_frontend(&self, frontend: Address) -> Option<&FrontEnd> {
        self.frontends.get(&frontend)
    }

    /// Whether `frontend` is registered
    pub fn is_registered_frontend(&self, frontend: Address) -> bool {
        self.frontends.get(&frontend).is_some_and(|fe| fe.registered)
    }

    /// Rewards paid out to `account`
    pub fn reward_balance_of(&self, account: Address) -> u128 {
        self.reward_balances.get(&account).copied().unwrap_or(0)
    }

    /// Running product
    pub fn get_p(&self) -> u128 {
        self.p
    }

    /// Current epoch
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    /// Current scale
    pub fn current_scale(&self) -> u64 {
        self.current_scale
    }

    /// `S[epoch][scale]`
    pub fn sum_at(&self, epoch: u64, scale: u64) -> U256 {
        self.epoch_to_scale_to_sum
            .get(&(epoch, scale))
            .copied()
            .unwrap_or_else(U256::zero)
    }

    /// `G[epoch][scale]`
    pub fn g_at(&self, epoch: u64, scale: u64) -> U256 {
        self.epoch_to_scale_to_g
            .get(&(epoch, scale))
            .copied()
            .unwrap_or_else(U256::zero)
    }

    /// Number of open deposits
    pub fn depositor_count(&self) -> usize {
        self.deposits.len()
    }

    /// Depositors with an open deposit
    pub fn depositors(&self) -> impl Iterator<Item = Address> + '_ {
        self.deposits.keys().copied()
    }

    fn initial_deposit(&self, depositor: Address) -> u128 {
        self.deposits
            .get(&depositor)
            .map(|d| d.initial_value)
            .unwrap_or(0)
    }

    fn frontend_tag(&self, depositor: Address) -> Option<Address> {
        self.deposits.get(&depositor).and_then(|d| d.frontend_tag)
    }

    /// Compute state hash
    pub fn state_hash(&self) -> StateHash {
        let mut data = Vec::new();
        data.extend_from_slice(&self.total_debt_deposits.to_be_bytes());
        data.extend_from_slice(&self.coll.to_be_bytes());
        data.extend_from_slice(&self.p.to_be_bytes());
        data.extend_from_slice(&self.current_epoch.to_be_bytes());
        data.extend_from_slice(&self.current_scale.to_be_bytes());
        StateHash::sha256(&data)
    }
}

impl CollateralReceiver for StabilityPool {
    fn address(&self) -> Address {
        self.address
    }

    fn receive_collateral(&mut self, sender: Address, amount: u128) -> Result<()> {
        self.access
            .require(sender, &[Role::ActivePool], "receive_collateral")?;
        self.coll = safe_add(self.coll, amount)?;
        Ok(())
    }
}

impl Transactional for StabilityPool {
    fn begin(&mut self) {
        self.saved.save(Scalars {
            coll: self.coll,
            total_debt_deposits: self.total_debt_deposits,
            p: self.p,
            current_scale: self.current_scale,
            current_epoch: self.current_epoch,
            last_reward_error: self.last_reward_error,
            last_coll_error_offset: self.last_coll_error_offset,
            last_debt_loss_error_offset: self.last_debt_loss_error_offset,
            last_cumulative_issuance: self.last_cumulative_issuance,
        });
        self.deposits.begin();
        self.deposit_snapshots.begin();
        self.frontends.begin();
        self.frontend_stakes.begin();
        self.frontend_snapshots.begin();
        self.epoch_to_scale_to_sum.begin();
        self.epoch_to_scale_to_g.begin();
        self.reward_balances.begin();
    }

    fn commit(&mut self) {
        self.saved.clear();
        self.deposits.commit();
        self.deposit_snapshots.commit();
        self.frontends.commit();
        self.frontend_stakes.commit();
        self.frontend_snapshots.commit();
        self.epoch_to_scale_to_sum.commit();
        self.epoch_to_scale_to_g.commit();
        self.reward_balances.commit();
    }

    fn rollback(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.coll = saved.coll;
            self.total_debt_deposits = saved.total_debt_deposits;
            self.p = saved.p;
            self.current_scale = saved.current_scale;
            self.current_epoch = saved.current_epoch;
            self.last_reward_error = saved.last_reward_error;
            self.last_coll_error_offset = saved.last_coll_error_offset;
            self.last_debt_loss_error_offset = saved.last_debt_loss_error_offset;
            self.last_cumulative_issuance = saved.last_cumulative_issuance;
        }
        self.deposits.rollback();
        self.deposit_snapshots.rollback();
        self.frontends.rollback();
        self.frontend_stakes.rollback();
        self.frontend_snapshots.rollback();
        self.epoch_to_scale_to_sum.rollback();
        self.epoch_to_scale_to_g.rollback();
        self.reward_balances.rollback();
    }
}

fn validate_kickback_rate(rate: u128) -> Result<()> {
    if rate > DECIMAL_PRECISION {
        return Err(Error::InvalidKickbackRate(rate));
    }
    Ok(())
}
