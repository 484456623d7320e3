//! System assembly.
//!
//! [`System`] owns every component, wires their addresses exactly once and
//! runs each external action as one transaction. Components journal the
//! entries an action overwrites and replay the journal if the action fails,
//! so a failed action leaves no trace, including its events, and the cost of
//! a rollback follows what the action touched rather than the size of the
//! state.

use serde::{Deserialize, Serialize};

use crate::core::config::ProtocolParams;
use crate::core::pools::{Accounts, ActivePool, CollSurplusPool, DefaultPool};
use crate::core::sorted_troves::{PositionHint, SortedTroves};
use crate::core::token::DebtToken;
use crate::core::trove::Trove;
use crate::error::{Error, Result};
use crate::liquidation::engine::LiquidationOutcome;
use crate::liquidation::recovery::RecoveryModeStatus;
use crate::liquidation::stability_pool::{DepositOutcome, StabilityPool};
use crate::oracle::issuance::{NoIssuance, RewardIssuance};
use crate::oracle::price_feed::{ManualPriceFeed, PriceFeed};
use crate::protocol::borrower_operations::{Adjustment, BorrowerOperations, OpenTroveOutcome};
use crate::protocol::events::{
    CollGainWithdrawnEvent, EventLog, FrontendEvent, ProtocolEvent, RecoveryModeEvent,
    RewardPaidEvent, StabilityDepositEvent,
};
use crate::protocol::redemption::{RedemptionHints, RedemptionOutcome};
use crate::protocol::trove_manager::TroveManager;
use crate::utils::crypto::{Address, StateHash};
use crate::utils::journal::{Saved, Transactional};
use crate::utils::math::{compute_nominal_cr, safe_add};

// ═══════════════════════════════════════════════════════════════════════════════
// ADDRESSES AND CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// Addresses of every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAddresses {
    /// Borrower Operations
    pub borrower_operations: Address,
    /// Trove Manager
    pub trove_manager: Address,
    /// Stability Pool
    pub stability_pool: Address,
    /// Active Pool
    pub active_pool: Address,
    /// Default Pool
    pub default_pool: Address,
    /// Collateral surplus pool
    pub coll_surplus_pool: Address,
    /// Holds the gas compensation reserve
    pub gas_pool: Address,
    /// Debt token
    pub debt_token: Address,
    /// Sorted troves index
    pub sorted_troves: Address,
    /// Receives borrowing and redemption fees
    pub fee_recipient: Address,
}

impl SystemAddresses {
    /// Deterministic addresses derived from component labels
    pub fn derive() -> Self {
        let at = |label: &str| Address::derive(&format!("trove-protocol/{}", label));
        Self {
            borrower_operations: at("borrower-operations"),
            trove_manager: at("trove-manager"),
            stability_pool: at("stability-pool"),
            active_pool: at("active-pool"),
            default_pool: at("default-pool"),
            coll_surplus_pool: at("coll-surplus-pool"),
            gas_pool: at("gas-pool"),
            debt_token: at("debt-token"),
            sorted_troves: at("sorted-troves"),
            fee_recipient: at("fee-recipient"),
        }
    }

    /// Whether `address` belongs to a component
    pub fn is_component(&self, address: Address) -> bool {
        [
            self.borrower_operations,
            self.trove_manager,
            self.stability_pool,
            self.active_pool,
            self.default_pool,
            self.coll_surplus_pool,
            self.gas_pool,
            self.debt_token,
            self.sorted_troves,
        ]
        .contains(&address)
    }
}

impl Default for SystemAddresses {
    fn default() -> Self {
        Self::derive()
    }
}

/// Values fixed for the duration of one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Collateral price (1e18 = 1 debt unit per collateral unit)
    pub price: u128,
    /// Seconds since epoch
    pub timestamp: u64,
    /// Cumulative reward issuance at `timestamp`
    pub cumulative_issuance: u128,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Ledgers and indexes the managers operate on.
///
/// Kept apart from the managers so a manager can hold `&mut self` while
/// touching several components at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Components {
    /// Collateral and debt of active troves
    pub active_pool: ActivePool,
    /// Redistributed collateral and debt not yet applied
    pub default_pool: DefaultPool,
    /// Claimable collateral left after capped liquidations and redemptions
    pub coll_surplus_pool: CollSurplusPool,
    /// Deposits absorbing liquidated debt
    pub stability_pool: StabilityPool,
    /// Debt token balances and allowances
    pub token: DebtToken,
    /// Troves ordered by nominal ICR
    pub sorted_troves: SortedTroves,
    /// Native collateral held by external accounts
    pub accounts: Accounts,
    /// Events of the current and past actions
    pub events: EventLog,
}

impl Transactional for Components {
    fn begin(&mut self) {
        self.active_pool.begin();
        self.default_pool.begin();
        self.coll_surplus_pool.begin();
        self.stability_pool.begin();
        self.token.begin();
        self.sorted_troves.begin();
        self.accounts.begin();
        self.events.begin();
    }

    fn commit(&mut self) {
        self.active_pool.commit();
        self.default_pool.commit();
        self.coll_surplus_pool.commit();
        self.stability_pool.commit();
        self.token.commit();
        self.sorted_troves.commit();
        self.accounts.commit();
        self.events.commit();
    }

    fn rollback(&mut self) {
        self.active_pool.rollback();
        self.default_pool.rollback();
        self.coll_surplus_pool.rollback();
        self.stability_pool.rollback();
        self.token.rollback();
        self.sorted_troves.rollback();
        self.accounts.rollback();
        self.events.rollback();
    }
}

/// Complete protocol state.
///
/// Parameters, addresses and Borrower Operations do not change once wired,
/// so only the managers, the ledgers and the scalars below take part in
/// rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    /// Parameters fixed at construction
    pub params: ProtocolParams,
    /// Wired component addresses
    pub addresses: SystemAddresses,
    /// Trove records, rewards and liquidations
    pub trove_manager: TroveManager,
    /// Borrower entry points
    pub borrower_operations: BorrowerOperations,
    /// Ledgers shared by the managers
    pub components: Components,
    /// Current time in seconds
    pub now: u64,
    /// Native collateral ever credited to accounts
    pub total_funded: u128,
    /// Mode observed after the last priced action
    pub recovery_mode: bool,
    #[serde(skip)]
    saved: Saved<(u64, u128, bool)>,
}

impl SystemState {
    /// Assemble and wire all components
    pub fn new(params: ProtocolParams, addresses: SystemAddresses) -> Result<Self> {
        params.validate()?;
        let a = addresses;

        let mut active_pool = ActivePool::new(a.active_pool);
        active_pool.set_addresses(a.borrower_operations, a.trove_manager, a.stability_pool, a.default_pool)?;
        let mut default_pool = DefaultPool::new(a.default_pool);
        default_pool.set_addresses(a.trove_manager, a.active_pool)?;
        let mut coll_surplus_pool = CollSurplusPool::new(a.coll_surplus_pool);
        coll_surplus_pool.set_addresses(a.borrower_operations, a.trove_manager, a.active_pool)?;
        let mut stability_pool = StabilityPool::new(a.stability_pool);
        stability_pool.set_addresses(a.trove_manager, a.active_pool)?;
        let mut token = DebtToken::new(a.debt_token);
        token.set_addresses(a.borrower_operations, a.trove_manager, a.stability_pool)?;
        let mut sorted_troves = SortedTroves::new(params.max_sorted_size, params.max_hint_traversal);
        sorted_troves.set_addresses(a.trove_manager, a.borrower_operations)?;

        let mut trove_manager = TroveManager::new(a.trove_manager, params.clone());
        trove_manager.set_addresses(a.borrower_operations, a.gas_pool, a.fee_recipient)?;
        let mut borrower_operations = BorrowerOperations::new(a.borrower_operations, params.clone());
        borrower_operations.set_addresses(a.stability_pool, a.gas_pool, a.fee_recipient)?;

        tracing::info!(
            mcr = params.min_collateral_ratio,
            ccr = params.critical_collateral_ratio,
            max_troves = params.max_sorted_size,
            "trove system assembled"
        );

        Ok(Self {
            params,
            addresses,
            trove_manager,
            borrower_operations,
            components: Components {
                active_pool,
                default_pool,
                coll_surplus_pool,
                stability_pool,
                token,
                sorted_troves,
                accounts: Accounts::new(),
                events: EventLog::new(),
            },
            now: 0,
            total_funded: 0,
            recovery_mode: false,
            saved: Saved::default(),
        })
    }
}

impl Transactional for SystemState {
    fn begin(&mut self) {
        self.saved.save((self.now, self.total_funded, self.recovery_mode));
        self.trove_manager.begin();
        self.components.begin();
    }

    fn commit(&mut self) {
        self.saved.clear();
        self.trove_manager.commit();
        self.components.commit();
    }

    fn rollback(&mut self) {
        if let Some((now, total_funded, recovery_mode)) = self.saved.take() {
            self.now = now;
            self.total_funded = total_funded;
            self.recovery_mode = recovery_mode;
        }
        self.trove_manager.rollback();
        self.components.rollback();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYSTEM
// ═══════════════════════════════════════════════════════════════════════════════

/// The assembled protocol with its external capabilities
#[derive(Debug)]
pub struct System<F: PriceFeed = ManualPriceFeed, I: RewardIssuance = NoIssuance> {
    state: SystemState,
    price_feed: F,
    issuance: I,
}

impl System<ManualPriceFeed, NoIssuance> {
    /// System with a manually set price and no reward issuance
    pub fn with_price(params: ProtocolParams, price: u128) -> Result<Self> {
        Self::new(params, ManualPriceFeed::new(price), NoIssuance)
    }

    /// Set the manual price
    pub fn set_price(&mut self, price: u128) {
        let now = self.state.now;
        self.price_feed.set_price(price, now);
    }
}

impl<F: PriceFeed, I: RewardIssuance> System<F, I> {
    /// Assemble a system at the derived component addresses
    pub fn new(params: ProtocolParams, price_feed: F, issuance: I) -> Result<Self> {
        Ok(Self {
            state: SystemState::new(params, SystemAddresses::derive())?,
            price_feed,
            issuance,
        })
    }

    /// Restore a system from [`System::to_bytes`] output
    pub fn from_bytes(bytes: &[u8], price_feed: F, issuance: I) -> Result<Self> {
        let state: SystemState =
            bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
        state.params.validate()?;
        Ok(Self {
            state,
            price_feed,
            issuance,
        })
    }

    /// Serialize the whole state
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.state).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Hash of the serialized state
    pub fn state_hash(&self) -> Result<StateHash> {
        Ok(StateHash::sha256(&self.to_bytes()?))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CLOCK AND CAPABILITIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Current time in seconds
    pub fn now(&self) -> u64 {
        self.state.now
    }

    /// Move the clock to `timestamp`; time never goes back
    pub fn set_time(&mut self, timestamp: u64) -> Result<()> {
        if timestamp < self.state.now {
            return Err(Error::InvalidParameter {
                name: "timestamp".into(),
                reason: format!("{} is before current time {}", timestamp, self.state.now),
            });
        }
        self.state.now = timestamp;
        Ok(())
    }

    /// Move the clock forward by `seconds`
    pub fn advance_time(&mut self, seconds: u64) {
        self.state.now = self.state.now.saturating_add(seconds);
    }

    /// The price feed
    pub fn price_feed(&self) -> &F {
        &self.price_feed
    }

    /// Mutable access to the price feed
    pub fn price_feed_mut(&mut self) -> &mut F {
        &mut self.price_feed
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TRANSACTIONS
    // ═══════════════════════════════════════════════════════════════════════════

    fn context(&mut self, priced: bool) -> Result<ExecutionContext> {
        let price = if priced {
            self.price_feed.fetch_price()?
        } else {
            self.price_feed.last_good_price()
        };
        Ok(ExecutionContext {
            price,
            timestamp: self.state.now,
            cumulative_issuance: self.issuance.cumulative_issuance(self.state.now),
        })
    }

    /// Run `f` as one action; undo everything it changed on error
    fn transact<T>(
        &mut self,
        action: &str,
        priced: bool,
        f: impl FnOnce(&mut SystemState, &ExecutionContext) -> Result<T>,
    ) -> Result<T> {
        let ctx = self.context(priced)?;
        self.state.begin();

        let result = f(&mut self.state, &ctx).and_then(|value| {
            if priced {
                Self::track_recovery_mode(&mut self.state, &ctx)?;
            }
            Ok(value)
        });

        match result {
            Ok(value) => {
                self.state.commit();
                tracing::debug!(action, "action committed");
                Ok(value)
            }
            Err(err) => {
                self.state.rollback();
                tracing::warn!(action, error = %err, code = err.code(), "action rolled back");
                Err(err)
            }
        }
    }

    fn track_recovery_mode(state: &mut SystemState, ctx: &ExecutionContext) -> Result<()> {
        let tcr = state.trove_manager.get_tcr(&state.components, ctx.price)?;
        let is_recovery_mode = tcr < state.params.critical_collateral_ratio;
        if is_recovery_mode == state.recovery_mode {
            return Ok(());
        }
        state.recovery_mode = is_recovery_mode;
        let event = RecoveryModeEvent {
            tcr,
            timestamp: ctx.timestamp,
        };
        if is_recovery_mode {
            tracing::warn!(tcr, "recovery mode entered");
            state.components.events.push(ProtocolEvent::RecoveryModeEntered(event));
        } else {
            tracing::info!(tcr, "recovery mode exited");
            state.components.events.push(ProtocolEvent::RecoveryModeExited(event));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ACCOUNTS AND TOKEN
    // ═══════════════════════════════════════════════════════════════════════════

    /// Credit native collateral to an external account
    pub fn fund(&mut self, account: Address, amount: u128) -> Result<()> {
        if account.is_zero() || self.state.addresses.is_component(account) {
            return Err(Error::InvalidParameter {
                name: "account".into(),
                reason: "must be an external account".into(),
            });
        }
        self.transact("fund", false, |s, _| {
            s.components.accounts.credit(account, amount)?;
            s.total_funded = safe_add(s.total_funded, amount)?;
            Ok(())
        })
    }

    /// Transfer debt tokens
    pub fn transfer(&mut self, from: Address, to: Address, amount: u128) -> Result<()> {
        self.transact("transfer", false, |s, _| {
            s.components.token.transfer(from, to, amount)
        })
    }

    /// Approve `spender` to move `owner`'s debt tokens
    pub fn approve(&mut self, owner: Address, spender: Address, amount: u128) -> Result<()> {
        self.transact("approve", false, |s, _| {
            s.components.token.approve(owner, spender, amount)
        })
    }

    /// Move debt tokens on `owner`'s behalf
    pub fn transfer_from(
        &mut self,
        spender: Address,
        owner: Address,
        to: Address,
        amount: u128,
    ) -> Result<()> {
        self.transact("transfer_from", false, |s, _| {
            s.components.token.transfer_from(spender, owner, to, amount)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BORROWER OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a trove
    pub fn open_trove(
        &mut self,
        borrower: Address,
        max_fee: u128,
        debt_amount: u128,
        hint: PositionHint,
        coll: u128,
    ) -> Result<OpenTroveOutcome> {
        self.transact("open_trove", true, |s, ctx| {
            s.borrower_operations.open_trove(
                &mut s.trove_manager,
                &mut s.components,
                ctx,
                borrower,
                max_fee,
                debt_amount,
                hint,
                coll,
            )
        })
    }

    /// Add collateral to a trove
    pub fn add_coll(&mut self, borrower: Address, amount: u128, hint: PositionHint) -> Result<()> {
        self.adjust_trove(borrower, Adjustment::add_coll(amount), hint)
    }

    /// Withdraw collateral from a trove
    pub fn withdraw_coll(&mut self, borrower: Address, amount: u128, hint: PositionHint) -> Result<()> {
        self.adjust_trove(borrower, Adjustment::withdraw_coll(amount), hint)
    }

    /// Draw more debt from a trove
    pub fn withdraw_debt(
        &mut self,
        borrower: Address,
        max_fee: u128,
        amount: u128,
        hint: PositionHint,
    ) -> Result<()> {
        self.adjust_trove(borrower, Adjustment::withdraw_debt(amount, max_fee), hint)
    }

    /// Repay trove debt
    pub fn repay_debt(&mut self, borrower: Address, amount: u128, hint: PositionHint) -> Result<()> {
        self.adjust_trove(borrower, Adjustment::repay_debt(amount), hint)
    }

    /// Change collateral and debt of a trove in one step
    pub fn adjust_trove(
        &mut self,
        borrower: Address,
        adjustment: Adjustment,
        hint: PositionHint,
    ) -> Result<()> {
        self.transact("adjust_trove", true, |s, ctx| {
            s.borrower_operations.adjust_trove(
                &mut s.trove_manager,
                &mut s.components,
                ctx,
                borrower,
                adjustment,
                hint,
            )
        })
    }

    /// Close a trove
    pub fn close_trove(&mut self, borrower: Address) -> Result<()> {
        self.transact("close_trove", true, |s, ctx| {
            s.borrower_operations
                .close_trove(&mut s.trove_manager, &mut s.components, ctx, borrower)
        })
    }

    /// Claim surplus collateral
    pub fn claim_collateral(&mut self, borrower: Address) -> Result<u128> {
        self.transact("claim_collateral", false, |s, ctx| {
            s.borrower_operations
                .claim_collateral(&mut s.components, ctx, borrower)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATIONS AND REDEMPTIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Liquidate one trove
    pub fn liquidate(&mut self, liquidator: Address, borrower: Address) -> Result<LiquidationOutcome> {
        self.transact("liquidate", true, |s, ctx| {
            s.trove_manager
                .liquidate(&mut s.components, ctx, liquidator, borrower)
        })
    }

    /// Liquidate up to `n` of the riskiest troves
    pub fn liquidate_troves(&mut self, liquidator: Address, n: usize) -> Result<LiquidationOutcome> {
        self.transact("liquidate_troves", true, |s, ctx| {
            s.trove_manager
                .liquidate_troves(&mut s.components, ctx, liquidator, n)
        })
    }

    /// Liquidate the eligible troves among `borrowers`
    pub fn batch_liquidate_troves(
        &mut self,
        liquidator: Address,
        borrowers: &[Address],
    ) -> Result<LiquidationOutcome> {
        self.transact("batch_liquidate_troves", true, |s, ctx| {
            s.trove_manager
                .batch_liquidate_troves(&mut s.components, ctx, liquidator, borrowers)
        })
    }

    /// Redeem debt tokens for collateral
    pub fn redeem_collateral(
        &mut self,
        redeemer: Address,
        amount: u128,
        hints: RedemptionHints,
        max_iterations: u32,
        max_fee: u128,
    ) -> Result<RedemptionOutcome> {
        self.transact("redeem_collateral", true, |s, ctx| {
            s.trove_manager.redeem_collateral(
                &mut s.components,
                ctx,
                redeemer,
                amount,
                hints,
                max_iterations,
                max_fee,
            )
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STABILITY POOL
    // ═══════════════════════════════════════════════════════════════════════════

    /// Deposit debt tokens; `frontend` is the zero address for none
    pub fn provide_to_sp(
        &mut self,
        depositor: Address,
        amount: u128,
        frontend: Address,
    ) -> Result<DepositOutcome> {
        self.transact("provide_to_sp", false, |s, ctx| {
            let c = &mut s.components;
            let tag = sp_frontend_tag(&c.stability_pool, depositor).or(frontend.non_zero());
            let outcome = c.stability_pool.provide_to_sp(
                &mut c.token,
                &mut c.accounts,
                ctx.cumulative_issuance,
                depositor,
                amount,
                frontend,
            )?;
            push_deposit_events(&mut c.events, ctx, depositor, tag, &outcome);
            Ok(outcome)
        })
    }

    /// Withdraw up to `amount` debt tokens and all gains
    pub fn withdraw_from_sp(&mut self, depositor: Address, amount: u128) -> Result<DepositOutcome> {
        self.transact("withdraw_from_sp", true, |s, ctx| {
            if amount != 0 {
                require_no_undercollateralized_troves(s, ctx)?;
            }
            let c = &mut s.components;
            let tag = sp_frontend_tag(&c.stability_pool, depositor);
            let outcome = c.stability_pool.withdraw_from_sp(
                &mut c.token,
                &mut c.accounts,
                ctx.cumulative_issuance,
                depositor,
                amount,
            )?;
            push_deposit_events(&mut c.events, ctx, depositor, tag, &outcome);
            Ok(outcome)
        })
    }

    /// Move the depositor's collateral gain into their trove
    pub fn withdraw_coll_gain_to_trove(
        &mut self,
        depositor: Address,
        hint: PositionHint,
    ) -> Result<DepositOutcome> {
        self.transact("withdraw_coll_gain_to_trove", true, |s, ctx| {
            if !s.trove_manager.get_trove_status(depositor).is_active() {
                return Err(Error::TroveNotActive(depositor.to_hex()));
            }
            let c = &mut s.components;
            let tag = sp_frontend_tag(&c.stability_pool, depositor);
            let outcome = c.stability_pool.withdraw_coll_gain_to_trove(
                &mut c.active_pool,
                ctx.cumulative_issuance,
                depositor,
            )?;
            push_deposit_events(&mut c.events, ctx, depositor, tag, &outcome);

            let stability_pool = s.addresses.stability_pool;
            s.borrower_operations.move_coll_gain_to_trove(
                stability_pool,
                &mut s.trove_manager,
                &mut s.components,
                ctx,
                depositor,
                outcome.coll_gain,
                hint,
            )?;
            Ok(outcome)
        })
    }

    /// Register a frontend with its kickback rate
    pub fn register_frontend(&mut self, frontend: Address, kickback_rate: u128) -> Result<()> {
        self.transact("register_frontend", false, |s, ctx| {
            s.components
                .stability_pool
                .register_frontend(frontend, kickback_rate)?;
            s.components.events.push(ProtocolEvent::FrontendRegistered(FrontendEvent {
                frontend,
                kickback_rate,
                timestamp: ctx.timestamp,
            }));
            Ok(())
        })
    }

    /// Change a frontend's kickback rate; returns the reward paid out
    pub fn set_kickback_rate(&mut self, frontend: Address, kickback_rate: u128) -> Result<u128> {
        self.transact("set_kickback_rate", false, |s, ctx| {
            let c = &mut s.components;
            let paid = c.stability_pool.set_kickback_rate(
                ctx.cumulative_issuance,
                frontend,
                kickback_rate,
            )?;
            if paid > 0 {
                c.events.push(ProtocolEvent::RewardPaid(RewardPaidEvent {
                    account: frontend,
                    amount: paid,
                    timestamp: ctx.timestamp,
                }));
            }
            c.events.push(ProtocolEvent::KickbackRateChanged(FrontendEvent {
                frontend,
                kickback_rate,
                timestamp: ctx.timestamp,
            }));
            Ok(paid)
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// The full state
    pub fn state(&self) -> &SystemState {
        &self.state
    }

    /// Parameters in force
    pub fn params(&self) -> &ProtocolParams {
        &self.state.params
    }

    /// Component addresses
    pub fn addresses(&self) -> &SystemAddresses {
        &self.state.addresses
    }

    /// Trove Manager
    pub fn trove_manager(&self) -> &TroveManager {
        &self.state.trove_manager
    }

    /// Borrower Operations
    pub fn borrower_operations(&self) -> &BorrowerOperations {
        &self.state.borrower_operations
    }

    /// Ledgers and indexes
    pub fn components(&self) -> &Components {
        &self.state.components
    }

    /// Stability Pool
    pub fn stability_pool(&self) -> &StabilityPool {
        &self.state.components.stability_pool
    }

    /// Sorted troves index
    pub fn sorted_troves(&self) -> &SortedTroves {
        &self.state.components.sorted_troves
    }

    /// Debt token
    pub fn token(&self) -> &DebtToken {
        &self.state.components.token
    }

    /// Active Pool
    pub fn active_pool(&self) -> &ActivePool {
        &self.state.components.active_pool
    }

    /// Default Pool
    pub fn default_pool(&self) -> &DefaultPool {
        &self.state.components.default_pool
    }

    /// Collateral surplus pool
    pub fn coll_surplus_pool(&self) -> &CollSurplusPool {
        &self.state.components.coll_surplus_pool
    }

    /// External collateral balances
    pub fn accounts(&self) -> &Accounts {
        &self.state.components.accounts
    }

    /// Stored trove record
    pub fn get_trove(&self, borrower: Address) -> Option<&Trove> {
        self.state.trove_manager.get_trove(borrower)
    }

    /// Last price the feed accepted
    pub fn price(&self) -> u128 {
        self.price_feed.last_good_price()
    }

    /// Active plus default pool collateral
    pub fn get_entire_system_coll(&self) -> Result<u128> {
        self.state
            .trove_manager
            .get_entire_system_coll(&self.state.components)
    }

    /// Active plus default pool debt
    pub fn get_entire_system_debt(&self) -> Result<u128> {
        self.state
            .trove_manager
            .get_entire_system_debt(&self.state.components)
    }

    /// TCR at the last good price
    pub fn get_tcr(&self) -> Result<u128> {
        self.state
            .trove_manager
            .get_tcr(&self.state.components, self.price())
    }

    /// Whether TCR is below CCR at the last good price
    pub fn check_recovery_mode(&self) -> Result<bool> {
        self.state
            .trove_manager
            .check_recovery_mode(&self.state.components, self.price())
    }

    /// Recovery mode details at the last good price
    pub fn recovery_status(&self) -> Result<RecoveryModeStatus> {
        self.state
            .trove_manager
            .recovery_status(&self.state.components, self.price())
    }

    /// ICR of `borrower` at the last good price, pending rewards included
    pub fn get_current_icr(&self, borrower: Address) -> Result<u128> {
        self.state
            .trove_manager
            .get_current_icr(borrower, self.price())
    }

    /// Exact list position for a trove with nominal ratio `nicr`
    pub fn find_hint(&self, nicr: u128) -> Result<PositionHint> {
        self.state
            .components
            .sorted_troves
            .find_hint(&self.state.trove_manager, nicr)
            .map(PositionHint::from)
    }

    /// Exact list position for a trove holding `coll` against `debt`
    pub fn hint_for(&self, coll: u128, debt: u128) -> Result<PositionHint> {
        self.find_hint(compute_nominal_cr(coll, debt))
    }

    /// Events not yet drained
    pub fn events(&self) -> &EventLog {
        &self.state.components.events
    }

    /// Take all pending events
    pub fn drain_events(&mut self) -> Vec<ProtocolEvent> {
        self.state.components.events.drain()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INVARIANTS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Check cross-component invariants
    pub fn verify_invariants(&self) -> Result<()> {
        let s = &self.state;
        let c = &s.components;
        let tm = &s.trove_manager;

        if !c.token.verify_supply_invariant() {
            return Err(Error::InvariantViolation("token supply differs from balances".into()));
        }

        let system_debt = tm.get_entire_system_debt(c)?;
        if c.token.total_supply() != system_debt {
            return Err(Error::InvariantViolation(format!(
                "token supply {} differs from system debt {}",
                c.token.total_supply(),
                system_debt
            )));
        }

        let held = [
            c.accounts.total(),
            c.active_pool.get_coll(),
            c.default_pool.get_coll(),
            c.coll_surplus_pool.get_coll(),
            c.stability_pool.get_coll(),
        ]
        .into_iter()
        .try_fold(0u128, safe_add)?;
        if held != s.total_funded {
            return Err(Error::InvariantViolation(format!(
                "collateral held {} differs from collateral funded {}",
                held, s.total_funded
            )));
        }

        if c.sorted_troves.get_size() != tm.get_trove_owners_count() {
            return Err(Error::InvariantViolation(format!(
                "sorted list holds {} troves, owners array {}",
                c.sorted_troves.get_size(),
                tm.get_trove_owners_count()
            )));
        }
        if let Some(missing) = tm
            .trove_owners()
            .iter()
            .find(|owner| !c.sorted_troves.contains(**owner))
        {
            return Err(Error::InvariantViolation(format!(
                "active trove {} missing from sorted list",
                missing
            )));
        }
        if !c.sorted_troves.is_ordered(tm) {
            return Err(Error::InvariantViolation("sorted list out of order".into()));
        }

        let stakes = tm
            .trove_owners()
            .iter()
            .map(|owner| tm.get_trove_stake(*owner))
            .try_fold(0u128, safe_add)?;
        if stakes != tm.total_stakes() {
            return Err(Error::InvariantViolation(format!(
                "stakes sum {} differs from total stakes {}",
                stakes,
                tm.total_stakes()
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn sp_frontend_tag(pool: &StabilityPool, depositor: Address) -> Option<Address> {
    pool.get_deposit(depositor).and_then(|d| d.frontend_tag)
}

fn require_no_undercollateralized_troves(s: &SystemState, ctx: &ExecutionContext) -> Result<()> {
    if let Some(last) = s.components.sorted_troves.get_last() {
        let icr = s.trove_manager.get_current_icr(last, ctx.price)?;
        if icr < s.params.min_collateral_ratio {
            return Err(Error::UndercollateralizedTroves);
        }
    }
    Ok(())
}

fn push_deposit_events(
    events: &mut EventLog,
    ctx: &ExecutionContext,
    depositor: Address,
    frontend: Option<Address>,
    outcome: &DepositOutcome,
) {
    let timestamp = ctx.timestamp;
    if outcome.coll_gain > 0 || outcome.debt_loss > 0 {
        events.push(ProtocolEvent::CollGainWithdrawn(CollGainWithdrawnEvent {
            depositor,
            coll: outcome.coll_gain,
            debt_loss: outcome.debt_loss,
            timestamp,
        }));
    }
    if outcome.depositor_reward > 0 {
        events.push(ProtocolEvent::RewardPaid(RewardPaidEvent {
            account: depositor,
            amount: outcome.depositor_reward,
            timestamp,
        }));
    }
    if let (Some(frontend), true) = (frontend, outcome.frontend_reward > 0) {
        events.push(ProtocolEvent::RewardPaid(RewardPaidEvent {
            account: frontend,
            amount: outcome.frontend_reward,
            timestamp,
        }));
    }
    events.push(ProtocolEvent::StabilityDepositUpdated(StabilityDepositEvent {
        depositor,
        deposit: outcome.new_deposit,
        timestamp,
    }));
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
