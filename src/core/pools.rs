//! Pool ledgers and native collateral accounts.
//!
//! Collateral moves between holders only through
//! [`CollateralReceiver::receive_collateral`], and the sending side debits its
//! balance only after the receiver accepted the transfer. A rejected transfer
//! therefore leaves both ledgers untouched.

use serde::{Deserialize, Serialize};
use crate::core::access::{AccessList, Role};
use crate::error::{Error, Result};
use crate::utils::crypto::Address;
use crate::utils::journal::{JournaledMap, Saved, Transactional};
use crate::utils::math::{safe_add, safe_sub};

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERAL RECEIVER
// ═══════════════════════════════════════════════════════════════════════════════

/// Anything that can be credited native collateral
pub trait CollateralReceiver {
    /// Address of the receiver
    fn address(&self) -> Address;

    /// Credit `amount` sent by `sender`
    fn receive_collateral(&mut self, sender: Address, amount: u128) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// NATIVE ACCOUNTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Native collateral balances of external accounts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Accounts {
    balances: JournaledMap<Address, u128>,
}

impl Accounts {
    /// Empty account set
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance of `account`
    pub fn balance_of(&self, account: Address) -> u128 {
        self.balances.get(&account).copied().unwrap_or(0)
    }

    /// Add native funds to `account`
    pub fn credit(&mut self, account: Address, amount: u128) -> Result<()> {
        let balance = safe_add(self.balance_of(account), amount)?;
        self.balances.insert(account, balance);
        Ok(())
    }

    /// Remove native funds from `account`
    pub fn debit(&mut self, account: Address, amount: u128) -> Result<()> {
        let available = self.balance_of(account);
        if available < amount {
            return Err(Error::insufficient(&account.to_hex(), amount, available));
        }
        if available == amount {
            self.balances.remove(&account);
        } else {
            self.balances.insert(account, available - amount);
        }
        Ok(())
    }

    /// Sum over all accounts
    pub fn total(&self) -> u128 {
        self.balances.values().fold(0u128, |acc, b| acc.saturating_add(*b))
    }

    /// Borrow one account as a collateral receiver
    pub fn wallet(&mut self, account: Address) -> Wallet<'_> {
        Wallet {
            accounts: self,
            account,
        }
    }
}

/// A single external account viewed as a [`CollateralReceiver`]
pub struct Wallet<'a> {
    accounts: &'a mut Accounts,
    account: Address,
}

impl CollateralReceiver for Wallet<'_> {
    fn address(&self) -> Address {
        self.account
    }

    fn receive_collateral(&mut self, _sender: Address, amount: u128) -> Result<()> {
        self.accounts.credit(self.account, amount)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACTIVE POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Collateral and debt of active troves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePool {
    address: Address,
    coll: u128,
    debt: u128,
    access: AccessList,
    #[serde(skip)]
    saved: Saved<(u128, u128)>,
}

impl ActivePool {
    /// Create an empty pool at `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            coll: 0,
            debt: 0,
            access: AccessList::new("active_pool"),
            saved: Saved::default(),
        }
    }

    /// Wire trusted callers; only once
    pub fn set_addresses(
        &mut self,
        borrower_operations: Address,
        trove_manager: Address,
        stability_pool: Address,
        default_pool: Address,
    ) -> Result<()> {
        self.access.configure([
            (Role::BorrowerOperations, borrower_operations),
            (Role::TroveManager, trove_manager),
            (Role::StabilityPool, stability_pool),
            (Role::DefaultPool, default_pool),
        ])
    }

    /// Collateral held
    pub fn get_coll(&self) -> u128 {
        self.coll
    }

    /// Debt recorded
    pub fn get_debt(&self) -> u128 {
        self.debt
    }

    /// Send collateral to `to`
    pub fn send_collateral(
        &mut self,
        caller: Address,
        to: &mut dyn CollateralReceiver,
        amount: u128,
    ) -> Result<()> {
        self.access.require(
            caller,
            &[Role::BorrowerOperations, Role::TroveManager, Role::StabilityPool],
            "send_collateral",
        )?;
        let remaining = self
            .coll
            .checked_sub(amount)
            .ok_or_else(|| Error::insufficient("active_pool", amount, self.coll))?;
        if amount > 0 {
            to.receive_collateral(self.address, amount)?;
        }
        self.coll = remaining;
        tracing::debug!(to = %to.address().short(), amount, "active pool sent collateral");
        Ok(())
    }

    /// Record additional debt
    pub fn increase_debt(&mut self, caller: Address, amount: u128) -> Result<()> {
        self.access
            .require(caller, &[Role::BorrowerOperations, Role::TroveManager], "increase_debt")?;
        self.debt = safe_add(self.debt, amount)?;
        Ok(())
    }

    /// Record repaid or cancelled debt
    pub fn decrease_debt(&mut self, caller: Address, amount: u128) -> Result<()> {
        self.access.require(
            caller,
            &[Role::BorrowerOperations, Role::TroveManager, Role::StabilityPool],
            "decrease_debt",
        )?;
        self.debt = self
            .debt
            .checked_sub(amount)
            .ok_or_else(|| Error::insufficient("active_pool debt", amount, self.debt))?;
        Ok(())
    }
}

impl CollateralReceiver for ActivePool {
    fn address(&self) -> Address {
        self.address
    }

    fn receive_collateral(&mut self, sender: Address, amount: u128) -> Result<()> {
        // Stability pool sends collateral gains that are moved into troves
        self.access.require(
            sender,
            &[Role::BorrowerOperations, Role::DefaultPool, Role::StabilityPool],
            "receive_collateral",
        )?;
        self.coll = safe_add(self.coll, amount)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEFAULT POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Liquidated collateral and debt awaiting redistribution to troves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultPool {
    address: Address,
    coll: u128,
    debt: u128,
    access: AccessList,
    #[serde(skip)]
    saved: Saved<(u128, u128)>,
}

impl DefaultPool {
    /// Create an empty pool at `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            coll: 0,
            debt: 0,
            access: AccessList::new("default_pool"),
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

    /// Collateral held
    pub fn get_coll(&self) -> u128 {
        self.coll
    }

    /// Debt recorded
    pub fn get_debt(&self) -> u128 {
        self.debt
    }

    /// Move collateral back into the active pool
    pub fn send_collateral_to_active_pool(
        &mut self,
        caller: Address,
        active_pool: &mut ActivePool,
        amount: u128,
    ) -> Result<()> {
        self.access
            .require(caller, &[Role::TroveManager], "send_collateral_to_active_pool")?;
        let remaining = self
            .coll
            .checked_sub(amount)
            .ok_or_else(|| Error::insufficient("default_pool", amount, self.coll))?;
        if amount > 0 {
            active_pool.receive_collateral(self.address, amount)?;
        }
        self.coll = remaining;
        Ok(())
    }

    /// Record debt pending redistribution
    pub fn increase_debt(&mut self, caller: Address, amount: u128) -> Result<()> {
        self.access.require(caller, &[Role::TroveManager], "increase_debt")?;
        self.debt = safe_add(self.debt, amount)?;
        Ok(())
    }

    /// Record debt moved back to the active pool
    pub fn decrease_debt(&mut self, caller: Address, amount: u128) -> Result<()> {
        self.access.require(caller, &[Role::TroveManager], "decrease_debt")?;
        self.debt = safe_sub(self.debt, amount)
            .map_err(|_| Error::insufficient("default_pool debt", amount, self.debt))?;
        Ok(())
    }
}

impl CollateralReceiver for DefaultPool {
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

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERAL SURPLUS POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Collateral owed to borrowers whose troves were closed by the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollSurplusPool {
    address: Address,
    coll: u128,
    claims: JournaledMap<Address, u128>,
    access: AccessList,
    #[serde(skip)]
    saved: Saved<u128>,
}

impl CollSurplusPool {
    /// Create an empty pool at `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            coll: 0,
            claims: JournaledMap::new(),
            access: AccessList::new("coll_surplus_pool"),
            saved: Saved::default(),
        }
    }

    /// Wire trusted callers; only once
    pub fn set_addresses(
        &mut self,
        borrower_operations: Address,
        trove_manager: Address,
        active_pool: Address,
    ) -> Result<()> {
        self.access.configure([
            (Role::BorrowerOperations, borrower_operations),
            (Role::TroveManager, trove_manager),
            (Role::ActivePool, active_pool),
        ])
    }

    /// Collateral held
    pub fn get_coll(&self) -> u128 {
        self.coll
    }

    /// Claimable collateral of `account`
    pub fn get_collateral(&self, account: Address) -> u128 {
        self.claims.get(&account).copied().unwrap_or(0)
    }

    /// Add `amount` to the claim of `account`
    pub fn account_surplus(&mut self, caller: Address, account: Address, amount: u128) -> Result<()> {
        self.access.require(caller, &[Role::TroveManager], "account_surplus")?;
        let claim = safe_add(self.get_collateral(account), amount)?;
        self.claims.insert(account, claim);
        Ok(())
    }

    /// Pay out the whole claim of `account` to `to`
    pub fn claim_collateral(
        &mut self,
        caller: Address,
        account: Address,
        to: &mut dyn CollateralReceiver,
    ) -> Result<u128> {
        self.access
            .require(caller, &[Role::BorrowerOperations], "claim_collateral")?;
        let claim = self.get_collateral(account);
        if claim == 0 {
            return Err(Error::InvalidParameter {
                name: "account".into(),
                reason: format!("no collateral available to claim for {}", account),
            });
        }
        let remaining = self
            .coll
            .checked_sub(claim)
            .ok_or_else(|| Error::InvariantViolation("surplus claims exceed pool balance".into()))?;
        to.receive_collateral(self.address, claim)?;
        self.coll = remaining;
        self.claims.remove(&account);
        Ok(claim)
    }
}

impl CollateralReceiver for CollSurplusPool {
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

// ═══════════════════════════════════════════════════════════════════════════════
// ROLLBACK
// ═══════════════════════════════════════════════════════════════════════════════

impl Transactional for Accounts {
    fn begin(&mut self) {
        self.balances.begin();
    }

    fn commit(&mut self) {
        self.balances.commit();
    }

    fn rollback(&mut self) {
        self.balances.rollback();
    }
}

impl Transactional for ActivePool {
    fn begin(&mut self) {
        self.saved.save((self.coll, self.debt));
    }

    fn commit(&mut self) {
        self.saved.clear();
    }

    fn rollback(&mut self) {
        if let Some((coll, debt)) = self.saved.take() {
            self.coll = coll;
            self.debt = debt;
        }
    }
}

impl Transactional for DefaultPool {
    fn begin(&mut self) {
        self.saved.save((self.coll, self.debt));
    }

    fn commit(&mut self) {
        self.saved.clear();
    }

    fn rollback(&mut self) {
        if let Some((coll, debt)) = self.saved.take() {
            self.coll = coll;
            self.debt = debt;
        }
    }
}

impl Transactional for CollSurplusPool {
    fn begin(&mut self) {
        self.saved.save(self.coll);
        self.claims.begin();
    }

    fn commit(&mut self) {
        self.saved.clear();
        self.claims.commit();
    }

    fn rollback(&mut self) {
        if let Some(coll) = self.saved.take() {
            self.coll = coll;
        }
        self.claims.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct Fixture {
        bo: Address,
        tm: Address,
        sp: Address,
        active: ActivePool,
        default: DefaultPool,
        surplus: CollSurplusPool,
    }

    fn fixture() -> Fixture {
        let bo = Address::derive("bo");
        let tm = Address::derive("tm");
        let sp = Address::derive("sp");
        let mut active = ActivePool::new(Address::derive("active"));
        let mut default = DefaultPool::new(Address::derive("default"));
        let mut surplus = CollSurplusPool::new(Address::derive("surplus"));
        active
            .set_addresses(bo, tm, sp, default.address())
            .unwrap();
        default.set_addresses(tm, active.address()).unwrap();
        surplus.set_addresses(bo, tm, active.address()).unwrap();
        Fixture {
            bo,
            tm,
            sp,
            active,
            default,
            surplus,
        }
    }

    #[test]
    fn test_active_pool_receive_and_send() {
        let mut f = fixture();
        f.active.receive_collateral(f.bo, 100).unwrap();
        f.active.increase_debt(f.bo, 50).unwrap();
        assert_eq!(f.active.get_coll(), 100);
        assert_eq!(f.active.get_debt(), 50);

        f.active.send_collateral(f.tm, &mut f.default, 40).unwrap();
        assert_eq!(f.active.get_coll(), 60);
        assert_eq!(f.default.get_coll(), 40);
    }

    #[test]
    fn test_unauthorized_caller_rejected() {
        let mut f = fixture();
        let mallory = Address::derive("mallory");

        let err = f.active.receive_collateral(mallory, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert_eq!(
            f.active.increase_debt(f.sp, 1).unwrap_err().kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            f.default.increase_debt(f.bo, 1).unwrap_err().kind(),
            ErrorKind::Authorization
        );
        assert!(f.active.set_addresses(f.bo, f.tm, f.sp, mallory).is_err());
    }

    #[test]
    fn test_overdraw_is_atomic() {
        let mut f = fixture();
        f.active.receive_collateral(f.bo, 10).unwrap();

        let err = f.active.send_collateral(f.tm, &mut f.default, 11).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
        assert_eq!(f.active.get_coll(), 10);
        assert_eq!(f.default.get_coll(), 0);

        assert!(f.active.decrease_debt(f.tm, 1).is_err());
    }

    #[test]
    fn test_rejected_receive_keeps_sender_balance() {
        let mut f = fixture();
        f.active.receive_collateral(f.bo, 10).unwrap();
        f.active.send_collateral(f.tm, &mut f.default, 10).unwrap();

        // Default pool only ever sends to the active pool's address
        let mut stray = ActivePool::new(Address::derive("stray"));
        let err = f
            .default
            .send_collateral_to_active_pool(f.tm, &mut stray, 5)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert_eq!(f.default.get_coll(), 10);
    }

    #[test]
    fn test_surplus_claim() {
        let mut f = fixture();
        let alice = Address::derive("alice");
        let mut accounts = Accounts::new();

        f.active.receive_collateral(f.bo, 7).unwrap();
        f.active.send_collateral(f.tm, &mut f.surplus, 7).unwrap();
        f.surplus.account_surplus(f.tm, alice, 7).unwrap();
        assert_eq!(f.surplus.get_collateral(alice), 7);

        let claimed = f
            .surplus
            .claim_collateral(f.bo, alice, &mut accounts.wallet(alice))
            .unwrap();
        assert_eq!(claimed, 7);
        assert_eq!(accounts.balance_of(alice), 7);
        assert_eq!(f.surplus.get_coll(), 0);
        assert!(f
            .surplus
            .claim_collateral(f.bo, alice, &mut accounts.wallet(alice))
            .is_err());
    }

    #[test]
    fn test_accounts_debit() {
        let mut accounts = Accounts::new();
        let bob = Address::derive("bob");
        accounts.credit(bob, 5).unwrap();
        assert!(accounts.debit(bob, 6).is_err());
        accounts.debit(bob, 5).unwrap();
        assert_eq!(accounts.balance_of(bob), 0);
        assert_eq!(accounts.total(), 0);
    }

    #[test]
    fn test_rollback_restores_ledgers() {
        let mut f = fixture();
        let alice = Address::derive("alice");
        f.active.receive_collateral(f.bo, 10).unwrap();
        f.active.increase_debt(f.bo, 4).unwrap();

        f.active.begin();
        f.surplus.begin();
        f.active.send_collateral(f.tm, &mut f.surplus, 6).unwrap();
        f.active.decrease_debt(f.tm, 4).unwrap();
        f.surplus.account_surplus(f.tm, alice, 6).unwrap();
        f.active.rollback();
        f.surplus.rollback();

        assert_eq!(f.active.get_coll(), 10);
        assert_eq!(f.active.get_debt(), 4);
        assert_eq!(f.surplus.get_coll(), 0);
        assert_eq!(f.surplus.get_collateral(alice), 0);
    }
}
