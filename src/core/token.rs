//! Debt token ledger.
//!
//! The stable asset minted against troves. Only Borrower Operations mints;
//! Trove Manager, Stability Pool and Borrower Operations burn. The Stability
//! Pool and Trove Manager move balances in and out of pools without an
//! allowance.

use serde::{Deserialize, Serialize};
use crate::core::access::{AccessList, Role};
use crate::error::{Error, Result};
use crate::utils::crypto::{Address, StateHash};
use crate::utils::journal::{JournaledMap, Saved, Transactional};
use crate::utils::math::safe_add;

// ═══════════════════════════════════════════════════════════════════════════════
// DEBT TOKEN
// ═══════════════════════════════════════════════════════════════════════════════

/// The protocol's stable asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebtToken {
    /// Token name
    pub name: String,
    /// Token symbol
    pub symbol: String,
    /// Decimal places
    pub decimals: u8,
    address: Address,
    total_supply: u128,
    balances: JournaledMap<Address, u128>,
    allowances: JournaledMap<(Address, Address), u128>,
    access: AccessList,
    #[serde(skip)]
    saved: Saved<u128>,
}

impl DebtToken {
    /// Create an empty token at `address`
    pub fn new(address: Address) -> Self {
        Self {
            name: "Trove USD".to_string(),
            symbol: "TUSD".to_string(),
            decimals: 18,
            address,
            total_supply: 0,
            balances: JournaledMap::new(),
            allowances: JournaledMap::new(),
            access: AccessList::new("debt_token"),
            saved: Saved::default(),
        }
    }

    /// Wire trusted callers; only once
    pub fn set_addresses(
        &mut self,
        borrower_operations: Address,
        trove_manager: Address,
        stability_pool: Address,
    ) -> Result<()> {
        self.access.configure([
            (Role::BorrowerOperations, borrower_operations),
            (Role::TroveManager, trove_manager),
            (Role::StabilityPool, stability_pool),
        ])
    }

    /// Token address
    pub fn address(&self) -> Address {
        self.address
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Get total supply
    pub fn total_supply(&self) -> u128 {
        self.total_supply
    }

    /// Get balance of an address
    pub fn balance_of(&self, owner: Address) -> u128 {
        self.balances.get(&owner).copied().unwrap_or(0)
    }

    /// Remaining allowance of `spender` over `owner`'s balance
    pub fn allowance(&self, owner: Address, spender: Address) -> u128 {
        self.allowances.get(&(owner, spender)).copied().unwrap_or(0)
    }

    /// Verify supply invariant (total_supply == sum of all balances)
    pub fn verify_supply_invariant(&self) -> bool {
        let sum = self
            .balances
            .values()
            .fold(0u128, |acc, b| acc.saturating_add(*b));
        sum == self.total_supply
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PRIVILEGED OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Mint new tokens to `to`
    pub fn mint(&mut self, caller: Address, to: Address, amount: u128) -> Result<()> {
        self.access.require(caller, &[Role::BorrowerOperations], "mint")?;
        if to.is_zero() {
            return Err(Error::InvalidParameter {
                name: "to".into(),
                reason: "cannot mint to the zero address".into(),
            });
        }
        self.total_supply = safe_add(self.total_supply, amount)?;
        self.credit(to, amount)
    }

    /// Burn tokens held by `from`
    pub fn burn(&mut self, caller: Address, from: Address, amount: u128) -> Result<()> {
        self.access.require(
            caller,
            &[Role::BorrowerOperations, Role::TroveManager, Role::StabilityPool],
            "burn",
        )?;
        self.debit(from, amount)?;
        self.total_supply = self
            .total_supply
            .checked_sub(amount)
            .ok_or_else(|| Error::InvariantViolation("burn exceeds total supply".into()))?;
        Ok(())
    }

    /// Move a depositor's tokens into `pool`
    pub fn send_to_pool(
        &mut self,
        caller: Address,
        from: Address,
        pool: Address,
        amount: u128,
    ) -> Result<()> {
        self.access
            .require(caller, &[Role::StabilityPool], "send_to_pool")?;
        self.move_balance(from, pool, amount)
    }

    /// Move tokens held by `pool` out to `to`
    pub fn return_from_pool(
        &mut self,
        caller: Address,
        pool: Address,
        to: Address,
        amount: u128,
    ) -> Result<()> {
        self.access.require(
            caller,
            &[Role::TroveManager, Role::StabilityPool],
            "return_from_pool",
        )?;
        self.require_valid_recipient(to)?;
        self.move_balance(pool, to, amount)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // HOLDER OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Transfer tokens between accounts
    pub fn transfer(&mut self, from: Address, to: Address, amount: u128) -> Result<()> {
        self.require_valid_recipient(to)?;
        self.move_balance(from, to, amount)
    }

    /// Set `spender`'s allowance over `owner`'s balance
    pub fn approve(&mut self, owner: Address, spender: Address, amount: u128) -> Result<()> {
        if spender.is_zero() {
            return Err(Error::InvalidParameter {
                name: "spender".into(),
                reason: "zero address".into(),
            });
        }
        self.allowances.insert((owner, spender), amount);
        Ok(())
    }

    /// Spend an allowance to move `owner`'s tokens
    pub fn transfer_from(
        &mut self,
        spender: Address,
        owner: Address,
        to: Address,
        amount: u128,
    ) -> Result<()> {
        self.require_valid_recipient(to)?;
        let allowed = self.allowance(owner, spender);
        if allowed < amount {
            return Err(Error::insufficient("allowance", amount, allowed));
        }
        self.move_balance(owner, to, amount)?;
        self.allowances.insert((owner, spender), allowed - amount);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INTERNAL
    // ═══════════════════════════════════════════════════════════════════════════

    fn require_valid_recipient(&self, to: Address) -> Result<()> {
        if to.is_zero() || to == self.address || self.access.is_component(to) {
            return Err(Error::InvalidParameter {
                name: "to".into(),
                reason: format!("cannot transfer tokens directly to {}", to),
            });
        }
        Ok(())
    }

    fn move_balance(&mut self, from: Address, to: Address, amount: u128) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.debit(from, amount)?;
        self.credit(to, amount)
    }

    fn credit(&mut self, to: Address, amount: u128) -> Result<()> {
        let balance = safe_add(self.balance_of(to), amount)?;
        if balance > 0 {
            self.balances.insert(to, balance);
        }
        Ok(())
    }

    fn debit(&mut self, from: Address, amount: u128) -> Result<()> {
        let available = self.balance_of(from);
        if available < amount {
            return Err(Error::insufficient(&from.to_hex(), amount, available));
        }
        if available == amount {
            self.balances.remove(&from);
        } else {
            self.balances.insert(from, available - amount);
        }
        Ok(())
    }

    /// Hash of supply and balances
    pub fn state_hash(&self) -> StateHash {
        let mut data = Vec::new();
        data.extend_from_slice(&self.total_supply.to_be_bytes());
        for (holder, balance) in &self.balances {
            data.extend_from_slice(holder.as_bytes());
            data.extend_from_slice(&balance.to_be_bytes());
        }
        StateHash::sha256(&data)
    }
}

impl Transactional for DebtToken {
    fn begin(&mut self) {
        self.saved.save(self.total_supply);
        self.balances.begin();
        self.allowances.begin();
    }

    fn commit(&mut self) {
        self.saved.clear();
        self.balances.commit();
        self.allowances.commit();
    }

    fn rollback(&mut self) {
        if let Some(total_supply) = self.saved.take() {
            self.total_supply = total_supply;
        }
        self.balances.rollback();
        self.allowances.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn token() -> (DebtToken, Address, Address, Address) {
        let bo = Address::derive("bo");
        let tm = Address::derive("tm");
        let sp = Address::derive("sp");
        let mut token = DebtToken::new(Address::derive("token"));
        token.set_addresses(bo, tm, sp).unwrap();
        (token, bo, tm, sp)
    }

    #[test]
    fn test_mint_only_by_borrower_operations() {
        let (mut token, bo, tm, _) = token();
        let alice = Address::derive("alice");

        token.mint(bo, alice, 100).unwrap();
        assert_eq!(token.balance_of(alice), 100);
        assert_eq!(token.total_supply(), 100);

        let err = token.mint(tm, alice, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = token.mint(alice, alice, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[test]
    fn test_mint_to_zero_address_fails() {
        let (mut token, bo, _, _) = token();
        assert!(token.mint(bo, Address::ZERO, 1).is_err());
        assert_eq!(token.total_supply(), 0);
    }

    #[test]
    fn test_burn() {
        let (mut token, bo, tm, sp) = token();
        let alice = Address::derive("alice");
        token.mint(bo, alice, 100).unwrap();

        token.burn(tm, alice, 30).unwrap();
        token.burn(sp, alice, 30).unwrap();
        assert_eq!(token.balance_of(alice), 40);
        assert!(token.burn(alice, alice, 1).is_err());
        assert!(token.burn(bo, alice, 41).is_err());
        assert!(token.verify_supply_invariant());
    }

    #[test]
    fn test_transfer_rules() {
        let (mut token, bo, _, sp) = token();
        let alice = Address::derive("alice");
        let bob = Address::derive("bob");
        token.mint(bo, alice, 100).unwrap();

        token.transfer(alice, bob, 25).unwrap();
        assert_eq!(token.balance_of(bob), 25);

        assert!(token.transfer(alice, Address::ZERO, 1).is_err());
        assert!(token.transfer(alice, sp, 1).is_err());
        assert!(token.transfer(alice, token.address(), 1).is_err());
        assert!(token.transfer(bob, alice, 26).is_err());
    }

    #[test]
    fn test_allowance() {
        let (mut token, bo, _, _) = token();
        let alice = Address::derive("alice");
        let bob = Address::derive("bob");
        let carol = Address::derive("carol");
        token.mint(bo, alice, 100).unwrap();

        token.approve(alice, bob, 40).unwrap();
        token.transfer_from(bob, alice, carol, 30).unwrap();
        assert_eq!(token.allowance(alice, bob), 10);
        assert_eq!(token.balance_of(carol), 30);
        assert!(token.transfer_from(bob, alice, carol, 11).is_err());
    }

    #[test]
    fn test_pool_moves() {
        let (mut token, bo, tm, sp) = token();
        let alice = Address::derive("alice");
        token.mint(bo, alice, 100).unwrap();

        token.send_to_pool(sp, alice, sp, 60).unwrap();
        assert_eq!(token.balance_of(sp), 60);
        assert!(token.send_to_pool(tm, alice, sp, 1).is_err());

        token.return_from_pool(sp, sp, alice, 10).unwrap();
        assert_eq!(token.balance_of(alice), 50);
    }

    #[test]
    fn test_state_hash_deterministic() {
        let (mut a, bo, _, _) = token();
        let (mut b, _, _, _) = token();
        let alice = Address::derive("alice");
        a.mint(bo, alice, 5).unwrap();
        b.mint(bo, alice, 5).unwrap();
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_rollback_restores_balances_and_allowances() {
        let (mut token, bo, _, _) = token();
        let alice = Address::derive("alice");
        let bob = Address::derive("bob");
        token.mint(bo, alice, 100).unwrap();
        let before = token.state_hash();

        token.begin();
        token.mint(bo, bob, 50).unwrap();
        token.transfer(alice, bob, 100).unwrap();
        token.approve(bob, alice, 10).unwrap();
        token.rollback();

        assert_eq!(token.state_hash(), before);
        assert_eq!(token.balance_of(alice), 100);
        assert_eq!(token.balance_of(bob), 0);
        assert_eq!(token.allowance(bob, alice), 0);
        assert!(token.verify_supply_invariant());
    }
}
