//! Caller allow-lists for privileged component operations.
//!
//! Each component owns an [`AccessList`] mapping the [`Role`]s it trusts to
//! concrete addresses. The list is configured exactly once during system
//! assembly; until then every privileged call is rejected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::utils::crypto::Address;

/// Protocol components that may appear as privileged callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Borrower-facing entry points
    BorrowerOperations,
    /// Trove lifecycle, liquidation and redemption
    TroveManager,
    /// Stability pool
    StabilityPool,
    /// Pool of collateral and debt of active troves
    ActivePool,
    /// Pool of collateral and debt pending redistribution
    DefaultPool,
    /// Claimable collateral of liquidated or redeemed borrowers
    CollSurplusPool,
    /// Holder of the per-trove gas reserve
    GasPool,
    /// Debt token ledger
    DebtToken,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::BorrowerOperations => "borrower_operations",
            Role::TroveManager => "trove_manager",
            Role::StabilityPool => "stability_pool",
            Role::ActivePool => "active_pool",
            Role::DefaultPool => "default_pool",
            Role::CollSurplusPool => "coll_surplus_pool",
            Role::GasPool => "gas_pool",
            Role::DebtToken => "debt_token",
        };
        write!(f, "{}", name)
    }
}

/// Set-once mapping of trusted roles to addresses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessList {
    component: String,
    roles: BTreeMap<Role, Address>,
    configured: bool,
}

impl AccessList {
    /// Empty, unconfigured list owned by `component`
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            roles: BTreeMap::new(),
            configured: false,
        }
    }

    /// Configure the trusted roles. Fails on a second call.
    pub fn configure(&mut self, roles: impl IntoIterator<Item = (Role, Address)>) -> Result<()> {
        if self.configured {
            return Err(Error::AddressesAlreadySet(self.component.clone()));
        }
        for (role, address) in roles {
            if address.is_zero() {
                return Err(Error::InvalidParameter {
                    name: role.to_string(),
                    reason: "zero address".into(),
                });
            }
            self.roles.insert(role, address);
        }
        self.configured = true;
        Ok(())
    }

    /// Whether `configure` has run
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Address configured for `role`
    pub fn address_of(&self, role: Role) -> Option<Address> {
        self.roles.get(&role).copied()
    }

    /// Whether `address` is any of the configured roles
    pub fn is_component(&self, address: Address) -> bool {
        self.roles.values().any(|a| *a == address)
    }

    /// Reject `caller` unless it holds one of `allowed`
    pub fn require(&self, caller: Address, allowed: &[Role], operation: &str) -> Result<()> {
        let permitted = allowed
            .iter()
            .filter_map(|role| self.roles.get(role))
            .any(|address| *address == caller);

        if permitted {
            Ok(())
        } else {
            Err(Error::unauthorized(
                caller,
                &format!("{}::{}", self.component, operation),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_unconfigured_rejects_everyone() {
        let list = AccessList::new("active_pool");
        let err = list
            .require(Address::derive("tm"), &[Role::TroveManager], "send_collateral")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[test]
    fn test_configure_once() {
        let mut list = AccessList::new("active_pool");
        let tm = Address::derive("tm");
        list.configure([(Role::TroveManager, tm)]).unwrap();

        assert!(list.require(tm, &[Role::TroveManager], "op").is_ok());
        assert!(list.require(tm, &[Role::BorrowerOperations], "op").is_err());
        assert!(list
            .require(Address::derive("mallory"), &[Role::TroveManager], "op")
            .is_err());

        let err = list.configure([(Role::TroveManager, tm)]).unwrap_err();
        assert!(matches!(err, Error::AddressesAlreadySet(_)));
    }

    #[test]
    fn test_zero_address_rejected() {
        let mut list = AccessList::new("token");
        assert!(list.configure([(Role::StabilityPool, Address::ZERO)]).is_err());
        assert!(!list.is_configured());
    }
}
