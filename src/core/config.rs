//! Protocol configuration and parameters.
//!
//! All parameters are fixed when a [`crate::protocol::System`] is assembled.
//! They come from [`ProtocolParams::default`] (the constants in
//! [`crate::utils::constants`]), optionally overridden from a JSON file or
//! `TROVE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::utils::constants::*;

// ═══════════════════════════════════════════════════════════════════════════════
// RECOVERY CEILING
// ═══════════════════════════════════════════════════════════════════════════════

/// Upper bound (exclusive) of the ICR band liquidatable in recovery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryCeiling {
    /// Troves with MCR <= ICR < TCR
    #[default]
    Tcr,
    /// Troves with MCR <= ICR < CCR
    Ccr,
}

impl std::str::FromStr for RecoveryCeiling {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcr" => Ok(RecoveryCeiling::Tcr),
            "ccr" => Ok(RecoveryCeiling::Ccr),
            other => Err(Error::InvalidParameter {
                name: "recovery_ceiling".into(),
                reason: format!("unknown ceiling '{}'", other),
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROTOCOL PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters fixed at system assembly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolParams {
    /// Minimum collateral ratio (MCR); below it a trove is liquidatable
    pub min_collateral_ratio: u128,

    /// Critical collateral ratio (CCR); TCR below it is recovery mode
    pub critical_collateral_ratio: u128,

    /// Debt reserve minted to the gas pool for every trove
    pub gas_compensation: u128,

    /// Minimum debt excluding the gas reserve
    pub min_net_debt: u128,

    /// Borrowing fee floor (1e18 = 100%)
    pub borrowing_fee_floor: u128,

    /// Borrowing fee cap (1e18 = 100%)
    pub max_borrowing_fee: u128,

    /// Redemption fee floor (1e18 = 100%)
    pub redemption_fee_floor: u128,

    /// Capacity of the sorted troves list
    pub max_sorted_size: usize,

    /// Steps a stale hint may be walked before `StaleHint`
    pub max_hint_traversal: u32,

    /// Recovery-mode liquidation band ceiling
    pub recovery_ceiling: RecoveryCeiling,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            min_collateral_ratio: MIN_COLLATERAL_RATIO,
            critical_collateral_ratio: CRITICAL_COLLATERAL_RATIO,
            gas_compensation: GAS_COMPENSATION,
            min_net_debt: MIN_NET_DEBT,
            borrowing_fee_floor: BORROWING_FEE_FLOOR,
            max_borrowing_fee: MAX_BORROWING_FEE,
            redemption_fee_floor: REDEMPTION_FEE_FLOOR,
            max_sorted_size: DEFAULT_MAX_SORTED_SIZE,
            max_hint_traversal: DEFAULT_MAX_HINT_TRAVERSAL,
            recovery_ceiling: RecoveryCeiling::Tcr,
        }
    }
}

impl ProtocolParams {
    /// Override the MCR
    pub fn with_mcr(mut self, mcr: u128) -> Self {
        self.min_collateral_ratio = mcr;
        self
    }

    /// Override the CCR
    pub fn with_ccr(mut self, ccr: u128) -> Self {
        self.critical_collateral_ratio = ccr;
        self
    }

    /// Override the sorted list capacity
    pub fn with_max_sorted_size(mut self, size: usize) -> Self {
        self.max_sorted_size = size;
        self
    }

    /// Override the hint traversal bound
    pub fn with_max_hint_traversal(mut self, steps: u32) -> Self {
        self.max_hint_traversal = steps;
        self
    }

    /// Override the recovery-mode ceiling
    pub fn with_recovery_ceiling(mut self, ceiling: RecoveryCeiling) -> Self {
        self.recovery_ceiling = ceiling;
        self
    }

    /// Override fee floors and cap
    pub fn with_fees(mut self, borrowing_floor: u128, max_borrowing: u128, redemption_floor: u128) -> Self {
        self.borrowing_fee_floor = borrowing_floor;
        self.max_borrowing_fee = max_borrowing;
        self.redemption_fee_floor = redemption_floor;
        self
    }

    /// Minimum total debt of a trove (net minimum plus gas reserve)
    pub fn min_debt(&self) -> u128 {
        self.min_net_debt.saturating_add(self.gas_compensation)
    }

    /// Check the parameters are consistent
    pub fn validate(&self) -> Result<()> {
        let invalid = |name: &str, reason: &str| Error::InvalidParameter {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if self.min_collateral_ratio < DECIMAL_PRECISION {
            return Err(invalid("min_collateral_ratio", "must be at least 100%"));
        }
        if self.critical_collateral_ratio < self.min_collateral_ratio {
            return Err(invalid("critical_collateral_ratio", "must not be below MCR"));
        }
        if self.borrowing_fee_floor > self.max_borrowing_fee {
            return Err(invalid("borrowing_fee_floor", "exceeds max_borrowing_fee"));
        }
        if self.max_borrowing_fee > DECIMAL_PRECISION || self.redemption_fee_floor > DECIMAL_PRECISION {
            return Err(invalid("fees", "must not exceed 100%"));
        }
        if self.max_sorted_size == 0 {
            return Err(invalid("max_sorted_size", "must be positive"));
        }
        if self.max_hint_traversal == 0 {
            return Err(invalid("max_hint_traversal", "must be positive"));
        }
        Ok(())
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigIo(e.to_string()))?;
        let params: Self =
            serde_json::from_str(&content).map_err(|e| Error::Deserialization(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Save to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::ConfigIo(e.to_string()))?;
            }
        }
        std::fs::write(path, content).map_err(|e| Error::ConfigIo(e.to_string()))
    }

    /// Defaults overridden by `TROVE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut params = Self::default();

        if let Some(v) = env_parse::<u128>("TROVE_MCR")? {
            params.min_collateral_ratio = v;
        }
        if let Some(v) = env_parse::<u128>("TROVE_CCR")? {
            params.critical_collateral_ratio = v;
        }
        if let Some(v) = env_parse::<u128>("TROVE_GAS_COMPENSATION")? {
            params.gas_compensation = v;
        }
        if let Some(v) = env_parse::<u128>("TROVE_MIN_NET_DEBT")? {
            params.min_net_debt = v;
        }
        if let Some(v) = env_parse::<usize>("TROVE_MAX_SORTED_SIZE")? {
            params.max_sorted_size = v;
        }
        if let Some(v) = env_parse::<u32>("TROVE_MAX_HINT_TRAVERSAL")? {
            params.max_hint_traversal = v;
        }
        if let Some(v) = env_parse::<RecoveryCeiling>("TROVE_RECOVERY_CEILING")? {
            params.recovery_ceiling = v;
        }

        params.validate()?;
        Ok(params)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::InvalidParameter {
                name: key.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_params_default() {
        let params = ProtocolParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.min_collateral_ratio, MIN_COLLATERAL_RATIO);
        assert_eq!(params.max_sorted_size, 1000);
        assert_eq!(params.min_debt(), 2_000 * DECIMAL_PRECISION);
    }

    #[test]
    fn test_validation_rejects_inverted_ratios() {
        let params = ProtocolParams::default().with_ccr(MIN_COLLATERAL_RATIO - 1);
        assert!(params.validate().is_err());

        let params = ProtocolParams::default().with_max_hint_traversal(0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");

        let params = ProtocolParams::default()
            .with_max_sorted_size(10)
            .with_recovery_ceiling(RecoveryCeiling::Ccr);
        params.save(&path).unwrap();

        let loaded = ProtocolParams::load(&path).unwrap();
        assert_eq!(loaded, params);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params: ProtocolParams = serde_json::from_str(r#"{"max_sorted_size": 5}"#).unwrap();
        assert_eq!(params.max_sorted_size, 5);
        assert_eq!(params.min_collateral_ratio, MIN_COLLATERAL_RATIO);
    }

    #[test]
    fn test_recovery_ceiling_parse() {
        assert_eq!("TCR".parse::<RecoveryCeiling>().unwrap(), RecoveryCeiling::Tcr);
        assert_eq!("ccr".parse::<RecoveryCeiling>().unwrap(), RecoveryCeiling::Ccr);
        assert!("mcr".parse::<RecoveryCeiling>().is_err());
    }
}
