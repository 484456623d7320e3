//! Reward issuance capability feeding the stability pool.
//!
//! Issuance is expressed as a cumulative amount at a given time so that the
//! stability pool only has to remember the last cumulative value it saw.

use serde::{Deserialize, Serialize};

/// Schedule of reward tokens issued to stability pool depositors
pub trait RewardIssuance {
    /// Total issued from genesis up to `timestamp`
    fn cumulative_issuance(&self, timestamp: u64) -> u128;
}

/// No rewards
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NoIssuance;

impl RewardIssuance for NoIssuance {
    fn cumulative_issuance(&self, _timestamp: u64) -> u128 {
        0
    }
}

/// Constant rate from `start` until `cap` is reached
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinearIssuance {
    /// First second of issuance
    pub start: u64,
    /// Tokens per second
    pub rate_per_second: u128,
    /// Maximum total issuance
    pub cap: u128,
}

impl LinearIssuance {
    /// Schedule issuing `rate_per_second` from `start`, never exceeding `cap`
    pub fn new(start: u64, rate_per_second: u128, cap: u128) -> Self {
        Self {
            start,
            rate_per_second,
            cap,
        }
    }
}

impl RewardIssuance for LinearIssuance {
    fn cumulative_issuance(&self, timestamp: u64) -> u128 {
        let elapsed = u128::from(timestamp.saturating_sub(self.start));
        elapsed.saturating_mul(self.rate_per_second).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_issuance() {
        let schedule = LinearIssuance::new(100, 5, 1_000);
        assert_eq!(schedule.cumulative_issuance(50), 0);
        assert_eq!(schedule.cumulative_issuance(110), 50);
        assert_eq!(schedule.cumulative_issuance(10_000), 1_000);
        assert_eq!(NoIssuance.cumulative_issuance(10_000), 0);
    }
}
