//! Price feed capability.
//!
//! The protocol only ever asks for the current collateral price through
//! [`PriceFeed::fetch_price`]. A zero price or a failed fetch is fatal to any
//! ratio-dependent action.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::constants::DECIMAL_PRECISION;

// ═══════════════════════════════════════════════════════════════════════════════
// PRICE DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// A single price data point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceData {
    /// Collateral price in debt units, 18 decimals
    pub price: u128,
    /// Timestamp when price was recorded
    pub timestamp: u64,
}

impl PriceData {
    /// Create a new price data point
    pub fn new(price: u128, timestamp: u64) -> Self {
        Self { price, timestamp }
    }

    /// Format price for display
    pub fn format_price(&self) -> String {
        let whole = self.price / DECIMAL_PRECISION;
        let cents = (self.price % DECIMAL_PRECISION) / (DECIMAL_PRECISION / 100);
        format!("{}.{:02}", whole, cents)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRICE FEED
// ═══════════════════════════════════════════════════════════════════════════════

/// Source of the collateral price
pub trait PriceFeed {
    /// Current price; never zero on success
    fn fetch_price(&mut self) -> Result<u128>;

    /// Last price returned by `fetch_price`
    fn last_good_price(&self) -> u128;
}

/// Price feed driven by explicit updates, for tests and simulations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualPriceFeed {
    /// Current price
    current: PriceData,
    /// Previous price (for change detection)
    previous: PriceData,
    /// Last price successfully fetched
    last_good_price: u128,
    /// Whether fetches currently fail
    broken: bool,
}

impl ManualPriceFeed {
    /// Feed starting at `price`
    pub fn new(price: u128) -> Self {
        Self {
            current: PriceData::new(price, 0),
            last_good_price: price,
            ..Default::default()
        }
    }

    /// Set a new price
    pub fn set_price(&mut self, price: u128, timestamp: u64) {
        self.previous = self.current;
        self.current = PriceData::new(price, timestamp);
        tracing::debug!(price = %self.current.format_price(), "price updated");
    }

    /// Make subsequent fetches fail (or recover)
    pub fn set_broken(&mut self, broken: bool) {
        self.broken = broken;
    }

    /// Current data point
    pub fn current(&self) -> PriceData {
        self.current
    }

    /// Previous data point
    pub fn previous(&self) -> PriceData {
        self.previous
    }
}

impl PriceFeed for ManualPriceFeed {
    fn fetch_price(&mut self) -> Result<u128> {
        if self.broken {
            return Err(Error::PriceUnavailable("price source not responding".into()));
        }
        if self.current.price == 0 {
            return Err(Error::PriceUnavailable("price is zero".into()));
        }
        self.last_good_price = self.current.price;
        Ok(self.current.price)
    }

    fn last_good_price(&self) -> u128 {
        self.last_good_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_manual_feed() {
        let mut feed = ManualPriceFeed::new(3_000 * DECIMAL_PRECISION);
        assert_eq!(feed.fetch_price().unwrap(), 3_000 * DECIMAL_PRECISION);

        feed.set_price(2_500 * DECIMAL_PRECISION, 60);
        assert_eq!(feed.fetch_price().unwrap(), 2_500 * DECIMAL_PRECISION);
        assert_eq!(feed.previous().price, 3_000 * DECIMAL_PRECISION);
        assert_eq!(feed.current().format_price(), "2500.00");
    }

    #[test]
    fn test_zero_price_is_unavailable() {
        let mut feed = ManualPriceFeed::new(0);
        let err = feed.fetch_price().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(feed.last_good_price(), 0);
    }

    #[test]
    fn test_broken_feed() {
        let mut feed = ManualPriceFeed::new(DECIMAL_PRECISION);
        feed.fetch_price().unwrap();
        feed.set_broken(true);
        assert!(matches!(feed.fetch_price(), Err(Error::PriceUnavailable(_))));
        assert_eq!(feed.last_good_price(), DECIMAL_PRECISION);
    }
}
