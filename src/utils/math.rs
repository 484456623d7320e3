//! Fixed-point arithmetic and collateral-ratio helpers.
//!
//! All amounts are 18-decimal `u128` values. Products of two such values can
//! exceed `u128`, so multiplications that feed a division go through `U256`.

use primitive_types::U256;

use crate::error::{Error, Result};
use crate::utils::constants::{
    DECIMAL_PRECISION, MAX_DECAY_MINUTES, NICR_PRECISION,
};

// ═══════════════════════════════════════════════════════════════════════════════
// SAFE ARITHMETIC OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Safe addition with overflow check
pub fn safe_add(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b).ok_or(Error::Overflow {
        operation: format!("{} + {}", a, b),
    })
}

/// Safe subtraction with underflow check
pub fn safe_sub(a: u128, b: u128) -> Result<u128> {
    a.checked_sub(b).ok_or(Error::Underflow {
        operation: format!("{} - {}", a, b),
    })
}

/// Safe multiplication with overflow check
pub fn safe_mul(a: u128, b: u128) -> Result<u128> {
    a.checked_mul(b).ok_or(Error::Overflow {
        operation: format!("{} * {}", a, b),
    })
}

/// Narrow a `U256` back to `u128`
pub fn to_u128(value: U256, operation: &str) -> Result<u128> {
    if value > U256::from(u128::MAX) {
        return Err(Error::Overflow {
            operation: operation.to_string(),
        });
    }
    Ok(value.low_u128())
}

/// Computes `(a * b) / c` with a 256-bit intermediate, rounding down
pub fn mul_div(a: u128, b: u128, c: u128) -> Result<u128> {
    if c == 0 {
        return Err(Error::InvalidParameter {
            name: "divisor".into(),
            reason: "division by zero".into(),
        });
    }
    let result = U256::from(a) * U256::from(b) / U256::from(c);
    to_u128(result, "mul_div")
}

/// Computes `(a * b) / c` with a 256-bit intermediate, rounding up
pub fn mul_div_up(a: u128, b: u128, c: u128) -> Result<u128> {
    if c == 0 {
        return Err(Error::InvalidParameter {
            name: "divisor".into(),
            reason: "division by zero".into(),
        });
    }
    let numerator = U256::from(a) * U256::from(b);
    let divisor = U256::from(c);
    let result = (numerator + divisor - U256::one()) / divisor;
    to_u128(result, "mul_div_up")
}

/// Multiply two 18-decimal values, rounding half up
pub fn dec_mul(x: u128, y: u128) -> Result<u128> {
    let product = U256::from(x) * U256::from(y) + U256::from(DECIMAL_PRECISION / 2);
    to_u128(product / U256::from(DECIMAL_PRECISION), "dec_mul")
}

/// Raise an 18-decimal base to an integer power by repeated squaring.
///
/// The exponent is capped at [`MAX_DECAY_MINUTES`]; with `base < 1` the result
/// is already zero long before that.
pub fn dec_pow(base: u128, minutes: u64) -> Result<u128> {
    let mut n = minutes.min(MAX_DECAY_MINUTES);
    if n == 0 {
        return Ok(DECIMAL_PRECISION);
    }

    let mut y = DECIMAL_PRECISION;
    let mut x = base;
    while n > 1 {
        if n % 2 == 1 {
            y = dec_mul(x, y)?;
        }
        x = dec_mul(x, x)?;
        n /= 2;
    }
    dec_mul(x, y)
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERALIZATION CALCULATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Collateral ratio at `price` (1e18 = 100%); `u128::MAX` when there is no debt
pub fn compute_cr(coll: u128, debt: u128, price: u128) -> u128 {
    if debt == 0 {
        return u128::MAX;
    }
    mul_div(coll, price, debt).unwrap_or(u128::MAX)
}

/// Nominal collateral ratio, independent of price (`coll * 1e20 / debt`)
pub fn compute_nominal_cr(coll: u128, debt: u128) -> u128 {
    if debt == 0 {
        return u128::MAX;
    }
    mul_div(coll, NICR_PRECISION, debt).unwrap_or(u128::MAX)
}

/// Collateral value at `price`
pub fn collateral_value(coll: u128, price: u128) -> Result<u128> {
    mul_div(coll, price, DECIMAL_PRECISION)
}

/// Divide `amount * 1e18 + carried_error` by `divisor`.
///
/// Returns the quotient and the new remainder to carry into the next call, so
/// repeated distributions lose no value to truncation.
pub fn div_with_error(amount: u128, carried_error: u128, divisor: u128) -> Result<(u128, u128)> {
    if divisor == 0 {
        return Err(Error::InvalidParameter {
            name: "divisor".into(),
            reason: "division by zero".into(),
        });
    }
    let numerator = U256::from(amount) * U256::from(DECIMAL_PRECISION) + U256::from(carried_error);
    let divisor = U256::from(divisor);
    let quotient = to_u128(numerator / divisor, "div_with_error")?;
    let remainder = (numerator % divisor).low_u128();
    Ok((quotient, remainder))
}
