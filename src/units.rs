//! Fixed-point amount conversion
//!
//! Every payout amount is carried as a smallest-unit `U256` (amount × 10^18).
//! Decimal strings only appear at the edges: reward comments on the way in and
//! leaderboards on the way out. Summing in smallest units keeps totals exact.

use alloy_primitives::U256;
use thiserror::Error;

/// All supported tokens (DAI, WXDAI) use 18 decimal places
pub const TOKEN_DECIMALS: u8 = 18;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitsError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount '{0}'")]
    Invalid(String),
    #[error("amount '{0}' overflows 256 bits")]
    Overflow(String),
}

/// Convert a decimal amount string such as `"17.5"` into smallest units.
///
/// Digits beyond 18 decimal places are truncated.
pub fn parse_units(amount: &str) -> Result<U256, UnitsError> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(UnitsError::Empty);
    }

    let (integer, fraction) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };
    if integer.is_empty() && fraction.is_empty() {
        return Err(UnitsError::Invalid(amount.to_string()));
    }
    if !integer.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(UnitsError::Invalid(amount.to_string()));
    }

    let exponent = TOKEN_DECIMALS as usize;
    let fraction = if fraction.len() > exponent {
        &fraction[..exponent]
    } else {
        fraction
    };

    let mut digits = String::with_capacity(integer.len() + exponent);
    digits.push_str(integer);
    digits.push_str(fraction);
    for _ in fraction.len()..exponent {
        digits.push('0');
    }

    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 10).map_err(|_| UnitsError::Overflow(amount.to_string()))
}

/// Convert smallest units back to a decimal string, trimming trailing zeros.
///
/// `17_500_000_000_000_000_000` formats as `"17.5"`, whole amounts carry no
/// fractional part.
pub fn format_units(value: U256) -> String {
    let divisor = U256::from(10u64).pow(U256::from(TOKEN_DECIMALS));
    let integer = value / divisor;
    let fraction = value % divisor;

    if fraction.is_zero() {
        return integer.to_string();
    }

    let fraction = format!("{:0>width$}", fraction.to_string(), width = TOKEN_DECIMALS as usize);
    format!("{}.{}", integer, fraction.trim_end_matches('0'))
}

/// Parse an unsigned integer that may be written in decimal or `0x` hex.
pub fn parse_uint(value: &str) -> Result<U256, UnitsError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(UnitsError::Empty);
    }
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some("") => Ok(U256::ZERO),
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(value, 10),
    };
    parsed.map_err(|_| UnitsError::Invalid(value.to_string()))
}
