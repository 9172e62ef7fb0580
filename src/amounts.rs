//! Conversion between on-chain raw token amounts and ledger decimals.
//!
//! Raw amounts are 256-bit unsigned integers; the ledger carries fixed-point
//! NUMERIC(38,18) decimals. Floating point is never used for balances.

use alloy::primitives::U256;
use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, Zero};
use eyre::{eyre, Result};

/// Divide a raw amount by 10^decimals.
pub fn raw_to_decimal(raw: U256, decimals: u8) -> BigDecimal {
    let digits = BigInt::parse_bytes(raw.to_string().as_bytes(), 10).unwrap_or_default();
    BigDecimal::new(digits, decimals as i64)
}

/// Multiply a decimal amount by 10^decimals, truncating any sub-unit dust.
pub fn decimal_to_raw(amount: &BigDecimal, decimals: u8) -> Result<U256> {
    if amount.sign() == bigdecimal::num_bigint::Sign::Minus {
        return Err(eyre!("raw amount cannot be negative: {amount}"));
    }
    let scaled = amount.with_scale(decimals as i64);
    let (digits, _) = scaled.into_bigint_and_exponent();
    U256::from_str_radix(&digits.to_string(), 10)
        .map_err(|e| eyre!("amount {amount} does not fit a uint256: {e}"))
}

/// Parse a decimal amount from its wire string form.
pub fn parse_decimal(s: &str) -> Result<BigDecimal> {
    s.parse::<BigDecimal>()
        .map_err(|e| eyre!("invalid decimal amount {s:?}: {e}"))
}

pub fn is_positive(amount: &BigDecimal) -> bool {
    !amount.is_zero() && amount.sign() == bigdecimal::num_bigint::Sign::Plus
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_raw_to_decimal() {
        let raw = U256::from(1_500_000u64);
        assert_eq!(
            raw_to_decimal(raw, 6),
            BigDecimal::from_str("1.5").unwrap()
        );
        assert_eq!(raw_to_decimal(U256::ZERO, 18), BigDecimal::zero());
    }

    #[test]
    fn test_decimal_to_raw() {
        let amount = BigDecimal::from_str("3.25").unwrap();
        assert_eq!(decimal_to_raw(&amount, 6).unwrap(), U256::from(3_250_000u64));
    }

    #[test]
    fn test_decimal_to_raw_truncates_dust() {
        let amount = BigDecimal::from_str("0.1234567").unwrap();
        assert_eq!(decimal_to_raw(&amount, 6).unwrap(), U256::from(123_456u64));
    }

    #[test]
    fn test_round_trip_whole_units() {
        let raw = U256::from(42_000_000_000_000_000_000u128);
        let dec = raw_to_decimal(raw, 18);
        assert_eq!(dec, BigDecimal::from(42));
        assert_eq!(decimal_to_raw(&dec, 18).unwrap(), raw);
    }

    #[test]
    fn test_negative_rejected() {
        let amount = BigDecimal::from_str("-1").unwrap();
        assert!(decimal_to_raw(&amount, 6).is_err());
    }

    #[test]
    fn test_is_positive() {
        assert!(is_positive(&BigDecimal::from_str("0.0001").unwrap()));
        assert!(!is_positive(&BigDecimal::zero()));
        assert!(!is_positive(&BigDecimal::from_str("-2").unwrap()));
    }
}
