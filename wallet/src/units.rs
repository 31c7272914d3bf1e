//! Conversion between display amounts and on-chain base units

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{Result, TransferError};

/// Largest scale a `Decimal` can carry
pub const MAX_DECIMALS: u8 = 28;

/// `amount × 10^decimals`, truncated toward zero
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<u128> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(TransferError::InvalidAmount(format!("negative amount {}", amount)));
    }
    if decimals > MAX_DECIMALS {
        return Err(TransferError::InvalidAmount(format!("{} decimals", decimals)));
    }

    let scale = Decimal::from_i128_with_scale(10i128.pow(decimals as u32), 0);
    amount
        .checked_mul(scale)
        .and_then(|units| units.trunc().to_u128())
        .ok_or_else(|| TransferError::InvalidAmount(format!("{} overflows base units", amount)))
}

/// `units / 10^decimals`
pub fn from_base_units(units: u128, decimals: u8) -> Result<Decimal> {
    if decimals > MAX_DECIMALS {
        return Err(TransferError::InvalidAmount(format!("{} decimals", decimals)));
    }
    let units = i128::try_from(units)
        .map_err(|_| TransferError::InvalidAmount(format!("{} base units", units)))?;
    Decimal::try_from_i128_with_scale(units, decimals as u32)
        .map(|d| d.normalize())
        .map_err(|_| TransferError::InvalidAmount(format!("{} base units", units)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_base_units() {
        assert_eq!(to_base_units(Decimal::new(15, 1), 9).unwrap(), 1_500_000_000);
        assert_eq!(to_base_units(Decimal::ZERO, 9).unwrap(), 0);
        // Sub-unit dust is dropped
        assert_eq!(to_base_units(Decimal::new(1_234_567, 6), 2).unwrap(), 123);
        assert!(to_base_units(Decimal::NEGATIVE_ONE, 9).is_err());
        assert!(to_base_units(Decimal::ONE, 29).is_err());
    }

    #[test]
    fn test_from_base_units() {
        assert_eq!(from_base_units(1_500_000_000, 9).unwrap(), Decimal::new(15, 1));
        assert_eq!(from_base_units(42, 0).unwrap(), Decimal::from(42));
        assert!(from_base_units(u128::MAX, 9).is_err());
    }
}
