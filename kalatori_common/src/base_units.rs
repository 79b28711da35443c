use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use serde::{Deserialize, Serialize};
use sqlx::Type;
use thiserror::Error;

use crate::op;

/// Currencies with more decimals than this cannot be represented in 64-bit base units with a useful range.
pub const MAX_DECIMALS: u8 = 18;

//--------------------------------------     BaseUnits       ---------------------------------------------------------
/// An amount expressed in the smallest indivisible unit of a currency (plancks for DOT, etc.).
///
/// All arithmetic and comparisons in the payment engine are carried out in base units so that the
/// `repaid >= amount` check is exact. Conversion to and from human-readable amounts requires the currency's
/// decimal precision.
#[derive(Debug, Clone, Copy, Default, Type, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[sqlx(transparent)]
pub struct BaseUnits(i64);

op!(binary BaseUnits, Add, add);
op!(binary BaseUnits, Sub, sub);
op!(inplace BaseUnits, AddAssign, add_assign);
op!(inplace BaseUnits, SubAssign, sub_assign);

impl Sum for BaseUnits {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Value cannot be represented in base units: {0}")]
pub struct BaseUnitsConversionError(String);

impl From<i64> for BaseUnits {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl TryFrom<u128> for BaseUnits {
    type Error = BaseUnitsConversionError;

    fn try_from(value: u128) -> Result<Self, Self::Error> {
        i64::try_from(value)
            .map(Self)
            .map_err(|_| BaseUnitsConversionError(format!("{value} is too large to convert to base units")))
    }
}

impl Display for BaseUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}u", self.0)
    }
}

impl BaseUnits {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Converts a human-readable amount (e.g. `12.5` DOT) into base units, rounding to the nearest unit.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn from_human(amount: f64, decimals: u8) -> Result<Self, BaseUnitsConversionError> {
        if decimals > MAX_DECIMALS {
            return Err(BaseUnitsConversionError(format!("{decimals} decimals is more than {MAX_DECIMALS}")));
        }
        if !amount.is_finite() || amount < 0.0 {
            return Err(BaseUnitsConversionError(format!("{amount} is not a valid amount")));
        }
        let scaled = (amount * 10f64.powi(i32::from(decimals))).round();
        if scaled >= i64::MAX as f64 {
            return Err(BaseUnitsConversionError(format!("{amount} overflows at {decimals} decimals")));
        }
        Ok(Self(scaled as i64))
    }

    /// Converts the amount into human-readable units for display and for the order representation.
    #[allow(clippy::cast_precision_loss)]
    pub fn to_human(&self, decimals: u8) -> f64 {
        self.0 as f64 / 10f64.powi(i32::from(decimals))
    }
}

/// Like [`BaseUnits::to_human`], for on-chain amounts that may not fit in base units.
#[allow(clippy::cast_precision_loss)]
pub fn raw_to_human(amount: u128, decimals: u8) -> f64 {
    amount as f64 / 10f64.powi(i32::from(decimals))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn human_conversion() {
        let hundred_dot = BaseUnits::from_human(100.0, 10).unwrap();
        assert_eq!(hundred_dot.value(), 1_000_000_000_000);
        assert_eq!(hundred_dot.to_human(10), 100.0);
        let half = BaseUnits::from_human(0.5, 6).unwrap();
        assert_eq!(half, BaseUnits::from(500_000));
        assert_eq!(BaseUnits::from_human(0.1, 10).unwrap().value(), 1_000_000_000);
    }

    #[test]
    fn invalid_human_amounts() {
        assert!(BaseUnits::from_human(-1.0, 10).is_err());
        assert!(BaseUnits::from_human(f64::NAN, 10).is_err());
        assert!(BaseUnits::from_human(f64::INFINITY, 10).is_err());
        assert!(BaseUnits::from_human(1.0, 19).is_err());
        assert!(BaseUnits::from_human(1e10, 18).is_err());
    }

    #[test]
    fn arithmetic() {
        let a = BaseUnits::from(50);
        let b = BaseUnits::from(75);
        assert_eq!(a + b, BaseUnits::from(125));
        assert_eq!(b - a, BaseUnits::from(25));
        let total: BaseUnits = vec![a, b, a].into_iter().sum();
        assert_eq!(total.value(), 175);
        assert!(BaseUnits::try_from(u128::MAX).is_err());
        assert_eq!(BaseUnits::try_from(42u128).unwrap().value(), 42);
        assert_eq!(a.checked_add(b), Some(BaseUnits::from(125)));
        assert_eq!(BaseUnits::from(i64::MAX).checked_add(a), None);
    }

    #[test]
    fn raw_amounts_beyond_base_units() {
        assert_eq!(raw_to_human(1_500_000, 6), 1.5);
        assert!(raw_to_human(u128::MAX, 10) > 1e28);
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&BaseUnits::from(42)).unwrap();
        assert_eq!(json, "42");
    }
}
