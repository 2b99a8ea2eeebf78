//! Precision-safe money and probability types.
//!
//! Wraps `rust_decimal::Decimal` so balances, prices, PnL and fees are never
//! represented as binary floating point. `Usd` carries dollar amounts;
//! `Probability` carries a market outcome's 0..1 price.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usd(pub Decimal);

impl Usd {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    #[inline]
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    #[inline]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Percentage of this amount, e.g. `pct(Decimal::from(10))` for 10%.
    #[inline]
    pub fn pct(&self, pct: Decimal) -> Self {
        Self(self.0 * pct / Decimal::from(100))
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

impl FromStr for Usd {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Usd {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Usd {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Usd {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Usd {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Usd {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl Mul<Decimal> for Usd {
    type Output = Self;
    fn mul(self, rhs: Decimal) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl Div<Decimal> for Usd {
    type Output = Self;
    fn div(self, rhs: Decimal) -> Self::Output {
        Self(self.0 / rhs)
    }
}

/// A market outcome's price, always in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Probability(pub Decimal);

impl Probability {
    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 > Decimal::ZERO && self.0 < Decimal::ONE
    }

    /// Implied decimal odds for a binary outcome: `1/p - 1`.
    #[inline]
    pub fn odds(&self) -> Option<Decimal> {
        if self.0.is_zero() {
            None
        } else {
            Some(Decimal::ONE / self.0 - Decimal::ONE)
        }
    }

    /// Basis-point difference from another probability.
    #[inline]
    pub fn bps_from(&self, other: Probability) -> Option<Decimal> {
        if other.0.is_zero() {
            return None;
        }
        Some((self.0 - other.0) / other.0 * Decimal::from(10_000))
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Probability {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Probability {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn usd_arithmetic_preserves_precision() {
        let a = Usd::new(dec!(100.10));
        let b = Usd::new(dec!(0.05));
        assert_eq!((a - b).inner(), dec!(100.05));
    }

    #[test]
    fn usd_pct_of_bankroll() {
        let bankroll = Usd::new(dec!(1000));
        assert_eq!(bankroll.pct(dec!(10)).inner(), dec!(100.00));
    }

    #[test]
    fn probability_odds() {
        let p = Probability::new(dec!(0.25));
        assert_eq!(p.odds().unwrap(), dec!(3));
    }

    #[test]
    fn probability_bps_from() {
        let p1 = Probability::new(dec!(0.50));
        let p2 = Probability::new(dec!(0.55));
        assert_eq!(p2.bps_from(p1).unwrap(), dec!(1000));
    }

    #[test]
    fn probability_validity_bounds() {
        assert!(!Probability::new(Decimal::ZERO).is_valid());
        assert!(!Probability::new(Decimal::ONE).is_valid());
        assert!(Probability::new(dec!(0.5)).is_valid());
    }
}
