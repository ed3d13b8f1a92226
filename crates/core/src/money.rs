use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Signed amount at two-decimal precision, held as minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "Decimal", try_from = "Decimal")]
pub struct Money(i64);

impl Money {
    pub fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    /// Exact conversion. `None` for more than two decimal places or a value
    /// outside the symmetric `i64` minor-unit range.
    pub fn from_decimal(decimal: Decimal) -> Option<Self> {
        if decimal.normalize().scale() > 2 {
            return None;
        }
        Self::from_rounded(decimal)
    }

    /// Rounds half away from zero to the minor unit first.
    pub fn from_decimal_rounded(decimal: Decimal) -> Option<Self> {
        Self::from_rounded(decimal.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }

    fn from_rounded(decimal: Decimal) -> Option<Self> {
        decimal
            .checked_mul(Decimal::ONE_HUNDRED)
            .and_then(|d| d.to_i64())
            .filter(|minor| *minor != i64::MIN)
            .map(Money)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, 2)
    }

    /// Multiply by an exchange rate, rounding the result to the minor unit.
    pub fn convert(self, rate: Decimal) -> Option<Self> {
        self.to_decimal().checked_mul(rate).and_then(Money::from_decimal_rounded)
    }

    pub fn zero() -> Self {
        Money(0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_abs(self) -> Option<Self> {
        self.0.checked_abs().map(Money)
    }

    pub fn checked_neg(self) -> Option<Self> {
        self.0.checked_neg().map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl FromStr for Money {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = s.trim().replace(',', "");
        let decimal =
            Decimal::from_str(&clean).map_err(|_| format!("Invalid amount: '{}'", s.trim()))?;
        Money::from_decimal(decimal)
            .ok_or_else(|| format!("Amount out of range or below one cent: '{}'", s.trim()))
    }
}

impl From<Money> for Decimal {
    fn from(m: Money) -> Self {
        m.to_decimal()
    }
}

impl TryFrom<Decimal> for Money {
    type Error = String;

    fn try_from(d: Decimal) -> Result<Self, Self::Error> {
        Money::from_decimal(d).ok_or_else(|| format!("Amount out of range or below one cent: {d}"))
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Money(self.0 - rhs.0)
    }
}
