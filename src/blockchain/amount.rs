use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Number of decimal places a coin is divisible into
pub const DECIMALS: u32 = 8;

/// Base units in one whole coin
pub const UNITS_PER_COIN: u64 = 10u64.pow(DECIMALS);

/// Errors that can occur when parsing amounts
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Too many decimal places (max 8): {0}")]
    TooPrecise(String),

    #[error("Amount overflow: {0}")]
    Overflow(String),
}

/// An unsigned currency amount stored as fixed-point base units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Creates an amount from raw base units
    pub const fn from_units(units: u64) -> Self {
        Amount(units)
    }

    /// Creates an amount from whole coins
    pub const fn coins(coins: u64) -> Self {
        Amount(coins * UNITS_PER_COIN)
    }

    /// Gets the raw base units
    pub fn units(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Halves the amount, rounding down to the nearest base unit
    pub fn halved(self) -> Amount {
        Amount(self.0 / 2)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:0width$}",
            self.0 / UNITS_PER_COIN,
            self.0 % UNITS_PER_COIN,
            width = DECIMALS as usize
        )
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (s, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(AmountError::InvalidAmount(s.to_string()));
        }
        if frac.len() > DECIMALS as usize {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let parse = |part: &str| -> Result<u64, AmountError> {
            if part.is_empty() {
                return Ok(0);
            }
            if !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(AmountError::InvalidAmount(s.to_string()));
            }
            part.parse::<u64>()
                .map_err(|_| AmountError::Overflow(s.to_string()))
        };

        let whole_units = parse(whole)?
            .checked_mul(UNITS_PER_COIN)
            .ok_or_else(|| AmountError::Overflow(s.to_string()))?;
        let frac_units = parse(frac)? * 10u64.pow(DECIMALS - frac.len() as u32);

        whole_units
            .checked_add(frac_units)
            .map(Amount)
            .ok_or_else(|| AmountError::Overflow(s.to_string()))
    }
}

/// A signed balance; wallets are not prevented from overspending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Balance(i128);

impl Balance {
    pub const ZERO: Balance = Balance(0);

    pub fn units(&self) -> i128 {
        self.0
    }

    pub fn credit(&mut self, amount: Amount) {
        self.0 += i128::from(amount.units());
    }

    pub fn debit(&mut self, amount: Amount) {
        self.0 -= i128::from(amount.units());
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Balance(i128::from(amount.units()))
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per_coin = u128::from(UNITS_PER_COIN);
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / per_coin,
            abs % per_coin,
            width = DECIMALS as usize
        )
    }
}
