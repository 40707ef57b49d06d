//! Core data types used across the simulation engine

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Money - Fixed-Point Arithmetic for Prices, Quantities and Balances
// ============================================================================

/// Fixed-point monetary value.
///
/// Every price, quantity, fee rate, margin and balance in the engine is a
/// `Money` backed by `rust_decimal::Decimal`. The accounting has to replay
/// exchange arithmetic exactly over long fill sequences, which rules out
/// binary floats.
///
/// # Example
/// ```
/// use futures_sim::Money;
/// let notional = Money::from_i64(100) * Money::from_f64(6500.5);
/// assert_eq!(notional, Money::from_f64(650050.0));
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const ONE: Money = Money(Decimal::ONE);

    /// Lossy conversion from a binary float. Non-finite inputs map to zero.
    pub fn from_f64(value: f64) -> Self {
        match Decimal::from_f64(value) {
            Some(d) => Money(d),
            None => Money::ZERO,
        }
    }

    /// Lossy conversion for reporting and approximate assertions
    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or_default()
    }

    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Strictly greater than zero
    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Strictly less than zero
    pub fn is_negative(self) -> bool {
        self.0 < Decimal::ZERO
    }
}

macro_rules! forward_binop {
    ($op:ident, $method:ident, $token:tt) => {
        impl ops::$op for Money {
            type Output = Money;
            fn $method(self, rhs: Money) -> Money {
                Money(self.0 $token rhs.0)
            }
        }
    };
}

forward_binop!(Add, add, +);
forward_binop!(Sub, sub, -);
forward_binop!(Mul, mul, *);

impl ops::Div for Money {
    type Output = Money;

    /// A zero divisor yields zero: derived ratios read "no basis" as zero
    /// rather than panicking mid-simulation.
    fn div(self, rhs: Money) -> Money {
        if rhs.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl ops::SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        *self = *self - rhs;
    }
}

impl ops::Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        Money(iter.map(|m| m.0).sum())
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.copied().sum()
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ============================================================================
// Symbol
// ============================================================================

/// Interned contract symbol.
///
/// Orders, trades and position keys all carry the symbol, so it is stored
/// as a shared `Arc<str>`; cloning is a reference-count bump, not a heap
/// copy. Serialises as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: impl AsRef<str>) -> Self {
        Symbol(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Symbol::new)
    }
}

// ============================================================================
// Sides and Directions
// ============================================================================

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Position direction. A flat position counts as long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

// ============================================================================
// K-line bars
// ============================================================================

/// Validation errors for k-line data
#[derive(Debug, Error)]
pub enum KlineValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: Money, low: Money },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(Money),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: Money, low: Money, high: Money },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange {
        close: Money,
        low: Money,
        high: Money,
    },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: Money,
        high: Money,
        low: Money,
        close: Money,
    },
}

/// OHLCV bar over one driver interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub timestamp: DateTime<Utc>,
    pub open: Money,
    pub high: Money,
    pub low: Money,
    pub close: Money,
    pub volume: Money,
    pub turnover: Money,
}

impl Kline {
    /// Create a new bar with validation
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Money,
        high: Money,
        low: Money,
        close: Money,
        volume: Money,
        turnover: Money,
    ) -> Result<Self, KlineValidationError> {
        let bar = Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            turnover,
        };
        bar.validate()?;
        Ok(bar)
    }

    /// Validate the bar data
    pub fn validate(&self) -> Result<(), KlineValidationError> {
        if !self.open.is_positive()
            || !self.high.is_positive()
            || !self.low.is_positive()
            || !self.close.is_positive()
        {
            return Err(KlineValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(KlineValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume.is_negative() {
            return Err(KlineValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(KlineValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(KlineValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

// ============================================================================
// Tests
// ============================================================================
