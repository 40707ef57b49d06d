//! Position model
//!
//! Per-instrument position state: direction, cost basis, unrealised P&L,
//! margin and close-out prices. Cross and isolated margining are two modes of
//! one struct rather than a type hierarchy; the instrument variant and the
//! margin mode vary independently.
//!
//! Derived values are pure functions of the position plus the market inputs
//! (last price, account available balance) passed in by the caller, so the
//! struct holds no back-references.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SimError;
use crate::instrument::Instrument;
use crate::types::{Direction, Money, Symbol};

/// Classification of a trade's impact on a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionEffect {
    /// Open a flat position
    Open,
    /// Extend an existing position on the same side
    GetMore,
    /// Reduce the position without closing it
    ClosePart,
    /// Close the position exactly
    Close,
    /// Close the position and open one on the opposite side
    CloseAndOpen,
}

/// Margin mode of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    /// All free account equity backs the position
    Cross,
    /// A user-chosen fixed amount backs the position
    Isolated { maint_margin: Money },
}

/// A per-instrument position.
///
/// Quantity is signed; `quantity == 0` implies `open_price == 0`. Positions
/// start cross and flat.
#[derive(Debug, Clone)]
pub struct Position {
    instrument: Arc<Instrument>,
    pub quantity: Money,
    pub open_price: Money,
    mode: MarginMode,
}

impl Position {
    pub fn new(instrument: Arc<Instrument>) -> Self {
        Self {
            instrument,
            quantity: Money::ZERO,
            open_price: Money::ZERO,
            mode: MarginMode::Cross,
        }
    }

    /// Rebuild a position from persisted state
    pub fn restore(
        instrument: Arc<Instrument>,
        quantity: Money,
        open_price: Money,
        mode: MarginMode,
    ) -> Self {
        Self {
            instrument,
            quantity,
            open_price,
            mode,
        }
    }

    pub fn instrument(&self) -> &Arc<Instrument> {
        &self.instrument
    }

    pub fn mode(&self) -> MarginMode {
        self.mode
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self.mode, MarginMode::Isolated { .. })
    }

    pub fn direction(&self) -> Direction {
        if self.quantity.is_negative() {
            Direction::Short
        } else {
            Direction::Long
        }
    }

    // ------------------------------------------------------------------
    // Trade application
    // ------------------------------------------------------------------

    /// Classify a trade by its signed execution quantity.
    /// Pure in (position quantity, trade quantity).
    pub fn effect_of(&self, exec_quantity: Money) -> PositionEffect {
        if self.quantity.is_zero() {
            PositionEffect::Open
        } else if (self.quantity * exec_quantity).is_positive() {
            PositionEffect::GetMore
        } else if self.quantity.abs() > exec_quantity.abs() {
            PositionEffect::ClosePart
        } else if self.quantity.abs() == exec_quantity.abs() {
            PositionEffect::Close
        } else {
            PositionEffect::CloseAndOpen
        }
    }

    /// Apply an execution to the cost basis and quantity
    pub fn apply(&mut self, exec_price: Money, exec_quantity: Money) {
        match self.effect_of(exec_quantity) {
            PositionEffect::Open => {
                self.open_price = exec_price;
                self.quantity = exec_quantity;
            }
            PositionEffect::GetMore => {
                let total = self.quantity + exec_quantity;
                self.open_price =
                    (self.open_price * self.quantity + exec_price * exec_quantity) / total;
                self.quantity = total;
            }
            PositionEffect::ClosePart => {
                self.quantity += exec_quantity;
            }
            PositionEffect::Close => {
                self.quantity = Money::ZERO;
                self.open_price = Money::ZERO;
            }
            PositionEffect::CloseAndOpen => {
                self.quantity += exec_quantity;
                self.open_price = exec_price;
            }
        }
    }

    // ------------------------------------------------------------------
    // Derived values
    // ------------------------------------------------------------------

    pub fn market_value(&self, last_price: Money) -> Money {
        self.quantity.abs() * last_price
    }

    pub fn open_value(&self) -> Money {
        self.quantity.abs() * self.open_price
    }

    /// Unrealised P&L including the taker fee a close-out at the last price
    /// would cost
    pub fn unrealised_pnl(&self, last_price: Money) -> Money {
        let market_value = self.market_value(last_price);
        let open_value = self.open_value();
        let profit = match self.direction() {
            Direction::Long => market_value - open_value,
            Direction::Short => open_value - market_value,
        };
        profit - market_value * self.instrument.taker_fee
    }

    pub fn open_init_margin(&self) -> Money {
        self.open_value() * self.instrument.init_margin_rate
    }

    pub fn last_init_margin(&self, last_price: Money) -> Money {
        self.market_value(last_price) * self.instrument.init_margin_rate
    }

    pub fn min_open_maint_margin(&self) -> Money {
        self.open_value() * self.instrument.maint_margin_rate
    }

    pub fn min_last_maint_margin(&self, last_price: Money) -> Money {
        self.market_value(last_price) * self.instrument.maint_margin_rate
    }

    /// The margin currently backing this position.
    ///
    /// Cross: the account's free equity plus the initial margin of the open
    /// value. Isolated: the stored amount.
    pub fn maint_margin(&self, _last_price: Money, available_balance: Money) -> Money {
        match self.mode {
            MarginMode::Cross => available_balance + self.open_init_margin(),
            MarginMode::Isolated { maint_margin } => maint_margin,
        }
    }

    /// This position's contribution to the account's `position_margin`
    pub fn position_margin(&self, last_price: Money) -> Money {
        match self.mode {
            MarginMode::Cross => {
                self.market_value(last_price)
                    * (self.instrument.init_margin_rate + self.instrument.taker_fee)
            }
            MarginMode::Isolated { maint_margin } => maint_margin,
        }
    }

    /// Effective leverage. Undefined on a cross position.
    pub fn leverage(&self, last_price: Money) -> Result<Money, SimError> {
        match self.mode {
            MarginMode::Cross => Err(SimError::MarginUndefined),
            MarginMode::Isolated { maint_margin } => {
                Ok(self.market_value(last_price) / maint_margin)
            }
        }
    }

    /// Price at which the backing margin falls to the minimum maintenance
    /// margin and the position is force-closed
    pub fn liq_price(&self, last_price: Money, available_balance: Money) -> Money {
        self.close_out_price(
            self.maint_margin(last_price, available_balance),
            self.instrument.maint_margin_rate,
        )
    }

    /// Price at which the position's equity reaches zero
    pub fn bankruptcy_price(&self, last_price: Money, available_balance: Money) -> Money {
        self.close_out_price(self.maint_margin(last_price, available_balance), Money::ZERO)
    }

    /// Solve `margin + pnl(price) - close_fee(price) = maint_rate * |Q| * price`
    /// for price; `maint_rate == 0` gives the bankruptcy price.
    fn close_out_price(&self, margin: Money, maint_rate: Money) -> Money {
        let margin_per_unit = margin / self.quantity.abs();
        let fee = self.instrument.taker_fee;
        match self.direction() {
            Direction::Long => {
                (self.open_price - margin_per_unit) / (Money::ONE - fee - maint_rate)
            }
            Direction::Short => {
                (self.open_price + margin_per_unit) / (Money::ONE + fee + maint_rate)
            }
        }
    }

    /// Whether the backing margin has fallen below the minimum
    pub fn is_liquidatable(&self, last_price: Money, available_balance: Money) -> bool {
        !self.quantity.is_zero()
            && self.maint_margin(last_price, available_balance)
                < self.min_last_maint_margin(last_price)
    }

    // ------------------------------------------------------------------
    // Margin mode transitions
    // ------------------------------------------------------------------

    /// Switch to isolated mode with a fixed maintenance margin.
    ///
    /// Fails with `margin-not-enough` (leaving the mode unchanged) when the
    /// requested amount is below the initial margin at the last price or
    /// above the account's available balance.
    pub fn set_maint_margin(
        &mut self,
        value: Money,
        last_price: Money,
        available_balance: Money,
    ) -> Result<(), SimError> {
        if value > available_balance {
            return Err(SimError::MarginNotEnough(format!(
                "requested margin {value} is more than the available balance {available_balance}"
            )));
        }
        let init_margin = self.last_init_margin(last_price);
        if value < init_margin {
            return Err(SimError::MarginNotEnough(format!(
                "requested margin {value} is less than the init margin {init_margin}"
            )));
        }
        self.mode = MarginMode::Isolated { maint_margin: value };
        Ok(())
    }

    /// Switch to isolated mode at a target leverage
    /// (maintenance margin = market value / leverage)
    pub fn set_leverage(
        &mut self,
        leverage: Money,
        last_price: Money,
        available_balance: Money,
    ) -> Result<(), SimError> {
        let margin = self.market_value(last_price) / leverage;
        self.set_maint_margin(margin, last_price, available_balance)
    }

    /// Restore cross mode
    pub fn set_cross(&mut self) {
        self.mode = MarginMode::Cross;
    }
}

// ============================================================================
// Position manager
// ============================================================================

/// Owns the {instrument -> position} mapping of one account.
/// Lookup lazily creates flat positions.
#[derive(Debug, Default)]
pub struct PositionManager {
    positions: HashMap<Symbol, Position>,
}

impl PositionManager {
    pub fn get(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn get_or_create(&mut self, instrument: &Arc<Instrument>) -> &mut Position {
        self.positions
            .entry(instrument.symbol.clone())
            .or_insert_with(|| Position::new(Arc::clone(instrument)))
    }

    pub fn get_mut(&mut self, symbol: &Symbol) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn insert(&mut self, position: Position) {
        self.positions
            .insert(position.instrument().symbol.clone(), position);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &Position)> {
        self.positions.iter()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
