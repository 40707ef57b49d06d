//! Order state machine and immutable trade facts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::instrument::Instrument;
use crate::types::{Direction, Money, Side};

pub type OrderId = u64;

pub type TradeId = u64;

// Ids come from process-wide monotonic counters, so they are unique within a
// simulation (and across concurrent simulations in one process). Matching
// visits orders in id order, which makes fills deterministic.
struct IdSequence(AtomicU64);

impl IdSequence {
    const fn new() -> Self {
        IdSequence(AtomicU64::new(1))
    }

    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

static ORDER_IDS: IdSequence = IdSequence::new();
static TRADE_IDS: IdSequence = IdSequence::new();

/// Allocate the next order id
pub fn next_order_id() -> OrderId {
    ORDER_IDS.next()
}

/// Allocate the next trade id
pub fn next_trade_id() -> TradeId {
    TRADE_IDS.next()
}

/// Order type - determines matching logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Execute immediately at the current last price
    Market,

    /// Execute at the configured price once the market crosses it.
    /// Buy limit: fills when last price <= limit price.
    /// Sell limit: fills when last price >= limit price.
    Limit,

    /// Converts to a market order when the trigger is reached.
    /// Buy stop: triggers when last price >= trigger.
    /// Sell stop: triggers when last price <= trigger.
    StopMarket,

    /// Converts to a limit order when the trigger is reached
    StopLimit,
}

/// Order state machine
///
/// `New -> (Triggered) -> PartiallyFilled -> Filled`, or `New -> Cancelled`,
/// or `New -> Rejected`. Filled, Cancelled and Rejected are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Triggered,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_open(self) -> bool {
        matches!(
            self,
            OrderStatus::New | OrderStatus::Triggered | OrderStatus::PartiallyFilled
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }
}

/// A resting or completed order.
///
/// Quantity is signed: positive buys, negative sells. The instrument is
/// shared, not owned.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub instrument: Arc<Instrument>,
    pub quantity: Money,
    pub traded_quantity: Money,
    pub price: Option<Money>,
    pub trigger_price: Option<Money>,
    pub kind: OrderType,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        instrument: Arc<Instrument>,
        quantity: Money,
        price: Option<Money>,
        trigger_price: Option<Money>,
        kind: OrderType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: next_order_id(),
            instrument,
            quantity,
            traded_quantity: Money::ZERO,
            price,
            trigger_price,
            kind,
            status: OrderStatus::New,
            created_at,
        }
    }

    pub fn side(&self) -> Side {
        if self.quantity.is_negative() {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    pub fn direction(&self) -> Direction {
        if self.quantity.is_negative() {
            Direction::Short
        } else {
            Direction::Long
        }
    }

    /// Signed quantity still to be executed
    pub fn remain_quantity(&self) -> Money {
        self.quantity - self.traded_quantity
    }

    /// Notional of the unexecuted part at the limit price
    pub fn remain_value(&self) -> Money {
        self.remain_quantity().abs() * self.price.unwrap_or(Money::ZERO)
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// The price this order currently rests at as a limit, if any
    pub(crate) fn resting_limit_price(&self) -> Option<Money> {
        if !self.is_open() {
            return None;
        }
        match self.kind {
            OrderType::Limit => self.price,
            OrderType::StopLimit if self.status != OrderStatus::New => self.price,
            _ => None,
        }
    }

    /// Record an execution and advance the state machine
    pub(crate) fn record_fill(&mut self, exec_quantity: Money) {
        self.traded_quantity += exec_quantity;
        self.status = if self.remain_quantity().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }
}

/// An immutable execution record.
///
/// The execution quantity keeps the order's sign so accounting can add it to
/// position quantity directly. Commission keeps the fee rate's sign, so a
/// maker rebate shows up as a negative commission.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: TradeId,
    pub order_id: OrderId,
    pub instrument: Arc<Instrument>,
    pub exec_price: Money,
    pub exec_quantity: Money,
    pub commission: Money,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    pub fn new(
        order: &Order,
        exec_price: Money,
        exec_quantity: Money,
        fee_rate: Money,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: next_trade_id(),
            order_id: order.id,
            instrument: Arc::clone(&order.instrument),
            exec_price,
            exec_quantity,
            commission: (exec_price * exec_quantity).abs() * fee_rate,
            timestamp,
        }
    }

    /// Executed notional, always positive
    pub fn value(&self) -> Money {
        (self.exec_price * self.exec_quantity).abs()
    }
}
