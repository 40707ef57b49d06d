//! Account model
//!
//! Aggregates positions, applies trades to the wallet and reserves margin
//! for resting limit orders. Price resolution goes through the
//! [`PriceSource`] seam so the account holds no exchange back-reference;
//! persisted state is re-linked to instruments in an explicit rehydrate step.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SimError;
use crate::instrument::InstrumentRegistry;
use crate::order::{Order, Trade};
use crate::position::{MarginMode, Position, PositionEffect, PositionManager};
use crate::types::{Direction, Money, Side, Symbol};

/// Resolves the last traded price of an instrument at the observer's "now"
pub trait PriceSource {
    fn last_price(&self, symbol: &Symbol) -> Money;
}

/// A trading account on one simulated exchange
#[derive(Debug, Default)]
pub struct Account {
    pub wallet_balance: Money,
    pub positions: PositionManager,
}

impl Account {
    pub fn new(wallet_balance: Money) -> Self {
        Self {
            wallet_balance,
            positions: PositionManager::default(),
        }
    }

    /// Apply one execution: book realised P&L and commission against the
    /// wallet, then update the position's cost basis.
    ///
    /// Realised P&L is credited exactly once per closing trade, for the
    /// closed quantity at the difference between execution and open price.
    pub fn deal(&mut self, trade: &Trade) {
        let position = self.positions.get_or_create(&trade.instrument);
        let effect = position.effect_of(trade.exec_quantity);

        match effect {
            PositionEffect::Open | PositionEffect::GetMore => {}
            _ => {
                let closed_quantity = match effect {
                    PositionEffect::CloseAndOpen => position.quantity.abs(),
                    _ => trade.exec_quantity.abs(),
                };
                let profit = match position.direction() {
                    Direction::Long => {
                        (trade.exec_price - position.open_price) * closed_quantity
                    }
                    Direction::Short => {
                        (position.open_price - trade.exec_price) * closed_quantity
                    }
                };
                self.wallet_balance += profit;
                debug!(
                    symbol = %trade.instrument.symbol,
                    %profit,
                    "realised profit booked"
                );
            }
        }

        self.wallet_balance -= trade.commission;
        self.positions
            .get_or_create(&trade.instrument)
            .apply(trade.exec_price, trade.exec_quantity);
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    pub fn unrealised_pnl(&self, prices: &dyn PriceSource) -> Money {
        self.positions
            .iter()
            .map(|(symbol, position)| position.unrealised_pnl(prices.last_price(symbol)))
            .sum()
    }

    /// Wallet plus unrealised P&L
    pub fn margin_balance(&self, prices: &dyn PriceSource) -> Money {
        self.wallet_balance + self.unrealised_pnl(prices)
    }

    /// Sum of the margin held against open positions
    pub fn position_margin(&self, prices: &dyn PriceSource) -> Money {
        self.positions
            .iter()
            .map(|(symbol, position)| position.position_margin(prices.last_price(symbol)))
            .sum()
    }

    /// Margin reserved for resting limit orders.
    ///
    /// Orders are grouped by instrument. Within a group the side notionals
    /// are summed; orders opposite to the position direction offset the
    /// position quantity (cheapest price first) before adding exposure, and
    /// the larger side's residual notional is reserved at the group's
    /// initial rate plus twice the taker fee.
    pub fn order_margin(&self, open_orders: &[&Order], prices: &dyn PriceSource) -> Money {
        let groups = open_orders
            .iter()
            .filter(|order| order.resting_limit_price().is_some())
            .map(|order| (order.instrument.symbol.clone(), *order))
            .into_group_map();

        groups
            .into_iter()
            .map(|(symbol, orders)| self.instrument_order_margin(&symbol, &orders, prices))
            .sum()
    }

    fn instrument_order_margin(
        &self,
        symbol: &Symbol,
        orders: &[&Order],
        prices: &dyn PriceSource,
    ) -> Money {
        let instrument = &orders[0].instrument;
        let last_price = prices.last_price(symbol);

        let (direction, position_quantity, init_rate) = match self.positions.get(symbol) {
            Some(position) => {
                let rate = match position.leverage(last_price) {
                    Ok(leverage) => Money::ONE / leverage,
                    Err(_) => instrument.init_margin_rate,
                };
                (position.direction(), position.quantity, rate)
            }
            None => (Direction::Long, Money::ZERO, instrument.init_margin_rate),
        };

        let mut long_value = Money::ZERO;
        let mut short_value = Money::ZERO;
        let mut opposite_orders: Vec<&&Order> = Vec::new();
        for order in orders {
            match order.side() {
                Side::Buy => long_value += order.remain_value(),
                Side::Sell => short_value += order.remain_value(),
            }
            if order.direction() != direction {
                opposite_orders.push(order);
            }
        }
        opposite_orders.sort_by_key(|order| order.price.unwrap_or(Money::ZERO));

        // walk the opposite side, consuming the position quantity before any
        // remaining notional counts toward the reservation
        let mut quantity = Money::ZERO;
        let mut offset_value = Money::ZERO;
        for order in opposite_orders {
            let price = order.price.unwrap_or(Money::ZERO);
            match direction {
                Direction::Long => {
                    if quantity - order.remain_quantity() < position_quantity {
                        offset_value += order.remain_value();
                        quantity -= order.remain_quantity();
                    } else {
                        let valid_quantity = position_quantity - quantity;
                        offset_value += valid_quantity * price;
                        break;
                    }
                }
                Direction::Short => {
                    if quantity - order.remain_quantity() > position_quantity {
                        offset_value += order.remain_value();
                        quantity -= order.remain_quantity();
                    } else {
                        let valid_quantity = quantity - position_quantity;
                        offset_value += valid_quantity * price;
                        break;
                    }
                }
            }
        }

        match direction {
            Direction::Long => short_value -= offset_value,
            Direction::Short => long_value -= offset_value,
        }

        long_value.max(short_value)
            * (init_rate + instrument.taker_fee + instrument.taker_fee)
    }

    /// Equity free for new positions and orders
    pub fn available_balance(&self, open_orders: &[&Order], prices: &dyn PriceSource) -> Money {
        self.margin_balance(prices)
            - self.position_margin(prices)
            - self.order_margin(open_orders, prices)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            wallet_balance: self.wallet_balance,
            positions: self
                .positions
                .iter()
                .map(|(symbol, position)| PositionSnapshot {
                    symbol: symbol.clone(),
                    quantity: position.quantity,
                    open_price: position.open_price,
                    mode: position.mode(),
                })
                .collect(),
        }
    }

    /// Rebuild an account from a snapshot, re-linking instrument references
    /// through the registry
    pub fn from_snapshot(
        snapshot: &AccountSnapshot,
        registry: &InstrumentRegistry,
    ) -> Result<Self, SimError> {
        let mut account = Account::new(snapshot.wallet_balance);
        for row in &snapshot.positions {
            let instrument = registry.get(&row.symbol).ok_or_else(|| {
                SimError::Setting(format!(
                    "snapshot references unknown instrument {}",
                    row.symbol
                ))
            })?;
            account.positions.insert(Position::restore(
                instrument,
                row.quantity,
                row.open_price,
                row.mode,
            ));
        }
        Ok(account)
    }
}

/// Serialisable account state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub wallet_balance: Money,
    pub positions: Vec<PositionSnapshot>,
}

/// Serialisable position row of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: Symbol,
    pub quantity: Money,
    pub open_price: Money,
    pub mode: MarginMode,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Instrument;
    use crate::order::OrderType;
    use crate::test_util::{future_instrument, perpetual_instrument, utc};
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FixedPrices(HashMap<Symbol, Money>);

    impl FixedPrices {
        fn one(symbol: &Symbol, price: f64) -> Self {
            Self(HashMap::from([(symbol.clone(), Money::from_f64(price))]))
        }
    }

    impl PriceSource for FixedPrices {
        fn last_price(&self, symbol: &Symbol) -> Money {
            self.0.get(symbol).copied().unwrap_or(Money::ZERO)
        }
    }

    fn money(v: f64) -> Money {
        Money::from_f64(v)
    }

    fn trade_on(
        instrument: &Arc<Instrument>,
        price: f64,
        quantity: f64,
        fee_rate: Money,
    ) -> Trade {
        let order = Order::new(
            Arc::clone(instrument),
            money(quantity),
            None,
            None,
            OrderType::Market,
            utc(2018, 1, 1, 0, 0),
        );
        Trade::new(
            &order,
            money(price),
            money(quantity),
            fee_rate,
            utc(2018, 1, 1, 0, 0),
        )
    }

    #[test]
    fn test_deal_books_realised_pnl_once() {
        let instrument = future_instrument();
        let mut account = Account::new(money(100_000.0));

        // open long 100 @ 10: only the commission moves the wallet
        let open = trade_on(&instrument, 10.0, 100.0, Money::ZERO);
        account.deal(&open);
        assert_eq!(account.wallet_balance, money(100_000.0));

        // close 100 @ 12: profit 200 booked exactly once
        let close = trade_on(&instrument, 12.0, -100.0, Money::ZERO);
        account.deal(&close);
        assert_eq!(account.wallet_balance, money(100_200.0));

        let position = account.positions.get(&instrument.symbol).unwrap();
        assert_eq!(position.quantity, Money::ZERO);
        assert_eq!(position.open_price, Money::ZERO);
    }

    #[test]
    fn test_deal_commission_debited() {
        let instrument = future_instrument();
        let mut account = Account::new(money(1000.0));

        let open = trade_on(&instrument, 10.0, 100.0, instrument.taker_fee);
        // commission = 1000 * 0.0025 = 2.5
        account.deal(&open);
        assert_eq!(account.wallet_balance, money(997.5));
    }

    #[test]
    fn test_deal_close_and_open_books_position_quantity() {
        let instrument = future_instrument();
        let mut account = Account::new(money(0.0));

        account.deal(&trade_on(&instrument, 10.0, 40.0, Money::ZERO));
        // flip: closes 40 @ 13 (profit 120), opens short 20
        account.deal(&trade_on(&instrument, 13.0, -60.0, Money::ZERO));
        assert_eq!(account.wallet_balance, money(120.0));

        let position = account.positions.get(&instrument.symbol).unwrap();
        assert_eq!(position.quantity, money(-20.0));
        assert_eq!(position.open_price, money(13.0));
    }

    #[test]
    fn test_deal_short_partial_close() {
        let instrument = future_instrument();
        let mut account = Account::new(money(0.0));

        account.deal(&trade_on(&instrument, 15.0, -80.0, Money::ZERO));
        account.deal(&trade_on(&instrument, 12.0, 30.0, Money::ZERO));
        // short profit (15 - 12) * 30 = 90
        assert_eq!(account.wallet_balance, money(90.0));
        let position = account.positions.get(&instrument.symbol).unwrap();
        assert_eq!(position.quantity, money(-50.0));
        assert_eq!(position.open_price, money(15.0));
    }

    #[test]
    fn test_order_margin_offsets_position_first() {
        // long 100 with two resting sells 40 @ 11 and 70 @ 12: the first 100
        // of opposite quantity offsets the position, the remaining 10 @ 12
        // is reserved at init 0.01 plus twice the taker fee 0.00075
        let instrument = perpetual_instrument();
        let mut account = Account::new(money(100_000.0));
        let prices = FixedPrices::one(&instrument.symbol, 10.0);

        account
            .positions
            .get_or_create(&instrument)
            .apply(money(10.0), money(100.0));

        let now = utc(2018, 1, 1, 0, 0);
        let sell_a = Order::new(
            Arc::clone(&instrument),
            money(-40.0),
            Some(money(11.0)),
            None,
            OrderType::Limit,
            now,
        );
        let sell_b = Order::new(
            Arc::clone(&instrument),
            money(-70.0),
            Some(money(12.0)),
            None,
            OrderType::Limit,
            now,
        );
        let open_orders = vec![&sell_a, &sell_b];

        let expected = money(10.0) * money(12.0) * money(0.01 + 2.0 * 0.00075);
        assert_eq!(account.order_margin(&open_orders, &prices), expected);
    }

    #[test]
    fn test_order_margin_same_side_orders_reserve_fully() {
        let instrument = perpetual_instrument();
        let account = Account::new(money(100_000.0));
        let prices = FixedPrices::one(&instrument.symbol, 10.0);

        // flat position, one resting buy 50 @ 9
        let buy = Order::new(
            Arc::clone(&instrument),
            money(50.0),
            Some(money(9.0)),
            None,
            OrderType::Limit,
            utc(2018, 1, 1, 0, 0),
        );
        let open_orders = vec![&buy];

        let expected = money(450.0) * money(0.01 + 2.0 * 0.00075);
        assert_eq!(account.order_margin(&open_orders, &prices), expected);
    }

    #[test]
    fn test_order_margin_short_position_with_buy_orders() {
        let instrument = perpetual_instrument();
        let mut account = Account::new(money(100_000.0));
        let prices = FixedPrices::one(&instrument.symbol, 10.0);

        account
            .positions
            .get_or_create(&instrument)
            .apply(money(10.0), money(-100.0));

        let now = utc(2018, 1, 1, 0, 0);
        let buy_a = Order::new(
            Arc::clone(&instrument),
            money(40.0),
            Some(money(9.0)),
            None,
            OrderType::Limit,
            now,
        );
        let buy_b = Order::new(
            Arc::clone(&instrument),
            money(70.0),
            Some(money(9.5)),
            None,
            OrderType::Limit,
            now,
        );
        let open_orders = vec![&buy_a, &buy_b];

        // 100 of the 110 buy quantity offsets the short; 10 @ 9.5 remains
        let expected = money(10.0) * money(9.5) * money(0.01 + 2.0 * 0.00075);
        assert_eq!(account.order_margin(&open_orders, &prices), expected);
    }

    #[test]
    fn test_available_balance_identity() {
        let instrument = perpetual_instrument();
        let mut account = Account::new(money(100_000.0));
        let prices = FixedPrices::one(&instrument.symbol, 10.0);

        account
            .positions
            .get_or_create(&instrument)
            .apply(money(9.0), money(100.0));

        let order = Order::new(
            Arc::clone(&instrument),
            money(50.0),
            Some(money(8.0)),
            None,
            OrderType::Limit,
            utc(2018, 1, 1, 0, 0),
        );
        let open_orders = vec![&order];

        let available = account.available_balance(&open_orders, &prices);
        let identity = account.margin_balance(&prices)
            - account.position_margin(&prices)
            - account.order_margin(&open_orders, &prices);
        assert_eq!(available, identity);
        assert!(available < account.margin_balance(&prices));
    }

    #[test]
    fn test_snapshot_rehydrate() {
        let instrument = future_instrument();
        let registry =
            InstrumentRegistry::from_instruments([Instrument::clone(&instrument)]);
        let mut account = Account::new(money(5000.0));
        account.deal(&trade_on(&instrument, 10.0, 100.0, Money::ZERO));
        account
            .positions
            .get_mut(&instrument.symbol)
            .unwrap()
            .set_maint_margin(money(600.0), money(10.0), money(5000.0))
            .unwrap();

        let snapshot = account.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: AccountSnapshot = serde_json::from_str(&json).unwrap();

        let restored = Account::from_snapshot(&parsed, &registry).unwrap();
        assert_eq!(restored.wallet_balance, money(5000.0));
        let position = restored.positions.get(&instrument.symbol).unwrap();
        assert_eq!(position.quantity, money(100.0));
        assert_eq!(position.open_price, money(10.0));
        assert!(position.is_isolated());
        // the re-linked instrument resolves derived values again
        assert_eq!(position.min_last_maint_margin(money(10.0)), money(25.0));
    }

    #[test]
    fn test_rehydrate_unknown_symbol_fails() {
        let registry = InstrumentRegistry::from_instruments(std::iter::empty());
        let snapshot = AccountSnapshot {
            wallet_balance: money(1.0),
            positions: vec![PositionSnapshot {
                symbol: Symbol::new("GONE"),
                quantity: money(1.0),
                open_price: money(1.0),
                mode: MarginMode::Cross,
            }],
        };
        assert!(matches!(
            Account::from_snapshot(&snapshot, &registry),
            Err(SimError::Setting(_))
        ));
    }
}
