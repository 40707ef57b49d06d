//! Simulated exchange
//!
//! Accepts orders, matches them against recorded market data at each tick,
//! applies the resulting trades to the single backtest account and exposes
//! the liquidation check. Matching is last-price driven and deterministic:
//! resting orders are visited in order-id order, and bar-mode fills use an
//! intra-bar event order of open -> low -> high -> close, adversarial to the
//! order holder where the bar leaves the sequence ambiguous.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::account::{Account, PriceSource};
use crate::config::TickType;
use crate::data::DataLoader;
use crate::error::SimError;
use crate::instrument::{Instrument, InstrumentRegistry};
use crate::order::{Order, OrderId, OrderStatus, OrderType, Trade};
use crate::types::{Kline, Money, Side, Symbol};

/// Which side of the book a fill consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liquidity {
    Maker,
    Taker,
}

/// The simulated exchange of one backtest
#[derive(Debug)]
pub struct SimExchange {
    name: String,
    registry: InstrumentRegistry,
    data: DataLoader,
    tick_type: TickType,
    now: DateTime<Utc>,
    account: Account,
    orders: BTreeMap<OrderId, Order>,
    trades: Vec<Trade>,
}

impl SimExchange {
    pub fn new(
        name: impl Into<String>,
        registry: InstrumentRegistry,
        data: DataLoader,
        tick_type: TickType,
        wallet_balance: Money,
        start: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            data,
            tick_type,
            now: start,
            account: Account::new(wallet_balance),
            orders: BTreeMap::new(),
            trades: Vec::new(),
        }
    }

    /// Preload the k-line tables of every listed instrument that has one
    pub fn setup(&mut self) -> anyhow::Result<()> {
        let symbols: Vec<Symbol> = self.registry.iter().map(|i| i.symbol.clone()).collect();
        for symbol in symbols {
            match self.data.table_path(&symbol) {
                Some(path) if path.exists() => {
                    self.data.load_table(&symbol)?;
                }
                _ => debug!(%symbol, "no k-line table"),
            }
        }
        info!(exchange = %self.name, instruments = self.registry.len(), "exchange ready");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Advance the exchange's view of "now". Time never runs backwards.
    pub fn set_now(&mut self, now: DateTime<Utc>) {
        debug_assert!(now >= self.now);
        self.now = now;
    }

    pub fn get_account(&self) -> &Account {
        &self.account
    }

    pub fn available_instruments(&self) -> impl Iterator<Item = &Arc<Instrument>> {
        self.registry.iter()
    }

    pub fn get_instrument(&self, symbol: &Symbol) -> Option<Arc<Instrument>> {
        self.registry.get(symbol)
    }

    pub fn get_last_price(&self, instrument: &Instrument) -> Money {
        self.data.last_price(&instrument.symbol, self.now)
    }

    /// K-line window of `count` bars ending at the current instant
    pub fn get_kline(&self, symbol: &Symbol, count: usize) -> &[Kline] {
        self.data.kline_window(symbol, count, self.now)
    }

    pub fn get_order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn open_orders(&self) -> Vec<&Order> {
        self.orders.values().filter(|o| o.is_open()).collect()
    }

    pub fn trade_log(&self) -> &[Trade] {
        &self.trades
    }

    // ------------------------------------------------------------------
    // Account aggregates at the current instant
    // ------------------------------------------------------------------

    pub fn unrealised_pnl(&self) -> Money {
        self.account.unrealised_pnl(self)
    }

    pub fn margin_balance(&self) -> Money {
        self.account.margin_balance(self)
    }

    pub fn position_margin(&self) -> Money {
        self.account.position_margin(self)
    }

    pub fn order_margin(&self) -> Money {
        self.account.order_margin(&self.open_orders(), self)
    }

    pub fn available_balance(&self) -> Money {
        self.account.available_balance(&self.open_orders(), self)
    }

    fn available_with_candidate(&self, candidate: &Order) -> Money {
        let mut open = self.open_orders();
        open.push(candidate);
        self.account.available_balance(&open, self)
    }

    // ------------------------------------------------------------------
    // Order placement
    // ------------------------------------------------------------------

    fn instrument(&self, symbol: &Symbol) -> Result<Arc<Instrument>, SimError> {
        self.registry
            .get(symbol)
            .ok_or_else(|| SimError::Setting(format!("unknown instrument {symbol}")))
    }

    fn validate_quantity(quantity: Money) -> Result<(), SimError> {
        if quantity.is_zero() {
            return Err(SimError::Setting("order quantity must be non-zero".into()));
        }
        Ok(())
    }

    fn validate_price(label: &str, price: Money) -> Result<(), SimError> {
        if !price.is_positive() {
            return Err(SimError::Setting(format!(
                "{label} must be positive, got {price}"
            )));
        }
        Ok(())
    }

    /// Place a resting limit order. Fails with `margin-not-enough` (and no
    /// state change) when the order's reservation does not fit the available
    /// balance at placement time.
    pub fn place_limit_order(
        &mut self,
        symbol: &Symbol,
        quantity: Money,
        price: Money,
    ) -> Result<OrderId, SimError> {
        let instrument = self.instrument(symbol)?;
        Self::validate_quantity(quantity)?;
        Self::validate_price("limit price", price)?;

        let order = Order::new(
            instrument,
            quantity,
            Some(price),
            None,
            OrderType::Limit,
            self.now,
        );
        let available = self.available_with_candidate(&order);
        if available.is_negative() {
            return Err(SimError::MarginNotEnough(format!(
                "placing order would leave the available balance at {available}"
            )));
        }

        let id = order.id;
        debug!(order_id = id, %symbol, %quantity, %price, "limit order placed");
        self.orders.insert(id, order);
        Ok(id)
    }

    /// Place a market order. It fills immediately at the current last price,
    /// or is recorded as Rejected when there is no market.
    pub fn place_market_order(
        &mut self,
        symbol: &Symbol,
        quantity: Money,
    ) -> Result<OrderId, SimError> {
        let instrument = self.instrument(symbol)?;
        Self::validate_quantity(quantity)?;

        let last = self.data.last_price(symbol, self.now);
        let mut order = Order::new(instrument, quantity, None, None, OrderType::Market, self.now);
        let id = order.id;

        if last.is_zero() {
            warn!(order_id = id, %symbol, "no market price; rejecting market order");
            order.status = OrderStatus::Rejected;
            self.orders.insert(id, order);
            return Ok(id);
        }

        let fee_rate = order.instrument.taker_fee;
        let trade = Trade::new(&order, last, quantity, fee_rate, self.now);
        order.record_fill(quantity);
        info!(order_id = id, %symbol, %quantity, price = %last, "market order filled");
        self.orders.insert(id, order);
        self.account.deal(&trade);
        self.trades.push(trade);
        Ok(id)
    }

    /// Place a stop-limit order: rests untriggered until the reference price
    /// crosses the trigger, then matches as a limit order.
    pub fn place_stop_limit_order(
        &mut self,
        symbol: &Symbol,
        quantity: Money,
        price: Money,
        trigger_price: Money,
    ) -> Result<OrderId, SimError> {
        let instrument = self.instrument(symbol)?;
        Self::validate_quantity(quantity)?;
        Self::validate_price("limit price", price)?;
        Self::validate_price("trigger price", trigger_price)?;

        let order = Order::new(
            instrument,
            quantity,
            Some(price),
            Some(trigger_price),
            OrderType::StopLimit,
            self.now,
        );
        let id = order.id;
        debug!(order_id = id, %symbol, %quantity, %price, %trigger_price, "stop-limit order placed");
        self.orders.insert(id, order);
        Ok(id)
    }

    /// Place a stop-market order: rests untriggered until the reference
    /// price crosses the trigger, then fills as a market order.
    pub fn place_stop_market_order(
        &mut self,
        symbol: &Symbol,
        quantity: Money,
        trigger_price: Money,
    ) -> Result<OrderId, SimError> {
        let instrument = self.instrument(symbol)?;
        Self::validate_quantity(quantity)?;
        Self::validate_price("trigger price", trigger_price)?;

        let order = Order::new(
            instrument,
            quantity,
            None,
            Some(trigger_price),
            OrderType::StopMarket,
            self.now,
        );
        let id = order.id;
        debug!(order_id = id, %symbol, %quantity, %trigger_price, "stop-market order placed");
        self.orders.insert(id, order);
        Ok(id)
    }

    /// Cancel an open order. Terminal orders fail with
    /// `order-not-cancellable`; the margin reservation lapses at the next
    /// recomputation.
    pub fn cancel_order(&mut self, id: OrderId) -> Result<(), SimError> {
        let order = self
            .orders
            .get_mut(&id)
            .ok_or(SimError::OrderNotCancellable(id))?;
        if !order.is_open() {
            return Err(SimError::OrderNotCancellable(id));
        }
        order.status = OrderStatus::Cancelled;
        debug!(order_id = id, "order cancelled");
        Ok(())
    }

    /// Cancel every remaining open order (end of simulation)
    pub fn cancel_all(&mut self) {
        for order in self.orders.values_mut() {
            if order.is_open() {
                order.status = OrderStatus::Cancelled;
            }
        }
    }

    // ------------------------------------------------------------------
    // Margin mode
    // ------------------------------------------------------------------

    /// Switch a position to isolated mode at a target leverage. Infeasible
    /// requests fail with `margin-not-enough` and leave the position as is.
    pub fn set_leverage(&mut self, symbol: &Symbol, leverage: Money) -> Result<(), SimError> {
        let instrument = self.instrument(symbol)?;
        let last = self.data.last_price(symbol, self.now);
        let available = self.available_balance();
        self.account
            .positions
            .get_or_create(&instrument)
            .set_leverage(leverage, last, available)
    }

    /// Switch a position to isolated mode with a fixed maintenance margin
    pub fn set_maint_margin(&mut self, symbol: &Symbol, value: Money) -> Result<(), SimError> {
        let instrument = self.instrument(symbol)?;
        let last = self.data.last_price(symbol, self.now);
        let available = self.available_balance();
        self.account
            .positions
            .get_or_create(&instrument)
            .set_maint_margin(value, last, available)
    }

    /// Restore a position to cross mode
    pub fn set_cross(&mut self, symbol: &Symbol) -> Result<(), SimError> {
        let instrument = self.instrument(symbol)?;
        self.account.positions.get_or_create(&instrument).set_cross();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    /// Match all open orders against the market at the current instant.
    /// Returns the trades emitted this tick, in emission order.
    pub fn process_tick(&mut self) -> Vec<Trade> {
        let open_ids: Vec<OrderId> = self
            .orders
            .iter()
            .filter(|(_, order)| order.is_open())
            .map(|(id, _)| *id)
            .collect();

        let mut emitted = Vec::new();
        for id in open_ids {
            let symbol = match self.orders.get(&id) {
                Some(order) => order.instrument.symbol.clone(),
                None => continue,
            };
            match self.tick_type {
                TickType::Tick => {
                    let last = self.data.last_price(&symbol, self.now);
                    if last.is_zero() {
                        continue;
                    }
                    self.match_tick(id, last, &mut emitted);
                }
                TickType::Bar => {
                    let Some(bar) = self.data.latest_bar(&symbol, self.now).cloned() else {
                        continue;
                    };
                    self.match_bar(id, &bar, &mut emitted);
                }
            }
        }
        emitted
    }

    fn match_tick(&mut self, id: OrderId, last: Money, emitted: &mut Vec<Trade>) {
        if let Some(order) = self.orders.get_mut(&id) {
            if order.status == OrderStatus::New
                && matches!(order.kind, OrderType::StopMarket | OrderType::StopLimit)
            {
                if let Some(trigger) = order.trigger_price {
                    let crossed = match order.side() {
                        Side::Buy => last >= trigger,
                        Side::Sell => last <= trigger,
                    };
                    if crossed {
                        order.status = OrderStatus::Triggered;
                        debug!(order_id = id, %last, "stop order triggered");
                    }
                }
            }
        }

        let decision = {
            let Some(order) = self.orders.get(&id) else {
                return;
            };
            match order.kind {
                OrderType::Limit => {
                    limit_cross(order.side(), order.price, last).map(|p| (p, Liquidity::Maker))
                }
                OrderType::StopLimit if order.status != OrderStatus::New => {
                    limit_cross(order.side(), order.price, last).map(|p| (p, Liquidity::Maker))
                }
                OrderType::StopMarket if order.status == OrderStatus::Triggered => {
                    Some((last, Liquidity::Taker))
                }
                _ => None,
            }
        };

        if let Some((price, liquidity)) = decision {
            self.execute(id, price, liquidity, emitted);
        }
    }

    fn match_bar(&mut self, id: OrderId, bar: &Kline, emitted: &mut Vec<Trade>) {
        let mut triggered_this_bar = false;
        if let Some(order) = self.orders.get_mut(&id) {
            if order.status == OrderStatus::New
                && matches!(order.kind, OrderType::StopMarket | OrderType::StopLimit)
            {
                if let Some(trigger) = order.trigger_price {
                    let crossed = match order.side() {
                        Side::Buy => bar.high >= trigger,
                        Side::Sell => bar.low <= trigger,
                    };
                    if crossed {
                        order.status = OrderStatus::Triggered;
                        triggered_this_bar = true;
                        debug!(order_id = id, "stop order triggered by bar");
                    }
                }
            }
        }

        let decision = {
            let Some(order) = self.orders.get(&id) else {
                return;
            };
            match order.kind {
                OrderType::Limit => {
                    bar_limit_cross(order.side(), order.price, bar).map(|p| (p, Liquidity::Maker))
                }
                OrderType::StopMarket if order.status == OrderStatus::Triggered => {
                    let Some(trigger) = order.trigger_price else {
                        return;
                    };
                    // a gap through the trigger fills at the open, never at a
                    // better price than the trigger
                    let price = match order.side() {
                        Side::Buy => bar.open.max(trigger),
                        Side::Sell => bar.open.min(trigger),
                    };
                    Some((price, Liquidity::Taker))
                }
                OrderType::StopLimit if order.status != OrderStatus::New => {
                    // intra-bar events run open -> low -> high -> close: a
                    // sell stop triggered at the low can still meet the high,
                    // a buy stop triggered at the high cannot revisit the low
                    if triggered_this_bar && order.side() == Side::Buy {
                        None
                    } else {
                        bar_limit_cross(order.side(), order.price, bar)
                            .map(|p| (p, Liquidity::Maker))
                    }
                }
                _ => None,
            }
        };

        if let Some((price, liquidity)) = decision {
            self.execute(id, price, liquidity, emitted);
        }
    }

    fn execute(&mut self, id: OrderId, price: Money, liquidity: Liquidity, emitted: &mut Vec<Trade>) {
        let trade = {
            let Some(order) = self.orders.get_mut(&id) else {
                return;
            };
            let quantity = order.remain_quantity();
            if quantity.is_zero() {
                return;
            }
            let fee_rate = match liquidity {
                Liquidity::Maker => order.instrument.maker_fee,
                Liquidity::Taker => order.instrument.taker_fee,
            };
            let trade = Trade::new(order, price, quantity, fee_rate, self.now);
            order.record_fill(quantity);
            trade
        };
        info!(
            order_id = id,
            price = %trade.exec_price,
            quantity = %trade.exec_quantity,
            commission = %trade.commission,
            "order filled"
        );
        self.account.deal(&trade);
        self.trades.push(trade.clone());
        emitted.push(trade);
    }

    // ------------------------------------------------------------------
    // Liquidation
    // ------------------------------------------------------------------

    /// Positions whose backing margin has fallen below the minimum
    /// maintenance margin at the current instant
    pub fn liquidatable_positions(&self) -> Vec<Symbol> {
        let available = self.available_balance();
        self.account
            .positions
            .iter()
            .filter(|(symbol, position)| {
                let last = self.data.last_price(symbol, self.now);
                !last.is_zero() && position.is_liquidatable(last, available)
            })
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Force-close every breached position with a market trade at its
    /// liquidation price. Returns the forced trades.
    pub fn check_liquidations(&mut self) -> Vec<Trade> {
        let mut forced = Vec::new();
        loop {
            let available = self.available_balance();
            let breached = self.account.positions.iter().find_map(|(symbol, position)| {
                let last = self.data.last_price(symbol, self.now);
                if last.is_zero() || !position.is_liquidatable(last, available) {
                    return None;
                }
                Some((
                    symbol.clone(),
                    position.liq_price(last, available),
                    -position.quantity,
                ))
            });
            let Some((symbol, liq_price, close_quantity)) = breached else {
                break;
            };
            let Some(instrument) = self.registry.get(&symbol) else {
                break;
            };

            warn!(%symbol, price = %liq_price, "maintenance margin breached; force-closing position");
            let mut order = Order::new(
                instrument,
                close_quantity,
                None,
                None,
                OrderType::Market,
                self.now,
            );
            let fee_rate = order.instrument.taker_fee;
            let trade = Trade::new(&order, liq_price, close_quantity, fee_rate, self.now);
            order.record_fill(close_quantity);
            self.orders.insert(order.id, order);
            self.account.deal(&trade);
            self.trades.push(trade.clone());
            forced.push(trade);
        }
        forced
    }
}

impl PriceSource for SimExchange {
    fn last_price(&self, symbol: &Symbol) -> Money {
        self.data.last_price(symbol, self.now)
    }
}

fn limit_cross(side: Side, limit: Option<Money>, last: Money) -> Option<Money> {
    let limit = limit?;
    match side {
        Side::Buy if last <= limit => Some(limit),
        Side::Sell if last >= limit => Some(limit),
        _ => None,
    }
}

fn bar_limit_cross(side: Side, limit: Option<Money>, bar: &Kline) -> Option<Money> {
    let limit = limit?;
    match side {
        Side::Buy if bar.low <= limit => Some(limit),
        Side::Sell if bar.high >= limit => Some(limit),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{perpetual_instrument, utc};

    fn money(v: f64) -> Money {
        Money::from_f64(v)
    }

    fn bar_at(minute: u32, open: f64, high: f64, low: f64, close: f64) -> Kline {
        Kline {
            timestamp: utc(2018, 1, 1, 12, minute),
            open: money(open),
            high: money(high),
            low: money(low),
            close: money(close),
            volume: money(100.0),
            turnover: money(100.0 * close),
        }
    }

    fn exchange_with_bars(tick_type: TickType, bars: Vec<Kline>) -> (SimExchange, Symbol) {
        let instrument = perpetual_instrument();
        let symbol = instrument.symbol.clone();
        let registry = InstrumentRegistry::from_instruments([Instrument::clone(&instrument)]);
        let mut data = DataLoader::in_memory();
        data.insert_table(symbol.clone(), bars);
        let exchange = SimExchange::new(
            "sim",
            registry,
            data,
            tick_type,
            money(1_000_000.0),
            utc(2018, 1, 1, 12, 0),
        );
        (exchange, symbol)
    }

    fn flat_bars() -> Vec<Kline> {
        vec![
            bar_at(0, 100.0, 100.0, 100.0, 100.0),
            bar_at(1, 99.0, 99.0, 99.0, 99.0),
            bar_at(2, 95.0, 95.0, 95.0, 95.0),
            bar_at(3, 103.0, 103.0, 103.0, 103.0),
        ]
    }

    #[test]
    fn test_market_order_fills_at_last_price() {
        let (mut exchange, symbol) = exchange_with_bars(TickType::Tick, flat_bars());
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        let id = exchange.place_market_order(&symbol, money(100.0)).unwrap();
        let order = exchange.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        let trades = exchange.trade_log();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exec_price, money(100.0));
        assert_eq!(trades[0].exec_quantity, money(100.0));
        // taker commission: 10000 * 0.00075
        assert_eq!(trades[0].commission, money(7.5));

        let position = exchange.get_account().positions.get(&symbol).unwrap();
        assert_eq!(position.quantity, money(100.0));
        assert_eq!(position.open_price, money(100.0));
    }

    #[test]
    fn test_market_order_rejected_without_market() {
        let (mut exchange, symbol) = exchange_with_bars(TickType::Tick, flat_bars());
        // before the first bar has closed there is no market
        let id = exchange.place_market_order(&symbol, money(100.0)).unwrap();
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Rejected);
        assert!(exchange.trade_log().is_empty());
    }

    #[test]
    fn test_unknown_symbol_is_a_setting_error() {
        let (mut exchange, _) = exchange_with_bars(TickType::Tick, flat_bars());
        assert!(matches!(
            exchange.place_market_order(&Symbol::new("NOPE"), money(1.0)),
            Err(SimError::Setting(_))
        ));
    }

    #[test]
    fn test_buy_limit_fills_when_last_crosses() {
        let (mut exchange, symbol) = exchange_with_bars(TickType::Tick, flat_bars());
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        let id = exchange
            .place_limit_order(&symbol, money(100.0), money(96.0))
            .unwrap();

        // last 99 > 96: still resting
        assert!(exchange.process_tick().is_empty());
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::New);

        // last 95 <= 96: fills at the limit price as maker
        exchange.set_now(utc(2018, 1, 1, 12, 3));
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exec_price, money(96.0));
        assert!(trades[0].commission.is_negative(), "maker rebate expected");
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_sell_limit_fills_when_last_crosses() {
        let (mut exchange, symbol) = exchange_with_bars(TickType::Tick, flat_bars());
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        let id = exchange
            .place_limit_order(&symbol, money(-50.0), money(102.0))
            .unwrap();
        assert!(exchange.process_tick().is_empty());

        exchange.set_now(utc(2018, 1, 1, 12, 4));
        // last 103 >= 102
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exec_price, money(102.0));
        assert_eq!(trades[0].exec_quantity, money(-50.0));
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_stop_market_triggers_and_fills_at_last() {
        let (mut exchange, symbol) = exchange_with_bars(TickType::Tick, flat_bars());
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        // sell stop below the market
        let id = exchange
            .place_stop_market_order(&symbol, money(-100.0), money(96.0))
            .unwrap();

        assert!(exchange.process_tick().is_empty());
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::New);

        exchange.set_now(utc(2018, 1, 1, 12, 3));
        // last 95 <= 96: triggered and filled at the observed last
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exec_price, money(95.0));
        assert_eq!(trades[0].commission, money(95.0 * 100.0 * 0.00075));
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_stop_limit_triggers_then_rests_as_limit() {
        let (mut exchange, symbol) = exchange_with_bars(TickType::Tick, flat_bars());
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        // buy stop-limit: trigger 103, limit 103.5
        let id = exchange
            .place_stop_limit_order(&symbol, money(10.0), money(103.5), money(103.0))
            .unwrap();

        assert!(exchange.process_tick().is_empty());

        exchange.set_now(utc(2018, 1, 1, 12, 4));
        // last 103 >= trigger, and 103 <= 103.5 so the limit leg also fills
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exec_price, money(103.5));
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_bar_mode_limit_fills_at_limit_price() {
        let bars = vec![
            bar_at(0, 100.0, 101.0, 99.0, 100.0),
            bar_at(1, 100.0, 102.0, 94.0, 95.0),
        ];
        let (mut exchange, symbol) = exchange_with_bars(TickType::Bar, bars);
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        let id = exchange
            .place_limit_order(&symbol, money(100.0), money(96.0))
            .unwrap();
        // bar 0: low 99 > 96, no fill
        assert!(exchange.process_tick().is_empty());

        exchange.set_now(utc(2018, 1, 1, 12, 2));
        // bar 1: low 94 <= 96, fill at the configured price
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exec_price, money(96.0));
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_bar_mode_sell_stop_gap_fills_at_open() {
        // market gaps below the trigger: the fill can be no better than the open
        let bars = vec![
            bar_at(0, 100.0, 101.0, 99.0, 100.0),
            bar_at(1, 92.0, 93.0, 90.0, 91.0),
        ];
        let (mut exchange, symbol) = exchange_with_bars(TickType::Bar, bars);
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        let id = exchange
            .place_stop_market_order(&symbol, money(-100.0), money(96.0))
            .unwrap();
        assert!(exchange.process_tick().is_empty());

        exchange.set_now(utc(2018, 1, 1, 12, 2));
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1);
        // min(open 92, trigger 96) = 92
        assert_eq!(trades[0].exec_price, money(92.0));
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_bar_mode_buy_stop_fills_at_trigger_within_bar() {
        let bars = vec![
            bar_at(0, 100.0, 101.0, 99.0, 100.0),
            bar_at(1, 100.0, 106.0, 99.5, 105.0),
        ];
        let (mut exchange, symbol) = exchange_with_bars(TickType::Bar, bars);
        exchange.set_now(utc(2018, 1, 1, 12, 2));

        let id = exchange
            .place_stop_market_order(&symbol, money(100.0), money(104.0))
            .unwrap();
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1);
        // max(open 100, trigger 104) = 104
        assert_eq!(trades[0].exec_price, money(104.0));
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_bar_mode_sell_stop_limit_may_fill_in_trigger_bar() {
        // sell stop-limit: trigger at the low, limit met by the later high
        let bars = vec![bar_at(0, 100.0, 103.0, 95.0, 102.0)];
        let (mut exchange, symbol) = exchange_with_bars(TickType::Bar, bars);
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        let id = exchange
            .place_stop_limit_order(&symbol, money(-100.0), money(101.0), money(96.0))
            .unwrap();
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1, "high comes after the triggering low");
        assert_eq!(trades[0].exec_price, money(101.0));
        assert_eq!(exchange.get_order(id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn test_bar_mode_buy_stop_limit_cannot_fill_in_trigger_bar() {
        // buy stop-limit triggered at the high cannot revisit the low in the
        // same bar; it fills on the next bar instead
        let bars = vec![
            bar_at(0, 100.0, 105.0, 99.0, 104.0),
            bar_at(1, 104.0, 104.5, 100.0, 101.0),
        ];
        let (mut exchange, symbol) = exchange_with_bars(TickType::Bar, bars);
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        let id = exchange
            .place_stop_limit_order(&symbol, money(100.0), money(101.0), money(104.0))
            .unwrap();
        assert!(
            exchange.process_tick().is_empty(),
            "low precedes the triggering high"
        );
        assert_eq!(
            exchange.get_order(id).unwrap().status,
            OrderStatus::Triggered
        );

        exchange.set_now(utc(2018, 1, 1, 12, 2));
        let trades = exchange.process_tick();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exec_price, money(101.0));
    }

    #[test]
    fn test_cancel_order_lifecycle() {
        let (mut exchange, symbol) = exchange_with_bars(TickType::Tick, flat_bars());
        exchange.set_now(utc(2018, 1, 1, 12, 1));

        let id = exchange
            .place_limit_order(&symbol, money(10.0), money(90.0))
            .unwrap();
        assert_eq!(exchange.open_orders().len(), 1);

        exchange.cancel_order(id).unwrap();
        assert_eq!(
            exchange.get_order(id).unwrap().status,
            OrderStatus::Cancelled
        );
        assert!(exchange.open_orders().is_empty());

        // terminal: cancelling again fails
        assert!(matches!(
            exchange.cancel_order(id),
            Err(SimError::OrderNotCancellable(_))
        ));
        assert!(matches!(
            exchange.cancel_order(9_999_999),
            Err(SimError::OrderNotCancellable(_))
        ));
    }

    #[test]
    fn test_limit_order_margin_check() {
        let instrument = perpetual_instrument();
        let symbol = instrument.symbol.clone();
        let registry = InstrumentRegistry::from_instruments([Instrument::clone(&instrument)]);
        let mut data = DataLoader::in_memory();
        data.insert_table(symbol.clone(), flat_bars());
        let mut exchange = SimExchange::new(
            "sim",
            registry,
            data,
            TickType::Tick,
            money(100.0),
            utc(2018, 1, 1, 12, 1),
        );

        // reservation 10000 * 90 * (0.01 + 0.0015) = far above the wallet
        let err = exchange.place_limit_order(&symbol, money(10_000.0), money(90.0));
        assert!(matches!(err, Err(SimError::MarginNotEnough(_))));
        // the failed placement left no state behind
        assert!(exchange.open_orders().is_empty());
        assert_eq!(exchange.order_margin(), Money::ZERO);

        // a small order fits: 10 * 90 * 0.0115 = 10.35
        let id = exchange.place_limit_order(&symbol, money(10.0), money(90.0));
        assert!(id.is_ok());
        assert_eq!(exchange.order_margin(), money(10.35));
    }

    #[test]
    fn test_margin_mode_through_exchange() {
        let (mut exchange, symbol) = exchange_with_bars(TickType::Tick, flat_bars());
        exchange.set_now(utc(2018, 1, 1, 12, 1));
        exchange.place_market_order(&symbol, money(100.0)).unwrap();

        // leverage is undefined while the position is cross
        {
            let position = exchange.get_account().positions.get(&symbol).unwrap();
            assert!(position.leverage(money(100.0)).is_err());
        }

        // isolate at 10x: margin 10000 / 10 = 1000
        exchange.set_leverage(&symbol, money(10.0)).unwrap();
        let position = exchange.get_account().positions.get(&symbol).unwrap();
        assert!(position.is_isolated());
        assert_eq!(position.position_margin(money(100.0)), money(1000.0));

        // 200x would put the margin below the init margin; the stored
        // isolated margin is untouched
        assert!(matches!(
            exchange.set_leverage(&symbol, money(200.0)),
            Err(SimError::MarginNotEnough(_))
        ));
        let position = exchange.get_account().positions.get(&symbol).unwrap();
        assert_eq!(position.position_margin(money(100.0)), money(1000.0));

        exchange.set_cross(&symbol).unwrap();
        let position = exchange.get_account().positions.get(&symbol).unwrap();
        assert!(!position.is_isolated());
    }

    #[test]
    fn test_liquidation_force_close() {
        // long 100 @ 100 on a thin wallet, then the market collapses far
        // enough that the free equity no longer covers the minimum margin
        let instrument = perpetual_instrument();
        let symbol = instrument.symbol.clone();
        let registry = InstrumentRegistry::from_instruments([Instrument::clone(&instrument)]);
        let mut data = DataLoader::in_memory();
        data.insert_table(
            symbol.clone(),
            vec![
                bar_at(0, 100.0, 100.0, 100.0, 100.0),
                bar_at(1, 60.0, 60.0, 60.0, 60.0),
            ],
        );
        let mut exchange = SimExchange::new(
            "sim",
            registry,
            data,
            TickType::Tick,
            money(600.0),
            utc(2018, 1, 1, 12, 1),
        );

        exchange.place_market_order(&symbol, money(100.0)).unwrap();
        assert!(exchange.liquidatable_positions().is_empty());

        exchange.set_now(utc(2018, 1, 1, 12, 2));
        assert_eq!(exchange.liquidatable_positions(), vec![symbol.clone()]);

        let forced = exchange.check_liquidations();
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].exec_quantity, money(-100.0));

        let position = exchange.get_account().positions.get(&symbol).unwrap();
        assert_eq!(position.quantity, Money::ZERO);
        assert!(exchange.liquidatable_positions().is_empty());
    }
}
