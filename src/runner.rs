//! Backtest runner
//!
//! Drives the strategy through the historical window on a single logical
//! task. Per-tick ordering: advance "now", match open orders, apply and
//! report fills, run the liquidation check, then hand control to the
//! strategy. The ordering is what makes the simulation deterministic; tests
//! pin it.

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::account::AccountSnapshot;
use crate::config::{RunType, Settings};
use crate::context::Context;
use crate::data::DataLoader;
use crate::exchange::SimExchange;
use crate::instrument::InstrumentRegistry;
use crate::order::Trade;
use crate::strategy::{Strategy, TickAction};
use crate::ticker::{Frequency, FrequencyTicker};
use crate::types::Money;

/// Result of a completed simulation
#[derive(Debug)]
pub struct BacktestReport {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<(DateTime<Utc>, Money)>,
    pub account: AccountSnapshot,
}

/// Owns the context, the simulated exchange and the strategy for one run
pub struct Backtester {
    context: Context,
    exchange: SimExchange,
    strategy: Box<dyn Strategy>,
}

impl std::fmt::Debug for Backtester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backtester")
            .field("context", &self.context)
            .field("exchange", &self.exchange)
            .field("strategy", &"<dyn Strategy>")
            .finish()
    }
}

impl Backtester {
    /// Build a runner from settings. The instrument snapshot and k-line
    /// tables are loaded from `DATA_DIR`.
    pub fn new(settings: Settings, strategy: Box<dyn Strategy>) -> Result<Self> {
        if settings.run_type != RunType::Backtest {
            bail!(crate::error::SimError::Setting(
                "only the BACKTEST run type is implemented".into()
            ));
        }

        let (name, exchange_settings) = settings
            .exchanges
            .iter()
            .next()
            .map(|(name, ex)| (name.clone(), ex.clone()))
            .context("no exchange configured")?;

        let registry = InstrumentRegistry::load(settings.data_dir.join("instruments.json"))?;
        let data = DataLoader::open(&settings.data_dir)?;
        let exchange = SimExchange::new(
            name,
            registry,
            data,
            settings.tick_type,
            exchange_settings.start_wallet_balance,
            settings.start_time,
        );

        Ok(Self {
            context: Context::new(settings),
            exchange,
            strategy,
        })
    }

    /// Build a runner around an exchange assembled by the caller
    pub fn with_exchange(
        settings: Settings,
        exchange: SimExchange,
        strategy: Box<dyn Strategy>,
    ) -> Self {
        Self {
            context: Context::new(settings),
            exchange,
            strategy,
        }
    }

    /// Run the simulation to the end of the window or until the strategy
    /// stops it. Remaining open orders are cancelled before the final
    /// account snapshot is taken.
    pub async fn run(mut self) -> Result<BacktestReport> {
        let settings = &self.context.settings;
        let frequency: Frequency = settings.frequency.parse()?;
        let ticker =
            FrequencyTicker::new(settings.start_time, settings.end_time, frequency)?;

        self.exchange.setup()?;
        if let Err(err) = self.strategy.setup(&mut self.exchange).await {
            error!(error = %err, "strategy setup failed");
            return Err(err);
        }

        info!(
            start = %self.context.settings.start_time,
            end = %self.context.settings.end_time,
            "backtest started"
        );

        let mut equity_curve = Vec::new();
        let mut dispatched = 0usize;

        for now in ticker {
            self.context.advance(now);
            self.exchange.set_now(now);

            // matching first: fills observed by this tick's callbacks are
            // fully applied to the account before the strategy runs
            self.exchange.process_tick();
            self.dispatch_trades(&mut dispatched).await?;

            self.exchange.check_liquidations();
            self.dispatch_trades(&mut dispatched).await?;

            let tick_result = self.strategy.tick(&mut self.exchange, now).await;
            let action = self.check_callback(tick_result)?;
            self.dispatch_trades(&mut dispatched).await?;
            if action == TickAction::Stop {
                info!(%now, "strategy stopped the simulation");
                break;
            }

            let bar_result = self.strategy.handle_bar(&mut self.exchange).await;
            let action = self.check_callback(bar_result)?;
            self.dispatch_trades(&mut dispatched).await?;
            if action == TickAction::Stop {
                info!(%now, "strategy stopped the simulation");
                break;
            }

            equity_curve.push((now, self.exchange.margin_balance()));
        }

        self.exchange.cancel_all();
        let report = BacktestReport {
            trades: self.exchange.trade_log().to_vec(),
            equity_curve,
            account: self.exchange.get_account().snapshot(),
        };
        info!(
            trades = report.trades.len(),
            wallet = %report.account.wallet_balance,
            "backtest finished"
        );
        Ok(report)
    }

    fn check_callback(&self, result: anyhow::Result<TickAction>) -> Result<TickAction> {
        result.map_err(|err| {
            // preserve the account state for inspection before aborting
            let snapshot = self.exchange.get_account().snapshot();
            error!(error = %err, account = ?snapshot, "strategy callback failed; aborting");
            err
        })
    }

    /// Report trades emitted since the last dispatch, in emission order
    async fn dispatch_trades(&mut self, dispatched: &mut usize) -> Result<()> {
        while *dispatched < self.exchange.trade_log().len() {
            let trade = self.exchange.trade_log()[*dispatched].clone();
            *dispatched += 1;
            self.strategy.on_trade(&mut self.exchange, &trade).await?;
        }
        Ok(())
    }
}
