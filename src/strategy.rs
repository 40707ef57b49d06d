//! Strategy interface
//!
//! User strategies react to the simulation through four async callbacks. The
//! engine invokes them on a single logical task, never concurrently with
//! itself or with matching, so every callback observes a consistent "now"
//! and a fully applied account state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::exchange::SimExchange;
use crate::order::Trade;

/// Whether the simulation should keep running after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Continue,
    Stop,
}

/// The callbacks a strategy implements.
///
/// Callbacks may await I/O of their own; the engine itself never runs two of
/// them at once.
#[async_trait]
pub trait Strategy: Send {
    /// Invoked once before the first tick
    async fn setup(&mut self, _exchange: &mut SimExchange) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked on every instant of the time driver
    async fn tick(
        &mut self,
        exchange: &mut SimExchange,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TickAction>;

    /// Invoked after every fill against one of the account's orders,
    /// in emission order
    async fn on_trade(
        &mut self,
        _exchange: &mut SimExchange,
        _trade: &Trade,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked at each new bar boundary, after `tick`
    async fn handle_bar(&mut self, _exchange: &mut SimExchange) -> anyhow::Result<TickAction> {
        Ok(TickAction::Continue)
    }
}
