//! Engine error kinds
//!
//! Margin and order errors surface synchronously from the call that caused
//! them and never leave partial state behind. I/O-heavy loading paths wrap
//! these kinds with `anyhow` context instead of growing new variants.

use std::path::PathBuf;
use thiserror::Error;

use crate::order::OrderId;

/// Structured failure kinds of the simulation engine
#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid configuration or time window
    #[error("setting error: {0}")]
    Setting(String),

    /// The request would violate the available-balance invariant
    #[error("margin not enough: {0}")]
    MarginNotEnough(String),

    /// Leverage or maintenance margin queried/set on a cross position
    #[error("margin is undefined on a cross position")]
    MarginUndefined,

    /// Cancel attempted on an order in a terminal status
    #[error("order {0} is not cancellable from its current status")]
    OrderNotCancellable(OrderId),

    /// External data fetch failed (isolated per archive day)
    #[error("data download failed: {0}")]
    DataDownload(String),

    /// A path that must be a directory is not one
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// The time driver cannot produce the requested cadence
    #[error("unsupported frequency: {0}")]
    UnsupportedFrequency(String),
}
