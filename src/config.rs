//! Settings
//!
//! The engine reads a JSON settings document with the vendor-convention
//! upper-case option names. Unknown options are ignored; every recognised
//! option has a default. The parsed value is constructed once and threaded
//! through the runner; there is no process-wide configuration singleton.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::Money;

/// Simulation vs live execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunType {
    #[serde(rename = "BACKTEST")]
    Backtest,
    /// Recognised but not implemented by this engine
    #[serde(rename = "REALTIME")]
    Realtime,
}

/// Which market observation drives order matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickType {
    /// Match against the last price alone
    #[serde(rename = "tick")]
    Tick,
    /// Match against the bar's open/high/low range
    #[serde(rename = "bar")]
    Bar,
}

/// Per-exchange settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSettings {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default, rename = "IS_TEST")]
    pub is_test: bool,
    #[serde(default, rename = "API_KEY")]
    pub api_key: String,
    #[serde(default, rename = "API_SECRET")]
    pub api_secret: String,
    #[serde(
        default = "default_wallet_balance",
        rename = "START_WALLET_BALANCE"
    )]
    pub start_wallet_balance: Money,
}

fn default_engine() -> String {
    "sim".to_string()
}

fn default_wallet_balance() -> Money {
    Money::from_i64(100_000)
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        ExchangeSettings {
            engine: default_engine(),
            is_test: true,
            api_key: String::new(),
            api_secret: String::new(),
            start_wallet_balance: default_wallet_balance(),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "UPPERCASE")]
pub struct Settings {
    pub database_uri: String,
    /// Proxy used only by the external downloader
    pub http_proxy: String,
    pub frequency: String,
    pub log_level: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub run_type: RunType,
    pub tick_type: TickType,
    pub strategy: String,
    pub data_dir: PathBuf,
    pub exchanges: HashMap<String, ExchangeSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_uri: String::new(),
            http_proxy: String::new(),
            frequency: "1m".to_string(),
            log_level: "INFO".to_string(),
            start_time: Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap(),
            run_type: RunType::Backtest,
            tick_type: TickType::Tick,
            strategy: String::new(),
            data_dir: PathBuf::from("data"),
            exchanges: HashMap::from([("sim".to_string(), ExchangeSettings::default())]),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents =
            fs::read_to_string(path.as_ref()).context("Failed to read settings file")?;
        serde_json::from_str(&contents).context("Failed to parse settings JSON")
    }
}
