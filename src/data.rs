//! Market data loading
//!
//! Backs the simulated exchange with two queries: the last traded price at an
//! instant, and a k-line window ending at an instant. Storage is one CSV
//! table per symbol under `<data_dir>/kline/`; tables are read once and kept
//! in memory for the whole run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::SimError;
use crate::types::{Kline, Money, Symbol};

// =============================================================================
// K-line store
// =============================================================================

/// One row of a k-line table
#[derive(Debug, Deserialize)]
struct KlineRow {
    timestamp: DateTime<Utc>,
    open: Money,
    high: Money,
    low: Money,
    close: Money,
    volume: Money,
    #[serde(default)]
    turnover: Money,
}

/// Read one k-line CSV table, enforcing chronological order
pub fn load_kline_csv(path: impl AsRef<Path>) -> Result<Vec<Kline>> {
    let mut reader = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("Failed to open k-line table {}", path.as_ref().display()))?;

    let mut bars: Vec<Kline> = Vec::new();
    for (row_idx, result) in reader.deserialize::<KlineRow>().enumerate() {
        let row = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        if let Some(prev) = bars.last() {
            if row.timestamp <= prev.timestamp {
                anyhow::bail!(
                    "row {}: timestamp {} is not after {}",
                    row_idx + 1,
                    row.timestamp,
                    prev.timestamp
                );
            }
        }
        bars.push(Kline {
            timestamp: row.timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            turnover: row.turnover,
        });
    }
    Ok(bars)
}

/// In-memory, table-per-symbol k-line store.
///
/// Tables may have gaps and uneven end points; every query is answered from
/// the bars whose timestamp strictly precedes the query instant, so a bar is
/// only visible once it has closed.
#[derive(Debug, Default)]
pub struct DataLoader {
    dir: Option<PathBuf>,
    tables: HashMap<Symbol, Vec<Kline>>,
}

impl DataLoader {
    /// Open a store rooted at a data directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SimError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(SimError::NotADirectory(dir));
        }
        Ok(Self {
            dir: Some(dir),
            tables: HashMap::new(),
        })
    }

    /// A store with no backing directory; tables are fed programmatically
    /// via [`DataLoader::insert_table`].
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Path of the on-disk table for a symbol, if the store has a directory
    pub fn table_path(&self, symbol: &Symbol) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join("kline").join(format!("{symbol}.csv")))
    }

    /// Load a symbol's table from disk, replacing any previous table
    pub fn load_table(&mut self, symbol: &Symbol) -> Result<usize> {
        let path = self
            .table_path(symbol)
            .context("data loader has no backing directory")?;
        let bars = load_kline_csv(&path)
            .with_context(|| format!("Failed to load k-line table for {symbol}"))?;
        info!(%symbol, bars = bars.len(), "loaded k-line table");
        let n = bars.len();
        self.tables.insert(symbol.clone(), bars);
        Ok(n)
    }

    /// Insert a table directly (bars must be in chronological order)
    pub fn insert_table(&mut self, symbol: Symbol, bars: Vec<Kline>) {
        debug_assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        self.tables.insert(symbol, bars);
    }

    pub fn has_table(&self, symbol: &Symbol) -> bool {
        self.tables.contains_key(symbol)
    }

    /// Bars of `symbol` that have closed before `at`
    fn visible(&self, symbol: &Symbol, at: DateTime<Utc>) -> &[Kline] {
        let Some(table) = self.tables.get(symbol) else {
            return &[];
        };
        let end = table.partition_point(|bar| bar.timestamp < at);
        &table[..end]
    }

    /// Close of the most recent bar strictly preceding `at`.
    /// Returns zero when no such bar exists; callers read zero as "no market".
    pub fn last_price(&self, symbol: &Symbol, at: DateTime<Utc>) -> Money {
        match self.visible(symbol, at).last() {
            Some(bar) => bar.close,
            None => {
                debug!(%symbol, %at, "no bar before instant");
                Money::ZERO
            }
        }
    }

    /// Up to `count` bars ending at `at`, in chronological order
    pub fn kline_window(&self, symbol: &Symbol, count: usize, at: DateTime<Utc>) -> &[Kline] {
        let bars = self.visible(symbol, at);
        &bars[bars.len().saturating_sub(count)..]
    }

    /// The most recent closed bar preceding `at`
    pub fn latest_bar(&self, symbol: &Symbol, at: DateTime<Utc>) -> Option<&Kline> {
        self.visible(symbol, at).last()
    }
}

// =============================================================================
// Vendor archive row schemas
// =============================================================================
//
// Per-day CSV archives are produced by the (external) downloader; the engine
// only needs their row shapes for fixtures and replay tooling. Timestamps use
// the vendor's `%Y-%m-%dD%H:%M:%S%.f` format.

/// One row of a per-day trade archive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveTradeRow {
    pub timestamp: String,
    pub symbol: String,
    pub side: String,
    pub size: Money,
    pub price: Money,
    pub tick_direction: String,
    #[serde(rename = "trdMatchID")]
    pub trd_match_id: String,
    pub gross_value: Money,
    pub home_notional: Money,
    pub foreign_notional: Money,
}

/// One row of a per-day quote archive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveQuoteRow {
    pub timestamp: String,
    pub symbol: String,
    pub bid_size: Money,
    pub bid_price: Money,
    pub ask_price: Money,
    pub ask_size: Money,
}

/// Parse a vendor archive timestamp (`2018-10-05D00:00:04.392073000`)
pub fn parse_archive_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let iso = raw.replacen('D', "T", 1);
    let naive = chrono::NaiveDateTime::parse_from_str(&iso, "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("Failed to parse archive timestamp: {raw}"))?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// Read a per-day trade archive
pub fn read_trade_archive(path: impl AsRef<Path>) -> Result<Vec<ArchiveTradeRow>> {
    let mut reader = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("Failed to open trade archive {}", path.as_ref().display()))?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("Failed to read trade row {}", i + 1)))
        .collect()
}

/// Read a per-day quote archive
pub fn read_quote_archive(path: impl AsRef<Path>) -> Result<Vec<ArchiveQuoteRow>> {
    let mut reader = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("Failed to open quote archive {}", path.as_ref().display()))?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("Failed to read quote row {}", i + 1)))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
