//! Instrument registry
//!
//! Typed contract metadata loaded once from a vendor snapshot and shared
//! read-only (via `Arc`) with orders, trades and positions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::types::{Money, Symbol};

/// Contract variant, classified from the snapshot's `typ` code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    /// Swap with no expiry
    Perpetual,
    /// Fixed-expiry future
    Future,
    /// Upside profit contract (call-like payoff leg)
    Upside,
    /// Downside profit contract (put-like payoff leg)
    Downside,
}

/// Contract metadata, immutable after registry load
#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: Symbol,
    pub kind: InstrumentKind,
    pub root_symbol: String,
    pub underlying: String,
    pub quote_currency: String,
    pub settle_currency: String,
    pub lot_size: Money,
    pub tick_size: Money,
    pub maker_fee: Money,
    pub taker_fee: Money,
    pub init_margin_rate: Money,
    pub maint_margin_rate: Money,
    pub listing_date: Option<DateTime<Utc>>,
    pub front_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub settle_date: Option<DateTime<Utc>>,
    pub settlement_fee: Money,
    pub reference: String,
    pub reference_symbol: String,
    pub deleverage: bool,
}

/// One record of the snapshot file (vendor camelCase field names)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstrument {
    symbol: String,
    typ: String,
    #[serde(default)]
    root_symbol: String,
    #[serde(default)]
    underlying: String,
    #[serde(default)]
    quote_currency: String,
    #[serde(default)]
    settl_currency: String,
    #[serde(default)]
    lot_size: Money,
    #[serde(default)]
    tick_size: Money,
    #[serde(default)]
    maker_fee: Money,
    #[serde(default)]
    taker_fee: Money,
    #[serde(default)]
    init_margin: Money,
    #[serde(default)]
    maint_margin: Money,
    #[serde(default)]
    listing: Option<DateTime<Utc>>,
    #[serde(default)]
    front: Option<DateTime<Utc>>,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    settle: Option<DateTime<Utc>>,
    #[serde(default)]
    settlement_fee: Money,
    #[serde(default)]
    reference: String,
    #[serde(default)]
    reference_symbol: String,
    #[serde(default)]
    deleverage: bool,
}

impl RawInstrument {
    fn kind(&self) -> Option<InstrumentKind> {
        match self.typ.as_str() {
            "FFWCSX" => Some(InstrumentKind::Perpetual),
            "FFCCSX" => Some(InstrumentKind::Future),
            "OCECCS" => Some(InstrumentKind::Upside),
            "OPECCS" => Some(InstrumentKind::Downside),
            _ => None,
        }
    }

    fn into_instrument(self, kind: InstrumentKind) -> Instrument {
        Instrument {
            symbol: Symbol::new(&self.symbol),
            kind,
            root_symbol: self.root_symbol,
            underlying: self.underlying,
            quote_currency: self.quote_currency,
            settle_currency: self.settl_currency,
            lot_size: self.lot_size,
            tick_size: self.tick_size,
            maker_fee: self.maker_fee,
            taker_fee: self.taker_fee,
            init_margin_rate: self.init_margin,
            maint_margin_rate: self.maint_margin,
            listing_date: self.listing,
            front_date: self.front,
            expiry_date: self.expiry,
            settle_date: self.settle,
            settlement_fee: self.settlement_fee,
            reference: self.reference,
            reference_symbol: self.reference_symbol,
            deleverage: self.deleverage,
        }
    }
}

/// Registry of all tradeable instruments for one exchange
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    instruments: HashMap<Symbol, Arc<Instrument>>,
}

impl InstrumentRegistry {
    /// Load and classify a JSON snapshot (an array of vendor records).
    /// Records with an unrecognised contract type are skipped with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read instrument snapshot {}", path.as_ref().display())
        })?;
        let raws: Vec<RawInstrument> =
            serde_json::from_str(&contents).context("Failed to parse instrument snapshot JSON")?;

        let mut registry = Self::default();
        for raw in raws {
            match raw.kind() {
                Some(kind) => {
                    let instrument = raw.into_instrument(kind);
                    registry
                        .instruments
                        .insert(instrument.symbol.clone(), Arc::new(instrument));
                }
                None => {
                    warn!(symbol = %raw.symbol, typ = %raw.typ, "skipping unsupported contract type");
                }
            }
        }

        info!(count = registry.len(), "loaded instrument registry");
        Ok(registry)
    }

    /// Build a registry from already-constructed instruments
    pub fn from_instruments(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            instruments: instruments
                .into_iter()
                .map(|i| (i.symbol.clone(), Arc::new(i)))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Arc<Instrument>> {
        self.instruments.get(symbol).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Instrument>> {
        self.instruments.values()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}
